use std::error::Error;
use std::path::PathBuf;

use log::debug;

use super::{execute, PeerOptions};
use crate::session::Workload;
use crate::storage::collect_outgoing;

/// Function handler to kickoff sender logic:
///     - Expand the given files and folders into the list of files to send
///     - Connect to the peer (hosting or joining, depending on its platform)
///     - Stream every file, chunked and encrypted, then wait for the receiver
///       to acknowledge
pub async fn run(paths: &[PathBuf], options: PeerOptions) -> Result<(), Box<dyn Error>> {
    for path in paths {
        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()).into());
        }
    }

    let files = collect_outgoing(paths)?;
    if files.is_empty() {
        return Err("Nothing to send: no regular files found".into());
    }
    let total_bytes: u64 = files.iter().filter_map(|f| f.size).sum();
    debug!("Sending {} files, {} bytes", files.len(), total_bytes);

    let summary = execute(Workload::Send(files), options).await?;
    println!("Sent {} files ({} bytes)", summary.files, summary.bytes);
    Ok(())
}
