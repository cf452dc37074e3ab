use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use log::debug;

use super::{execute, PeerOptions};
use crate::session::Workload;
use crate::storage::DirectoryStorage;

pub async fn run(dest: &Path, options: PeerOptions) -> Result<(), Box<dyn Error>> {
    debug!("Starting receive command into {}", dest.display());
    std::fs::create_dir_all(dest)?;

    let storage = Arc::new(DirectoryStorage::new(dest));
    let summary = execute(Workload::Receive(storage), options).await?;

    for path in &summary.saved {
        println!("{}", path.display());
    }
    println!("Received {} files ({} bytes)", summary.files, summary.bytes);
    Ok(())
}
