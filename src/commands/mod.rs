//! # Commands Module
//!
//! Command handlers behind the `linkdrop` binary:
//!
//! ## `send`
//! Sends files and folders to the peer. Folders are walked and every file
//! keeps its place under the folder's name.
//!
//! ## `receive`
//! Receives into a destination directory, never overwriting existing files.
//!
//! Both run one session through a [`TransferController`]: which side hosts
//! follows from the peer's platform and the local role, the hosting side
//! generates the link credential when none is given and the joining side
//! asks for it. Ctrl-C cancels the session.

pub mod receive;
pub mod send;

use std::error::Error;
use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};

use crate::bytes::generate_credential;
use crate::config::TransferConfig;
use crate::controller::{SessionParams, TransferController};
use crate::cryptography::DerivedKey;
use crate::events::{EventSink, Progress, SessionOutcome, StatusEvent};
use crate::networking::{HostingStatus, PeerPlatform};
use crate::session::{TransferSummary, Workload};

/// Pairing details supplied on the command line.
pub struct PeerOptions {
    pub peer_platform: PeerPlatform,
    pub peer_addr: Option<IpAddr>,
    pub credential: Option<String>,
    pub config: TransferConfig,
}

/// Run one session to the end, rendering progress on the terminal.
async fn execute(workload: Workload, options: PeerOptions) -> Result<TransferSummary, Box<dyn Error>> {
    let hosting = HostingStatus::derive(options.peer_platform, workload.role());
    debug!("Local side will {:?}", hosting);

    if hosting == HostingStatus::Join && options.peer_addr.is_none() {
        return Err("--peer is required when this device joins the link".into());
    }

    let credential = match (options.credential, hosting) {
        (Some(credential), _) => credential,
        (None, HostingStatus::Host) => {
            let credential = generate_credential();
            println!("Link credential (copied to clipboard): \x1b[4m\x1b[1m{}\x1b[0m", credential);
            credential
        }
        (None, HostingStatus::Join) => {
            info!("Prompting for link credential");
            prompt_credential().await?
        }
    };

    let params = SessionParams {
        workload,
        peer_platform: options.peer_platform,
        key: DerivedKey::from_credential(&credential),
        peer_addr: options.peer_addr,
        config: options.config,
    };

    let controller = TransferController::new();
    let handle = controller.start(params, Arc::new(ProgressSink::new()))?;

    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    Ok(handle.wait().await?)
}

async fn prompt_credential() -> Result<String, Box<dyn Error>> {
    let credential = tokio::task::spawn_blocking(|| -> io::Result<String> {
        print!("Enter the link credential: ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim().to_string())
    })
    .await??;

    if credential.is_empty() {
        return Err("link credential must not be empty".into());
    }
    Ok(credential)
}

/// Terminal rendering of session events: a spinner while connecting, a byte
/// bar per file.
pub struct ProgressSink {
    bar: ProgressBar,
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(100));
        ProgressSink { bar }
    }

    fn file_bar(&self, message: String) {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.black}] {bytes}/{total_bytes} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        self.bar.set_style(style);
        self.bar.set_position(0);
        self.bar.set_message(message);
    }
}

impl EventSink for ProgressSink {
    fn status(&self, event: &StatusEvent) {
        match event {
            StatusEvent::SendingFile { .. } | StatusEvent::ReceivingFile { .. } => {
                self.file_bar(event.to_string())
            }
            StatusEvent::AwaitingPeer { .. }
            | StatusEvent::Connecting { .. }
            | StatusEvent::Connected { .. }
            | StatusEvent::HandshakeComplete { .. } => self.bar.set_message(event.to_string()),
            StatusEvent::FileSaved { .. } | StatusEvent::TransferComplete => {
                self.bar.println(event.to_string())
            }
        }
    }

    fn progress(&self, progress: &Progress) {
        if let Some(total) = progress.total {
            self.bar.set_length(total);
        }
        self.bar.set_position(progress.bytes);
    }

    fn finished(&self, outcome: SessionOutcome<'_>) {
        match outcome {
            SessionOutcome::Completed(summary) => self.bar.finish_with_message(format!(
                "Done: {} files, {} bytes",
                summary.files, summary.bytes
            )),
            SessionOutcome::Failed(e) => self.bar.abandon_with_message(format!("Failed: {}", e)),
            SessionOutcome::Cancelled => self.bar.abandon_with_message("Cancelled"),
        }
    }
}
