//! Runs a whole session on its own task: connect, handshake, transfer,
//! teardown. At most one session is live in the process, and its terminal
//! event fires exactly once however it ends.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::{AbortHandle, JoinHandle};

use crate::channel::FileChannel;
use crate::config::TransferConfig;
use crate::cryptography::DerivedKey;
use crate::error::{Result, TransferError};
use crate::events::{EventSink, SessionOutcome, StatusEvent};
use crate::handshake::Handshake;
use crate::networking::{establish, HostingStatus, PeerPlatform, TeardownHandle};
use crate::session::{TransferSession, TransferSummary, Workload};

/// Everything the pairing layer hands over before a session starts.
pub struct SessionParams {
    pub workload: Workload,
    pub peer_platform: PeerPlatform,
    pub key: DerivedKey,
    /// Required when this side joins.
    pub peer_addr: Option<IpAddr>,
    pub config: TransferConfig,
}

#[derive(Default)]
struct SessionState {
    running: AtomicBool,
    cancelled: AtomicBool,
    finished: AtomicBool,
}

impl SessionState {
    /// Whoever claims the session first decides how it ended.
    fn claim(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }
}

/// Set while any session task exists in this process.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Clears [`ACTIVE`] when the session task goes away, whether it returned,
/// failed or was aborted.
struct ActiveGuard;

impl ActiveGuard {
    fn acquire() -> Option<Self> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActiveGuard)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
    }
}

/// Entry point for sessions. Every controller shares the same single slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferController;

impl TransferController {
    pub fn new() -> Self {
        TransferController
    }

    pub fn is_active(&self) -> bool {
        ACTIVE.load(Ordering::Acquire)
    }

    /// Spawn a session. Fails with `SessionActive` while another one, from
    /// any controller, is still running or tearing down.
    pub fn start(&self, params: SessionParams, sink: Arc<dyn EventSink>) -> Result<TransferHandle> {
        params.config.validate().map_err(TransferError::InvalidConfig)?;

        let Some(guard) = ActiveGuard::acquire() else {
            warn!("Refusing to start a second session");
            return Err(TransferError::SessionActive);
        };

        let teardown = TeardownHandle::new();
        let state = Arc::new(SessionState::default());
        state.running.store(true, Ordering::Release);

        let task = tokio::spawn(run_session(
            params,
            sink.clone(),
            teardown.clone(),
            state.clone(),
            guard,
        ));

        Ok(TransferHandle {
            canceller: Canceller {
                abort: task.abort_handle(),
                teardown,
                state,
                sink,
            },
            task,
        })
    }
}

pub struct TransferHandle {
    task: JoinHandle<Result<TransferSummary>>,
    canceller: Canceller,
}

impl TransferHandle {
    pub fn is_running(&self) -> bool {
        self.canceller.state.running.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Cancellation handle usable from another task or thread.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn connection(&self) -> &TeardownHandle {
        &self.canceller.teardown
    }

    /// Wait for the session task to end. After this returns the controller
    /// accepts a new session.
    pub async fn wait(self) -> Result<TransferSummary> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TransferError::Cancelled),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

#[derive(Clone)]
pub struct Canceller {
    abort: AbortHandle,
    teardown: TeardownHandle,
    state: Arc<SessionState>,
    sink: Arc<dyn EventSink>,
}

impl Canceller {
    /// Stop the session wherever it is. Closing the socket wakes any read or
    /// write the task is blocked on.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            info!("Cancelling transfer");
        }
        self.state.running.store(false, Ordering::Release);
        self.abort.abort();
        self.teardown.teardown();
        if self.state.claim() {
            debug!("Session finished: cancelled");
            self.sink.finished(SessionOutcome::Cancelled);
        }
    }
}

async fn run_session(
    params: SessionParams,
    sink: Arc<dyn EventSink>,
    teardown: TeardownHandle,
    state: Arc<SessionState>,
    _guard: ActiveGuard,
) -> Result<TransferSummary> {
    let result = drive(params, sink.as_ref(), &teardown).await;

    teardown.teardown();
    state.running.store(false, Ordering::Release);
    settle(&state, sink.as_ref(), result)
}

/// Turn the task's result into the one reported both to the sink and to
/// `wait`. A cancel that claimed the session first wins over any result.
fn settle(state: &SessionState, sink: &dyn EventSink, result: Result<TransferSummary>) -> Result<TransferSummary> {
    let result = match result {
        _ if state.cancelled.load(Ordering::Acquire) => Err(TransferError::Cancelled),
        other => other,
    };

    if !state.claim() {
        return Err(TransferError::Cancelled);
    }

    match &result {
        Ok(summary) => sink.finished(SessionOutcome::Completed(summary)),
        Err(TransferError::Cancelled) => sink.finished(SessionOutcome::Cancelled),
        Err(e) => {
            warn!("Transfer failed: {}", e);
            sink.finished(SessionOutcome::Failed(e));
        }
    }
    debug!("Session finished");
    result
}

async fn drive(
    params: SessionParams,
    sink: &dyn EventSink,
    teardown: &TeardownHandle,
) -> Result<TransferSummary> {
    let SessionParams {
        workload,
        peer_platform,
        key,
        peer_addr,
        config,
    } = params;

    let role = workload.role();
    let hosting = HostingStatus::derive(peer_platform, role);
    info!("Starting session: {} as {:?}", role, hosting);

    let mut stream = establish(hosting, peer_addr, &config, teardown, sink).await?;

    let mut handshake = Handshake::new(role, hosting, config.protocol_version)
        .with_min_supported(config.min_supported_version);
    let outcome = match config.handshake_timeout() {
        Some(limit) => tokio::time::timeout(limit, handshake.run(&mut stream))
            .await
            .map_err(|_| {
                TransferError::PeerDisconnected(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer did not complete the handshake in time",
                ))
            })??,
        None => handshake.run(&mut stream).await?,
    };
    sink.status(&StatusEvent::HandshakeComplete {
        peer_version: outcome.peer_version,
    });

    let channel = FileChannel::new(key, config.chunk_size).with_io_timeout(config.io_timeout());
    TransferSession::new(outcome, stream, channel)
        .run(workload, sink)
        .await
}
