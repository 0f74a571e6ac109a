//! Session state machine and resource ownership.
//!
//! The [`LifecycleController`] is the only owner of the session's external
//! resources. Each slot is filled once, in acquisition order
//! (remote process → socket → sink), and [`LifecycleController::teardown`]
//! releases them in reverse, attempting every step even when an earlier one
//! fails.

use crate::bridge::RemoteProcess;
use crate::error::{Result, SessionError};
use crate::observer::SessionObserver;
use crate::pump::ChunkSink;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// How long the remote process gets to exit on its own
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `fut` unless `cancel` fires first, in which case the step yields
/// [`SessionError::Cancelled`] and `fut` is dropped.
pub async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = fut => result,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum SessionState {
    Idle,
    Bootstrapping,
    Connecting,
    Negotiating,
    Streaming,
    Terminating,
    Closed,
}

/// Byte stream the session reads from. Blanket-implemented so tests can use
/// in-memory pipes in place of a `TcpStream`.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Resource {
    #[strum(serialize = "audio sink")]
    Sink,
    #[strum(serialize = "socket")]
    Socket,
    #[strum(serialize = "remote process")]
    RemoteProcess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Remote process ignored the stop request and was killed
    ForceKilled,
    Failed(String),
}

impl fmt::Display for ReleaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseOutcome::Released => write!(f, "released"),
            ReleaseOutcome::ForceKilled => write!(f, "force-killed"),
            ReleaseOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// What teardown did, in the order it did it. Empty when there was nothing
/// left to release.
#[derive(Debug, Default, Clone)]
pub struct TeardownReport {
    pub steps: Vec<(Resource, ReleaseOutcome)>,
}

impl TeardownReport {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn all_released(&self) -> bool {
        self.steps
            .iter()
            .all(|(_, outcome)| !matches!(outcome, ReleaseOutcome::Failed(_)))
    }
}

pub struct LifecycleController {
    state: SessionState,
    cancel: CancellationToken,
    observer: Arc<dyn SessionObserver>,
    stop_timeout: Duration,
    remote: Option<Box<dyn RemoteProcess>>,
    socket: Option<Box<dyn Transport>>,
    sink: Option<Box<dyn ChunkSink>>,
}

impl LifecycleController {
    pub fn new(observer: Arc<dyn SessionObserver>, stop_timeout: Duration) -> Self {
        Self {
            state: SessionState::Idle,
            cancel: CancellationToken::new(),
            observer,
            stop_timeout,
            remote: None,
            socket: None,
            sink: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token every blocking step of the session selects on.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Move forward to `to`.
    ///
    /// Skipping states is allowed (the metadata channel has no header to
    /// negotiate). Going back, leaving `Closed`, or entering `Closed` other
    /// than from `Terminating` is not.
    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        let from = self.state;
        let allowed = match (from, to) {
            (SessionState::Closed, _) => false,
            (SessionState::Terminating, SessionState::Closed) => true,
            (_, SessionState::Closed) => false,
            (from, to) => to > from,
        };
        if !allowed {
            return Err(SessionError::InvalidTransition { from, to });
        }

        self.state = to;
        self.observer.state_changed(from, to);
        Ok(())
    }

    fn check_open(&self, resource: Resource) -> Result<()> {
        if self.state >= SessionState::Terminating {
            return Err(SessionError::ResourceRejected {
                resource,
                reason: format!("session is {}", self.state),
            });
        }
        Ok(())
    }

    pub fn register_remote(&mut self, process: Box<dyn RemoteProcess>) -> Result<()> {
        self.check_open(Resource::RemoteProcess)?;
        if self.remote.is_some() {
            return Err(SessionError::ResourceRejected {
                resource: Resource::RemoteProcess,
                reason: "already registered".to_string(),
            });
        }
        log::debug!("Registered remote process (pid {:?})", process.id());
        self.remote = Some(process);
        Ok(())
    }

    pub fn register_socket(&mut self, socket: Box<dyn Transport>) -> Result<()> {
        self.check_open(Resource::Socket)?;
        if self.socket.is_some() {
            return Err(SessionError::ResourceRejected {
                resource: Resource::Socket,
                reason: "already registered".to_string(),
            });
        }
        self.socket = Some(socket);
        Ok(())
    }

    pub fn register_sink(&mut self, sink: Box<dyn ChunkSink>) -> Result<()> {
        self.check_open(Resource::Sink)?;
        if self.sink.is_some() {
            return Err(SessionError::ResourceRejected {
                resource: Resource::Sink,
                reason: "already registered".to_string(),
            });
        }
        self.sink = Some(sink);
        Ok(())
    }

    pub fn socket_mut(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.socket.as_deref_mut()
    }

    /// Socket and sink borrowed together for the pump.
    pub fn streaming_parts(
        &mut self,
    ) -> Option<(&mut (dyn Transport + 'static), &mut (dyn ChunkSink + 'static))> {
        match (self.socket.as_deref_mut(), self.sink.as_deref_mut()) {
            (Some(socket), Some(sink)) => Some((socket, sink)),
            _ => None,
        }
    }

    /// Release everything this session acquired.
    ///
    /// Order: stop sink, close socket, stop the remote process (bounded wait,
    /// then kill). Safe to call any number of times; only the first call
    /// does work.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == SessionState::Closed {
            log::debug!("Teardown requested on a closed session, nothing to do");
            return report;
        }

        if self.state != SessionState::Terminating {
            // Forward to Terminating is always legal from a non-closed state
            let _ = self.transition(SessionState::Terminating);
        }
        // Wake anything still parked on the token
        self.cancel.cancel();
        log::info!("🧹 Cleaning up resources...");

        if let Some(mut sink) = self.sink.take() {
            let outcome = match sink.stop().await {
                Ok(()) => ReleaseOutcome::Released,
                Err(e) => ReleaseOutcome::Failed(e.to_string()),
            };
            report.steps.push((Resource::Sink, outcome));
        }

        if let Some(mut socket) = self.socket.take() {
            let outcome = match socket.shutdown().await {
                Ok(()) => ReleaseOutcome::Released,
                // Peer already gone; dropping the handle closes it
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
                    ReleaseOutcome::Released
                }
                Err(e) => ReleaseOutcome::Failed(e.to_string()),
            };
            drop(socket);
            report.steps.push((Resource::Socket, outcome));
        }

        if let Some(process) = self.remote.take() {
            let outcome = self.stop_remote(process).await;
            report.steps.push((Resource::RemoteProcess, outcome));
        }

        for (resource, outcome) in &report.steps {
            match outcome {
                ReleaseOutcome::Failed(_) => log::warn!("⚠️  {}: {}", resource, outcome),
                _ => log::debug!("{}: {}", resource, outcome),
            }
        }

        let _ = self.transition(SessionState::Closed);
        report
    }

    async fn stop_remote(&self, mut process: Box<dyn RemoteProcess>) -> ReleaseOutcome {
        if let Err(e) = process.signal_stop() {
            log::debug!("Stop signal to remote process failed: {}", e);
        }

        match tokio::time::timeout(self.stop_timeout, process.wait()).await {
            Ok(Ok(code)) => {
                log::debug!("Remote process exited with {:?}", code);
                ReleaseOutcome::Released
            }
            Ok(Err(e)) => {
                log::debug!("Waiting for remote process failed: {}, killing", e);
                match process.force_kill().await {
                    Ok(()) => ReleaseOutcome::ForceKilled,
                    Err(kill_err) => ReleaseOutcome::Failed(format!("{}; {}", e, kill_err)),
                }
            }
            Err(_) => {
                log::warn!(
                    "⚠️  Remote process still running after {:?}, killing it",
                    self.stop_timeout
                );
                match process.force_kill().await {
                    Ok(()) => ReleaseOutcome::ForceKilled,
                    Err(e) => ReleaseOutcome::Failed(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{MemorySink, MockRemoteProcess, RecordingObserver};

    fn controller() -> (LifecycleController, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        (
            LifecycleController::new(observer.clone(), Duration::from_millis(100)),
            observer,
        )
    }

    #[test]
    fn test_forward_transitions() {
        let (mut controller, observer) = controller();
        controller.transition(SessionState::Bootstrapping).unwrap();
        controller.transition(SessionState::Connecting).unwrap();
        controller.transition(SessionState::Streaming).unwrap();
        assert_eq!(controller.state(), SessionState::Streaming);
        assert_eq!(observer.states().len(), 3);

        let err = controller.transition(SessionState::Connecting).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_closed_only_from_terminating() {
        let (mut controller, _) = controller();
        assert!(controller.transition(SessionState::Closed).is_err());
        controller.transition(SessionState::Terminating).unwrap();
        controller.transition(SessionState::Closed).unwrap();
        assert!(controller.transition(SessionState::Terminating).is_err());
        assert!(controller.transition(SessionState::Idle).is_err());
    }

    #[tokio::test]
    async fn test_teardown_releases_in_reverse_order() {
        let (mut controller, _) = controller();
        let (remote, counters) = MockRemoteProcess::new(true);
        let (socket, _peer) = tokio::io::duplex(64);
        let sink = MemorySink::default();

        controller.register_remote(Box::new(remote)).unwrap();
        controller.register_socket(Box::new(socket)).unwrap();
        controller.register_sink(Box::new(sink.clone())).unwrap();

        let report = controller.teardown().await;
        let order: Vec<Resource> = report.steps.iter().map(|(r, _)| *r).collect();
        assert_eq!(
            order,
            vec![Resource::Sink, Resource::Socket, Resource::RemoteProcess]
        );
        assert!(report.all_released());
        assert_eq!(sink.stop_count(), 1);
        assert_eq!(counters.signals(), 1);
        assert_eq!(counters.kills(), 0);
        assert_eq!(controller.state(), SessionState::Closed);
        assert!(controller.is_cancelled());
    }

    #[tokio::test]
    async fn test_teardown_twice_is_a_noop() {
        let (mut controller, _) = controller();
        let (remote, counters) = MockRemoteProcess::new(true);
        let sink = MemorySink::default();
        controller.register_remote(Box::new(remote)).unwrap();
        controller.register_sink(Box::new(sink.clone())).unwrap();

        let first = controller.teardown().await;
        let second = controller.teardown().await;
        assert_eq!(first.steps.len(), 2);
        assert!(second.is_empty());
        assert_eq!(sink.stop_count(), 1);
        assert_eq!(counters.signals(), 1);
    }

    #[tokio::test]
    async fn test_stubborn_remote_is_killed() {
        let (mut controller, _) = controller();
        let (remote, counters) = MockRemoteProcess::new(false);
        controller.register_remote(Box::new(remote)).unwrap();

        let report = controller.teardown().await;
        assert_eq!(
            report.steps,
            vec![(Resource::RemoteProcess, ReleaseOutcome::ForceKilled)]
        );
        assert_eq!(counters.kills(), 1);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_other_releases() {
        let (mut controller, _) = controller();
        let (remote, counters) = MockRemoteProcess::new(true);
        controller.register_remote(Box::new(remote)).unwrap();
        controller
            .register_sink(Box::new(MemorySink::failing()))
            .unwrap();

        let report = controller.teardown().await;
        assert!(!report.all_released());
        assert!(matches!(report.steps[0].1, ReleaseOutcome::Failed(_)));
        assert_eq!(report.steps[1].1, ReleaseOutcome::Released);
        assert_eq!(counters.signals(), 1);
    }

    #[tokio::test]
    async fn test_resources_are_write_once() {
        let (mut controller, _) = controller();
        controller
            .register_sink(Box::new(MemorySink::default()))
            .unwrap();
        let err = controller
            .register_sink(Box::new(MemorySink::default()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        controller.teardown().await;
        let (remote, _) = MockRemoteProcess::new(true);
        assert!(controller.register_remote(Box::new(remote)).is_err());
    }
}
