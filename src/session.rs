//! One streaming session from bootstrap to teardown.

use crate::audio_sink::{AudioError, CpalConfig, CpalSink};
use crate::bootstrap::Bootstrapper;
use crate::bridge::Bridge;
use crate::config::{SessionConfig, StreamMode};
use crate::connector;
use crate::error::{Result, SessionError};
use crate::lifecycle::{
    until_cancelled, LifecycleController, Resource, SessionState, TeardownReport,
};
use crate::metadata::{ArtworkFile, LineSink, NowPlayingPrinter};
use crate::observer::SessionObserver;
use crate::protocol::{self, StreamHeader};
use crate::pump::{ChunkSink, PumpConfig, PumpOutcome, StreamPump, TerminationReason};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a session that got past configuration ended.
#[derive(Debug)]
pub struct SessionSummary {
    /// Bytes delivered to the sink
    pub bytes: u64,
    pub reason: TerminationReason,
    /// Negotiated audio format, when one was read
    pub header: Option<StreamHeader>,
    pub teardown: TeardownReport,
}

/// Creates the consumer once the stream shape is known.
#[async_trait::async_trait]
pub trait SinkFactory: Send {
    /// `header` is `None` on channels without a preamble.
    async fn open(&mut self, header: Option<&StreamHeader>) -> Result<Box<dyn ChunkSink>>;
}

/// Opens a [`CpalSink`] matching the negotiated header.
pub struct CpalSinkFactory {
    config: CpalConfig,
    observer: Arc<dyn SessionObserver>,
}

impl CpalSinkFactory {
    pub fn new(config: CpalConfig, observer: Arc<dyn SessionObserver>) -> Self {
        Self { config, observer }
    }
}

#[async_trait::async_trait]
impl SinkFactory for CpalSinkFactory {
    async fn open(&mut self, header: Option<&StreamHeader>) -> Result<Box<dyn ChunkSink>> {
        let header = header.ok_or_else(|| {
            SessionError::Sink(AudioError::Unsupported(
                "audio output needs a stream header".to_string(),
            ))
        })?;
        let sink = CpalSink::open(header, self.config.clone(), self.observer.clone()).await?;
        Ok(Box::new(sink))
    }
}

/// Opens a [`LineSink`] printing "now playing" blocks.
pub struct MetadataSinkFactory {
    artwork_path: Option<PathBuf>,
    observer: Arc<dyn SessionObserver>,
}

impl MetadataSinkFactory {
    pub fn new(artwork_path: Option<PathBuf>, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            artwork_path,
            observer,
        }
    }
}

#[async_trait::async_trait]
impl SinkFactory for MetadataSinkFactory {
    async fn open(&mut self, _header: Option<&StreamHeader>) -> Result<Box<dyn ChunkSink>> {
        Ok(Box::new(LineSink::new(
            Box::new(NowPlayingPrinter),
            Box::new(ArtworkFile::new(self.artwork_path.clone())),
            self.observer.clone(),
        )))
    }
}

pub struct Session {
    config: SessionConfig,
    bridge: Arc<dyn Bridge>,
    sinks: Box<dyn SinkFactory>,
    observer: Arc<dyn SessionObserver>,
    controller: LifecycleController,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        bridge: Arc<dyn Bridge>,
        sinks: Box<dyn SinkFactory>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let controller = LifecycleController::new(observer.clone(), config.stop_timeout);
        Self {
            config,
            bridge,
            sinks,
            observer,
            controller,
        }
    }

    /// Cancelling this token stops the session at whatever step it is in.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.controller.cancellation_token()
    }

    /// Run the session to the end.
    ///
    /// Teardown always runs before this returns. Cancellation at any point is
    /// reported as a summary with [`TerminationReason::Cancelled`], not as an
    /// error; everything that stops the session before streaming starts is
    /// returned as the corresponding [`SessionError`].
    pub async fn run(mut self) -> Result<SessionSummary> {
        let result = self.drive().await;
        let teardown = self.controller.teardown().await;

        let (header, outcome) = match result {
            Ok(done) => done,
            Err(SessionError::Cancelled) => {
                log::info!("⏹️  Session cancelled before streaming");
                (None, None)
            }
            Err(e) => {
                log::debug!("Session failed: {}", e);
                return Err(e);
            }
        };

        let summary = match outcome {
            Some(outcome) => SessionSummary {
                bytes: outcome.bytes,
                reason: outcome.reason,
                header,
                teardown,
            },
            None => SessionSummary {
                bytes: 0,
                reason: TerminationReason::Cancelled,
                header,
                teardown,
            },
        };
        self.observer.finished(&summary);
        Ok(summary)
    }

    async fn drive(&mut self) -> Result<(Option<StreamHeader>, Option<PumpOutcome>)> {
        self.config.validate()?;
        let cancel = self.controller.cancellation_token();

        self.controller.transition(SessionState::Bootstrapping)?;
        let bootstrapper = Bootstrapper::new(self.config.clone(), self.bridge.clone());
        let tunnel = bootstrapper
            .prepare(self.config.device_serial.as_deref(), &mut self.controller)
            .await?;

        self.controller.transition(SessionState::Connecting)?;
        let stream = until_cancelled(
            &cancel,
            connector::connect(&tunnel.host, tunnel.port, self.config.connect_timeout),
        )
        .await?;
        self.controller.register_socket(Box::new(stream))?;

        let header = match self.config.mode {
            StreamMode::Audio => {
                self.controller.transition(SessionState::Negotiating)?;
                let socket = self.controller.socket_mut().ok_or_else(not_registered)?;
                let header = until_cancelled(
                    &cancel,
                    protocol::read_header(socket, self.config.header_timeout),
                )
                .await?;
                log::info!(
                    "🎵 Audio format: {} Hz, {} channel(s), format code {}",
                    header.sample_rate,
                    header.channels,
                    header.format
                );
                Some(header)
            }
            StreamMode::Metadata => None,
        };

        let sink = until_cancelled(&cancel, self.sinks.open(header.as_ref())).await?;
        self.controller.register_sink(sink)?;

        self.controller.transition(SessionState::Streaming)?;
        log::info!("▶️  Streaming, press Ctrl+C to stop");

        let pump = StreamPump::new(PumpConfig {
            chunk_size: self.config.chunk_size,
            read_timeout: self.config.read_timeout,
        });
        let (socket, sink) = self
            .controller
            .streaming_parts()
            .ok_or_else(not_registered)?;
        let outcome = pump.run(socket, sink, &cancel).await;
        log::info!("⏹️  Stream ended: {}", outcome.reason);

        Ok((header, Some(outcome)))
    }
}

fn not_registered() -> SessionError {
    SessionError::ResourceRejected {
        resource: Resource::Socket,
        reason: "not registered".to_string(),
    }
}
