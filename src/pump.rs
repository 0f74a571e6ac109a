//! The streaming loop: socket → sink until something ends the stream.

use crate::audio_sink::AudioError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Recommended read size for the transport
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("Sink already stopped")]
    Stopped,
}

/// Consumer of the byte stream.
///
/// `write` may take as long as it needs; a slow sink throttles the pump, which
/// is the only flow control between device and host.
#[async_trait::async_trait]
pub trait ChunkSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError>;

    /// Flush what is left and release the underlying output. Idempotent.
    async fn stop(&mut self) -> Result<(), SinkError>;
}

/// Why the pump stopped.
#[derive(Debug)]
pub enum TerminationReason {
    /// Remote end closed the connection
    PeerClosed,
    /// No data within the configured read timeout
    Timeout(Duration),
    /// Cancellation token fired
    Cancelled,
    TransportError(io::Error),
    SinkError(SinkError),
}

impl TerminationReason {
    /// Peer close and user cancellation are normal ways for a session to end.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            TerminationReason::PeerClosed | TerminationReason::Cancelled
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::PeerClosed => write!(f, "connection closed by device"),
            TerminationReason::Timeout(after) => write!(f, "no data for {:?}", after),
            TerminationReason::Cancelled => write!(f, "stopped by user"),
            TerminationReason::TransportError(e) => write!(f, "transport error: {}", e),
            TerminationReason::SinkError(e) => write!(f, "sink error: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct PumpOutcome {
    pub reason: TerminationReason,
    /// Bytes accepted by the sink
    pub bytes: u64,
    pub chunks: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub chunk_size: usize,
    /// `None` blocks on the socket indefinitely
    pub read_timeout: Option<Duration>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout: None,
        }
    }
}

enum ReadResult {
    Data(usize),
    Eof,
    TimedOut,
    Failed(io::Error),
}

pub struct StreamPump {
    config: PumpConfig,
}

impl StreamPump {
    pub fn new(config: PumpConfig) -> Self {
        Self { config }
    }

    /// Move bytes from `reader` to `sink` until the peer closes, a read times
    /// out, either side fails, or `cancel` fires.
    ///
    /// Both the read and the sink write race against the token, so
    /// cancellation never waits for the next chunk.
    pub async fn run<R>(
        &self,
        reader: &mut R,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> PumpOutcome
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut bytes = 0u64;
        let mut chunks = 0u64;

        let reason = loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break TerminationReason::Cancelled,
                result = read_chunk(reader, &mut buf, self.config.read_timeout) => result,
            };

            let n = match read {
                ReadResult::Data(n) => n,
                ReadResult::Eof => {
                    log::info!("🔌 Connection closed by device");
                    break TerminationReason::PeerClosed;
                }
                ReadResult::TimedOut => {
                    // read_timeout is always set when a read times out
                    let after = self.config.read_timeout.unwrap_or_default();
                    log::error!("⏱️  Socket timeout while waiting for data");
                    break TerminationReason::Timeout(after);
                }
                ReadResult::Failed(e) => {
                    log::error!("❌ Socket error: {}", e);
                    break TerminationReason::TransportError(e);
                }
            };

            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("Cancelled with {} read bytes not yet in the sink", n);
                    break TerminationReason::Cancelled;
                }
                result = sink.write(&buf[..n]) => result,
            };

            if let Err(e) = written {
                log::error!("❌ Error during playback: {}", e);
                break TerminationReason::SinkError(e);
            }

            bytes += n as u64;
            chunks += 1;
        };

        log::debug!(
            "Pump finished after {} chunks / {} bytes: {}",
            chunks,
            bytes,
            reason
        );

        PumpOutcome {
            reason,
            bytes,
            chunks,
        }
    }
}

async fn read_chunk<R>(reader: &mut R, buf: &mut [u8], timeout: Option<Duration>) -> ReadResult
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => return ReadResult::TimedOut,
        },
        None => reader.read(buf).await,
    };

    match result {
        Ok(0) => ReadResult::Eof,
        Ok(n) => ReadResult::Data(n),
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            ReadResult::TimedOut
        }
        Err(e) => ReadResult::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySink;
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_forwards_every_byte_in_order() {
        let (mut reader, mut writer) = tokio::io::duplex(1024);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();

        tokio::spawn(async move {
            for part in sent.chunks(777) {
                writer.write_all(part).await.unwrap();
            }
        });

        let mut sink = MemorySink::default();
        let pump = StreamPump::new(PumpConfig::default());
        let outcome = pump
            .run(&mut reader, &mut sink, &CancellationToken::new())
            .await;

        assert!(matches!(outcome.reason, TerminationReason::PeerClosed));
        assert_eq!(outcome.bytes, payload.len() as u64);
        assert_eq!(sink.data(), payload);
    }

    #[tokio::test]
    async fn test_chunks_are_bounded_by_chunk_size() {
        let (mut reader, mut writer) = tokio::io::duplex(64 * 1024);
        writer.write_all(&[7u8; 20_000]).await.unwrap();
        drop(writer);

        let mut sink = MemorySink::default();
        let pump = StreamPump::new(PumpConfig {
            chunk_size: 4096,
            read_timeout: None,
        });
        let outcome = pump
            .run(&mut reader, &mut sink, &CancellationToken::new())
            .await;

        assert_eq!(outcome.bytes, 20_000);
        assert!(sink.chunk_sizes().iter().all(|&n| n > 0 && n <= 4096));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut reader, _writer) = tokio::io::duplex(64);
        let mut sink = MemorySink::default();
        let pump = StreamPump::new(PumpConfig {
            chunk_size: 16,
            read_timeout: Some(Duration::from_millis(50)),
        });

        let outcome = pump
            .run(&mut reader, &mut sink, &CancellationToken::new())
            .await;
        assert!(matches!(outcome.reason, TerminationReason::Timeout(_)));
        assert!(!outcome.reason.is_clean());
        assert_eq!(outcome.bytes, 0);
    }

    #[tokio::test]
    async fn test_cancel_while_blocked_on_read() {
        let (mut reader, _writer) = tokio::io::duplex(64);
        let mut sink = MemorySink::default();
        let cancel = CancellationToken::new();
        let pump = StreamPump::new(PumpConfig::default());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            pump.run(&mut reader, &mut sink, &cancel),
        )
        .await
        .expect("pump must honour cancellation");

        assert!(matches!(outcome.reason, TerminationReason::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancel_while_blocked_on_sink() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        writer.write_all(b"abc").await.unwrap();

        let mut sink = MemorySink::blocking();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let pump = StreamPump::new(PumpConfig::default());
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            pump.run(&mut reader, &mut sink, &cancel),
        )
        .await
        .expect("pump must not wait for a stuck sink");

        assert!(matches!(outcome.reason, TerminationReason::Cancelled));
        assert_eq!(outcome.bytes, 0);
    }

    #[tokio::test]
    async fn test_sink_failure_ends_pump() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        writer.write_all(b"hello").await.unwrap();

        let mut sink = MemorySink::failing();
        let pump = StreamPump::new(PumpConfig::default());
        let outcome = pump
            .run(&mut reader, &mut sink, &CancellationToken::new())
            .await;

        assert!(matches!(outcome.reason, TerminationReason::SinkError(_)));
        assert_eq!(outcome.bytes, 0);
    }
}
