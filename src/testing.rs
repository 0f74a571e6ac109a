//! In-memory stand-ins for the device, the bridge and the outputs.
//!
//! Used by the unit tests and the integration tests under `tests/`, so a
//! whole session can run on a machine with no phone and no sound card.

use crate::audio_sink::AudioError;
use crate::bridge::{Bridge, BridgeError, DeviceEntry, DeviceState, RemoteProcess};
use crate::error::{Result as SessionResult, SessionError};
use crate::lifecycle::SessionState;
use crate::metadata::{ArtworkDisplay, MetadataError, MetadataEvent, MetadataPresenter};
use crate::observer::SessionObserver;
use crate::protocol::StreamHeader;
use crate::pump::{ChunkSink, SinkError};
use crate::session::{SessionSummary, SinkFactory};
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SinkMode {
    #[default]
    Accepting,
    /// `write` never completes
    Blocking,
    /// Both `write` and `stop` fail
    Failing,
}

#[derive(Debug, Default)]
struct SinkState {
    data: Vec<u8>,
    chunk_sizes: Vec<usize>,
    stops: usize,
}

/// [`ChunkSink`] collecting everything in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    mode: SinkMode,
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn blocking() -> Self {
        Self {
            mode: SinkMode::Blocking,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            mode: SinkMode::Failing,
            ..Self::default()
        }
    }

    pub fn data(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().chunk_sizes.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stops
    }
}

#[async_trait::async_trait]
impl ChunkSink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        match self.mode {
            SinkMode::Accepting => {
                let mut state = self.state.lock().unwrap();
                state.data.extend_from_slice(chunk);
                state.chunk_sizes.push(chunk.len());
                Ok(())
            }
            SinkMode::Blocking => std::future::pending().await,
            SinkMode::Failing => Err(AudioError::WriteError("device unplugged".to_string()).into()),
        }
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        self.state.lock().unwrap().stops += 1;
        match self.mode {
            SinkMode::Failing => Err(AudioError::StopError("device unplugged".to_string()).into()),
            _ => Ok(()),
        }
    }
}

/// [`SinkFactory`] handing out clones of one [`MemorySink`] and remembering
/// the header it was opened with.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    sink: MemorySink,
    headers: Arc<Mutex<Vec<Option<StreamHeader>>>>,
    fail_open: bool,
}

impl MemorySinkFactory {
    pub fn new(sink: MemorySink) -> Self {
        Self {
            sink,
            ..Self::default()
        }
    }

    /// Every `open` fails as if the output device were missing.
    pub fn unavailable() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn sink(&self) -> MemorySink {
        self.sink.clone()
    }

    pub fn headers(&self) -> Vec<Option<StreamHeader>> {
        self.headers.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SinkFactory for MemorySinkFactory {
    async fn open(&mut self, header: Option<&StreamHeader>) -> SessionResult<Box<dyn ChunkSink>> {
        self.headers.lock().unwrap().push(header.copied());
        if self.fail_open {
            return Err(SessionError::Sink(AudioError::DeviceError(
                "no output device".to_string(),
            )));
        }
        Ok(Box::new(self.sink.clone()))
    }
}

/// Observer that keeps every callback for later assertions.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    states: Mutex<Vec<(SessionState, SessionState)>>,
    progress: Mutex<Vec<u64>>,
    rejected: Mutex<Vec<String>>,
    /// (bytes, reason, clean)
    finished: Mutex<Vec<(u64, String, bool)>>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<(SessionState, SessionState)> {
        self.states.lock().unwrap().clone()
    }

    /// Target state of every transition, in order
    pub fn visited(&self) -> Vec<SessionState> {
        self.states().into_iter().map(|(_, to)| to).collect()
    }

    pub fn progress_events(&self) -> Vec<u64> {
        self.progress.lock().unwrap().clone()
    }

    pub fn rejected_lines(&self) -> Vec<String> {
        self.rejected.lock().unwrap().clone()
    }

    pub fn summaries(&self) -> Vec<(u64, String, bool)> {
        self.finished.lock().unwrap().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn state_changed(&self, from: SessionState, to: SessionState) {
        self.states.lock().unwrap().push((from, to));
    }

    fn progress(&self, total_bytes: u64) {
        self.progress.lock().unwrap().push(total_bytes);
    }

    fn metadata_rejected(&self, line: &str, _error: &MetadataError) {
        self.rejected.lock().unwrap().push(line.to_string());
    }

    fn finished(&self, summary: &SessionSummary) {
        self.finished.lock().unwrap().push((
            summary.bytes,
            summary.reason.to_string(),
            summary.reason.is_clean(),
        ));
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPresenter {
    events: Arc<Mutex<Vec<MetadataEvent>>>,
}

impl RecordingPresenter {
    pub fn events(&self) -> Vec<MetadataEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.title).collect()
    }
}

impl MetadataPresenter for RecordingPresenter {
    fn present(&mut self, event: &MetadataEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingArtwork {
    images: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingArtwork {
    pub fn images(&self) -> Vec<Vec<u8>> {
        self.images.lock().unwrap().clone()
    }
}

impl ArtworkDisplay for RecordingArtwork {
    fn show(&mut self, image: &[u8], _event: &MetadataEvent) -> io::Result<()> {
        self.images.lock().unwrap().push(image.to_vec());
        Ok(())
    }
}

/// Counters shared between a [`MockRemoteProcess`] and the test.
#[derive(Debug, Clone, Default)]
pub struct RemoteCounters {
    signals: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
    spawned: Arc<AtomicUsize>,
}

impl RemoteCounters {
    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

/// Fake remote server. With `exits_on_signal` false it ignores the stop
/// request and has to be killed.
#[derive(Debug)]
pub struct MockRemoteProcess {
    exits_on_signal: bool,
    signalled: bool,
    counters: RemoteCounters,
}

impl MockRemoteProcess {
    pub fn new(exits_on_signal: bool) -> (Self, RemoteCounters) {
        let counters = RemoteCounters::default();
        (Self::with_counters(exits_on_signal, counters.clone()), counters)
    }

    pub fn with_counters(exits_on_signal: bool, counters: RemoteCounters) -> Self {
        counters.spawned.fetch_add(1, Ordering::SeqCst);
        Self {
            exits_on_signal,
            signalled: false,
            counters,
        }
    }
}

#[async_trait::async_trait]
impl RemoteProcess for MockRemoteProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn signal_stop(&mut self) -> io::Result<()> {
        self.counters.signals.fetch_add(1, Ordering::SeqCst);
        self.signalled = true;
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if self.signalled && self.exits_on_signal {
            return Ok(Some(0));
        }
        std::future::pending().await
    }

    async fn force_kill(&mut self) -> io::Result<()> {
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct BridgeState {
    installed: bool,
    devices: Vec<DeviceEntry>,
    push_failures: VecDeque<String>,
    forward_error: Option<String>,
    remote_exits_on_signal: bool,
    push_hangs: bool,
    calls: Vec<String>,
}

/// Scriptable [`Bridge`] that records every call as a short string such as
/// `"forward 9999 9999"`.
#[derive(Debug)]
pub struct MockBridge {
    state: Mutex<BridgeState>,
    counters: RemoteCounters,
}

impl MockBridge {
    pub fn with_devices(devices: &[(&str, DeviceState)]) -> Self {
        Self {
            state: Mutex::new(BridgeState {
                installed: true,
                devices: devices
                    .iter()
                    .map(|(serial, state)| DeviceEntry {
                        serial: serial.to_string(),
                        state: state.clone(),
                    })
                    .collect(),
                push_failures: VecDeque::new(),
                forward_error: None,
                remote_exits_on_signal: true,
                push_hangs: false,
                calls: Vec::new(),
            }),
            counters: RemoteCounters::default(),
        }
    }

    pub fn with_device(serial: &str) -> Self {
        Self::with_devices(&[(serial, DeviceState::Device)])
    }

    /// No bridge executable at all.
    pub fn missing() -> Self {
        let bridge = Self::with_devices(&[]);
        bridge.state.lock().unwrap().installed = false;
        bridge
    }

    /// Queue one failing `push` with the given adb output.
    pub fn fail_push(&self, output: &str) {
        self.state
            .lock()
            .unwrap()
            .push_failures
            .push_back(output.to_string());
    }

    pub fn fail_forward(&self, output: &str) {
        self.state.lock().unwrap().forward_error = Some(output.to_string());
    }

    /// `push` never completes, like adb stuck on an unresponsive device.
    pub fn hang_push(&self) {
        self.state.lock().unwrap().push_hangs = true;
    }

    /// Spawned servers ignore the stop signal.
    pub fn stubborn_remote(&self) {
        self.state.lock().unwrap().remote_exits_on_signal = false;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn remote_counters(&self) -> RemoteCounters {
        self.counters.clone()
    }

    fn record(&self, call: String) -> std::result::Result<(), BridgeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.installed {
            Ok(())
        } else {
            Err(BridgeError::NotFound("adb".to_string()))
        }
    }
}

#[async_trait::async_trait]
impl Bridge for MockBridge {
    async fn version(&self) -> std::result::Result<String, BridgeError> {
        self.record("version".to_string())?;
        Ok("Android Debug Bridge version 1.0.41".to_string())
    }

    async fn devices(&self) -> std::result::Result<Vec<DeviceEntry>, BridgeError> {
        self.record("devices".to_string())?;
        Ok(self.state.lock().unwrap().devices.clone())
    }

    async fn push(&self, _local: &Path, remote: &str) -> std::result::Result<(), BridgeError> {
        self.record(format!("push {}", remote))?;
        let hangs = self.state.lock().unwrap().push_hangs;
        if hangs {
            std::future::pending::<()>().await;
        }
        match self.state.lock().unwrap().push_failures.pop_front() {
            Some(output) => Err(BridgeError::CommandFailed {
                command: format!("adb push {}", remote),
                status: 1,
                output,
            }),
            None => Ok(()),
        }
    }

    async fn forward(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> std::result::Result<(), BridgeError> {
        self.record(format!("forward {} {}", local_port, remote_port))?;
        match &self.state.lock().unwrap().forward_error {
            Some(output) => Err(BridgeError::CommandFailed {
                command: format!("adb forward tcp:{} tcp:{}", local_port, remote_port),
                status: 1,
                output: output.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn spawn_shell(
        &self,
        command: &str,
    ) -> std::result::Result<Box<dyn RemoteProcess>, BridgeError> {
        self.record(format!("shell {}", command))?;
        let exits = self.state.lock().unwrap().remote_exits_on_signal;
        Ok(Box::new(MockRemoteProcess::with_counters(
            exits,
            self.counters.clone(),
        )))
    }
}

/// What the fake device server sends on its single connection.
#[derive(Debug, Clone, Default)]
pub struct ServerScript {
    /// Written first, e.g. the 6-byte audio header
    pub preamble: Vec<u8>,
    pub payload: Vec<u8>,
    /// Split the payload into writes of this size (0 = one write)
    pub write_size: usize,
    /// Keep the connection open after the payload instead of closing it
    pub hold_open: bool,
}

/// Loopback TCP server standing in for the forwarded device port.
pub struct MockStreamServer {
    port: u16,
    handle: JoinHandle<()>,
}

impl MockStreamServer {
    pub async fn start(script: ServerScript) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::debug!("Mock server accept failed: {}", e);
                    return;
                }
            };

            if stream.write_all(&script.preamble).await.is_err() {
                return;
            }
            let write_size = if script.write_size == 0 {
                script.payload.len().max(1)
            } else {
                script.write_size
            };
            for part in script.payload.chunks(write_size) {
                if stream.write_all(part).await.is_err() {
                    return;
                }
            }
            let _ = stream.flush().await;

            if script.hold_open {
                // Until the client goes away
                let mut scratch = [0u8; 64];
                loop {
                    match tokio::io::AsyncReadExt::read(&mut stream, &mut scratch).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            }
        });

        Ok(Self { port, handle })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the server task to finish, bounded by `limit`.
    pub async fn finished(self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.handle).await.is_ok()
    }
}
