//! Getting from "a phone is plugged in" to "a port is listening on localhost".

use crate::bridge::{Bridge, BridgeError, DeviceEntry, DeviceState};
use crate::config::{SessionConfig, StreamMode};
use crate::error::{Result, SessionError};
use crate::lifecycle::{until_cancelled, LifecycleController};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where the stream can be reached once bootstrap succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub host: String,
    pub port: u16,
    pub device_serial: String,
    /// Whether a remote server process was started (and registered)
    pub server_started: bool,
}

pub struct Bootstrapper {
    config: SessionConfig,
    bridge: Arc<dyn Bridge>,
}

impl Bootstrapper {
    pub fn new(config: SessionConfig, bridge: Arc<dyn Bridge>) -> Self {
        Self { config, bridge }
    }

    /// Verify the bridge and device, deploy and start the server (audio
    /// mode), forward the port and wait for the server to come up.
    ///
    /// The server process is registered with `controller` before this
    /// returns, so any later failure still stops it during teardown.
    pub async fn prepare(
        &self,
        device_serial: Option<&str>,
        controller: &mut LifecycleController,
    ) -> Result<TunnelInfo> {
        let cancel = controller.cancellation_token();

        self.check_bridge(&cancel).await?;
        ensure_running(&cancel)?;

        let device = self.select_device(device_serial, &cancel).await?;
        log::info!("📱 Using device: {}", device.serial);
        ensure_running(&cancel)?;

        if self.config.mode == StreamMode::Audio {
            self.check_artifact()?;
            self.deploy(&cancel).await?;
        }
        ensure_running(&cancel)?;

        self.forward(&cancel).await?;
        ensure_running(&cancel)?;

        let server_started = if self.config.mode == StreamMode::Audio {
            let process = self.launch(&cancel).await?;
            controller.register_remote(process)?;
            true
        } else {
            false
        };

        log::debug!("Waiting {:?} for the server to settle", self.config.settle_delay);
        until_cancelled(&cancel, async {
            tokio::time::sleep(self.config.settle_delay).await;
            Ok(())
        })
        .await?;

        Ok(TunnelInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            device_serial: device.serial,
            server_started,
        })
    }

    async fn check_bridge(&self, cancel: &CancellationToken) -> Result<()> {
        log::info!("🔧 Checking ADB installation...");
        let version = until_cancelled(cancel, async { Ok(self.bridge.version().await) }).await?;
        match version {
            Ok(version) => {
                log::debug!("ADB version: {}", version);
                Ok(())
            }
            Err(BridgeError::NotFound(program)) => Err(SessionError::DependencyMissing(format!(
                "{} not found. Please install ADB and ensure it's in your PATH",
                program
            ))),
            Err(e) => Err(SessionError::DependencyMissing(e.to_string())),
        }
    }

    async fn select_device(
        &self,
        serial: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<DeviceEntry> {
        log::info!("🔍 Checking device connection...");
        let devices = until_cancelled(cancel, async { Ok(self.bridge.devices().await) }).await?;
        let devices = devices.map_err(|e| match e {
            BridgeError::NotFound(program) => {
                SessionError::DependencyMissing(format!("{} not found", program))
            }
            other => SessionError::DeviceUnavailable(other.to_string()),
        })?;

        let candidates: Vec<&DeviceEntry> = devices
            .iter()
            .filter(|d| serial.map_or(true, |s| d.serial == s))
            .collect();

        match candidates.as_slice() {
            [] => Err(SessionError::DeviceUnavailable(match serial {
                Some(s) => format!("device '{}' is not connected", s),
                None => "no device connected".to_string(),
            })),
            [device] if device.state == DeviceState::Device => Ok((*device).clone()),
            [device] => Err(SessionError::DeviceUnavailable(format!(
                "device '{}' is {}",
                device.serial, device.state
            ))),
            many => {
                let serials: Vec<&str> = many.iter().map(|d| d.serial.as_str()).collect();
                Err(SessionError::DeviceUnavailable(format!(
                    "{} devices connected ({}), pick one with --serial",
                    many.len(),
                    serials.join(", ")
                )))
            }
        }
    }

    fn check_artifact(&self) -> Result<()> {
        let path = &self.config.artifact_path;
        if !path.is_file() {
            return Err(SessionError::ArtifactMissing(format!(
                "{} (build the server first)",
                path.display()
            )));
        }
        Ok(())
    }

    /// Push the server, retrying only errors that look like transport noise.
    async fn deploy(&self, cancel: &CancellationToken) -> Result<()> {
        let remote = &self.config.remote_artifact_path;
        let max_attempts = self.config.deploy_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            log::info!(
                "📦 Pushing {} to device (attempt {}/{})...",
                self.config.artifact_path.display(),
                attempt,
                max_attempts
            );

            let pushed = until_cancelled(cancel, async {
                Ok(self.bridge.push(&self.config.artifact_path, remote).await)
            })
            .await?;
            match pushed {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    log::warn!("⚠️  Push failed ({}), retrying", e);
                    until_cancelled(cancel, async {
                        tokio::time::sleep(self.config.deploy_retry_delay).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => {
                    return Err(SessionError::DeployFailed {
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    async fn forward(&self, cancel: &CancellationToken) -> Result<()> {
        let port = self.config.port;
        log::info!("🔀 Setting up port forwarding for port {}...", port);
        until_cancelled(cancel, async {
            self.bridge
                .forward(port, port)
                .await
                .map_err(|e| SessionError::TunnelFailed(e.to_string()))
        })
        .await
    }

    /// A process spawned after cancellation is dropped here, and
    /// `kill_on_drop` stops it.
    async fn launch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn crate::bridge::RemoteProcess>> {
        log::info!("🚀 Starting AudioServer on device...");
        let command = format!(
            "CLASSPATH={} app_process {} AudioServer {}",
            self.config.remote_artifact_path,
            self.config.remote_dir(),
            self.config.port
        );
        until_cancelled(cancel, async {
            self.bridge
                .spawn_shell(&command)
                .await
                .map_err(|e| SessionError::DeployFailed {
                    attempts: 1,
                    reason: format!("could not start server: {}", e),
                })
        })
        .await
    }
}

fn ensure_running(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(SessionError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::lifecycle::SessionState;
    use crate::observer::LogObserver;
    use crate::testing::MockBridge;
    use std::time::{Duration, Instant};

    fn config_with_artifact() -> (SessionConfig, tempfile::NamedTempFile) {
        let artifact = tempfile::NamedTempFile::new().unwrap();
        let mut config = SessionConfig::audio();
        config.artifact_path = artifact.path().to_path_buf();
        config.settle_delay = Duration::from_millis(1);
        config.deploy_retry_delay = Duration::from_millis(1);
        (config, artifact)
    }

    fn controller() -> LifecycleController {
        LifecycleController::new(Arc::new(LogObserver), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_prepare_audio_runs_every_step() {
        let (config, _artifact) = config_with_artifact();
        let bridge = Arc::new(MockBridge::with_device("emulator-5554"));
        let mut controller = controller();

        let tunnel = Bootstrapper::new(config, bridge.clone())
            .prepare(None, &mut controller)
            .await
            .unwrap();

        assert_eq!(tunnel.port, 9999);
        assert_eq!(tunnel.device_serial, "emulator-5554");
        assert!(tunnel.server_started);
        assert_eq!(
            bridge.calls(),
            vec![
                "version",
                "devices",
                "push /data/local/tmp/AudioServer.jar",
                "forward 9999 9999",
                "shell CLASSPATH=/data/local/tmp/AudioServer.jar app_process /data/local/tmp/ AudioServer 9999",
            ]
        );

        // The spawned server belongs to the controller now
        let report = controller.teardown().await;
        assert_eq!(report.steps.len(), 1);
        assert_eq!(bridge.remote_counters().signals(), 1);
    }

    #[tokio::test]
    async fn test_metadata_mode_only_forwards() {
        let mut config = SessionConfig::metadata();
        config.settle_delay = Duration::from_millis(1);
        let bridge = Arc::new(MockBridge::with_device("abc"));
        let mut controller = controller();

        let tunnel = Bootstrapper::new(config, bridge.clone())
            .prepare(None, &mut controller)
            .await
            .unwrap();
        assert!(!tunnel.server_started);
        assert_eq!(bridge.calls(), vec!["version", "devices", "forward 9998 9998"]);
    }

    #[tokio::test]
    async fn test_missing_bridge() {
        let (config, _artifact) = config_with_artifact();
        let bridge = Arc::new(MockBridge::missing());
        let err = Bootstrapper::new(config, bridge)
            .prepare(None, &mut controller())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
    }

    #[tokio::test]
    async fn test_device_selection() {
        let (config, _artifact) = config_with_artifact();
        let bridge = Arc::new(MockBridge::with_devices(&[
            ("phone", DeviceState::Device),
            ("tablet", DeviceState::Offline),
        ]));
        let bootstrapper = Bootstrapper::new(config, bridge);

        // Two devices and no serial
        let err = bootstrapper
            .prepare(None, &mut controller())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);

        // Offline is not retried or accepted
        let err = bootstrapper
            .prepare(Some("tablet"), &mut controller())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
        assert!(err.to_string().contains("offline"));

        let err = bootstrapper
            .prepare(Some("watch"), &mut controller())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);

        let tunnel = bootstrapper
            .prepare(Some("phone"), &mut controller())
            .await
            .unwrap();
        assert_eq!(tunnel.device_serial, "phone");
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_retried() {
        let mut config = SessionConfig::audio();
        config.artifact_path = "/nonexistent/AudioServer.jar".into();
        let bridge = Arc::new(MockBridge::with_device("abc"));

        let err = Bootstrapper::new(config, bridge.clone())
            .prepare(None, &mut controller())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactMissing);
        assert!(!bridge.calls().iter().any(|c| c.starts_with("push")));
    }

    #[tokio::test]
    async fn test_transient_push_failures_are_retried() {
        let (config, _artifact) = config_with_artifact();
        let bridge = Arc::new(MockBridge::with_device("abc"));
        bridge.fail_push("error: device offline");
        bridge.fail_push("adb: error: protocol fault");

        Bootstrapper::new(config, bridge.clone())
            .prepare(None, &mut controller())
            .await
            .unwrap();
        let pushes = bridge.calls().iter().filter(|c| c.starts_with("push")).count();
        assert_eq!(pushes, 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let (config, _artifact) = config_with_artifact();
        let bridge = Arc::new(MockBridge::with_device("abc"));
        for _ in 0..5 {
            bridge.fail_push("error: device offline");
        }

        let err = Bootstrapper::new(config, bridge.clone())
            .prepare(None, &mut controller())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DeployFailed { attempts: 3, .. }));
        assert!(!bridge.calls().iter().any(|c| c.starts_with("forward")));
    }

    #[tokio::test]
    async fn test_permission_errors_fail_immediately() {
        let (config, _artifact) = config_with_artifact();
        let bridge = Arc::new(MockBridge::with_device("abc"));
        bridge.fail_push("remote couldn't create file: Permission denied");

        let err = Bootstrapper::new(config, bridge.clone())
            .prepare(None, &mut controller())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DeployFailed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_forward_is_idempotent() {
        let mut config = SessionConfig::metadata();
        config.settle_delay = Duration::from_millis(1);
        let bridge = Arc::new(MockBridge::with_device("abc"));
        let bootstrapper = Bootstrapper::new(config, bridge.clone());

        bootstrapper.prepare(None, &mut controller()).await.unwrap();
        bootstrapper.prepare(None, &mut controller()).await.unwrap();
        let forwards = bridge.calls().iter().filter(|c| c.starts_with("forward")).count();
        assert_eq!(forwards, 2);
    }

    #[tokio::test]
    async fn test_cancel_during_settle() {
        let (mut config, _artifact) = config_with_artifact();
        config.settle_delay = Duration::from_secs(30);
        let bridge = Arc::new(MockBridge::with_device("abc"));
        let mut controller = controller();
        let cancel = controller.cancellation_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            Bootstrapper::new(config, bridge.clone()).prepare(None, &mut controller),
        )
        .await
        .expect("settle delay must be cancellable")
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        // Server was already registered and still gets stopped
        assert_eq!(controller.state(), SessionState::Idle);
        controller.teardown().await;
        assert_eq!(bridge.remote_counters().signals(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_hung_push() {
        let (config, _artifact) = config_with_artifact();
        let bridge = Arc::new(MockBridge::with_device("abc"));
        bridge.hang_push();
        let mut controller = controller();
        let cancel = controller.cancellation_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            Bootstrapper::new(config, bridge.clone()).prepare(None, &mut controller),
        )
        .await
        .expect("a stuck push must not outlive cancellation")
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            bridge.calls(),
            vec!["version", "devices", "push /data/local/tmp/AudioServer.jar"]
        );
        assert_eq!(bridge.remote_counters().spawned(), 0);
    }
}
