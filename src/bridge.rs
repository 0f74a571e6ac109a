//! Thin typed wrapper around the `adb` command line tool.
//!
//! The session only talks to the device through the [`Bridge`] trait so the
//! bootstrap sequence can be exercised without a phone attached. [`AdbBridge`]
//! is the real implementation; every call shells out to `adb` and maps the
//! exit status into a [`BridgeError`].

use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{0} not found (is it installed and on PATH?)")]
    NotFound(String),

    #[error("Failed to run '{command}': {source}")]
    Execution {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' exited with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },
}

/// Messages adb prints when the USB/TCP transport hiccups. Worth another try.
const TRANSIENT_MARKERS: &[&str] = &[
    "device offline",
    "protocol fault",
    "connection reset",
    "transport",
    "closed",
    "timeout",
    "timed out",
];

/// Messages that will not go away on a retry.
const PERMANENT_MARKERS: &[&str] = &[
    "permission denied",
    "no such file",
    "read-only file system",
    "no space left",
];

impl BridgeError {
    /// Whether retrying the same command has a reasonable chance to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::CommandFailed { output, .. } => {
                let output = output.to_lowercase();
                if PERMANENT_MARKERS.iter().any(|m| output.contains(m)) {
                    return false;
                }
                TRANSIENT_MARKERS.iter().any(|m| output.contains(m))
            }
            BridgeError::NotFound(_) | BridgeError::Execution { .. } => false,
        }
    }
}

/// Connection state reported by `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    Bootloader,
    Recovery,
    Other(String),
}

impl DeviceState {
    fn parse(state: &str) -> Self {
        match state {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            "bootloader" => DeviceState::Bootloader,
            "recovery" => DeviceState::Recovery,
            other => DeviceState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Device => write!(f, "device"),
            DeviceState::Offline => write!(f, "offline"),
            DeviceState::Unauthorized => write!(f, "unauthorized"),
            DeviceState::Bootloader => write!(f, "bootloader"),
            DeviceState::Recovery => write!(f, "recovery"),
            DeviceState::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub serial: String,
    pub state: DeviceState,
}

/// Parse the output of `adb devices`.
///
/// Skips the `List of devices attached` banner and the `* daemon ...` lines
/// adb prints when it has to start its server first.
pub fn parse_device_list(output: &str) -> Vec<DeviceEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('*') && !line.starts_with("List of devices"))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(DeviceEntry {
                serial: serial.to_string(),
                state: DeviceState::parse(state),
            })
        })
        .collect()
}

/// Handle over a process started on the device through the bridge.
///
/// The lifecycle controller owns it and drives shutdown as
/// `signal_stop` → bounded `wait` → `force_kill`.
#[async_trait::async_trait]
pub trait RemoteProcess: Send {
    /// OS process id of the local bridge process, if still known.
    fn id(&self) -> Option<u32>;

    /// Ask the process to exit (SIGTERM on unix).
    fn signal_stop(&mut self) -> io::Result<()>;

    /// Wait for the process to exit. Returns the exit code when available.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Kill the process and reap it.
    async fn force_kill(&mut self) -> io::Result<()>;
}

/// Operations the bootstrapper needs from the device bridge.
#[async_trait::async_trait]
pub trait Bridge: Send + Sync {
    /// `adb version`; returns the first line of the version banner.
    async fn version(&self) -> Result<String, BridgeError>;

    /// `adb devices`
    async fn devices(&self) -> Result<Vec<DeviceEntry>, BridgeError>;

    /// `adb push <local> <remote>`
    async fn push(&self, local: &Path, remote: &str) -> Result<(), BridgeError>;

    /// `adb forward tcp:<local> tcp:<remote>`
    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), BridgeError>;

    /// `adb shell <command>` left running in the background.
    async fn spawn_shell(&self, command: &str) -> Result<Box<dyn RemoteProcess>, BridgeError>;
}

/// [`Bridge`] backed by the real `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    program: String,
    serial: Option<String>,
}

impl AdbBridge {
    pub fn new(program: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            program: program.into(),
            serial,
        }
    }

    /// Arguments targeting the selected device (`-s <serial>`), if any.
    fn device_args(&self) -> Vec<String> {
        match &self.serial {
            Some(serial) => vec!["-s".to_string(), serial.clone()],
            None => Vec::new(),
        }
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    fn map_spawn_error(&self, command: String, err: io::Error) -> BridgeError {
        if err.kind() == io::ErrorKind::NotFound {
            BridgeError::NotFound(self.program.clone())
        } else {
            BridgeError::Execution {
                command,
                source: err,
            }
        }
    }

    /// Run `adb <args>` to completion and return its stdout.
    async fn run(&self, args: Vec<String>) -> Result<String, BridgeError> {
        let command = self.describe(&args);
        log::debug!("Running: {}", command);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.map_spawn_error(command.clone(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // adb reports some failures (e.g. push) on stdout
            let text = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            log::debug!("'{}' failed: {}", command, text);
            return Err(BridgeError::CommandFailed {
                command,
                status: output.status.code().unwrap_or(-1),
                output: text,
            });
        }

        Ok(stdout)
    }
}

#[async_trait::async_trait]
impl Bridge for AdbBridge {
    async fn version(&self) -> Result<String, BridgeError> {
        let stdout = self.run(vec!["version".to_string()]).await?;
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn devices(&self) -> Result<Vec<DeviceEntry>, BridgeError> {
        let stdout = self.run(vec!["devices".to_string()]).await?;
        Ok(parse_device_list(&stdout))
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<(), BridgeError> {
        let mut args = self.device_args();
        args.push("push".to_string());
        args.push(local.display().to_string());
        args.push(remote.to_string());
        let stdout = self.run(args).await?;
        log::debug!("push: {}", stdout.trim());
        Ok(())
    }

    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), BridgeError> {
        let mut args = self.device_args();
        args.push("forward".to_string());
        args.push(format!("tcp:{}", local_port));
        args.push(format!("tcp:{}", remote_port));
        self.run(args).await?;
        Ok(())
    }

    async fn spawn_shell(&self, command: &str) -> Result<Box<dyn RemoteProcess>, BridgeError> {
        let mut args = self.device_args();
        args.push("shell".to_string());
        args.push(command.to_string());
        let described = self.describe(&args);
        log::debug!("Spawning: {}", described);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.map_spawn_error(described, e))?;

        // Drain the remote server's console so the pipes never fill up
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("📱 {}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("📱 {}", line);
                }
            });
        }

        Ok(Box::new(ShellProcess { child }))
    }
}

/// `adb shell` child process running the remote server.
pub struct ShellProcess {
    child: Child,
}

#[async_trait::async_trait]
impl RemoteProcess for ShellProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn signal_stop(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };
        // SAFETY: pid belongs to a child we spawned and have not reaped yet
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal_stop(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn force_kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        let output = "* daemon not running; starting now at tcp:5037\n\
                      * daemon started successfully\n\
                      List of devices attached\n\
                      emulator-5554\tdevice\n\
                      R58M12345\tunauthorized\n\
                      \n";
        let devices = parse_device_list(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].state, DeviceState::Device);
        assert_eq!(devices[1].state, DeviceState::Unauthorized);
    }

    #[test]
    fn test_parse_empty_device_list() {
        assert!(parse_device_list("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_unknown_state_is_preserved() {
        let devices = parse_device_list("abc\tsideload\n");
        assert_eq!(devices[0].state, DeviceState::Other("sideload".to_string()));
        assert_eq!(devices[0].state.to_string(), "sideload");
    }

    #[test]
    fn test_transient_classification() {
        let failed = |output: &str| BridgeError::CommandFailed {
            command: "adb push".to_string(),
            status: 1,
            output: output.to_string(),
        };
        assert!(failed("error: device offline").is_transient());
        assert!(failed("adb: error: failed to read copy response: protocol fault").is_transient());
        assert!(!failed("remote couldn't create file: Permission denied").is_transient());
        assert!(!failed("something unexpected").is_transient());
        assert!(!BridgeError::NotFound("adb".to_string()).is_transient());
    }

    #[tokio::test]
    async fn test_missing_program_maps_to_not_found() {
        let bridge = AdbBridge::new("definitely-not-an-adb-binary-4242", None);
        match bridge.version().await {
            Err(BridgeError::NotFound(program)) => {
                assert_eq!(program, "definitely-not-an-adb-binary-4242")
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }
}
