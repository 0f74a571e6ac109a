use crate::audio_sink::DEFAULT_PROGRESS_INTERVAL;
use crate::lifecycle::DEFAULT_STOP_TIMEOUT;
use crate::pump::DEFAULT_CHUNK_SIZE;
use std::path::PathBuf;
use std::time::Duration;
use strum::Display;
use thiserror::Error;

pub const DEFAULT_AUDIO_PORT: u16 = 9999;
pub const DEFAULT_METADATA_PORT: u16 = 9998;
pub const DEFAULT_ARTIFACT: &str = "lib/AudioServer.jar";
pub const REMOTE_ARTIFACT: &str = "/data/local/tmp/AudioServer.jar";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Port must be between 1 and 65535")]
    InvalidPort,
    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("Deploy attempts must be at least 1")]
    InvalidAttempts,
    #[error("Remote artifact path must be absolute: {0}")]
    InvalidRemotePath(String),
}

/// Which channel the session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StreamMode {
    /// Header + raw PCM from the deployed audio server
    #[strum(serialize = "audio")]
    Audio,
    /// Line-delimited JSON from the on-device metadata app
    #[strum(serialize = "metadata")]
    Metadata,
}

impl StreamMode {
    pub fn default_port(&self) -> u16 {
        match self {
            StreamMode::Audio => DEFAULT_AUDIO_PORT,
            StreamMode::Metadata => DEFAULT_METADATA_PORT,
        }
    }
}

/// Everything one session needs to know, built from the command line.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: StreamMode,
    pub device_serial: Option<String>,
    /// Path or name of the `adb` executable
    pub adb_program: String,
    pub host: String,
    /// Used for both ends of the tunnel
    pub port: u16,
    pub artifact_path: PathBuf,
    pub remote_artifact_path: String,
    /// Extra push attempts are only made for transient bridge errors
    pub deploy_attempts: u32,
    pub deploy_retry_delay: Duration,
    /// The remote server has no ready signal, so we wait this long
    pub settle_delay: Duration,
    pub connect_timeout: Duration,
    pub header_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub chunk_size: usize,
    pub stop_timeout: Duration,
    pub output_device: Option<String>,
    pub progress_interval: u64,
    /// Where to keep the latest album art (metadata mode)
    pub artwork_path: Option<PathBuf>,
}

impl SessionConfig {
    pub fn audio() -> Self {
        Self {
            mode: StreamMode::Audio,
            device_serial: None,
            adb_program: "adb".to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_AUDIO_PORT,
            artifact_path: PathBuf::from(DEFAULT_ARTIFACT),
            remote_artifact_path: REMOTE_ARTIFACT.to_string(),
            deploy_attempts: 3,
            deploy_retry_delay: Duration::from_millis(500),
            settle_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            header_timeout: Some(Duration::from_secs(10)),
            read_timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            output_device: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            artwork_path: None,
        }
    }

    pub fn metadata() -> Self {
        Self {
            mode: StreamMode::Metadata,
            port: DEFAULT_METADATA_PORT,
            settle_delay: Duration::from_secs(1),
            header_timeout: None,
            ..Self::audio()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        if self.deploy_attempts == 0 {
            return Err(ConfigError::InvalidAttempts);
        }
        if !self.remote_artifact_path.starts_with('/') {
            return Err(ConfigError::InvalidRemotePath(
                self.remote_artifact_path.clone(),
            ));
        }
        Ok(())
    }

    /// Directory on the device holding the artifact, with trailing slash
    pub fn remote_dir(&self) -> String {
        match self.remote_artifact_path.rfind('/') {
            Some(idx) => self.remote_artifact_path[..=idx].to_string(),
            None => "/".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::audio()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_mode() {
        let audio = SessionConfig::audio();
        assert_eq!(audio.port, 9999);
        assert_eq!(audio.chunk_size, 4096);
        assert_eq!(audio.deploy_attempts, 3);
        assert!(audio.validate().is_ok());

        let metadata = SessionConfig::metadata();
        assert_eq!(metadata.port, 9998);
        assert_eq!(metadata.mode, StreamMode::Metadata);
        assert!(metadata.header_timeout.is_none());
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = SessionConfig::audio();
        config.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort)));

        let mut config = SessionConfig::audio();
        config.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChunkSize)
        ));

        let mut config = SessionConfig::audio();
        config.remote_artifact_path = "tmp/AudioServer.jar".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_dir() {
        assert_eq!(SessionConfig::audio().remote_dir(), "/data/local/tmp/");
    }
}
