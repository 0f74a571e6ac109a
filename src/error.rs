use crate::audio_sink::AudioError;
use crate::config::ConfigError;
use crate::lifecycle::{Resource, SessionState};
use std::io;
use strum::Display;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Why a TCP connect attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectFailure {
    #[strum(serialize = "connection refused")]
    Refused,
    #[strum(serialize = "timed out")]
    TimedOut,
    #[strum(serialize = "unreachable")]
    Other,
}

/// Every way a session can fail before (or instead of) streaming.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Bridge tool unavailable: {0}")]
    DependencyMissing(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Server artifact not found: {0}")]
    ArtifactMissing(String),

    #[error("Failed to deploy server after {attempts} attempt(s): {reason}")]
    DeployFailed { attempts: u32, reason: String },

    #[error("Failed to set up port forwarding: {0}")]
    TunnelFailed(String),

    #[error("Failed to connect to {addr} ({failure}): {reason}")]
    ConnectFailed {
        addr: String,
        failure: ConnectFailure,
        reason: String,
    },

    #[error("Stream header truncated: got {received} of 6 bytes")]
    HeaderTruncated { received: usize },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Audio output error: {0}")]
    Sink(#[from] AudioError),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Cannot register {resource}: {reason}")]
    ResourceRejected { resource: Resource, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Flat discriminant of [`SessionError`] so callers can branch on the kind
/// without matching payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    DependencyMissing,
    DeviceUnavailable,
    ArtifactMissing,
    DeployFailed,
    TunnelFailed,
    ConnectFailed,
    HeaderTruncated,
    Timeout,
    SinkError,
    Cancelled,
    InvalidState,
    Config,
    TransportError,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::DependencyMissing(_) => ErrorKind::DependencyMissing,
            SessionError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            SessionError::ArtifactMissing(_) => ErrorKind::ArtifactMissing,
            SessionError::DeployFailed { .. } => ErrorKind::DeployFailed,
            SessionError::TunnelFailed(_) => ErrorKind::TunnelFailed,
            SessionError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            SessionError::HeaderTruncated { .. } => ErrorKind::HeaderTruncated,
            SessionError::Timeout(_) => ErrorKind::Timeout,
            SessionError::Sink(_) => ErrorKind::SinkError,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::InvalidTransition { .. } => ErrorKind::InvalidState,
            SessionError::ResourceRejected { .. } => ErrorKind::InvalidState,
            SessionError::Config(_) => ErrorKind::Config,
            SessionError::Io(_) => ErrorKind::TransportError,
        }
    }
}
