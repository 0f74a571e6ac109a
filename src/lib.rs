pub mod audio_sink;
pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod connector;
pub mod error;
pub mod lifecycle;
pub mod metadata;
pub mod observer;
pub mod protocol;
pub mod pump;
pub mod session;
pub mod testing;

pub use config::{SessionConfig, StreamMode};
pub use error::{ErrorKind, Result, SessionError};
pub use session::{Session, SessionSummary};
