use crate::error::{ConnectFailure, Result, SessionError};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Open the TCP connection to the tunnelled port.
///
/// No retries here; a refused or timed-out connect is reported as
/// [`SessionError::ConnectFailed`] and the caller decides what to do.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    log::info!("📡 Connecting to stream at {}...", addr);

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let failure = classify(&e);
            return Err(SessionError::ConnectFailed {
                addr,
                failure,
                reason: e.to_string(),
            });
        }
        Err(_) => {
            return Err(SessionError::ConnectFailed {
                addr,
                failure: ConnectFailure::TimedOut,
                reason: format!("no answer within {:?}", timeout),
            })
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Could not set TCP_NODELAY: {}", e);
    }

    log::info!("✅ Connected successfully");
    Ok(stream)
}

fn classify(err: &io::Error) -> ConnectFailure {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ConnectFailure::Refused,
        io::ErrorKind::TimedOut => ConnectFailure::TimedOut,
        _ => ConnectFailure::Other,
    }
}
