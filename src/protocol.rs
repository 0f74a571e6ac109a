//! Wire format of the binary audio channel.
//!
//! The remote server opens every connection with a fixed preamble:
//!
//! ```text
//! [sample_rate: u32 BE][channels: u8][format: u8]
//! ```
//!
//! followed by raw PCM until it closes the socket.

use crate::error::{Result, SessionError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the stream preamble in bytes
pub const HEADER_LEN: usize = 6;

/// Sample encodings the server may announce. Only code `2` is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleFormat {
    /// Signed 16-bit PCM, little-endian samples
    Pcm16 = 0x02,
}

impl TryFrom<u8> for SampleFormat {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x02 => Ok(SampleFormat::Pcm16),
            other => Err(other),
        }
    }
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::Pcm16 => 2,
        }
    }
}

/// Shape of the audio stream, negotiated once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub sample_rate: u32,
    pub channels: u8,
    /// Raw format code as sent by the server; see [`StreamHeader::sample_format`]
    pub format: u8,
}

impl StreamHeader {
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            sample_rate: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            channels: bytes[4],
            format: bytes[5],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let rate = self.sample_rate.to_be_bytes();
        [rate[0], rate[1], rate[2], rate[3], self.channels, self.format]
    }

    /// Decoded format, or the unknown code
    pub fn sample_format(&self) -> std::result::Result<SampleFormat, u8> {
        SampleFormat::try_from(self.format)
    }

    /// Bytes per second of audio for this configuration, if the format is known.
    pub fn byte_rate(&self) -> Option<u64> {
        let format = self.sample_format().ok()?;
        Some(self.sample_rate as u64 * self.channels as u64 * format.bytes_per_sample() as u64)
    }
}

/// Read the stream preamble.
///
/// Keeps reading until all [`HEADER_LEN`] bytes arrived; a peer that closes
/// early yields [`SessionError::HeaderTruncated`]. With `timeout` set, the
/// whole read is bounded.
pub async fn read_header<R>(reader: &mut R, timeout: Option<Duration>) -> Result<StreamHeader>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, read_header_inner(reader))
            .await
            .map_err(|_| {
                SessionError::Timeout(format!("no stream header within {:?}", limit))
            })?,
        None => read_header_inner(reader).await,
    }
}

async fn read_header_inner<R>(reader: &mut R) -> Result<StreamHeader>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut received = 0;

    while received < HEADER_LEN {
        let n = reader.read(&mut header[received..]).await?;
        if n == 0 {
            return Err(SessionError::HeaderTruncated { received });
        }
        received += n;
        log::debug!("Header: {}/{} bytes", received, HEADER_LEN);
    }

    Ok(StreamHeader::from_bytes(&header))
}
