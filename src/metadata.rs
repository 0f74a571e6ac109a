//! Now-playing metadata channel.
//!
//! The on-device listener writes one JSON object per line. [`LineSink`]
//! reassembles lines across socket reads, turns each into a
//! [`MetadataEvent`] and hands it to a [`MetadataPresenter`]. A bad record is
//! reported and skipped; it never ends the session.

use crate::observer::SessionObserver;
use crate::pump::{ChunkSink, SinkError};
use base64::Engine;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Lines longer than this are dropped rather than buffered forever.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record is not valid UTF-8")]
    Encoding,

    #[error("Record exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Album art is not valid base64: {0}")]
    Artwork(#[from] base64::DecodeError),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRecord {
    package: String,
    title: String,
    artist: String,
    album: String,
    duration: u64,
    #[serde(rename = "albumArt")]
    album_art: Option<String>,
}

/// One "now playing" update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEvent {
    pub package: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: u64,
    /// Still base64 encoded; see [`MetadataEvent::decode_album_art`]
    pub album_art: Option<String>,
}

impl MetadataEvent {
    pub fn parse(line: &str) -> Result<Self, MetadataError> {
        let raw: RawRecord = serde_json::from_str(line)?;
        Ok(Self {
            package: raw.package,
            title: raw.title,
            artist: raw.artist,
            album: raw.album,
            duration_ms: raw.duration,
            album_art: raw.album_art.filter(|art| !art.trim().is_empty()),
        })
    }

    /// Decode the embedded image, if any.
    ///
    /// Android's default base64 flavour wraps lines, so whitespace is removed
    /// first.
    pub fn decode_album_art(&self) -> Option<Result<Vec<u8>, MetadataError>> {
        let art = self.album_art.as_ref()?;
        let compact: String = art.chars().filter(|c| !c.is_whitespace()).collect();
        Some(
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map_err(MetadataError::from),
        )
    }

    /// `m:ss` rendering of the track length.
    pub fn duration_display(&self) -> String {
        let secs = self.duration_ms / 1000;
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

/// Splits a byte stream on `\n`, keeping partial lines between pushes.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_len: usize,
    /// Inside an over-long line; bytes are dropped through the next `\n`
    discarding: bool,
}

impl LineBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Append `chunk` and return every line it completed, without the
    /// terminator.
    ///
    /// A line that grows past `max_len` is reported once and the rest of it
    /// is skipped, so parsing resumes after its terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, MetadataError>> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            if self.discarding {
                self.discarding = false;
            } else {
                self.pending.extend_from_slice(&rest[..pos]);
                let line = std::mem::take(&mut self.pending);
                if line.len() > self.max_len {
                    lines.push(Err(MetadataError::LineTooLong(self.max_len)));
                } else {
                    lines.push(Ok(line));
                }
            }
            rest = &rest[pos + 1..];
        }

        if !self.discarding {
            self.pending.extend_from_slice(rest);
            if self.pending.len() > self.max_len {
                self.pending.clear();
                self.discarding = true;
                lines.push(Err(MetadataError::LineTooLong(self.max_len)));
            }
        }
        lines
    }

    /// Whatever is left after the stream ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.discarding = false;
        let rest = std::mem::take(&mut self.pending);
        if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(rest)
        }
    }
}

/// Receives every parsed metadata event.
pub trait MetadataPresenter: Send {
    fn present(&mut self, event: &MetadataEvent);
}

/// Receives decoded album art.
pub trait ArtworkDisplay: Send {
    fn show(&mut self, image: &[u8], event: &MetadataEvent) -> io::Result<()>;
}

/// Prints a "Now Playing" block to stdout.
#[derive(Debug, Default)]
pub struct NowPlayingPrinter;

impl MetadataPresenter for NowPlayingPrinter {
    fn present(&mut self, event: &MetadataEvent) {
        let or_unknown = |s: &str| {
            if s.is_empty() {
                "Unknown".to_string()
            } else {
                s.to_string()
            }
        };
        println!("\n{}", "=".repeat(50));
        println!("🎵 Now Playing:");
        println!("  Package:  {}", or_unknown(&event.package));
        println!("  Title:    {}", or_unknown(&event.title));
        println!("  Artist:   {}", or_unknown(&event.artist));
        println!("  Album:    {}", or_unknown(&event.album));
        println!("  Duration: {}", event.duration_display());
        println!("{}", "=".repeat(50));
    }
}

/// Keeps the latest album art in a file, or just logs it without a path.
#[derive(Debug, Default)]
pub struct ArtworkFile {
    path: Option<PathBuf>,
}

impl ArtworkFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl ArtworkDisplay for ArtworkFile {
    fn show(&mut self, image: &[u8], event: &MetadataEvent) -> io::Result<()> {
        match &self.path {
            Some(path) => {
                std::fs::write(path, image)?;
                log::info!(
                    "🖼️  Album art for '{}' saved to {} ({} bytes)",
                    event.title,
                    path.display(),
                    image.len()
                );
            }
            None => log::debug!("Album art for '{}': {} bytes", event.title, image.len()),
        }
        Ok(())
    }
}

/// [`ChunkSink`] for the line-delimited JSON channel.
pub struct LineSink {
    buffer: LineBuffer,
    presenter: Box<dyn MetadataPresenter>,
    artwork: Box<dyn ArtworkDisplay>,
    observer: Arc<dyn SessionObserver>,
    events: u64,
    rejected: u64,
    stopped: bool,
}

impl LineSink {
    pub fn new(
        presenter: Box<dyn MetadataPresenter>,
        artwork: Box<dyn ArtworkDisplay>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            buffer: LineBuffer::new(MAX_LINE_BYTES),
            presenter,
            artwork,
            observer,
            events: 0,
            rejected: 0,
            stopped: false,
        }
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn handle_line(&mut self, line: Result<Vec<u8>, MetadataError>) {
        let bytes = match line {
            Ok(bytes) => bytes,
            Err(e) => return self.reject("<discarded>", &e),
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return self.reject("<binary>", &MetadataError::Encoding),
        };
        let text = text.trim_end_matches('\r');
        if text.trim().is_empty() {
            return;
        }

        let event = match MetadataEvent::parse(text) {
            Ok(event) => event,
            Err(e) => return self.reject(text, &e),
        };

        self.events += 1;
        self.presenter.present(&event);

        match event.decode_album_art() {
            Some(Ok(image)) => {
                if let Err(e) = self.artwork.show(&image, &event) {
                    log::warn!("⚠️  Could not display album art: {}", e);
                }
            }
            Some(Err(e)) => log::warn!("⚠️  {}", e),
            None => {}
        }
    }

    fn reject(&mut self, line: &str, error: &MetadataError) {
        self.rejected += 1;
        self.observer.metadata_rejected(line, error);
    }
}

#[async_trait::async_trait]
impl ChunkSink for LineSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        if self.stopped {
            return Err(SinkError::Stopped);
        }
        for line in self.buffer.push(chunk) {
            self.handle_line(line);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        if let Some(rest) = self.buffer.finish() {
            self.handle_line(Ok(rest));
        }
        log::debug!(
            "Metadata sink stopped: {} event(s), {} rejected",
            self.events,
            self.rejected
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingArtwork, RecordingObserver, RecordingPresenter};

    fn sink() -> (LineSink, RecordingPresenter, RecordingArtwork, Arc<RecordingObserver>) {
        let presenter = RecordingPresenter::default();
        let artwork = RecordingArtwork::default();
        let observer = Arc::new(RecordingObserver::default());
        let sink = LineSink::new(
            Box::new(presenter.clone()),
            Box::new(artwork.clone()),
            observer.clone(),
        );
        (sink, presenter, artwork, observer)
    }

    #[test]
    fn test_parse_full_record() {
        let event = MetadataEvent::parse(
            r#"{"package":"com.spotify.music","title":"Song","artist":"Band","album":"LP","duration":215000,"albumArt":""}"#,
        )
        .unwrap();
        assert_eq!(event.package, "com.spotify.music");
        assert_eq!(event.title, "Song");
        assert_eq!(event.duration_ms, 215000);
        assert_eq!(event.duration_display(), "3:35");
        assert!(event.album_art.is_none());
    }

    #[test]
    fn test_missing_fields_default() {
        let event = MetadataEvent::parse(r#"{"title":"A"}"#).unwrap();
        assert_eq!(event.title, "A");
        assert_eq!(event.artist, "");
        assert_eq!(event.duration_ms, 0);
    }

    #[test]
    fn test_wrapped_base64_art_decodes() {
        // "hello world" split the way Android wraps base64
        let event = MetadataEvent::parse(r#"{"albumArt":"aGVsbG8g\nd29ybGQ=\n"}"#).unwrap();
        let image = event.decode_album_art().unwrap().unwrap();
        assert_eq!(image, b"hello world");
    }

    #[test]
    fn test_line_buffer_keeps_partial_lines() {
        let mut buffer = LineBuffer::new(1024);
        assert!(buffer.push(b"{\"ti").is_empty());
        let lines = buffer.push(b"tle\":1}\n{\"a\"");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap(), b"{\"title\":1}");
        assert_eq!(buffer.finish().unwrap(), b"{\"a\"");
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_line_buffer_drops_oversized_line() {
        let mut buffer = LineBuffer::new(8);
        let lines = buffer.push(b"0123456789");
        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], Err(MetadataError::LineTooLong(8))));

        // The tail belongs to the same line and must not surface as a record
        assert!(buffer.push(b"ok\n").is_empty());
        let lines = buffer.push(b"next\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap(), b"next");
    }

    #[test]
    fn test_line_buffer_skips_tail_across_chunks() {
        let mut buffer = LineBuffer::new(4);
        assert_eq!(buffer.push(b"abcdef").len(), 1);
        assert!(buffer.push(b"{\"title\":\"X\"}").is_empty());
        assert!(buffer.push(b"still the same line").is_empty());
        let lines = buffer.push(b"\n{}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap(), b"{}");
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_line_buffer_tail_is_not_a_final_record() {
        let mut buffer = LineBuffer::new(4);
        assert_eq!(buffer.push(b"abcdefgh").len(), 1);
        assert!(buffer.push(b"{}").is_empty());
        assert!(buffer.finish().is_none());
    }

    #[tokio::test]
    async fn test_two_events_survive_every_split() {
        let stream = b"{\"title\":\"A\"}\n{\"title\":\"B\"}";
        for first in 0..=stream.len() {
            for second in first..=stream.len() {
                let (mut sink, presenter, _, _) = sink();
                sink.write(&stream[..first]).await.unwrap();
                sink.write(&stream[first..second]).await.unwrap();
                sink.write(&stream[second..]).await.unwrap();
                sink.stop().await.unwrap();
                assert_eq!(presenter.titles(), vec!["A", "B"], "split {}/{}", first, second);
            }
        }
    }

    #[tokio::test]
    async fn test_bad_record_does_not_stop_the_sink() {
        let (mut sink, presenter, _, observer) = sink();
        sink.write(b"{\"title\":\"A\"}\nnot json\n\n{\"title\":\"B\"}\r\n")
            .await
            .unwrap();
        assert_eq!(presenter.titles(), vec!["A", "B"]);
        assert_eq!(sink.events(), 2);
        assert_eq!(sink.rejected(), 1);
        assert_eq!(observer.rejected_lines(), vec!["not json".to_string()]);
    }

    #[tokio::test]
    async fn test_art_is_decoded_before_display() {
        let (mut sink, _, artwork, _) = sink();
        sink.write(b"{\"title\":\"A\",\"albumArt\":\"iVBORw0KGgo=\"}\n")
            .await
            .unwrap();
        assert_eq!(
            artwork.images(),
            vec![vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]]
        );
    }

    #[tokio::test]
    async fn test_invalid_art_still_presents_event() {
        let (mut sink, presenter, artwork, _) = sink();
        sink.write(b"{\"title\":\"A\",\"albumArt\":\"***\"}\n")
            .await
            .unwrap();
        assert_eq!(presenter.titles(), vec!["A"]);
        assert!(artwork.images().is_empty());
    }

    #[tokio::test]
    async fn test_write_after_stop() {
        let (mut sink, _, _, _) = sink();
        sink.stop().await.unwrap();
        assert!(matches!(sink.write(b"x").await, Err(SinkError::Stopped)));
    }

    #[test]
    fn test_artwork_file_writes_latest_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.jpg");
        let event = MetadataEvent::parse(r#"{"title":"Song"}"#).unwrap();
        let mut artwork = ArtworkFile::new(Some(path.clone()));

        artwork.show(&[0xFF, 0xD8, 0xFF, 0xE0], &event).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xE0]);

        artwork.show(b"second", &event).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_artwork_file_reports_write_errors() {
        let dir = tempfile::tempdir().unwrap();
        let event = MetadataEvent::parse(r#"{"title":"Song"}"#).unwrap();
        // A directory cannot be overwritten with file contents
        let mut artwork = ArtworkFile::new(Some(dir.path().to_path_buf()));
        assert!(artwork.show(b"image", &event).is_err());

        let mut artwork = ArtworkFile::new(None);
        assert!(artwork.show(b"image", &event).is_ok());
    }
}
