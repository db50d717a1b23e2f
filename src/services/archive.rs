//! Streaming zip output.
//!
//! `zip::ZipWriter` needs `Write + Seek` because it patches each local header
//! (CRC and sizes) once the entry is closed. [`Spool`] gives it a seekable
//! buffer that only holds the tail of the archive that may still be patched;
//! everything before that point is handed to the response body through a
//! bounded channel as soon as it is final.

use crate::utils::validation::EntryNamer;
use axum::body::Body;
use bytes::Bytes;
use std::fmt;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Largest chunk pushed to the client in one message.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

pub type ArchiveChunk = Result<Bytes, io::Error>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive writer is {state}; cannot {action}")]
    InvalidState { state: ArchiveState, action: &'static str },

    #[error("Archive encoding failed: {0}")]
    Encoding(String),

    #[error("Client disconnected before the archive was complete")]
    ClientDisconnected,
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(err: zip::result::ZipError) -> Self {
        ArchiveError::Encoding(err.to_string())
    }
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        ArchiveError::Encoding(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    Idle,
    Streaming { entries: usize },
    Finalized,
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveState::Idle => write!(f, "idle"),
            ArchiveState::Streaming { entries } => write!(f, "streaming ({} entries)", entries),
            ArchiveState::Finalized => write!(f, "finalized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: usize,
    pub bytes_sent: u64,
}

/// Seekable in-memory window over the end of the archive.
#[derive(Debug, Default)]
struct Spool {
    buf: Vec<u8>,
    /// Absolute archive offset of `buf[0]`; everything before it was sent.
    base: u64,
    pos: u64,
}

impl Spool {
    fn end(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    /// Removes and returns bytes before absolute offset `upto`.
    fn take_until(&mut self, upto: u64) -> Bytes {
        let upto = upto.clamp(self.base, self.end());
        let n = (upto - self.base) as usize;
        let head: Vec<u8> = self.buf.drain(..n).collect();
        self.base = upto;
        Bytes::from(head)
    }

    fn take_all(&mut self) -> Bytes {
        let end = self.end();
        self.take_until(end)
    }
}

/// Shared handle so the writer can drain while `ZipWriter` owns the sink.
#[derive(Debug, Clone, Default)]
struct SpoolSink(Arc<Mutex<Spool>>);

impl SpoolSink {
    fn lock(&self) -> MutexGuard<'_, Spool> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for SpoolSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut spool = self.lock();
        let offset = (spool.pos - spool.base) as usize;
        if offset > spool.buf.len() {
            spool.buf.resize(offset, 0);
        }
        let overlap = (spool.buf.len() - offset).min(data.len());
        spool.buf[offset..offset + overlap].copy_from_slice(&data[..overlap]);
        spool.buf.extend_from_slice(&data[overlap..]);
        spool.pos += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SpoolSink {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let mut spool = self.lock();
        let absolute = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => spool.end().checked_add_signed(delta),
            SeekFrom::Current(delta) => spool.pos.checked_add_signed(delta),
        };
        match absolute {
            Some(n) if n >= spool.base => {
                spool.pos = n;
                Ok(n)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek into archive bytes that were already streamed",
            )),
        }
    }
}

/// Creates a connected writer/body pair. At most `capacity` chunks of
/// [`STREAM_CHUNK_SIZE`] are buffered before the writer waits for the client.
pub fn archive_channel(capacity: usize, deflate: bool) -> (ArchiveWriter, ArchiveBody) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = SpoolSink::default();
    let method = if deflate {
        CompressionMethod::Deflated
    } else {
        CompressionMethod::Stored
    };

    let writer = ArchiveWriter {
        zip: Some(ZipWriter::new(sink.clone())),
        spool: sink,
        tx,
        state: ArchiveState::Idle,
        namer: EntryNamer::new(),
        options: FileOptions::default()
            .compression_method(method)
            .unix_permissions(0o644),
        bytes_sent: 0,
    };
    (writer, ArchiveBody { rx })
}

/// Push side of the archive. Entries are written one at a time, in order.
pub struct ArchiveWriter {
    zip: Option<ZipWriter<SpoolSink>>,
    spool: SpoolSink,
    tx: mpsc::Sender<ArchiveChunk>,
    state: ArchiveState,
    namer: EntryNamer,
    options: FileOptions,
    bytes_sent: u64,
}

impl ArchiveWriter {
    pub fn state(&self) -> ArchiveState {
        self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.state == ArchiveState::Finalized
    }

    pub fn entries(&self) -> usize {
        match self.state {
            ArchiveState::Streaming { entries } => entries,
            _ => 0,
        }
    }

    /// Writes one complete entry and closes the previous one. Returns the name
    /// actually used inside the archive (sanitized and made unique).
    pub async fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<String, ArchiveError> {
        let entries = match self.state {
            ArchiveState::Finalized => {
                return Err(ArchiveError::InvalidState {
                    state: self.state,
                    action: "add an entry",
                });
            }
            ArchiveState::Idle => 0,
            ArchiveState::Streaming { entries } => entries,
        };

        let entry_name = self.namer.next_name(name);
        let ready = match self.encode_entry(&entry_name, data) {
            Ok(ready) => ready,
            Err(e) => {
                self.abort(&e).await;
                return Err(e);
            }
        };

        self.state = ArchiveState::Streaming {
            entries: entries + 1,
        };
        self.send(ready).await?;
        Ok(entry_name)
    }

    fn encode_entry(&mut self, name: &str, data: &[u8]) -> Result<Bytes, ArchiveError> {
        let zip = self.zip.as_mut().ok_or(ArchiveError::InvalidState {
            state: self.state,
            action: "add an entry",
        })?;

        // Bytes before the current position are never patched again once the
        // next entry has started.
        let boundary = self.spool.lock().pos;
        zip.start_file(name, self.options)?;
        let ready = self.spool.lock().take_until(boundary);
        zip.write_all(data)?;
        Ok(ready)
    }

    /// Writes the central directory and closes the stream. Must be called
    /// exactly once.
    pub async fn finish(&mut self) -> Result<ArchiveSummary, ArchiveError> {
        if self.state == ArchiveState::Finalized {
            return Err(ArchiveError::InvalidState {
                state: self.state,
                action: "finalize",
            });
        }
        let entries = self.entries();

        let tail = match self.seal() {
            Ok(tail) => tail,
            Err(e) => {
                self.abort(&e).await;
                return Err(e);
            }
        };
        self.send(tail).await?;

        tracing::info!(
            "🗜️  Archive finalized: {} entries, {} bytes",
            entries,
            self.bytes_sent
        );
        Ok(ArchiveSummary {
            entries,
            bytes_sent: self.bytes_sent,
        })
    }

    fn seal(&mut self) -> Result<Bytes, ArchiveError> {
        self.state = ArchiveState::Finalized;
        let mut zip = self.zip.take().ok_or(ArchiveError::InvalidState {
            state: ArchiveState::Finalized,
            action: "finalize",
        })?;
        zip.finish()?;
        Ok(self.spool.lock().take_all())
    }

    /// Terminates the response body with an error so the client sees a broken
    /// transfer instead of a silently truncated archive.
    async fn abort(&mut self, err: &ArchiveError) {
        tracing::error!("❌ Aborting archive stream: {}", err);
        self.state = ArchiveState::Finalized;
        self.zip = None;
        let _ = self
            .tx
            .send(Err(io::Error::other(err.to_string())))
            .await;
    }

    async fn send(&mut self, mut data: Bytes) -> Result<(), ArchiveError> {
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(STREAM_CHUNK_SIZE));
            let len = chunk.len() as u64;
            if self.tx.send(Ok(chunk)).await.is_err() {
                self.state = ArchiveState::Finalized;
                self.zip = None;
                return Err(ArchiveError::ClientDisconnected);
            }
            self.bytes_sent += len;
        }
        Ok(())
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if self.state == ArchiveState::Finalized {
            return;
        }
        tracing::warn!("⚠️  Archive writer dropped before finalize; closing it best-effort");
        if let Ok(mut tail) = self.seal() {
            while !tail.is_empty() {
                let chunk = tail.split_to(tail.len().min(STREAM_CHUNK_SIZE));
                if self.tx.try_send(Ok(chunk)).is_err() {
                    break;
                }
            }
        }
    }
}

/// Pull side of the archive, consumed by the HTTP response.
pub struct ArchiveBody {
    rx: mpsc::Receiver<ArchiveChunk>,
}

impl ArchiveBody {
    pub fn into_body(self) -> Body {
        let mut rx = self.rx;
        let stream = async_stream::stream! {
            while let Some(chunk) = rx.recv().await {
                yield chunk;
            }
        };
        Body::from_stream(stream)
    }

    /// Receives the next chunk; `None` once the writer is gone.
    pub async fn next_chunk(&mut self) -> Option<ArchiveChunk> {
        self.rx.recv().await
    }

    /// Drains the stream into one buffer, failing on the first aborted chunk.
    pub async fn collect(mut self) -> Result<Vec<u8>, io::Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn read_entries(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut data = Vec::new();
                file.read_to_end(&mut data).unwrap();
                (file.name().to_string(), data)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_entry_round_trip() {
        let (mut writer, body) = archive_channel(16, true);
        let name = writer.add_entry("Sheet1.png", b"\x89PNG fake").await.unwrap();
        assert_eq!(name, "Sheet1.png");
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.entries, 1);
        drop(writer);

        let bytes = body.collect().await.unwrap();
        assert_eq!(summary.bytes_sent, bytes.len() as u64);
        let entries = read_entries(bytes);
        assert_eq!(entries, vec![("Sheet1.png".to_string(), b"\x89PNG fake".to_vec())]);
    }

    #[tokio::test]
    async fn test_state_machine() {
        let (mut writer, _body) = archive_channel(16, false);
        assert_eq!(writer.state(), ArchiveState::Idle);

        writer.add_entry("a.png", b"a").await.unwrap();
        writer.add_entry("b.png", b"b").await.unwrap();
        assert_eq!(writer.state(), ArchiveState::Streaming { entries: 2 });

        writer.finish().await.unwrap();
        assert!(writer.is_finalized());

        let err = writer.add_entry("c.png", b"c").await.unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::InvalidState {
                state: ArchiveState::Finalized,
                ..
            }
        ));
        assert!(matches!(
            writer.finish().await.unwrap_err(),
            ArchiveError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_archive_is_valid() {
        let (mut writer, body) = archive_channel(4, true);
        writer.finish().await.unwrap();
        drop(writer);
        let bytes = body.collect().await.unwrap();
        assert!(read_entries(bytes).is_empty());
    }

    #[tokio::test]
    async fn test_previous_entry_is_streamed_before_finish() {
        let (mut writer, mut body) = archive_channel(16, false);
        writer.add_entry("first.png", &[1u8; 1000]).await.unwrap();
        writer.add_entry("second.png", &[2u8; 1000]).await.unwrap();

        // The first entry (header + data) is final once the second one starts.
        let chunk = body.next_chunk().await.unwrap().unwrap();
        assert!(chunk.starts_with(b"PK\x03\x04"));
        assert!(chunk.len() >= 1000);

        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_entries_stream_through_small_channel() {
        let (mut writer, body) = archive_channel(2, false);
        let reader = tokio::spawn(body.collect());

        let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 300 * 1024]).collect();
        for (i, data) in payloads.iter().enumerate() {
            writer.add_entry(&format!("p{}.png", i), data).await.unwrap();
        }
        writer.finish().await.unwrap();
        drop(writer);

        let entries = read_entries(reader.await.unwrap().unwrap());
        assert_eq!(entries.len(), 3);
        for (i, (name, data)) in entries.iter().enumerate() {
            assert_eq!(name, &format!("p{}.png", i));
            assert_eq!(data, &payloads[i]);
        }
    }

    #[tokio::test]
    async fn test_duplicate_names_are_made_unique() {
        let (mut writer, body) = archive_channel(16, true);
        writer.add_entry("CT.png", b"1").await.unwrap();
        writer.add_entry("CT.png", b"2").await.unwrap();
        writer.add_entry("../CT.png", b"3").await.unwrap();
        writer.finish().await.unwrap();
        drop(writer);

        let names: Vec<String> = read_entries(body.collect().await.unwrap())
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["CT.png", "CT (2).png", "_CT.png"]);
    }

    #[tokio::test]
    async fn test_client_disconnect_is_reported() {
        let (mut writer, body) = archive_channel(16, false);
        drop(body);
        // Nothing is final yet, so the first entry does not touch the channel.
        writer.add_entry("a.png", b"a").await.unwrap();
        let err = writer.add_entry("b.png", b"b").await.unwrap_err();
        assert!(matches!(err, ArchiveError::ClientDisconnected));
        assert!(writer.is_finalized());
    }

    #[tokio::test]
    async fn test_drop_without_finish_still_closes_archive() {
        let (mut writer, body) = archive_channel(16, true);
        writer.add_entry("only.png", b"data").await.unwrap();
        drop(writer);

        let entries = read_entries(body.collect().await.unwrap());
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_spool_rejects_seek_into_sent_bytes() {
        let mut sink = SpoolSink::default();
        sink.write_all(b"0123456789").unwrap();
        let sent = sink.lock().take_until(6);
        assert_eq!(&sent[..], b"012345");

        assert!(sink.seek(SeekFrom::Start(3)).is_err());
        sink.seek(SeekFrom::Start(7)).unwrap();
        sink.write_all(b"X").unwrap();
        assert_eq!(&sink.lock().take_all()[..], b"6X89");
    }
}
