//! Purpose: Buffer a request body into one seekable store before synchronous decoding.
//! Exports: `BodyBuffer`, `effective_threshold`, `DEFAULT_MEMORY_THRESHOLD`.
//! Role: Async drain phase of the pipeline; the decoder then reads without suspension.
//! Invariants: The memory/disk decision is fixed once draining completes and never revisited.
//! Invariants: No byte is readable before the source is fully drained and rewound.
//! Invariants: Spill files are removed on `dispose` or drop, including after partial drains.
//! Notes: The spill check uses the configured threshold; the effective (possibly reduced)
//! threshold only sizes the in-memory segment and is reported via `memory_threshold`.
use std::error::Error as StdError;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_MEMORY_THRESHOLD: usize = 1024 * 1024;

/// The declared length replaces the configured threshold when it is known,
/// positive and smaller.
pub fn effective_threshold(configured: usize, declared_length: Option<u64>) -> usize {
    match declared_length {
        Some(len) if len > 0 && len < configured as u64 => len as usize,
        _ => configured,
    }
}

enum Store {
    Memory(Cursor<Vec<u8>>),
    Spilled(NamedTempFile),
    Disposed,
}

pub struct BodyBuffer {
    store: Store,
    len: u64,
    declared_length: Option<u64>,
    memory_threshold: usize,
    configured_threshold: usize,
}

impl BodyBuffer {
    /// Drain `source` completely, spilling to a temp file once the body exceeds
    /// `threshold` bytes, then rewind. `deadline` bounds the whole drain.
    pub async fn drain<S, E>(
        source: S,
        declared_length: Option<u64>,
        threshold: usize,
        deadline: Option<Duration>,
    ) -> Result<Self, Error>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let fill = Self::fill(source, declared_length, threshold);
        let mut buffer = match deadline {
            Some(limit) => tokio::time::timeout(limit, fill).await.map_err(|_| {
                Error::new(ErrorKind::Timeout)
                    .with_message("timed out while buffering request body")
                    .with_hint("Raise the drain timeout or send the body faster.")
            })??,
            None => fill.await?,
        };
        buffer.seek(SeekFrom::Start(0)).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to rewind request body")
                .with_source(err)
        })?;
        tracing::debug!(
            bytes = buffer.len,
            spilled = buffer.is_spilled(),
            memory_threshold = buffer.memory_threshold,
            "buffered request body"
        );
        Ok(buffer)
    }

    async fn fill<S, E>(source: S, declared_length: Option<u64>, threshold: usize) -> Result<Self, Error>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: StdError + Send + Sync + 'static,
    {
        tokio::pin!(source);
        let memory_threshold = effective_threshold(threshold, declared_length);
        let capacity = declared_length.map_or(0, |len| len.min(memory_threshold as u64) as usize);
        let mut memory = Vec::with_capacity(capacity);
        let mut spill: Option<(NamedTempFile, tokio::fs::File)> = None;
        let mut len = 0u64;

        while let Some(chunk) = source.next().await {
            let chunk = chunk.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read request body")
                    .with_source(err)
            })?;
            len += chunk.len() as u64;

            if spill.is_none() && len > threshold as u64 {
                let (temp, mut writer) = open_spill_file()?;
                writer.write_all(&memory).await.map_err(spill_write_error)?;
                memory = Vec::new();
                spill = Some((temp, writer));
            }
            match spill.as_mut() {
                Some((_, writer)) => writer.write_all(&chunk).await.map_err(spill_write_error)?,
                None => memory.extend_from_slice(&chunk),
            }
        }

        let store = match spill {
            Some((temp, mut writer)) => {
                writer.flush().await.map_err(spill_write_error)?;
                Store::Spilled(temp)
            }
            None => Store::Memory(Cursor::new(memory)),
        };
        Ok(Self {
            store,
            len,
            declared_length,
            memory_threshold,
            configured_threshold: threshold,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.store, Store::Spilled(_))
    }

    pub fn spill_path(&self) -> Option<&Path> {
        match &self.store {
            Store::Spilled(temp) => Some(temp.path()),
            _ => None,
        }
    }

    /// Effective threshold after the declared-length reduction.
    pub fn memory_threshold(&self) -> usize {
        self.memory_threshold
    }

    pub fn configured_threshold(&self) -> usize {
        self.configured_threshold
    }

    pub fn declared_length(&self) -> Option<u64> {
        self.declared_length
    }

    /// Release the backing store and remove any spill file. Safe to repeat.
    pub fn dispose(&mut self) {
        if let Store::Spilled(temp) = std::mem::replace(&mut self.store, Store::Disposed) {
            let path = temp.path().to_path_buf();
            if let Err(err) = temp.close() {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove spill file");
            }
        }
    }
}

impl Drop for BodyBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn open_spill_file() -> Result<(NamedTempFile, tokio::fs::File), Error> {
    let temp = NamedTempFile::new().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create spill file")
            .with_source(err)
    })?;
    let handle = temp.as_file().try_clone().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!(
                "failed to open spill file for writing: {}",
                temp.path().display()
            ))
            .with_source(err)
    })?;
    Ok((temp, tokio::fs::File::from_std(handle)))
}

fn spill_write_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write spill file")
        .with_source(err)
}

fn disposed() -> io::Error {
    io::Error::other("body buffer already disposed")
}

impl Read for BodyBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.store {
            Store::Memory(cursor) => cursor.read(buf),
            Store::Spilled(temp) => temp.as_file_mut().read(buf),
            Store::Disposed => Err(disposed()),
        }
    }
}

impl Seek for BodyBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.store {
            Store::Memory(cursor) => cursor.seek(pos),
            Store::Spilled(temp) => temp.as_file_mut().seek(pos),
            Store::Disposed => Err(disposed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BodyBuffer, effective_threshold};
    use bytes::Bytes;
    use std::io::{self, Read};
    use std::time::Duration;
    use tokio_stream::Stream;

    fn chunks(body: &[u8], size: usize) -> impl Stream<Item = io::Result<Bytes>> {
        let parts: Vec<io::Result<Bytes>> = body
            .chunks(size.max(1))
            .map(|part| Ok(Bytes::copy_from_slice(part)))
            .collect();
        tokio_stream::iter(parts)
    }

    #[test]
    fn effective_threshold_prefers_smaller_declared_length() {
        assert_eq!(effective_threshold(1024, Some(10)), 10);
        assert_eq!(effective_threshold(1024, Some(1024)), 1024);
        assert_eq!(effective_threshold(1024, Some(4096)), 1024);
        assert_eq!(effective_threshold(1024, Some(0)), 1024);
        assert_eq!(effective_threshold(1024, None), 1024);
    }

    #[tokio::test]
    async fn small_body_stays_in_memory() {
        let body = br#"{"a":1}"#;
        let mut buffer = BodyBuffer::drain(chunks(body, 3), Some(body.len() as u64), 1024, None)
            .await
            .expect("drain");
        assert!(!buffer.is_spilled());
        assert!(buffer.spill_path().is_none());
        assert_eq!(buffer.memory_threshold(), body.len());
        assert_eq!(buffer.configured_threshold(), 1024);

        let mut out = Vec::new();
        buffer.read_to_end(&mut out).expect("read");
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn body_at_threshold_does_not_spill() {
        let body = vec![b'x'; 64];
        let buffer = BodyBuffer::drain(chunks(&body, 7), None, 64, None)
            .await
            .expect("drain");
        assert!(!buffer.is_spilled());
        assert_eq!(buffer.len(), 64);
    }

    #[tokio::test]
    async fn large_body_spills_and_cleans_up() {
        let body = vec![b'y'; 4096];
        let mut buffer = BodyBuffer::drain(chunks(&body, 500), None, 1024, None)
            .await
            .expect("drain");
        assert!(buffer.is_spilled());
        let path = buffer.spill_path().expect("spill path").to_path_buf();
        assert!(path.exists());

        let mut out = Vec::new();
        buffer.read_to_end(&mut out).expect("read");
        assert_eq!(out, body);

        buffer.dispose();
        assert!(!path.exists());
        buffer.dispose();
        assert!(buffer.read(&mut [0u8; 4]).is_err());
    }

    #[tokio::test]
    async fn dropping_spilled_buffer_removes_file() {
        let body = vec![b'z'; 256];
        let buffer = BodyBuffer::drain(chunks(&body, 256), None, 16, None)
            .await
            .expect("drain");
        let path = buffer.spill_path().expect("spill path").to_path_buf();
        drop(buffer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_after_external_removal_is_quiet() {
        let body = vec![b'z'; 256];
        let buffer = BodyBuffer::drain(chunks(&body, 64), None, 16, None)
            .await
            .expect("drain");
        let path = buffer.spill_path().expect("spill path").to_path_buf();
        std::fs::remove_file(&path).expect("remove spill file");
        drop(buffer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn empty_body_is_empty() {
        let buffer = BodyBuffer::drain(chunks(b"", 1), Some(0), 1024, None)
            .await
            .expect("drain");
        assert!(buffer.is_empty());
        assert_eq!(buffer.memory_threshold(), 1024);
    }

    #[tokio::test]
    async fn source_error_is_io() {
        let parts: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let err = BodyBuffer::drain(tokio_stream::iter(parts), None, 1024, None)
            .await
            .err()
            .expect("expected io error");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Io);
    }

    #[tokio::test]
    async fn deadline_bounds_the_drain() {
        let source = tokio_stream::pending::<io::Result<Bytes>>();
        let err = BodyBuffer::drain(source, None, 1024, Some(Duration::from_millis(20)))
            .await
            .err()
            .expect("expected timeout");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Timeout);
    }
}
