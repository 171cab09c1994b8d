// ABOUTME: Streaming tar producer for uploads into sandboxes
// ABOUTME: Archives are built on a blocking thread and leave it in bounded chunks

use crate::engine::ArchiveStream;
use crate::error::{Result, SandboxError};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::io::{self, Write};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest chunk handed to the engine
pub const ARCHIVE_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks in flight between the tar builder and the engine
const CHANNEL_DEPTH: usize = 4;

/// `Write` end of the archive stream; cuts the tar into chunks and blocks while the engine is behind
pub struct ChunkSender {
    tx: mpsc::Sender<Result<Bytes>>,
    buffer: Vec<u8>,
}

impl ChunkSender {
    fn new(tx: mpsc::Sender<Result<Bytes>>) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(ARCHIVE_CHUNK_SIZE),
        }
    }

    fn send(&mut self) -> io::Result<()> {
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(ARCHIVE_CHUNK_SIZE));
        self.tx
            .blocking_send(Ok(Bytes::from(chunk)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))
    }
}

impl Write for ChunkSender {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let taken = data.len().min(ARCHIVE_CHUNK_SIZE - self.buffer.len());
        self.buffer.extend_from_slice(&data[..taken]);
        if self.buffer.len() == ARCHIVE_CHUNK_SIZE {
            self.send()?;
        }
        Ok(taken)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.send()
    }
}

pub type TarBuilder = tar::Builder<ChunkSender>;

/// Run `build` against a tar builder on a blocking thread and stream the archive it writes.
///
/// The stream ends with an `Err` item if `build` fails, so the engine never sees a
/// well-formed archive for a broken source. The handle resolves to `build`'s result
/// once the archive is finished or abandoned.
pub fn tar_stream<T, F>(label: String, build: F) -> (ArchiveStream, JoinHandle<io::Result<T>>)
where
    T: Send + 'static,
    F: FnOnce(&mut TarBuilder) -> io::Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let failures = tx.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(ChunkSender::new(tx));
        let result = build(&mut builder).and_then(|value| {
            let mut sender = builder.into_inner()?;
            sender.flush()?;
            Ok(value)
        });
        if let Err(e) = &result {
            // Ignored when the consumer is already gone; the handle still reports it
            let _ = failures.blocking_send(Err(SandboxError::transfer(&label, e)));
        }
        result
    });

    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
    .boxed();
    (stream, handle)
}
