//! Chunked/resumable upload state machine shared by the adapters whose
//! backends expose a session or multipart primitive.
//!
//! `NotStarted → SessionOpen → Appending* → Committed`, with `Aborted`
//! reachable from every non-terminal state. Only `commit` makes an object
//! visible, so an aborted session never leaves a partial item behind.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use super::{ProviderKind, StorageError, StorageItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadState {
    NotStarted,
    SessionOpen,
    Appending,
    Committed,
    Aborted,
}

/// Size threshold above which an adapter switches to chunked upload, and the
/// chunk geometry it uses once it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub threshold: u64,
    pub chunk_size: usize,
    /// Chunks in flight at once. Only backends with out-of-order part
    /// numbering may use more than one.
    pub parallelism: usize,
}

impl UploadLimits {
    pub const fn new(threshold: u64, chunk_size: usize) -> Self {
        Self {
            threshold,
            chunk_size,
            parallelism: 1,
        }
    }

    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn is_chunked(&self, size: u64) -> bool {
        size > self.threshold
    }
}

/// One slice of the payload handed to [`ChunkProtocol::append`].
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    /// Zero-based position; S3 part numbers are `index + 1`.
    pub index: usize,
    pub offset: u64,
    pub data: Bytes,
    pub total: u64,
}

impl Chunk {
    pub fn is_last(&self) -> bool {
        self.offset + self.data.len() as u64 == self.total
    }

    /// Inclusive `Content-Range` value for session protocols.
    pub fn content_range(&self) -> String {
        let end = self.offset + self.data.len() as u64 - 1;
        format!("bytes {}-{}/{}", self.offset, end, self.total)
    }
}

/// Backend glue for one resumable-upload primitive.
#[async_trait]
pub(crate) trait ChunkProtocol: Send + Sync {
    type Part: Send + 'static;

    /// Open a session and return its backend identifier.
    async fn open(&self) -> Result<String, StorageError>;

    async fn append(&self, session_id: &str, chunk: Chunk) -> Result<Self::Part, StorageError>;

    /// Finalize with every part in order; the object becomes visible here.
    async fn commit(
        &self,
        session_id: &str,
        parts: Vec<Self::Part>,
        total: u64,
    ) -> Result<StorageItem, StorageError>;

    /// Release server-side state. Best effort.
    async fn abort(&self, session_id: &str) -> Result<(), StorageError>;
}

/// In-flight bookkeeping for one upload call. The session id never leaves
/// the adapter.
#[derive(Debug)]
pub(crate) struct UploadSession {
    session_id: Option<String>,
    kind: ProviderKind,
    destination: String,
    chunk_size: usize,
    bytes_sent: u64,
    state: UploadState,
}

impl UploadSession {
    pub fn new(kind: ProviderKind, destination: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            session_id: None,
            kind,
            destination: destination.into(),
            chunk_size: chunk_size.max(1),
            bytes_sent: 0,
            state: UploadState::NotStarted,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn chunks(&self, data: &Bytes) -> Vec<Chunk> {
        let total = data.len() as u64;
        (0..data.len())
            .step_by(self.chunk_size)
            .enumerate()
            .map(|(index, start)| {
                let end = (start + self.chunk_size).min(data.len());
                Chunk {
                    index,
                    offset: start as u64,
                    data: data.slice(start..end),
                    total,
                }
            })
            .collect()
    }

    /// Drive the whole lifecycle. On any failure, including cancellation,
    /// the session is aborted before the error is returned.
    pub async fn run<P: ChunkProtocol>(
        &mut self,
        protocol: &P,
        data: Bytes,
        parallelism: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<StorageItem, StorageError> {
        debug_assert_eq!(self.state, UploadState::NotStarted);

        if is_cancelled(cancel) {
            self.state = UploadState::Aborted;
            return Err(cancelled());
        }

        let session_id = match protocol.open().await {
            Ok(id) => id,
            Err(e) => {
                self.state = UploadState::Aborted;
                return Err(e);
            }
        };
        self.session_id = Some(session_id.clone());
        self.state = UploadState::SessionOpen;
        tracing::debug!(
            provider = %self.kind,
            destination = %self.destination,
            bytes = data.len(),
            "Opened upload session"
        );

        let total = data.len() as u64;
        let parts = match self
            .append_all(protocol, &session_id, &data, parallelism, cancel)
            .await
        {
            Ok(parts) => parts,
            Err(e) => return Err(self.abort(protocol, e).await),
        };

        if is_cancelled(cancel) {
            return Err(self.abort(protocol, cancelled()).await);
        }

        match protocol.commit(&session_id, parts, total).await {
            Ok(item) => {
                self.state = UploadState::Committed;
                tracing::debug!(
                    provider = %self.kind,
                    destination = %self.destination,
                    "Committed upload session"
                );
                Ok(item)
            }
            Err(e) => Err(self.abort(protocol, e).await),
        }
    }

    async fn append_all<P: ChunkProtocol>(
        &mut self,
        protocol: &P,
        session_id: &str,
        data: &Bytes,
        parallelism: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<P::Part>, StorageError> {
        let chunks = self.chunks(data);

        if parallelism <= 1 {
            let mut parts = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                if is_cancelled(cancel) {
                    return Err(cancelled());
                }
                let len = chunk.data.len() as u64;
                parts.push(protocol.append(session_id, chunk).await?);
                self.state = UploadState::Appending;
                self.bytes_sent += len;
            }
            return Ok(parts);
        }

        let sent: Vec<(u64, P::Part)> = stream::iter(chunks)
            .map(|chunk| async move {
                if is_cancelled(cancel) {
                    return Err(cancelled());
                }
                let len = chunk.data.len() as u64;
                protocol.append(session_id, chunk).await.map(|part| (len, part))
            })
            .buffered(parallelism)
            .try_collect()
            .await?;

        self.state = UploadState::Appending;
        self.bytes_sent = sent.iter().map(|(len, _)| len).sum();
        Ok(sent.into_iter().map(|(_, part)| part).collect())
    }

    async fn abort<P: ChunkProtocol>(&mut self, protocol: &P, cause: StorageError) -> StorageError {
        self.state = UploadState::Aborted;
        if let Some(ref session_id) = self.session_id {
            if let Err(e) = protocol.abort(session_id).await {
                tracing::warn!(
                    provider = %self.kind,
                    destination = %self.destination,
                    error = %e,
                    "Failed to release aborted upload session"
                );
            } else {
                tracing::debug!(
                    provider = %self.kind,
                    destination = %self.destination,
                    bytes_sent = self.bytes_sent,
                    "Aborted upload session"
                );
            }
        }
        cause
    }
}

fn is_cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.is_some_and(|token| token.is_cancelled())
}

fn cancelled() -> StorageError {
    StorageError::Cancelled("upload cancelled by caller".to_string())
}
