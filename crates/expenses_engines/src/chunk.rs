#![forbid(unsafe_code)]

use std::collections::VecDeque;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer interrupted: {0}")]
    Interrupted(String),
    #[error("transfer carried no bytes")]
    EmptyPayload,
}

/// Pull side of a streaming upload.
///
/// `Ok(Some(chunk))` is the next chunk in arrival order, `Ok(None)` is the sender's
/// end-of-stream and `Err(_)` is the transport's error channel.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedImage {
    pub bytes: Vec<u8>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkReceiver;

impl ChunkReceiver {
    /// Reads until end-of-stream and concatenates in arrival order. On a transport
    /// error the partial buffer is dropped.
    pub async fn receive<S>(&self, source: &mut S) -> Result<ReceivedImage, TransferError>
    where
        S: ChunkSource + ?Sized,
    {
        let mut bytes = Vec::new();
        let mut chunk_count = 0usize;
        loop {
            match source.next_chunk().await {
                Ok(Some(chunk)) => {
                    chunk_count += 1;
                    bytes.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        chunks_before_error = chunk_count,
                        bytes_before_error = bytes.len(),
                        "chunk transfer interrupted, discarding partial buffer"
                    );
                    return Err(match err {
                        TransferError::EmptyPayload => {
                            TransferError::Interrupted("source reported empty payload".into())
                        }
                        other => other,
                    });
                }
            }
        }
        if bytes.is_empty() {
            return Err(TransferError::EmptyPayload);
        }
        tracing::debug!(chunk_count, total_bytes = bytes.len(), "chunk transfer complete");
        Ok(ReceivedImage { bytes, chunk_count })
    }
}

/// In-memory source replaying a fixed script of chunks and errors.
#[derive(Debug, Default)]
pub struct ScriptedChunkSource {
    script: VecDeque<Result<Vec<u8>, TransferError>>,
    pulls: usize,
}

impl ScriptedChunkSource {
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            script: chunks.into_iter().map(Ok).collect(),
            pulls: 0,
        }
    }

    pub fn then_error(mut self, detail: &str) -> Self {
        self.script
            .push_back(Err(TransferError::Interrupted(detail.to_string())));
        self
    }

    /// Number of `next_chunk` calls made so far, including the end-of-stream pull.
    pub fn pulls(&self) -> usize {
        self.pulls
    }
}

#[async_trait]
impl ChunkSource for ScriptedChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        self.pulls += 1;
        self.script.pop_front().transpose()
    }
}
