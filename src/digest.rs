//! Streaming SHA-256 and the bounded read primitives the reconciler uses
//! to carve an appended byte stream into part-sized pieces without ever
//! buffering more than one store part at a time.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use sha2::{Digest as _, Sha256};

use crate::error::Error;

/// A lazily-produced sequence of byte chunks, the same shape the
/// `ObjectStore` trait reads from and hands back on `get`.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Wraps a single buffer as a one-shot stream.
pub fn once(data: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Wraps an empty stream, for zero-length bodies.
pub fn empty() -> ByteStream {
    Box::pin(stream::empty())
}

/// `sha256:`-prefixed lowercase hex digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// An incremental digest, fed chunk by chunk as bytes are read off a
/// stream so the final hash never requires a second pass over the data.
pub struct IncrementalDigest(Sha256);

impl IncrementalDigest {
    pub fn new() -> Self {
        IncrementalDigest(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> String {
        format!("sha256:{}", hex::encode(self.0.finalize()))
    }
}

impl Default for IncrementalDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a `ByteStream` in bounded windows, letting callers pull exact
/// byte counts across chunk boundaries without ever holding more than one
/// upstream chunk plus the current partial read in memory.
pub struct ChunkReader {
    inner: ByteStream,
    pending: VecDeque<Bytes>,
    exhausted: bool,
}

impl ChunkReader {
    pub fn new(inner: ByteStream) -> Self {
        ChunkReader {
            inner,
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Pushes bytes back to the front of the read queue, as if they had
    /// never been consumed. Used by the reconciler's shrink-repair case
    /// to splice recovered scratch bytes ahead of newly appended bytes.
    pub fn prepend(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.pending.push_front(data);
        }
    }

    async fn pull(&mut self) -> Result<(), Error> {
        match self.inner.next().await {
            Some(Ok(bytes)) => {
                if !bytes.is_empty() {
                    self.pending.push_back(bytes);
                }
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => {
                self.exhausted = true;
                Ok(())
            }
        }
    }

    /// Reads up to `n` bytes, returning fewer only once the stream itself
    /// is exhausted.
    pub async fn read_up_to(&mut self, n: u64) -> Result<Bytes, Error> {
        if n == 0 {
            return Ok(Bytes::new());
        }
        let mut out = BytesMut::with_capacity(n.min(1 << 20) as usize);
        while (out.len() as u64) < n {
            if let Some(front) = self.pending.front_mut() {
                let need = n - out.len() as u64;
                if (front.len() as u64) <= need {
                    let chunk = self.pending.pop_front().unwrap();
                    out.extend_from_slice(&chunk);
                } else {
                    let take = front.split_to(need as usize);
                    out.extend_from_slice(&take);
                }
                continue;
            }
            if self.exhausted {
                break;
            }
            self.pull().await?;
        }
        Ok(out.freeze())
    }

    /// Reads exactly `n` bytes, failing if the stream ends early.
    pub async fn read_exact(&mut self, n: u64) -> Result<Bytes, Error> {
        let data = self.read_up_to(n).await?;
        if (data.len() as u64) < n {
            return Err(Error::Client(format!(
                "stream ended after {} of {} expected bytes",
                data.len(),
                n
            )));
        }
        Ok(data)
    }

    /// Drains the stream fully. Only used for bodies the spec allows to
    /// be fully materialized (manifests, monolithic blobs).
    pub async fn read_to_end(&mut self) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        while let Some(front) = self.pending.pop_front() {
            out.extend_from_slice(&front);
        }
        while !self.exhausted {
            self.pull().await?;
            while let Some(front) = self.pending.pop_front() {
                out.extend_from_slice(&front);
            }
        }
        Ok(out.freeze())
    }
}

/// Fully buffers a stream, failing if it exceeds `limit` bytes. Used by
/// the monolithic upload path to enforce `max_chunk` without assuming the
/// caller's declared content length is honest.
pub async fn buffer_bounded(stream: ByteStream, limit: u64) -> Result<Bytes, Error> {
    let mut reader = ChunkReader::new(stream);
    let data = reader.read_up_to(limit + 1).await?;
    if data.len() as u64 > limit {
        return Err(Error::Client(format!(
            "body exceeds {} byte limit",
            limit
        )));
    }
    Ok(data)
}

/// Fully buffers a stream of known, trusted size.
pub async fn buffer(stream: ByteStream) -> Result<Bytes, Error> {
    ChunkReader::new(stream).read_to_end().await
}

enum TeeState {
    Running(ByteStream, Sha256),
    Done,
}

/// Wraps `inner` in a pass-through stream that hashes every byte forwarded
/// without buffering the body. The returned cell is populated with the
/// final digest only once the stream has been driven to completion (e.g.
/// by handing it to `ObjectStore::put`) — read it only after that future
/// resolves.
pub fn tee_sha256(inner: ByteStream) -> (ByteStream, Arc<Mutex<Option<String>>>) {
    let digest_cell = Arc::new(Mutex::new(None));
    let out_cell = digest_cell.clone();
    let stream = stream::unfold((TeeState::Running(inner, Sha256::new()), out_cell), |(st, cell)| async move {
        match st {
            TeeState::Running(mut inner, mut hasher) => match inner.next().await {
                Some(Ok(bytes)) => {
                    hasher.update(&bytes);
                    Some((Ok(bytes), (TeeState::Running(inner, hasher), cell)))
                }
                Some(Err(e)) => Some((Err(e), (TeeState::Done, cell))),
                None => {
                    let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
                    *cell.lock().unwrap() = Some(digest);
                    None
                }
            },
            TeeState::Done => None,
        }
    });
    (Box::pin(stream), digest_cell)
}
