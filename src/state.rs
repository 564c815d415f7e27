//! Upload state: the record the reconciler mutates, and its encoding as
//! an opaque, fingerprinted token (spec §9 — the signed-token scheme is
//! dropped in favor of a compare-and-set fingerprint, since this crate
//! has no signing key material of its own).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::{self, ByteStream};
use crate::error::Error;
use crate::store::{ObjectStore, PutHint};

/// One part already committed to the store multipart session, and the
/// chunk-shape record (below) describing how it was produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartRecord {
    pub part_number: u32,
    pub etag: String,
}

/// How a committed part relates to the client-visible chunk sequence.
/// `upload_id` mirrors `UploadState::store_upload_id` — the spec's data
/// model carries it per-chunk rather than deriving it, so it is kept
/// here verbatim even though it is constant for the life of one upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Chunk {
    /// A part whose size matches the running equal-size chain.
    MultiPartEqual { size: u64, upload_id: String },
    /// A part smaller than its predecessor, recoverable via `scratch_key`
    /// in full compatibility mode.
    MultiPartShrunk {
        size: u64,
        upload_id: String,
        scratch_key: String,
    },
    /// A part below `min_chunk`, held back from the store's equal-size
    /// chain and recoverable via `scratch_key` in full compatibility mode.
    SmallTrailing {
        size: u64,
        upload_id: String,
        scratch_key: String,
    },
}

impl Chunk {
    pub fn size(&self) -> u64 {
        match self {
            Chunk::MultiPartEqual { size, .. } => *size,
            Chunk::MultiPartShrunk { size, .. } => *size,
            Chunk::SmallTrailing { size, .. } => *size,
        }
    }

    pub fn is_equal(&self) -> bool {
        matches!(self, Chunk::MultiPartEqual { .. })
    }

    pub fn is_repairable(&self) -> bool {
        matches!(self, Chunk::MultiPartShrunk { .. } | Chunk::SmallTrailing { .. })
    }

    pub fn scratch_key(&self) -> Option<&str> {
        match self {
            Chunk::MultiPartEqual { .. } => None,
            Chunk::MultiPartShrunk { scratch_key, .. } => Some(scratch_key),
            Chunk::SmallTrailing { scratch_key, .. } => Some(scratch_key),
        }
    }
}

/// The full state of one in-progress upload. Invariant: `parts.len() ==
/// chunks.len()`, and `byte_range == chunks.iter().map(Chunk::size).sum()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadState {
    pub registry_upload_id: Uuid,
    pub store_upload_id: String,
    pub name: String,
    pub byte_range: u64,
    pub parts: Vec<PartRecord>,
    pub chunks: Vec<Chunk>,
}

impl UploadState {
    pub fn new(registry_upload_id: Uuid, store_upload_id: String, name: String) -> Self {
        UploadState {
            registry_upload_id,
            store_upload_id,
            name,
            byte_range: 0,
            parts: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn last_chunk(&self) -> Option<&Chunk> {
        self.chunks.last()
    }

    pub fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }
}

fn upload_state_key(name: &str, registry_upload_id: &Uuid) -> String {
    format!("{}/uploads/{}", name, registry_upload_id)
}

/// The result of persisting a state: the canonical token bytes and the
/// fingerprint derived from them, handed back to the caller as a resume
/// token.
pub fn fingerprint_of(token: &str) -> String {
    digest::sha256_hex(token.as_bytes())
}

/// Serializes, fingerprints and persists `state`, returning the
/// fingerprint a caller should present on the next request.
pub async fn encode_state(
    store: &dyn ObjectStore,
    state_ttl: std::time::Duration,
    state: &UploadState,
) -> Result<String, Error> {
    let token = serde_json::to_string(state)?;
    let fingerprint = fingerprint_of(&token);
    let key = upload_state_key(&state.name, &state.registry_upload_id);
    store
        .put(
            &key,
            digest::once(bytes::Bytes::from(token.into_bytes())),
            PutHint {
                expires_in: Some(state_ttl),
                ..Default::default()
            },
        )
        .await?;
    Ok(fingerprint)
}

/// Outcome of reading back a persisted upload state.
pub enum Decoded {
    Missing,
    /// The stored state's fingerprint did not match what the caller
    /// presented. Carries the state *and* the fingerprint actually
    /// computed from it, so the caller can report the authoritative
    /// cursor — and the fingerprint to resume with — rather than echoing
    /// back the caller's own stale one (spec §4.3/§7).
    Stale { state: UploadState, fingerprint: String },
    Fresh { state: UploadState, fingerprint: String },
}

/// Reads back the state for `(name, registry_upload_id)`. If
/// `expected_fingerprint` is given and does not match, returns
/// `Decoded::Stale` rather than erroring — the caller decides how to
/// surface that as a `Range` conflict.
pub async fn decode_state(
    store: &dyn ObjectStore,
    name: &str,
    registry_upload_id: Uuid,
    expected_fingerprint: Option<&str>,
) -> Result<Decoded, Error> {
    let key = upload_state_key(name, &registry_upload_id);
    let (stream, _meta) = match store.get(&key).await? {
        None => return Ok(Decoded::Missing),
        Some(v) => v,
    };
    let bytes = digest::buffer(stream).await?;
    let token = std::str::from_utf8(&bytes)
        .map_err(|e| Error::Internal(format!("upload state is not valid utf-8: {}", e)))?;
    let fingerprint = fingerprint_of(token);
    let state: UploadState = serde_json::from_str(token)?;
    match expected_fingerprint {
        Some(expected) if expected != fingerprint => Ok(Decoded::Stale { state, fingerprint }),
        _ => Ok(Decoded::Fresh { state, fingerprint }),
    }
}

pub async fn delete_state(
    store: &dyn ObjectStore,
    name: &str,
    registry_upload_id: Uuid,
) -> Result<(), Error> {
    store.delete(&upload_state_key(name, &registry_upload_id)).await
}

/// A stream wrapping a single in-memory buffer, for re-reading bytes that
/// have already been buffered (e.g. the recovered scratch bytes in a
/// shrink repair).
pub fn bytes_stream(data: bytes::Bytes) -> ByteStream {
    digest::once(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn encode_then_decode_round_trips_and_detects_staleness() {
        let store = MemoryStore::with_default_limits();
        let state = UploadState::new(Uuid::new_v4(), "store-id".into(), "repo".into());
        let fp = encode_state(&store, std::time::Duration::from_secs(60), &state)
            .await
            .unwrap();

        match decode_state(&store, "repo", state.registry_upload_id, Some(&fp))
            .await
            .unwrap()
        {
            Decoded::Fresh { fingerprint, .. } => assert_eq!(fingerprint, fp),
            _ => panic!("expected fresh decode"),
        }

        match decode_state(&store, "repo", state.registry_upload_id, Some("bogus"))
            .await
            .unwrap()
        {
            Decoded::Stale { .. } => {}
            _ => panic!("expected stale decode"),
        }
    }

    #[tokio::test]
    async fn decode_missing_upload() {
        let store = MemoryStore::with_default_limits();
        match decode_state(&store, "repo", Uuid::new_v4(), None).await.unwrap() {
            Decoded::Missing => {}
            _ => panic!("expected missing"),
        }
    }
}
