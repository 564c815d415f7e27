//! C5 — the upload session orchestrator: the request-facing surface that
//! drives the state codec and the reconciler. None of this module holds
//! state across calls; everything it needs travels in the
//! `UploadState`/fingerprint round-tripped by the caller.

use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::digest::{self, ByteStream};
use crate::error::{Error, OkOrNotFound, RangeConflict};
use crate::keys;
use crate::reconciler::Reconciler;
use crate::state::{self, Decoded, UploadState};
use crate::store::{ObjectStore, PutHint};

/// An opaque resume handle. A real HTTP front end encodes this into the
/// `Location` URL it returns to the client; this crate only needs the
/// two values to re-authenticate the next request against the state
/// that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLocation {
    pub upload_id: Uuid,
    pub fingerprint: String,
}

pub struct StartUploadResult {
    pub location: UploadLocation,
    pub min_chunk: u64,
    pub max_chunk: u64,
}

pub struct GetUploadResult {
    pub location: UploadLocation,
    /// `None` when nothing has been accepted yet (spec §9).
    pub range: Option<(u64, u64)>,
    pub min_chunk: u64,
    pub max_chunk: u64,
}

pub struct UploadChunkResult {
    pub location: UploadLocation,
    pub range: (u64, u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedUpload {
    pub digest: String,
    pub key: String,
}

pub enum MonolithicResult {
    Finished(FinishedUpload),
    TooLarge,
}

/// Thin, borrow-only wrapper exposing the upload operations over a
/// `Registry`'s store and config, mirroring the teacher's
/// `garage.bucket_helper()` pattern.
pub struct UploadSession<'a> {
    pub(crate) store: &'a dyn ObjectStore,
    pub(crate) config: &'a Config,
}

impl<'a> UploadSession<'a> {
    pub fn new(store: &'a dyn ObjectStore, config: &'a Config) -> Self {
        UploadSession { store, config }
    }

    pub async fn start_upload(&self, name: &str) -> Result<StartUploadResult, Error> {
        let upload_id = Uuid::new_v4();
        let target = keys::upload_target_key(upload_id);
        let store_upload_id = self.store.create_multipart(&target).await?;
        let state = UploadState::new(upload_id, store_upload_id, name.to_string());
        let fingerprint = state::encode_state(self.store, self.config.state_ttl, &state).await?;
        info!(name, %upload_id, "upload: started");
        Ok(StartUploadResult {
            location: UploadLocation { upload_id, fingerprint },
            min_chunk: self.config.min_chunk,
            max_chunk: self.config.max_chunk,
        })
    }

    pub async fn get_upload(&self, name: &str, upload_id: Uuid) -> Result<GetUploadResult, Error> {
        match state::decode_state(self.store, name, upload_id, None).await? {
            Decoded::Missing => Err(Error::NotFound(format!("upload {}", upload_id))),
            Decoded::Fresh { state, fingerprint } => Ok(GetUploadResult {
                location: UploadLocation { upload_id, fingerprint },
                range: byte_range_of(&state),
                min_chunk: self.config.min_chunk,
                max_chunk: self.config.max_chunk,
            }),
            Decoded::Stale { .. } => unreachable!("decode without an expected fingerprint is never stale"),
        }
    }

    pub async fn upload_chunk(
        &self,
        name: &str,
        location: &UploadLocation,
        stream: ByteStream,
        length: u64,
        http_range: Option<(u64, u64)>,
    ) -> Result<UploadChunkResult, Error> {
        if length > self.config.max_upload_chunk {
            return Err(Error::Client(format!(
                "chunk of {} bytes exceeds max_upload_chunk {}",
                length, self.config.max_upload_chunk
            )));
        }

        let (mut state, current_fingerprint) = match state::decode_state(
            self.store,
            name,
            location.upload_id,
            Some(&location.fingerprint),
        )
        .await?
        {
            Decoded::Missing => return Err(Error::NotFound(format!("upload {}", location.upload_id))),
            Decoded::Stale { state, fingerprint } => {
                return Err(Error::Range(RangeConflict {
                    fingerprint,
                    last_byte: last_byte_of(&state),
                }))
            }
            Decoded::Fresh { state, fingerprint } => (state, fingerprint),
        };

        if let Some((start, end)) = http_range {
            if start != state.byte_range || start >= end {
                return Err(Error::Range(RangeConflict {
                    fingerprint: current_fingerprint,
                    last_byte: last_byte_of(&state),
                }));
            }
        }

        let target = keys::upload_target_key(location.upload_id);
        let handle = self.store.resume_multipart(&target, &state.store_upload_id).await?;
        let reconciler = Reconciler::new(self.store, self.config);
        reconciler
            .reconcile(&mut state, handle.as_ref(), &location.fingerprint, stream, length)
            .await?;

        let fingerprint = state::encode_state(self.store, self.config.state_ttl, &state).await?;
        Ok(UploadChunkResult {
            location: UploadLocation {
                upload_id: location.upload_id,
                fingerprint,
            },
            range: (0, state.byte_range.saturating_sub(1)),
        })
    }

    /// `body`, when given, is the bytes of a client that never called
    /// `uploadChunk` and is handing the whole blob over in one shot.
    pub async fn finish_upload(
        &self,
        name: &str,
        location: &UploadLocation,
        expected_digest: &str,
        body: Option<(ByteStream, u64)>,
    ) -> Result<FinishedUpload, Error> {
        let state = match state::decode_state(
            self.store,
            name,
            location.upload_id,
            Some(&location.fingerprint),
        )
        .await?
        {
            Decoded::Missing => return Err(Error::NotFound(format!("upload {}", location.upload_id))),
            Decoded::Stale { state, fingerprint } => {
                return Err(Error::Range(RangeConflict {
                    fingerprint,
                    last_byte: last_byte_of(&state),
                }))
            }
            Decoded::Fresh { state, .. } => state,
        };

        let target = keys::upload_target_key(location.upload_id);

        if state.parts.is_empty() {
            let (stream, length) = body.ok_or_else(|| {
                Error::Client("finishUpload requires a body when no chunks were uploaded".into())
            })?;
            if length > self.config.max_chunk {
                return Err(Error::Client(format!(
                    "monolithic body of {} bytes exceeds max_chunk {}",
                    length, self.config.max_chunk
                )));
            }
            let bytes = digest::buffer_bounded(stream, length).await?;
            let computed = digest::sha256_hex(&bytes);
            if computed != expected_digest {
                return Err(Error::Client(format!(
                    "digest mismatch: expected {}, computed {}",
                    expected_digest, computed
                )));
            }
            let key = keys::blob_key(name, expected_digest);
            self.store
                .put(&key, digest::once(bytes), PutHint::default())
                .await?;
            self.abort_multipart_session(location.upload_id, &state.store_upload_id).await;
            self.cleanup_upload(name, &state).await;
            info!(name, digest = expected_digest, "upload: finished (monolithic, no chunks)");
            return Ok(FinishedUpload {
                digest: expected_digest.to_string(),
                key,
            });
        }

        if let Some((_, length)) = &body {
            if *length > 0 {
                return Err(Error::Client(
                    "trailing body is not allowed after chunked uploadChunk calls".into(),
                ));
            }
        }

        let handle = self.store.resume_multipart(&target, &state.store_upload_id).await?;
        let parts: Vec<(u32, String)> = state
            .parts
            .iter()
            .map(|p| (p.part_number, p.etag.clone()))
            .collect();
        handle.complete(&parts).await?;

        let key = keys::blob_key(name, expected_digest);
        let (readback, _meta) = self
            .store
            .get(&target)
            .await?
            .ok_or_not_found(&target)?;
        let (tee, digest_cell) = digest::tee_sha256(readback);
        self.store.put(&key, tee, PutHint::default()).await?;
        let computed = digest_cell
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Internal("digest tee did not complete".into()))?;
        if computed != expected_digest {
            self.store.delete(&key).await.ok();
            self.store.delete(&target).await.ok();
            return Err(Error::Client(format!(
                "digest mismatch: expected {}, computed {}",
                expected_digest, computed
            )));
        }
        self.store.delete(&target).await.ok();
        self.cleanup_upload(name, &state).await;
        info!(name, digest = expected_digest, parts = state.parts.len(), "upload: finished");
        Ok(FinishedUpload {
            digest: expected_digest.to_string(),
            key,
        })
    }

    pub async fn cancel_upload(&self, name: &str, upload_id: Uuid) -> Result<(), Error> {
        let state = match state::decode_state(self.store, name, upload_id, None).await? {
            Decoded::Missing => return Err(Error::NotFound(format!("upload {}", upload_id))),
            Decoded::Fresh { state, .. } => state,
            Decoded::Stale { .. } => unreachable!("decode without an expected fingerprint is never stale"),
        };
        let target = keys::upload_target_key(upload_id);
        match self.store.resume_multipart(&target, &state.store_upload_id).await {
            Ok(handle) => {
                handle.abort().await?;
            }
            Err(e) => warn!(%upload_id, error = %e, "upload: store session already gone on cancel"),
        }
        self.cleanup_upload(name, &state).await;
        info!(name, %upload_id, "upload: cancelled");
        Ok(())
    }

    /// A client that already knows the full digest and body can skip the
    /// chunked dance entirely.
    pub async fn monolithic_upload(
        &self,
        name: &str,
        digest: &str,
        stream: ByteStream,
        declared_size: Option<u64>,
    ) -> Result<MonolithicResult, Error> {
        let limit = self.config.max_chunk;
        let bytes: Bytes = match declared_size {
            Some(s) if s > limit => return Ok(MonolithicResult::TooLarge),
            Some(s) => digest::buffer_bounded(stream, s).await?,
            None => match digest::buffer_bounded(stream, limit).await {
                Ok(b) => b,
                Err(Error::Client(_)) => return Ok(MonolithicResult::TooLarge),
                Err(e) => return Err(e),
            },
        };
        let computed = digest::sha256_hex(&bytes);
        if computed != digest {
            return Err(Error::Client(format!(
                "digest mismatch: expected {}, computed {}",
                digest, computed
            )));
        }
        let key = keys::blob_key(name, digest);
        self.store
            .put(&key, digest::once(bytes), PutHint::default())
            .await?;
        Ok(MonolithicResult::Finished(FinishedUpload {
            digest: digest.to_string(),
            key,
        }))
    }

    /// Best-effort abort of the store-side multipart session backing an
    /// upload. Used on the monolithic `finishUpload` path, where the
    /// multipart session opened by `startUpload` is never otherwise
    /// drained once the client skips straight to a single-shot body.
    async fn abort_multipart_session(&self, upload_id: Uuid, store_upload_id: &str) {
        let target = keys::upload_target_key(upload_id);
        match self.store.resume_multipart(&target, store_upload_id).await {
            Ok(handle) => {
                if let Err(e) = handle.abort().await {
                    warn!(%upload_id, error = %e, "upload: failed to abort multipart session");
                }
            }
            Err(e) => warn!(%upload_id, error = %e, "upload: store session already gone"),
        }
    }

    async fn cleanup_upload(&self, name: &str, state: &UploadState) {
        for chunk in &state.chunks {
            if let Some(scratch_key) = chunk.scratch_key() {
                if let Err(e) = self.store.delete(scratch_key).await {
                    warn!(scratch_key, error = %e, "failed to clean up scratch object on upload completion");
                }
            }
        }
        if let Err(e) = state::delete_state(self.store, name, state.registry_upload_id).await {
            warn!(upload_id = %state.registry_upload_id, error = %e, "failed to delete upload state");
        }
    }
}

fn byte_range_of(state: &UploadState) -> Option<(u64, u64)> {
    if state.byte_range == 0 {
        None
    } else {
        Some((0, state.byte_range - 1))
    }
}

fn last_byte_of(state: &UploadState) -> Option<u64> {
    if state.byte_range == 0 {
        None
    } else {
        Some(state.byte_range - 1)
    }
}
