//! The chunk reconciler: given a newly appended byte range and the chunk
//! sequence already committed to the store, decides how to place it as
//! one or more store parts. This is the core of the upload engine; every
//! other component exists to drive this decision tree or to persist its
//! output.

use futures::future::BoxFuture;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{CompatibilityMode, Config};
use crate::digest::{self, ByteStream, ChunkReader};
use crate::error::{Error, RangeConflict};
use crate::keys;
use crate::state::{Chunk, UploadState};
use crate::store::{MultipartHandle, ObjectStore, PutHint};

pub struct Reconciler<'a> {
    store: &'a dyn ObjectStore,
    config: &'a Config,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn ObjectStore, config: &'a Config) -> Self {
        Reconciler { store, config }
    }

    /// Reconciles `size` newly appended bytes, read lazily from `stream`,
    /// against `state`. On success `state` has been mutated in place
    /// (new parts/chunks pushed, `byte_range` advanced); on failure
    /// `state` may be partially mutated but the caller must discard it —
    /// only a successful reconcile is ever persisted.
    pub async fn reconcile(
        &self,
        state: &mut UploadState,
        handle: &dyn MultipartHandle,
        current_fingerprint: &str,
        stream: ByteStream,
        size: u64,
    ) -> Result<(), Error> {
        let mut reader = ChunkReader::new(stream);
        self.reconcile_into(state, handle, &mut reader, size, current_fingerprint)
            .await
    }

    fn reconcile_into<'f>(
        &'f self,
        state: &'f mut UploadState,
        handle: &'f dyn MultipartHandle,
        reader: &'f mut ChunkReader,
        size: u64,
        fp: &'f str,
    ) -> BoxFuture<'f, Result<(), Error>> {
        Box::pin(async move {
            let last = state.last_chunk().cloned();
            let min = self.config.min_chunk;
            let max = self.config.max_chunk;
            let full = self.config.push_compatibility_mode == CompatibilityMode::Full;

            // (a) Ideal path: continues an equal-size chain, or opens one.
            let continues_chain = match &last {
                None => true,
                Some(c) => c.is_equal() && c.size() == size,
            };
            if continues_chain && size >= min && size <= max {
                trace!(size, "reconciler: case (a) ideal");
                let bytes = reader.read_exact(size).await?;
                return self.commit_part(
                    state,
                    handle,
                    bytes,
                    |s, upload_id| Chunk::MultiPartEqual { size: s, upload_id },
                    fp,
                ).await;
            }

            // (b) Oversize: split into MAX-sized pieces and recurse on each.
            if size > max {
                debug!(size, max, "reconciler: case (b) oversize, splitting");
                let mut remaining = size;
                while remaining > 0 {
                    let piece = remaining.min(max);
                    self.reconcile_into(state, handle, reader, piece, fp).await?;
                    remaining -= piece;
                }
                return Ok(());
            }

            // (c) Shrink repair: undo the last chunk and recombine.
            if let Some(last_chunk) = &last {
                if last_chunk.is_repairable() && full {
                    debug!(size, "reconciler: case (c) shrink repair");
                    let scratch_key = last_chunk
                        .scratch_key()
                        .ok_or_else(|| Error::Internal("repairable chunk missing scratch_key".into()))?
                        .to_string();
                    let popped_size = last_chunk.size();
                    let (scratch_stream, _meta) = self
                        .store
                        .get(&scratch_key)
                        .await?
                        .ok_or_else(|| Error::Server(format!(
                            "scratch object {} missing for repair", scratch_key
                        )))?;
                    let scratch_bytes = digest::buffer(scratch_stream).await?;

                    state.chunks.pop();
                    state.parts.pop();
                    state.byte_range -= popped_size;

                    reader.prepend(scratch_bytes);
                    let combined = popped_size + size;
                    self.reconcile_into(state, handle, reader, combined, fp).await?;

                    if let Err(e) = self.store.delete(&scratch_key).await {
                        warn!(scratch_key, error = %e, "failed to clean up scratch object after repair");
                    }
                    return Ok(());
                }
            }

            // (d) Shrink or sub-minimum tail.
            let shrinks = last.as_ref().map(|c| c.size() > size).unwrap_or(false);
            let sub_minimum = size < min && last.as_ref().map(|c| c.is_equal()).unwrap_or(true);
            if shrinks || sub_minimum {
                debug!(size, shrinks, sub_minimum, "reconciler: case (d) shrink/sub-minimum");
                let bytes = reader.read_exact(size).await?;
                let classify_small = size < min;
                let scratch_key = keys::scratch_key(&self.config.helper_prefix, Uuid::new_v4());
                if full {
                    self.store
                        .put(
                            &scratch_key,
                            digest::once(bytes.clone()),
                            PutHint {
                                expires_in: Some(self.config.scratch_ttl),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                // In non-full mode the scratch object is never written; the
                // key is recorded anyway but case (c) is unreachable without
                // full mode, so it is never dereferenced.
                return self.commit_part(
                    state,
                    handle,
                    bytes,
                    move |sz, upload_id| {
                        if classify_small {
                            Chunk::SmallTrailing { size: sz, upload_id, scratch_key }
                        } else {
                            Chunk::MultiPartShrunk { size: sz, upload_id, scratch_key }
                        }
                    },
                    fp,
                ).await;
            }

            // (e) Grow after an equal run: split into last.size()-sized pieces.
            if let Some(last_chunk) = &last {
                if last_chunk.is_equal() && size > last_chunk.size() && size <= max && full {
                    let piece_size = last_chunk.size();
                    debug!(size, piece_size, "reconciler: case (e) grow, splitting");
                    let mut remaining = size;
                    while remaining > 0 {
                        let piece = remaining.min(piece_size);
                        self.reconcile_into(state, handle, reader, piece, fp).await?;
                        remaining -= piece;
                    }
                    return Ok(());
                }
            }

            // (f) Otherwise: this append cannot be reconciled against the
            // current chunk sequence.
            warn!(size, "reconciler: case (f) no rule matches, returning Range");
            Err(Error::Range(RangeConflict {
                fingerprint: fp.to_string(),
                last_byte: if state.byte_range == 0 {
                    None
                } else {
                    Some(state.byte_range - 1)
                },
            }))
        })
    }

    async fn commit_part<F>(
        &self,
        state: &mut UploadState,
        handle: &dyn MultipartHandle,
        bytes: bytes::Bytes,
        make_chunk: F,
        fp: &str,
    ) -> Result<(), Error>
    where
        F: FnOnce(u64, String) -> Chunk,
    {
        if state.parts.len() >= self.config.max_parts {
            return Err(Error::Range(RangeConflict {
                fingerprint: fp.to_string(),
                last_byte: if state.byte_range == 0 {
                    None
                } else {
                    Some(state.byte_range - 1)
                },
            }));
        }
        let part_number = state.next_part_number();
        let size = bytes.len() as u64;
        let etag = handle
            .upload_part(part_number, digest::once(bytes), size)
            .await?;
        state.parts.push(crate::state::PartRecord { part_number, etag });
        state.chunks.push(make_chunk(size, state.store_upload_id.clone()));
        state.byte_range += size;
        Ok(())
    }
}
