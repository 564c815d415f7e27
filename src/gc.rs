//! C7 — the garbage-collector interlock. `mark_for_insertion` /
//! `clean_insertion` / `check_can_insert_data` guard a manifest write
//! against a concurrent `collect` pass deleting a blob the manifest is
//! about to reference; `collect` itself never deletes anything while an
//! insertion is in flight.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::digest;
use crate::keys;
use crate::manifest::ManifestParser;
use crate::store::{ListOptions, ObjectStore, PutHint};
use crate::Error;

const EPOCH_META_KEY: &str = "epoch_ms";

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A token proving a manifest write registered itself before checking
/// blob existence. Must be cleaned up (success or failure) or it will
/// block every future collection pass for its repository until it
/// expires.
pub struct GcMarker {
    key: String,
    created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Delete blobs no stored manifest references.
    Unreferenced,
    /// Delete digest-keyed manifests no tag references.
    Untagged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcOutcome {
    /// Collection ran to completion.
    Collected { deleted: usize },
    /// Collection aborted because an insertion was in flight.
    Aborted,
}

pub struct GarbageCollector<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        GarbageCollector { store }
    }

    pub async fn mark_for_insertion(&self, name: &str) -> Result<GcMarker, Error> {
        let created_at_ms = now_millis();
        let key = keys::insertion_marker_key(name, Uuid::new_v4());
        self.store
            .put(
                &key,
                digest::once(bytes::Bytes::from(created_at_ms.to_string())),
                PutHint::default(),
            )
            .await?;
        Ok(GcMarker { key, created_at_ms })
    }

    pub async fn clean_insertion(&self, marker: &GcMarker) {
        if let Err(e) = self.store.delete(&marker.key).await {
            warn!(key = %marker.key, error = %e, "gc: failed to clean up insertion marker");
        }
    }

    /// `false` means a collection pass has completed since this marker
    /// was created and may not have accounted for the blob(s) this
    /// insertion is about to reference; the caller must abort (spec's
    /// GC-race scenario).
    pub async fn check_can_insert_data(&self, name: &str, marker: &GcMarker) -> Result<bool, Error> {
        let epoch_key = keys::gc_epoch_key(name);
        let epoch_ms = match self.store.head(&epoch_key).await? {
            None => return Ok(true),
            Some(meta) => meta
                .custom_meta
                .get(EPOCH_META_KEY)
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0),
        };
        Ok(marker.created_at_ms >= epoch_ms)
    }

    /// Runs one collection pass. Aborts without deleting anything if any
    /// insertion marker is currently live for this repository.
    pub async fn collect(&self, name: &str, mode: GcMode, parser: &dyn ManifestParser) -> Result<GcOutcome, Error> {
        let epoch_start = now_millis();

        let markers = self
            .store
            .list(ListOptions {
                prefix: Some(keys::insertion_marker_prefix(name)),
                ..Default::default()
            })
            .await?;
        if !markers.keys.is_empty() {
            debug!(name, in_flight = markers.keys.len(), "gc: aborting, insertion in flight");
            return Ok(GcOutcome::Aborted);
        }

        let deleted = match mode {
            GcMode::Unreferenced => self.collect_unreferenced_blobs(name, parser).await?,
            GcMode::Untagged => self.collect_untagged_manifests(name, parser).await?,
        };

        self.write_gc_epoch(name, epoch_start).await?;
        info!(name, deleted, ?mode, "gc: collection pass complete");
        Ok(GcOutcome::Collected { deleted })
    }

    async fn write_gc_epoch(&self, name: &str, epoch_ms: u64) -> Result<(), Error> {
        let mut meta = std::collections::HashMap::new();
        meta.insert(EPOCH_META_KEY.to_string(), epoch_ms.to_string());
        self.store
            .put(
                &keys::gc_epoch_key(name),
                digest::empty(),
                PutHint {
                    custom_meta: meta,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn referenced_blob_digests(
        &self,
        name: &str,
        parser: &dyn ManifestParser,
    ) -> Result<HashSet<String>, Error> {
        let mut referenced = HashSet::new();
        let mut cursor = None;
        loop {
            let page = self
                .store
                .list(ListOptions {
                    prefix: Some(keys::manifest_prefix(name)),
                    cursor: cursor.clone(),
                    limit: 1000,
                })
                .await?;
            for key in &page.keys {
                if let Some((stream, _meta)) = self.store.get(key).await? {
                    let bytes = digest::buffer(stream).await?;
                    if let Ok(parsed) = parser.parse(&bytes) {
                        referenced.extend(parsed.referenced_blobs());
                    }
                }
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(referenced)
    }

    async fn collect_unreferenced_blobs(
        &self,
        name: &str,
        parser: &dyn ManifestParser,
    ) -> Result<usize, Error> {
        let referenced = self.referenced_blob_digests(name, parser).await?;
        let prefix = keys::blob_prefix(name);
        let mut deleted = 0usize;
        let mut cursor = None;
        loop {
            let page = self
                .store
                .list(ListOptions {
                    prefix: Some(prefix.clone()),
                    cursor: cursor.clone(),
                    limit: 1000,
                })
                .await?;
            for key in &page.keys {
                let digest = key.strip_prefix(&prefix).unwrap_or(key);
                if !referenced.contains(digest) {
                    self.store.delete(key).await?;
                    deleted += 1;
                }
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(deleted)
    }

    /// Deletes digest-keyed manifests no tag references, then sweeps
    /// blobs that were only reachable through them.
    async fn collect_untagged_manifests(
        &self,
        name: &str,
        parser: &dyn ManifestParser,
    ) -> Result<usize, Error> {
        let prefix = keys::manifest_prefix(name);
        let page = self
            .store
            .list(ListOptions {
                prefix: Some(prefix.clone()),
                cursor: None,
                limit: 0,
            })
            .await?;

        let mut tagged_digests = HashSet::new();
        let mut digest_keyed = Vec::new();
        for key in &page.keys {
            let reference = key.strip_prefix(&prefix).unwrap_or(key);
            if crate::manifest::reference_kind(reference) == crate::manifest::ReferenceKind::Digest {
                digest_keyed.push((key.clone(), reference.to_string()));
                continue;
            }
            if let Some(meta) = self.store.head(key).await? {
                if let Some(d) = meta.custom_meta.get("digest") {
                    tagged_digests.insert(d.clone());
                }
            }
        }

        let mut deleted = 0usize;
        for (key, digest) in digest_keyed {
            if !tagged_digests.contains(&digest) {
                self.store.delete(&key).await?;
                deleted += 1;
            }
        }

        deleted += self.collect_unreferenced_blobs(name, parser).await?;
        Ok(deleted)
    }
}
