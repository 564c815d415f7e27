//! C6 — manifest storage and the cross-repository mount/symlink engine.
//! The manifest schema itself is treated as opaque per spec §1/§6: this
//! module only needs to know which digests a manifest references, which
//! it gets through the [`ManifestParser`] collaborator.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::digest::{self, ByteStream};
use crate::error::{Error, OkOrNotFound};
use crate::gc::GarbageCollector;
use crate::keys;
use crate::store::{ObjectStore, PutHint};

const DIGEST_META_KEY: &str = "digest";
const SYMLINK_META_KEY: &str = "symlink-target";

/// Whether a manifest reference names a digest directly or an arbitrary
/// tag. A digest-form reference is always content-addressed and never
/// needs a second copy written under the tag namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Tag,
    Digest,
}

pub fn reference_kind(reference: &str) -> ReferenceKind {
    if reference.starts_with("sha256:") {
        ReferenceKind::Digest
    } else {
        ReferenceKind::Tag
    }
}

/// What a manifest's bytes reference, independent of its concrete schema
/// version. Implementations are supplied by the caller; this crate only
/// ships a JSON-shaped reference implementation for its own tests.
pub trait ManifestParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedManifest, String>;
}

#[derive(Debug, Clone)]
pub enum ParsedManifest {
    /// Schema v1: a flat list of layer (`fsLayers`) digests.
    V1 { fs_layers: Vec<String> },
    /// Schema v2 single-platform manifest: one config blob, N layer blobs.
    V2Manifest { config: String, layers: Vec<String> },
    /// Schema v2 multi-platform index: digests of child manifests.
    V2Index { manifests: Vec<String> },
}

impl ParsedManifest {
    pub fn referenced_blobs(&self) -> Vec<String> {
        match self {
            ParsedManifest::V1 { fs_layers } => fs_layers.clone(),
            ParsedManifest::V2Manifest { config, layers } => {
                let mut v = vec![config.clone()];
                v.extend(layers.iter().cloned());
                v
            }
            ParsedManifest::V2Index { .. } => Vec::new(),
        }
    }

    pub fn referenced_manifests(&self) -> Vec<String> {
        match self {
            ParsedManifest::V2Index { manifests } => manifests.clone(),
            _ => Vec::new(),
        }
    }
}

/// A minimal reference parser understanding the JSON shapes named in
/// spec §3 (`fsLayers` / `config`+`layers` / `manifests`). Good enough to
/// drive this crate's own tests; a real deployment supplies its own.
pub struct JsonManifestParser;

impl ManifestParser for JsonManifestParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedManifest, String> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid json: {}", e))?;
        if let Some(manifests) = value.get("manifests").and_then(|v| v.as_array()) {
            let digests = manifests
                .iter()
                .filter_map(|m| m.get("digest").and_then(|d| d.as_str()))
                .map(|s| s.to_string())
                .collect();
            return Ok(ParsedManifest::V2Index { manifests: digests });
        }
        if let Some(config) = value.get("config").and_then(|c| c.get("digest")).and_then(|d| d.as_str()) {
            let layers = value
                .get("layers")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|l| l.get("digest").and_then(|d| d.as_str()))
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default();
            return Ok(ParsedManifest::V2Manifest {
                config: config.to_string(),
                layers,
            });
        }
        if let Some(fs_layers) = value.get("fsLayers").and_then(|v| v.as_array()) {
            let digests = fs_layers
                .iter()
                .filter_map(|l| l.get("blobSum").and_then(|d| d.as_str()))
                .map(|s| s.to_string())
                .collect();
            return Ok(ParsedManifest::V1 { fs_layers: digests });
        }
        Err("manifest has neither manifests, config/layers nor fsLayers".to_string())
    }
}

pub struct PutManifestResult {
    pub digest: String,
    pub key: String,
}

/// Thin, borrow-only wrapper exposing manifest and layer operations,
/// mirroring the teacher's `garage.bucket_helper()` pattern.
pub struct ManifestEngine<'a> {
    store: &'a dyn ObjectStore,
    parser: &'a dyn ManifestParser,
}

impl<'a> ManifestEngine<'a> {
    pub fn new(store: &'a dyn ObjectStore, parser: &'a dyn ManifestParser) -> Self {
        ManifestEngine { store, parser }
    }

    /// Writes a manifest, validating referenced blobs/manifests exist
    /// when `check_layers` is set, inside the GC insertion interlock
    /// (spec §4.7) so a concurrent collection pass cannot delete a blob
    /// this manifest is about to reference.
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        stream: ByteStream,
        content_type: Option<&str>,
        check_layers: bool,
    ) -> Result<PutManifestResult, Error> {
        let gc = GarbageCollector::new(self.store);
        let marker = gc.mark_for_insertion(name).await?;
        let result = self
            .put_manifest_inner(name, reference, stream, content_type, check_layers, &marker)
            .await;
        gc.clean_insertion(&marker).await;
        result
    }

    async fn put_manifest_inner(
        &self,
        name: &str,
        reference: &str,
        stream: ByteStream,
        content_type: Option<&str>,
        check_layers: bool,
        marker: &crate::gc::GcMarker,
    ) -> Result<PutManifestResult, Error> {
        let bytes = digest::buffer(stream).await?;
        let digest = digest::sha256_hex(&bytes);
        let parsed = self
            .parser
            .parse(&bytes)
            .map_err(|e| Error::Manifest(format!("invalid manifest: {}", e)))?;

        if check_layers {
            for blob_digest in parsed.referenced_blobs() {
                let key = keys::blob_key(name, &blob_digest);
                if self.store.head(&key).await?.is_none() {
                    return Err(Error::Manifest(format!("referenced blob {} not found", blob_digest)));
                }
            }
            for manifest_digest in parsed.referenced_manifests() {
                let key = keys::manifest_key(name, &manifest_digest);
                if self.store.head(&key).await?.is_none() {
                    return Err(Error::Manifest(format!(
                        "referenced manifest {} not found", manifest_digest
                    )));
                }
            }
        }

        let gc = GarbageCollector::new(self.store);
        if !gc.check_can_insert_data(name, marker).await? {
            return Err(Error::Server(format!(
                "garbage collection raced with manifest insertion for {}", name
            )));
        }

        let mut meta = HashMap::new();
        meta.insert(DIGEST_META_KEY.to_string(), digest.clone());
        let hint = PutHint {
            content_type: content_type.map(|s| s.to_string()),
            custom_meta: meta,
            expires_in: None,
        };

        let digest_key = keys::manifest_key(name, &digest);
        if reference_kind(reference) == ReferenceKind::Digest || reference == digest {
            self.store.put(&digest_key, digest::once(bytes), hint).await?;
        } else {
            let reference_key = keys::manifest_key(name, reference);
            let (a, b) = futures::join!(
                self.store.put(&digest_key, digest::once(bytes.clone()), hint.clone()),
                self.store.put(&reference_key, digest::once(bytes), hint),
            );
            a?;
            b?;
        }

        debug!(name, reference, digest, "manifest: put");
        Ok(PutManifestResult { digest, key: digest_key })
    }

    pub async fn get_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> Result<(bytes::Bytes, Option<String>), Error> {
        let key = keys::manifest_key(name, reference);
        let (stream, meta) = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("manifest {}/{}", name, reference)))?;
        let bytes = digest::buffer(stream).await?;
        Ok((bytes, meta.content_type))
    }

    pub async fn manifest_exists(&self, name: &str, reference: &str) -> Result<bool, Error> {
        let key = keys::manifest_key(name, reference);
        Ok(self.store.head(&key).await?.is_some())
    }

    /// Resolves a layer, following one level of cross-repository symlink
    /// (spec §4.6's mount). A mount can never point at another mount, so
    /// resolution never recurses past depth one; a target that resolves
    /// back to the key it was read from is rejected rather than followed.
    pub async fn get_layer(&self, name: &str, digest: &str) -> Result<(ByteStream, u64), Error> {
        let key = keys::blob_key(name, digest);
        let (stream, meta) = self.store.get(&key).await?.ok_or_not_found(&key)?;
        if meta.custom_meta.contains_key(SYMLINK_META_KEY) {
            let target = read_symlink_target(stream, &key).await?;
            if target == key {
                return Err(Error::Blob(format!("mount {} resolves to itself", key)));
            }
            let (real_stream, real_meta) = self
                .store
                .get(&target)
                .await?
                .ok_or_else(|| Error::Blob(format!("mount target {} for {} is missing", target, key)))?;
            return Ok((real_stream, real_meta.size));
        }
        Ok((stream, meta.size))
    }

    pub async fn layer_exists(&self, name: &str, digest: &str) -> Result<bool, Error> {
        let key = keys::blob_key(name, digest);
        let (stream, meta) = match self.store.get(&key).await? {
            None => return Ok(false),
            Some(v) => v,
        };
        if meta.custom_meta.contains_key(SYMLINK_META_KEY) {
            let target = read_symlink_target(stream, &key).await?;
            Ok(self.store.head(&target).await?.is_some())
        } else {
            Ok(true)
        }
    }

    /// Mounts `digest` from `source_name` into `dest_name` without
    /// copying bytes: writes a symlink marker at the destination whose
    /// body is the real blob's key and whose metadata names the real
    /// source repository (spec §6) — never an intermediate mount.
    pub async fn mount_existing_layer(
        &self,
        source_name: &str,
        dest_name: &str,
        digest: &str,
    ) -> Result<(), Error> {
        if source_name == dest_name {
            return Err(Error::Client("mount source and destination repository are identical".into()));
        }
        let source_key = keys::blob_key(source_name, digest);
        let (source_stream, source_meta) = self
            .store
            .get(&source_key)
            .await?
            .ok_or_else(|| Error::Blob(format!("layer {} not found in {}", digest, source_name)))?;

        let (real_name, real_key) = match source_meta.custom_meta.get(SYMLINK_META_KEY) {
            Some(name) => {
                let target = read_symlink_target(source_stream, &source_key).await?;
                (name.clone(), target)
            }
            None => (source_name.to_string(), source_key),
        };

        let dest_key = keys::blob_key(dest_name, digest);
        let mut meta = HashMap::new();
        meta.insert(SYMLINK_META_KEY.to_string(), real_name.clone());
        meta.insert(DIGEST_META_KEY.to_string(), digest.to_string());
        self.store
            .put(
                &dest_key,
                digest::once(bytes::Bytes::from(real_key.clone().into_bytes())),
                PutHint {
                    custom_meta: meta,
                    ..Default::default()
                },
            )
            .await?;
        info!(source_name, dest_name, digest, real_name, real_key, "manifest: mounted layer");
        Ok(())
    }
}

/// Reads a symlink marker's small body (a `name/blobs/<digest>` key) back
/// into a string. Bounded by construction: mount bodies are never more
/// than a couple hundred bytes.
async fn read_symlink_target(stream: ByteStream, key: &str) -> Result<String, Error> {
    let bytes = digest::buffer(stream).await?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Internal(format!("mount marker {} body is not valid utf-8: {}", key, e)))
}

impl Default for JsonManifestParser {
    fn default() -> Self {
        JsonManifestParser
    }
}
