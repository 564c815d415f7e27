//! An in-memory `ObjectStore`, enforcing the same part-size and
//! part-count rules a real multipart-capable backend would. This is the
//! collaborator the rest of the crate is tested against; it is not meant
//! to be used in production.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::digest::{self, ByteStream};
use crate::error::Error;
use crate::store::{ListOptions, ListPage, MultipartHandle, ObjectMeta, ObjectStore, PartTag, PutHint};

struct StoredObject {
    bytes: Bytes,
    meta: ObjectMeta,
    expires_at: Option<Instant>,
}

struct MultipartSession {
    key: String,
    parts: HashMap<u32, Bytes>,
}

struct Inner {
    objects: HashMap<String, StoredObject>,
    multiparts: HashMap<String, MultipartSession>,
}

/// In-memory `ObjectStore`. Clone cheaply; all clones share the same
/// backing state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    min_part: u64,
    max_part: u64,
    max_parts: usize,
}

impl MemoryStore {
    /// `min_part`/`max_part`/`max_parts` mirror the constraints a real
    /// multipart backend enforces. Tests that want fast runs construct a
    /// store with small values instead of the real 5 MiB/5 GiB defaults.
    pub fn new(min_part: u64, max_part: u64, max_parts: usize) -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner {
                objects: HashMap::new(),
                multiparts: HashMap::new(),
            })),
            min_part,
            max_part,
            max_parts,
        }
    }

    /// Constants matching spec defaults (5 MiB / 5 GiB / 10 000 parts).
    pub fn with_default_limits() -> Self {
        MemoryStore::new(5 * 1024 * 1024, 5 * 1024 * 1024 * 1024, 10_000)
    }

    fn evict_expired(inner: &mut Inner) {
        let now = Instant::now();
        inner.objects.retain(|_, obj| match obj.expires_at {
            Some(t) => t > now,
            None => true,
        });
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, Error> {
        let mut inner = self.inner.lock().unwrap();
        Self::evict_expired(&mut inner);
        Ok(inner.objects.get(key).map(|o| o.meta.clone()))
    }

    async fn get(&self, key: &str) -> Result<Option<(ByteStream, ObjectMeta)>, Error> {
        let mut inner = self.inner.lock().unwrap();
        Self::evict_expired(&mut inner);
        Ok(inner.objects.get(key).map(|o| {
            (digest::once(o.bytes.clone()), o.meta.clone())
        }))
    }

    async fn put(&self, key: &str, stream: ByteStream, hint: PutHint) -> Result<ObjectMeta, Error> {
        let bytes = digest::buffer(stream).await?;
        let meta = ObjectMeta {
            size: bytes.len() as u64,
            content_type: hint.content_type,
            custom_meta: hint.custom_meta,
        };
        trace!(key, size = meta.size, "store: put");
        let mut inner = self.inner.lock().unwrap();
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                meta: meta.clone(),
                expires_at: hint.expires_in.map(|d| Instant::now() + d),
            },
        );
        Ok(meta)
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.objects.remove(key);
        trace!(key, "store: delete");
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> Result<ListPage, Error> {
        let mut inner = self.inner.lock().unwrap();
        Self::evict_expired(&mut inner);
        let prefix = opts.prefix.unwrap_or_default();
        let mut keys: Vec<&String> = inner
            .objects
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        keys.sort();
        let start = match &opts.cursor {
            Some(c) => keys.partition_point(|k| k.as_str() <= c.as_str()),
            None => 0,
        };
        let limit = if opts.limit == 0 { keys.len() } else { opts.limit };
        let page: Vec<String> = keys[start..]
            .iter()
            .take(limit)
            .map(|k| k.to_string())
            .collect();
        let next_cursor = if start + page.len() < keys.len() {
            page.last().cloned()
        } else {
            None
        };
        Ok(ListPage {
            keys: page,
            next_cursor,
        })
    }

    async fn create_multipart(&self, key: &str) -> Result<String, Error> {
        let store_upload_id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().unwrap();
        inner.multiparts.insert(
            store_upload_id.clone(),
            MultipartSession {
                key: key.to_string(),
                parts: HashMap::new(),
            },
        );
        debug!(key, store_upload_id, "store: create_multipart");
        Ok(store_upload_id)
    }

    async fn resume_multipart(
        &self,
        key: &str,
        store_upload_id: &str,
    ) -> Result<Box<dyn MultipartHandle>, Error> {
        let inner = self.inner.lock().unwrap();
        let session = inner
            .multiparts
            .get(store_upload_id)
            .ok_or_else(|| Error::Server(format!("unknown multipart upload {}", store_upload_id)))?;
        if session.key != key {
            return Err(Error::Internal(format!(
                "multipart upload {} does not target key {}",
                store_upload_id, key
            )));
        }
        Ok(Box::new(MemoryMultipartHandle {
            store: self.clone(),
            store_upload_id: store_upload_id.to_string(),
        }))
    }
}

struct MemoryMultipartHandle {
    store: MemoryStore,
    store_upload_id: String,
}

#[async_trait]
impl MultipartHandle for MemoryMultipartHandle {
    async fn upload_part(
        &self,
        part_number: u32,
        stream: ByteStream,
        size: u64,
    ) -> Result<PartTag, Error> {
        if part_number == 0 || part_number as usize > self.store.max_parts {
            return Err(Error::Server(format!(
                "part number {} out of range (max {})",
                part_number, self.store.max_parts
            )));
        }
        if size > self.store.max_part {
            return Err(Error::Server(format!(
                "part {} of size {} exceeds max part size {}",
                part_number, size, self.store.max_part
            )));
        }
        let bytes = digest::buffer(stream).await?;
        if bytes.len() as u64 != size {
            return Err(Error::Internal(format!(
                "part {} declared size {} but stream yielded {} bytes",
                part_number,
                size,
                bytes.len()
            )));
        }
        let etag = digest::sha256_hex(&bytes);
        let mut inner = self.store.inner.lock().unwrap();
        let session = inner
            .multiparts
            .get_mut(&self.store_upload_id)
            .ok_or_else(|| Error::Server(format!("unknown multipart upload {}", self.store_upload_id)))?;
        session.parts.insert(part_number, bytes);
        trace!(store_upload_id = %self.store_upload_id, part_number, size, "store: upload_part");
        Ok(etag)
    }

    async fn complete(self: Box<Self>, parts: &[(u32, PartTag)]) -> Result<ObjectMeta, Error> {
        let mut inner = self.store.inner.lock().unwrap();
        let session = inner
            .multiparts
            .remove(&self.store_upload_id)
            .ok_or_else(|| Error::Server(format!("unknown multipart upload {}", self.store_upload_id)))?;

        if parts.is_empty() {
            return Err(Error::Internal("complete called with no parts".into()));
        }
        let mut assembled = BytesMut::new();
        for (i, (part_number, etag)) in parts.iter().enumerate() {
            let bytes = session.parts.get(part_number).ok_or_else(|| {
                Error::Internal(format!("part {} not found in multipart session", part_number))
            })?;
            let actual_etag = digest::sha256_hex(bytes);
            if &actual_etag != etag {
                return Err(Error::Internal(format!(
                    "etag mismatch for part {}: expected {}, got {}",
                    part_number, etag, actual_etag
                )));
            }
            let is_last = i == parts.len() - 1;
            if !is_last && (bytes.len() as u64) < self.store.min_part {
                return Err(Error::Server(format!(
                    "non-final part {} has size {} below minimum {}",
                    part_number,
                    bytes.len(),
                    self.store.min_part
                )));
            }
            assembled.extend_from_slice(bytes);
        }
        let bytes = assembled.freeze();
        let meta = ObjectMeta {
            size: bytes.len() as u64,
            content_type: None,
            custom_meta: HashMap::new(),
        };
        inner.objects.insert(
            session.key.clone(),
            StoredObject {
                bytes,
                meta: meta.clone(),
                expires_at: None,
            },
        );
        debug!(key = %session.key, parts = parts.len(), size = meta.size, "store: complete multipart");
        Ok(meta)
    }

    async fn abort(self: Box<Self>) -> Result<(), Error> {
        let mut inner = self.store.inner.lock().unwrap();
        inner.multiparts.remove(&self.store_upload_id);
        debug!(store_upload_id = %self.store_upload_id, "store: abort multipart");
        Ok(())
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<MemoryStore>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PutHint;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryStore::with_default_limits();
        store
            .put("k", digest::once(Bytes::from_static(b"hello")), PutHint::default())
            .await
            .unwrap();
        let (stream, meta) = store.get("k").await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        let bytes = digest::buffer(stream).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn multipart_rejects_oversize_part() {
        let store = MemoryStore::new(4, 8, 10);
        let id = store.create_multipart("k").await.unwrap();
        let handle = store.resume_multipart("k", &id).await.unwrap();
        let err = handle
            .upload_part(1, digest::once(Bytes::from(vec![0u8; 9])), 9)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Server(_)));
    }

    #[tokio::test]
    async fn multipart_rejects_small_non_final_part_at_complete() {
        let store = MemoryStore::new(4, 8, 10);
        let id = store.create_multipart("k").await.unwrap();
        let handle = store.resume_multipart("k", &id).await.unwrap();
        let tag1 = handle
            .upload_part(1, digest::once(Bytes::from(vec![0u8; 2])), 2)
            .await
            .unwrap();
        let tag2 = handle
            .upload_part(2, digest::once(Bytes::from(vec![0u8; 2])), 2)
            .await
            .unwrap();
        let err = handle.complete(&[(1, tag1), (2, tag2)]).await.unwrap_err();
        assert!(matches!(err, Error::Server(_)));
    }
}
