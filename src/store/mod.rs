//! The abstraction this crate builds on: an external object store with
//! multipart upload support. Transport, auth and SDK wiring for a real
//! backend are out of scope here — [`memory::MemoryStore`] is the
//! reference implementation this crate tests itself against.

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::digest::ByteStream;
use crate::error::Error;

/// Metadata returned alongside an object's bytes.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub size: u64,
    pub content_type: Option<String>,
    pub custom_meta: HashMap<String, String>,
}

/// Hints attached to a `put`, carried through to [`ObjectMeta`] on a
/// subsequent `head`/`get` of the same key.
#[derive(Debug, Clone, Default)]
pub struct PutHint {
    pub content_type: Option<String>,
    pub custom_meta: HashMap<String, String>,
    /// Advisory expiration. The store is free to ignore this; it exists
    /// so scratch and upload-state objects do not accumulate forever.
    pub expires_in: Option<Duration>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_cursor: Option<String>,
}

/// Parameters for a single `list` call.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub cursor: Option<String>,
    pub limit: usize,
}

/// The identifier a store assigns to one uploaded part, opaque to
/// everything above this trait (commonly an ETag).
pub type PartTag = String;

/// An external, content-addressable object store with multipart upload.
/// Keys are flat strings; any repository/namespace structure is encoded
/// by the caller as `/`-separated prefixes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, Error>;

    async fn get(&self, key: &str) -> Result<Option<(ByteStream, ObjectMeta)>, Error>;

    async fn put(&self, key: &str, stream: ByteStream, hint: PutHint) -> Result<ObjectMeta, Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn list(&self, opts: ListOptions) -> Result<ListPage, Error>;

    /// Begins a multipart upload targeting `key`, returning the store's
    /// own upload id. The state codec persists this id so a later request
    /// (possibly served by a different worker) can resume it.
    async fn create_multipart(&self, key: &str) -> Result<String, Error>;

    /// Reattaches to an in-progress multipart upload.
    async fn resume_multipart(
        &self,
        key: &str,
        store_upload_id: &str,
    ) -> Result<Box<dyn MultipartHandle>, Error>;
}

/// One live multipart upload session. Parts may be uploaded in any order
/// the caller chooses to call `upload_part`; the store is responsible for
/// assembling them in part-number order at `complete`.
#[async_trait]
pub trait MultipartHandle: Send + Sync {
    async fn upload_part(
        &self,
        part_number: u32,
        stream: ByteStream,
        size: u64,
    ) -> Result<PartTag, Error>;

    async fn complete(self: Box<Self>, parts: &[(u32, PartTag)]) -> Result<ObjectMeta, Error>;

    async fn abort(self: Box<Self>) -> Result<(), Error>;
}
