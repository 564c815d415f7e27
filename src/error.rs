use err_derive::Error;

/// A conflict between the fingerprint a caller presented and the one
/// currently authoritative for an upload. Carries enough for the caller
/// to resume: the fingerprint to retry with, and the last byte offset
/// the store has actually accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeConflict {
    pub fingerprint: String,
    /// `byteRange - 1` of the authoritative state, or `None` if nothing
    /// has been accepted yet.
    pub last_byte: Option<u64>,
}

/// Errors of this crate, matching the semantic kinds of spec §7.
#[derive(Debug, Error)]
pub enum Error {
    /// Stale fingerprint, invalid HTTP range, or a chunk the reconciler
    /// cannot place. Carries the authoritative cursor so the client can
    /// resume.
    #[error(display = "stale or invalid range: resume after byte {:?}", _0)]
    Range(RangeConflict),

    /// Malformed manifest, or a referenced blob/child manifest is missing.
    #[error(display = "manifest error: {}", _0)]
    Manifest(String),

    /// Requested layer is absent.
    #[error(display = "blob error: {}", _0)]
    Blob(String),

    /// The caller's request itself is invalid (not a store failure, not
    /// retriable as-is).
    #[error(display = "bad request: {}", _0)]
    Client(String),

    /// The object store failed, an invariant was violated, or a GC race
    /// was lost. Retriable.
    #[error(display = "storage error: {}", _0)]
    Server(String),

    /// Programmer error. Not retriable; message must not leak store data.
    #[error(display = "internal error: {}", _0)]
    Internal(String),

    /// A referenced resource (upload, manifest, repository) is absent.
    #[error(display = "not found: {}", _0)]
    NotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("state codec: {}", e))
    }
}

/// Convert an `Option`/`Result` into a `Server` error, tagging it with the
/// operation that produced it. Every `ObjectStore` call is wrapped with
/// this so store failures never cross a component boundary untagged.
pub trait ErrContext<T> {
    fn err_context(self, op: &str) -> Result<T, Error>;
}

impl<T, E: std::fmt::Display> ErrContext<T> for Result<T, E> {
    fn err_context(self, op: &str) -> Result<T, Error> {
        self.map_err(|e| Error::Server(format!("{}: {}", op, e)))
    }
}

/// Maps a missing value to `NotFound`, the way `ok_or_bad_request` does in
/// the teacher's API crate.
pub trait OkOrNotFound<T> {
    fn ok_or_not_found(self, what: &str) -> Result<T, Error>;
}

impl<T> OkOrNotFound<T> for Option<T> {
    fn ok_or_not_found(self, what: &str) -> Result<T, Error> {
        self.ok_or_else(|| Error::NotFound(what.to_string()))
    }
}
