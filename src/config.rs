use std::time::Duration;

use crate::error::Error;

/// Governs whether the reconciler may repair shrinking/growing chunk
/// sequences (spec §4.4 cases c/e). `Off` trades resumability after a
/// non-ideal append for a simpler, strictly-forward-only state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityMode {
    Off,
    Full,
}

impl Default for CompatibilityMode {
    fn default() -> Self {
        CompatibilityMode::Off
    }
}

/// Tunables for the upload engine. Constructed directly or via
/// [`Config::default`] — there is no file/env parsing surface here, that
/// belongs to whatever binds this crate to a transport.
#[derive(Debug, Clone)]
pub struct Config {
    /// Smallest part size the store will accept for a non-final part.
    pub min_chunk: u64,
    /// Largest part size the store will accept for any part.
    pub max_chunk: u64,
    /// Largest single client-supplied chunk `uploadChunk` will accept
    /// before splitting it into multiple parts (spec §4.4 case b).
    pub max_upload_chunk: u64,
    /// Upper bound on parts per multipart upload.
    pub max_parts: usize,
    /// How long an upload-state object survives without being touched.
    pub state_ttl: Duration,
    /// How long a scratch object backing a shrink/trailing chunk survives.
    pub scratch_ttl: Duration,
    /// Whether the reconciler may repair non-ideal chunk sequences.
    pub push_compatibility_mode: CompatibilityMode,
    /// Key prefix under which scratch objects are written.
    pub helper_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_chunk: 5 * 1024 * 1024,
            max_chunk: 5 * 1024 * 1024 * 1024,
            max_upload_chunk: 5 * 1024 * 1024 * 1024,
            max_parts: 10_000,
            state_ttl: Duration::from_secs(2 * 60 * 60),
            scratch_ttl: Duration::from_secs(60 * 60),
            push_compatibility_mode: CompatibilityMode::Off,
            helper_prefix: "_scratch".to_string(),
        }
    }
}

impl Config {
    /// Fails fast on an internally inconsistent configuration rather than
    /// letting it surface later as confusing mid-upload `Server` errors.
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_chunk == 0 {
            return Err(Error::Internal("min_chunk must be nonzero".into()));
        }
        if self.min_chunk > self.max_chunk {
            return Err(Error::Internal("min_chunk must be <= max_chunk".into()));
        }
        if self.max_chunk > self.max_upload_chunk {
            return Err(Error::Internal(
                "max_chunk must be <= max_upload_chunk".into(),
            ));
        }
        if self.max_parts == 0 {
            return Err(Error::Internal("max_parts must be nonzero".into()));
        }
        if self.helper_prefix.is_empty() {
            return Err(Error::Internal("helper_prefix must not be empty".into()));
        }
        Ok(())
    }
}
