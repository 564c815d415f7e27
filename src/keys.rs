//! Object-store key layout (spec §3): flat string keys encoding the
//! repository namespace as `/`-separated prefixes.

use uuid::Uuid;

pub fn manifest_key(name: &str, reference: &str) -> String {
    format!("{}/manifests/{}", name, reference)
}

pub fn blob_key(name: &str, digest: &str) -> String {
    format!("{}/blobs/{}", name, digest)
}

/// Target key for the in-flight multipart object backing an upload,
/// before it is re-materialized under its final digest on finish.
pub fn upload_target_key(registry_upload_id: Uuid) -> String {
    format!("_uploads/{}", registry_upload_id)
}

pub fn scratch_key(helper_prefix: &str, id: Uuid) -> String {
    format!("{}/{}", helper_prefix, id)
}

pub fn insertion_marker_prefix(name: &str) -> String {
    format!("_gc/{}/insertion-marker/", name)
}

pub fn insertion_marker_key(name: &str, id: Uuid) -> String {
    format!("{}{}", insertion_marker_prefix(name), id)
}

pub fn gc_epoch_key(name: &str) -> String {
    format!("_gc/{}/epoch", name)
}

pub fn manifest_prefix(name: &str) -> String {
    format!("{}/manifests/", name)
}

pub fn blob_prefix(name: &str) -> String {
    format!("{}/blobs/", name)
}
