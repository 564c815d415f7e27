//! End-to-end scenarios against `Registry` wired to `MemoryStore`, covering
//! the literal scenarios from spec §8 (S1-S8).

use std::sync::Arc;

use bytes::Bytes;
use registry_storage::gc::GcMode;
use registry_storage::manifest::JsonManifestParser;
use registry_storage::store::memory::MemoryStore;
use registry_storage::upload::UploadLocation;
use registry_storage::{CompatibilityMode, Config, Error, Registry};

fn stream_of(bytes: Bytes) -> registry_storage::digest::ByteStream {
    registry_storage::digest::once(bytes)
}

fn registry(store: MemoryStore, mode: CompatibilityMode) -> Registry {
    let config = Config {
        push_compatibility_mode: mode,
        ..Config::default()
    };
    Registry::new(Arc::new(store), config, Arc::new(JsonManifestParser)).unwrap()
}

/// Like [`registry`], but for tests whose `MemoryStore` part-size limits
/// are scaled down from the real 5 MiB/5 GiB defaults; `Config::min_chunk`/
/// `max_chunk` must track the store's limits or the reconciler's decision
/// tree (which reasons about `Config`, not the store) takes branches the
/// test did not intend.
fn registry_with_limits(store: MemoryStore, min: u64, max: u64, max_parts: usize, mode: CompatibilityMode) -> Registry {
    let config = Config {
        min_chunk: min,
        max_chunk: max,
        max_upload_chunk: max,
        max_parts,
        push_compatibility_mode: mode,
        ..Config::default()
    };
    Registry::new(Arc::new(store), config, Arc::new(JsonManifestParser)).unwrap()
}

async fn append(
    registry: &Registry,
    name: &str,
    location: &UploadLocation,
    data: &[u8],
) -> Result<UploadLocation, Error> {
    let result = registry
        .uploads()
        .upload_chunk(name, location, stream_of(Bytes::copy_from_slice(data)), data.len() as u64, None)
        .await?;
    Ok(result.location)
}

#[tokio::test]
async fn s1_ideal_push() {
    let store = MemoryStore::with_default_limits();
    let reg = registry(store, CompatibilityMode::Off);
    let name = "lib/app";

    let start = reg.uploads().start_upload(name).await.unwrap();
    let mut location = start.location;

    let chunk1 = vec![1u8; 5 * 1024 * 1024];
    let chunk2 = vec![2u8; 5 * 1024 * 1024];
    let chunk3 = vec![3u8; 1024];

    location = append(&reg, name, &location, &chunk1).await.unwrap();
    location = append(&reg, name, &location, &chunk2).await.unwrap();
    location = append(&reg, name, &location, &chunk3).await.unwrap();

    let mut whole = chunk1.clone();
    whole.extend_from_slice(&chunk2);
    whole.extend_from_slice(&chunk3);
    let digest = registry_storage::digest::sha256_hex(&whole);

    let finished = reg
        .uploads()
        .finish_upload(name, &location, &digest, None)
        .await
        .unwrap();
    assert_eq!(finished.digest, digest);

    let (stream, size) = reg.manifests().get_layer(name, &digest).await.unwrap();
    assert_eq!(size, whole.len() as u64);
    let got = registry_storage::digest::buffer(stream).await.unwrap();
    assert_eq!(&got[..], &whole[..]);
    assert!(reg.manifests().layer_exists(name, &digest).await.unwrap());
}

#[tokio::test]
async fn s2_oversize_chunk_splits_into_equal_plus_trailing() {
    // Scaled down from the literal 6 GiB/5 GiB/1 GiB scenario so the test
    // actually runs in memory; the shape (oversize -> split into a MAX
    // chain plus a smaller trailing piece) is what S2 tests, not the
    // specific byte counts.
    let min = 4u64;
    let max = 16u64;
    let store = MemoryStore::new(min, max, 10_000);
    let config = Config {
        min_chunk: min,
        max_chunk: max,
        max_upload_chunk: 64,
        ..Config::default()
    };
    let reg = Registry::new(Arc::new(store), config, Arc::new(JsonManifestParser)).unwrap();
    let name = "lib/oversize";

    let start = reg.uploads().start_upload(name).await.unwrap();
    let oversize = vec![7u8; 20]; // 16 + 4: one MAX part, one trailing part
    let location = append(&reg, name, &start.location, &oversize).await.unwrap();

    let digest = registry_storage::digest::sha256_hex(&oversize);
    let finished = reg
        .uploads()
        .finish_upload(name, &location, &digest, None)
        .await
        .unwrap();
    assert_eq!(finished.digest, digest);

    let (stream, size) = reg.manifests().get_layer(name, &digest).await.unwrap();
    assert_eq!(size, 20);
    let got = registry_storage::digest::buffer(stream).await.unwrap();
    assert_eq!(&got[..], &oversize[..]);
}

#[tokio::test]
async fn s3_shrink_repair_in_full_mode() {
    let min = 4u64;
    let max = 64u64;
    let store = MemoryStore::new(min, max, 10_000);
    let config = Config {
        min_chunk: min,
        max_chunk: max,
        max_upload_chunk: max,
        push_compatibility_mode: CompatibilityMode::Full,
        ..Config::default()
    };
    let reg = Registry::new(Arc::new(store), config, Arc::new(JsonManifestParser)).unwrap();
    let name = "lib/shrink";

    let start = reg.uploads().start_upload(name).await.unwrap();
    let c1 = vec![1u8; 8];
    let c2 = vec![2u8; 8];
    let c3 = vec![3u8; 3]; // below min_chunk of 4, becomes SmallTrailing
    let c4 = vec![4u8; 8];

    let mut location = start.location;
    location = append(&reg, name, &location, &c1).await.unwrap();
    location = append(&reg, name, &location, &c2).await.unwrap();
    location = append(&reg, name, &location, &c3).await.unwrap();
    // This append triggers case (c): pop the SmallTrailing chunk, recombine
    // with the recovered scratch bytes, and reconcile the 11-byte result.
    location = append(&reg, name, &location, &c4).await.unwrap();

    let mut whole = c1.clone();
    whole.extend_from_slice(&c2);
    whole.extend_from_slice(&c3);
    whole.extend_from_slice(&c4);
    let digest = registry_storage::digest::sha256_hex(&whole);

    let finished = reg
        .uploads()
        .finish_upload(name, &location, &digest, None)
        .await
        .unwrap();
    assert_eq!(finished.digest, digest);

    let (stream, _) = reg.manifests().get_layer(name, &digest).await.unwrap();
    let got = registry_storage::digest::buffer(stream).await.unwrap();
    assert_eq!(&got[..], &whole[..]);
}

#[tokio::test]
async fn s4_stale_fingerprint_is_rejected_without_mutation() {
    let store = MemoryStore::new(4, 64, 10_000);
    let reg = registry_with_limits(store, 4, 64, 10_000, CompatibilityMode::Off);
    let name = "lib/stale";

    let start = reg.uploads().start_upload(name).await.unwrap();
    let f0 = start.location.clone();

    let chunk = vec![9u8; 8];
    let f1 = append(&reg, name, &f0, &chunk).await.unwrap();
    assert_ne!(f0.fingerprint, f1.fingerprint);

    // Replay against the original (now stale) fingerprint.
    let err = append(&reg, name, &f0, &chunk).await.unwrap_err();
    match err {
        Error::Range(conflict) => {
            assert_eq!(conflict.last_byte, Some(7));
            // The conflict must carry the authoritative current fingerprint
            // so the caller can resume, not an echo of its own stale one.
            assert_eq!(conflict.fingerprint, f1.fingerprint);
        }
        other => panic!("expected Range, got {:?}", other),
    }

    // The store state must be unchanged: a correctly-addressed follow-up
    // append using the fresh fingerprint still succeeds and the byte range
    // only ever advanced once.
    let get = reg.uploads().get_upload(name, f1.upload_id).await.unwrap();
    assert_eq!(get.range, Some((0, 7)));
}

#[tokio::test]
async fn s5_cross_repo_mount() {
    let store = MemoryStore::with_default_limits();
    let reg = registry(store, CompatibilityMode::Off);

    let data = Bytes::from_static(b"hello layer bytes");
    let digest = registry_storage::digest::sha256_hex(&data);
    match reg
        .uploads()
        .monolithic_upload("lib/a", &digest, stream_of(data.clone()), Some(data.len() as u64))
        .await
        .unwrap()
    {
        registry_storage::upload::MonolithicResult::Finished(_) => {}
        _ => panic!("expected monolithic upload to finish"),
    }

    reg.manifests()
        .mount_existing_layer("lib/a", "lib/b", &digest)
        .await
        .unwrap();

    assert!(reg.manifests().layer_exists("lib/b", &digest).await.unwrap());
    let (stream, _) = reg.manifests().get_layer("lib/b", &digest).await.unwrap();
    let got = registry_storage::digest::buffer(stream).await.unwrap();
    assert_eq!(got, data);
}

#[tokio::test]
async fn s5b_mount_rejects_same_repository() {
    let store = MemoryStore::with_default_limits();
    let reg = registry(store, CompatibilityMode::Off);
    let data = Bytes::from_static(b"x");
    let digest = registry_storage::digest::sha256_hex(&data);
    reg.uploads()
        .monolithic_upload("lib/a", &digest, stream_of(data.clone()), Some(1))
        .await
        .unwrap();

    let err = reg
        .manifests()
        .mount_existing_layer("lib/a", "lib/a", &digest)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Client(_)));
}

#[tokio::test]
async fn s6_gc_race_blocks_manifest_commit() {
    let store = MemoryStore::with_default_limits();
    let reg = registry(store, CompatibilityMode::Off);
    let name = "lib/race";

    // Collection must abort (not delete anything) while an insertion is
    // in flight - the one-sided guarantee of spec §4.7.
    let gc = reg.gc();
    let marker = gc.mark_for_insertion(name).await.unwrap();
    let outcome = reg.collect(name, GcMode::Unreferenced).await.unwrap();
    assert_eq!(outcome, registry_storage::gc::GcOutcome::Aborted);

    // A marker created *before* a collection pass that actually ran must
    // fail its freshness check afterward: the manifest write that marker
    // was guarding can no longer be trusted to have been seen by GC.
    gc.clean_insertion(&marker).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let stale_marker = gc.mark_for_insertion(name).await.unwrap();
    gc.clean_insertion(&stale_marker).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let outcome2 = reg.collect(name, GcMode::Unreferenced).await.unwrap();
    assert!(matches!(outcome2, registry_storage::gc::GcOutcome::Collected { .. }));
    assert!(!gc.check_can_insert_data(name, &stale_marker).await.unwrap());

    // A fresh marker taken after that collection pass is still valid.
    let fresh_marker = gc.mark_for_insertion(name).await.unwrap();
    assert!(gc.check_can_insert_data(name, &fresh_marker).await.unwrap());
    gc.clean_insertion(&fresh_marker).await;
}

#[tokio::test]
async fn s7_tag_and_digest_both_written_and_readable() {
    let store = MemoryStore::with_default_limits();
    let reg = registry(store, CompatibilityMode::Off);
    let name = "lib/manifests";

    let data = Bytes::from_static(b"{}");
    let digest = registry_storage::digest::sha256_hex(&data);
    let result = reg
        .manifests()
        .put_manifest(name, "latest", stream_of(data.clone()), Some("application/json"), false)
        .await
        .unwrap();
    assert_eq!(result.digest, digest);

    let (by_tag, _) = reg.manifests().get_manifest(name, "latest").await.unwrap();
    let (by_digest, _) = reg.manifests().get_manifest(name, &digest).await.unwrap();
    assert_eq!(by_tag, data);
    assert_eq!(by_digest, data);
    assert!(reg.manifests().manifest_exists(name, "latest").await.unwrap());
}

#[tokio::test]
async fn s8_idempotent_cancel() {
    let store = MemoryStore::with_default_limits();
    let reg = registry(store, CompatibilityMode::Off);
    let name = "lib/cancel";

    let start = reg.uploads().start_upload(name).await.unwrap();
    let upload_id = start.location.upload_id;

    reg.uploads().cancel_upload(name, upload_id).await.unwrap();
    let err = reg.uploads().cancel_upload(name, upload_id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn finish_upload_rejects_trailing_body_after_chunked_appends() {
    let store = MemoryStore::new(4, 64, 10_000);
    let reg = registry_with_limits(store, 4, 64, 10_000, CompatibilityMode::Off);
    let name = "lib/trailing";

    let start = reg.uploads().start_upload(name).await.unwrap();
    let chunk = vec![5u8; 8];
    let location = append(&reg, name, &start.location, &chunk).await.unwrap();

    let digest = registry_storage::digest::sha256_hex(&chunk);
    let trailing = Bytes::from_static(b"unexpected");
    let err = reg
        .uploads()
        .finish_upload(
            name,
            &location,
            &digest,
            Some((stream_of(trailing), 10)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Client(_)));
}

#[tokio::test]
async fn monolithic_upload_too_large_falls_back() {
    let store = MemoryStore::with_default_limits();
    let config = Config {
        max_chunk: 8,
        max_upload_chunk: 8,
        min_chunk: 4,
        ..Config::default()
    };
    let reg = Registry::new(Arc::new(store), config, Arc::new(JsonManifestParser)).unwrap();

    let data = Bytes::from(vec![0u8; 100]);
    let digest = registry_storage::digest::sha256_hex(&data);
    let result = reg
        .uploads()
        .monolithic_upload("lib/large", &digest, stream_of(data.clone()), Some(100))
        .await
        .unwrap();
    assert!(matches!(result, registry_storage::upload::MonolithicResult::TooLarge));
}

#[tokio::test]
async fn part_count_bound_is_enforced() {
    let store = MemoryStore::new(2, 2, 2);
    let reg = registry_with_limits(store, 2, 2, 2, CompatibilityMode::Off);
    let name = "lib/manyparts";

    let start = reg.uploads().start_upload(name).await.unwrap();
    let mut location = start.location;
    location = append(&reg, name, &location, &[1, 2]).await.unwrap();
    location = append(&reg, name, &location, &[3, 4]).await.unwrap();
    // Max parts is 2; a third equal-size part must be rejected as Range.
    let err = append(&reg, name, &location, &[5, 6]).await.unwrap_err();
    assert!(matches!(err, Error::Range(_)));
}

#[tokio::test]
async fn off_mode_rejects_continuing_past_a_shrunk_tail() {
    // A single shrink is always accepted (case d is not compatibility-mode
    // gated); what `off` mode forbids is *continuing* past it, since both
    // the repair (c) and grow (e) branches that could resume an equal
    // chain require full mode.
    let store = MemoryStore::new(4, 64, 10_000);
    let reg = registry_with_limits(store, 4, 64, 10_000, CompatibilityMode::Off);
    let name = "lib/offmode";

    let start = reg.uploads().start_upload(name).await.unwrap();
    let first = vec![1u8; 8];
    let mut location = append(&reg, name, &start.location, &first).await.unwrap();

    let shrunk = vec![2u8; 4]; // shrinks relative to the first chunk; accepted
    location = append(&reg, name, &location, &shrunk).await.unwrap();

    let third = vec![3u8; 8]; // cannot repair/resume without full mode
    let err = append(&reg, name, &location, &third).await.unwrap_err();
    assert!(matches!(err, Error::Range(_)));
}
