//! Remote transport tests that run without a network
//!
//! Covers upload selection from `+latest`, object addressing, archive
//! round trips and the error surface of an unconfigured transport. Wire
//! traffic itself is exercised against a real endpoint, not here.

use std::fs;

use tempfile::TempDir;

use rugby::remote::{
    compress_dir, extract_zip, object_key, ArchiveFormat, RemoteConfig, RemoteError,
    RemoteTransport,
};
use rugby::store::BinaryStore;
use rugby::{BuildFlags, Credentials, Environment, Target, TargetKind};

fn import_entry(store: &BinaryStore, temp: &TempDir, product: &str, fingerprint: &str) {
    let source = temp.path().join("artifacts").join(fingerprint);
    fs::create_dir_all(source.join("Headers")).unwrap();
    fs::write(source.join("binary"), fingerprint.as_bytes()).unwrap();
    fs::write(source.join("Headers/api.h"), b"#pragma once\n").unwrap();

    let mut target = Target::new(product, product, TargetKind::Framework);
    target.fingerprint = Some(fingerprint.to_string());
    store.import(&target, &BuildFlags::default(), &source).unwrap();
}

fn test_config() -> RemoteConfig {
    RemoteConfig {
        endpoint: "https://s3.us-east-1.amazonaws.com".to_string(),
        bucket: "rugby-cache".to_string(),
        credentials: Credentials {
            access_key: "AK".to_string(),
            secret_key: "SK".to_string(),
        },
        region: None,
        style: None,
        parallelism: 4,
        request_timeout: std::time::Duration::from_secs(5),
        resource_timeout: std::time::Duration::from_secs(10),
        debug: Default::default(),
    }
}

// =============================================================================
// Upload selection
// =============================================================================

#[tokio::test]
async fn test_upload_without_latest_file_fails() {
    let temp = TempDir::new().unwrap();
    let store = BinaryStore::new(temp.path().join("bin"));
    let transport = RemoteTransport::new(test_config()).unwrap();

    let result = transport.upload_all(&store, ArchiveFormat::Zip).await;
    assert!(matches!(result, Err(RemoteError::NoLatestFile)));
}

#[tokio::test]
async fn test_upload_with_empty_latest_fails() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("bin");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("+latest"), "").unwrap();

    let store = BinaryStore::new(&root);
    let transport = RemoteTransport::new(test_config()).unwrap();

    let result = transport.upload_all(&store, ArchiveFormat::Zip).await;
    assert!(matches!(result, Err(RemoteError::EmptySelection)));
}

#[test]
fn test_latest_selects_newest_fingerprint_for_upload() {
    let temp = TempDir::new().unwrap();
    let store = BinaryStore::new(temp.path().join("bin"));

    import_entry(&store, &temp, "P", "f1aa");
    std::thread::sleep(std::time::Duration::from_millis(20));
    import_entry(&store, &temp, "P", "f2bb");

    store.refresh_latest().unwrap();
    let pointers = store.read_latest().unwrap();

    let keys: Vec<String> = pointers
        .iter()
        .map(|p| object_key(p, ArchiveFormat::Zip))
        .collect();

    let group = BuildFlags::default().group_dir();
    assert_eq!(keys, vec![format!("P/{group}/f2bb.zip")], "only the newest entry uploads");
}

// =============================================================================
// Archive round trip (stored bytes must reproduce the entry)
// =============================================================================

#[test]
fn test_uploaded_archive_reproduces_entry_byte_for_byte() {
    let temp = TempDir::new().unwrap();
    let store = BinaryStore::new(temp.path().join("bin"));
    import_entry(&store, &temp, "P", "f1aa");

    store.refresh_latest().unwrap();
    let pointer = store.read_latest().unwrap().remove(0);

    let archive = temp.path().join("object.zip");
    compress_dir(&pointer.path, &archive).unwrap();

    let unpacked = temp.path().join("unpacked");
    extract_zip(&archive, &unpacked).unwrap();

    for file in ["binary", "Headers/api.h", "metadata.json"] {
        assert_eq!(
            fs::read(pointer.path.join(file)).unwrap(),
            fs::read(unpacked.join(file)).unwrap(),
            "{file} differs after the round trip"
        );
    }
}

// =============================================================================
// Configuration surface
// =============================================================================

#[test]
fn test_transport_from_unconfigured_environment_fails() {
    let env = Environment::default();
    assert!(matches!(
        RemoteConfig::from_env(&env),
        Err(RemoteError::MissingSetting("S3_ENDPOINT"))
    ));
}

#[test]
fn test_seven_z_keys_are_addressable() {
    let temp = TempDir::new().unwrap();
    let store = BinaryStore::new(temp.path().join("bin"));
    import_entry(&store, &temp, "P", "f1aa");
    store.refresh_latest().unwrap();
    let pointer = store.read_latest().unwrap().remove(0);

    let key = object_key(&pointer, ArchiveFormat::SevenZ);
    assert!(key.ends_with("/f1aa.7z"));
    assert_eq!(ArchiveFormat::from_key(&key), Some(ArchiveFormat::SevenZ));
}
