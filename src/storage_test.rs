use super::*;

// =============================================================================
// FileStore
// =============================================================================

#[test]
fn missing_file_reads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("session.json"));
    assert_eq!(store.get("user").unwrap(), None);
}

#[test]
fn set_then_get_survives_new_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("session.json");

    FileStore::new(&path).set("user", r#"{"id":1}"#).unwrap();
    let reopened = FileStore::new(&path);

    assert_eq!(reopened.get("user").unwrap().as_deref(), Some(r#"{"id":1}"#));
}

#[test]
fn remove_deletes_only_that_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("kv.json"));
    store.set("a", "1").unwrap();
    store.set("b", "2").unwrap();

    store.remove("a").unwrap();

    assert_eq!(store.get("a").unwrap(), None);
    assert_eq!(store.get("b").unwrap().as_deref(), Some("2"));
}

#[test]
fn remove_missing_key_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("kv.json"));
    store.remove("nothing").unwrap();
    assert!(!store.path().exists());
}

#[test]
fn corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.json");
    std::fs::write(&path, "{not json").unwrap();

    let err = FileStore::new(&path).get("user").unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)));
}

// =============================================================================
// MemoryStore
// =============================================================================

#[test]
fn memory_store_round_trip() {
    let store = MemoryStore::new();
    store.set("k", "v").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
}
