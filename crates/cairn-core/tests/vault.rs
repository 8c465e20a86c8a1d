//! Credential persistence through the file store.

use cairn_core::{CoreError, CredentialVault, FileStore, Store};
use std::sync::Arc;

const MASTER: &[u8] = b"correct horse battery staple";

fn vault(store: Arc<dyn Store>, master: &[u8]) -> CredentialVault {
    CredentialVault::new(store, "default", Some(master.to_vec()), 1_000).expect("vault")
}

#[test]
fn test_credential_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path()).unwrap());
        vault(store, MASTER).save("e2b", "e2b_live_abcdef").unwrap();
    }

    let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path()).unwrap());
    let reopened = vault(Arc::clone(&store), MASTER);
    assert!(reopened.has("e2b"));
    assert_eq!(reopened.load("e2b").unwrap().expose(), "e2b_live_abcdef");

    // The stored file never contains the plaintext.
    let raw = std::fs::read_to_string(dir.path().join("credentials/default/e2b.json")).unwrap();
    assert!(!raw.contains("e2b_live_abcdef"));

    // A different master secret cannot read it.
    assert!(matches!(
        vault(store, b"wrong master").load("e2b"),
        Err(CoreError::CredentialUnavailable { .. })
    ));
}

#[test]
fn test_corrupted_entry_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path()).unwrap());
    let v = vault(Arc::clone(&store), MASTER);
    v.save("daytona", "dtn_secret_value").unwrap();

    let path = dir.path().join("credentials/default/daytona.json");
    let mut entry: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    entry["blob"] = serde_json::Value::String("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into());
    std::fs::write(&path, serde_json::to_string(&entry).unwrap()).unwrap();

    assert!(matches!(
        v.load("daytona"),
        Err(CoreError::CredentialUnavailable { .. })
    ));

    // Saving again replaces the damaged entry.
    v.save("daytona", "dtn_secret_value").unwrap();
    assert_eq!(v.load("daytona").unwrap().expose(), "dtn_secret_value");
}

#[test]
fn test_remove_credential() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::open(dir.path()).unwrap());
    let v = vault(store, MASTER);
    v.save("modal", "modal-token").unwrap();
    assert!(v.remove("modal").unwrap());
    assert!(!v.has("modal"));
    assert!(matches!(
        v.load("modal"),
        Err(CoreError::CredentialUnavailable { .. })
    ));
}
