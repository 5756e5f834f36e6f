use std::sync::Arc;
use std::time::Duration;

use bastion_common::{ClientId, Error, Location, PeerId, RecordHint, VaultPath};
use bastion_crypto::ed25519;
use bastion_storage::LocalProvider;
use bastion_vault::{
    Chain, ClientAccess, ClientRequest, EngineConfig, KdfParams, KeyType, NetworkConfig,
    OutputLocation, Permissions, Procedure, RemoteRequest, RemoteResponse, Slip10DeriveInput,
    SnapshotRequest, Status, VaultManager,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn manager(dir: &TempDir) -> VaultManager {
    VaultManager::new(
        Arc::new(LocalProvider::with_root(dir.path()).unwrap()),
        EngineConfig::default().with_kdf_params(KdfParams::minimal()),
    )
}

const PATH: &str = "engine.snapshot";

#[tokio::test]
async fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager.load(PATH, b"password").await.unwrap();
    let client = manager.create_client(PATH, "wallet").await.unwrap();
    client
        .vault("keys")
        .insert("a", b"secret", RecordHint::new("first").unwrap())
        .await
        .unwrap();
    client
        .store()
        .insert("note", b"plain".to_vec(), None)
        .await
        .unwrap();
    manager.save(PATH).await.unwrap();
    manager.unload(PATH).await.unwrap();

    manager.load(PATH, b"password").await.unwrap();
    let client = manager.load_client(PATH, "wallet").await.unwrap();
    assert!(client.vault("keys").check_record("a").await.unwrap());
    assert_eq!(
        client.store().get("note").await.unwrap(),
        Some(b"plain".to_vec())
    );
    let hints = client.vault("keys").list_hints().await.unwrap();
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0].1, RecordHint::new("first").unwrap());
}

#[tokio::test]
async fn test_wrong_password_leaves_file_untouched() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager.load(PATH, b"password").await.unwrap();
    manager.create_client(PATH, "wallet").await.unwrap();
    manager.save(PATH).await.unwrap();
    manager.unload(PATH).await.unwrap();

    let before = std::fs::read(dir.path().join(PATH)).unwrap();
    assert!(matches!(
        manager.load(PATH, b"wrong").await,
        Err(Error::Authentication(_))
    ));
    let after = std::fs::read(dir.path().join(PATH)).unwrap();

    assert_eq!(before, after);
    assert!(manager.loaded_paths().await.is_empty());
}

#[tokio::test]
async fn test_empty_password_is_rejected_as_wrong() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    assert!(matches!(
        manager.load("fresh.snapshot", b"").await,
        Err(Error::InvalidParameter(_))
    ));

    manager.load(PATH, b"password").await.unwrap();
    manager.save(PATH).await.unwrap();
    assert!(matches!(
        manager.reload(PATH, b"").await,
        Err(Error::Authentication(_))
    ));
    manager.unload(PATH).await.unwrap();

    assert!(matches!(
        manager.load(PATH, b"").await,
        Err(Error::Authentication(_))
    ));
    assert!(manager.loaded_paths().await.is_empty());
}

#[tokio::test]
async fn test_removed_key_is_gone_for_procedures() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager.load(PATH, b"password").await.unwrap();
    let client = manager.create_client(PATH, "wallet").await.unwrap();
    let location = Location::generic("keys", "k");

    client
        .execute_procedure(Procedure::GenerateKey {
            ty: KeyType::Ed25519,
            output: location.clone().into(),
        })
        .await
        .unwrap();
    client.remove_secret(&location, true).await.unwrap();

    let result = client
        .execute_procedure(Procedure::PublicKey {
            ty: KeyType::Ed25519,
            private_key: location.clone(),
        })
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert!(!client.record_exists(&location).await.unwrap());
}

#[tokio::test]
async fn test_counters_survive_reload_without_reuse() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager.load(PATH, b"password").await.unwrap();
    let vault = manager
        .create_client(PATH, "wallet")
        .await
        .unwrap()
        .vault("log");

    assert_eq!(vault.insert_counter(None, b"0", RecordHint::default()).await.unwrap(), 0);
    assert_eq!(vault.insert_counter(None, b"1", RecordHint::default()).await.unwrap(), 1);
    vault.remove_counter(1, true).await.unwrap();
    manager.save(PATH).await.unwrap();
    manager.unload(PATH).await.unwrap();

    manager.load(PATH, b"password").await.unwrap();
    let vault = manager.load_client(PATH, "wallet").await.unwrap().vault("log");
    assert_eq!(vault.insert_counter(None, b"2", RecordHint::default()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_last_counter_is_never_handed_out() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager.load(PATH, b"password").await.unwrap();
    let vault = manager
        .create_client(PATH, "wallet")
        .await
        .unwrap()
        .vault("log");

    assert!(matches!(
        vault.insert_counter(Some(u64::MAX), b"x", RecordHint::default()).await,
        Err(Error::InvalidParameter(_))
    ));
    assert!(!vault.exists().await.unwrap());

    let last = u64::MAX - 1;
    assert_eq!(
        vault.insert_counter(Some(last), b"x", RecordHint::default()).await.unwrap(),
        last
    );
    assert!(matches!(
        vault.insert_counter(None, b"y", RecordHint::default()).await,
        Err(Error::InvalidParameter(_))
    ));
    assert_eq!(vault.list_hints().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_mnemonic_derive_sign_scenario() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager.load(PATH, b"password").await.unwrap();
    let client = manager.create_client(PATH, "wallet").await.unwrap();

    let outputs = client
        .execute_procedures(vec![
            Procedure::Bip39Generate {
                passphrase: Some("p".to_string()),
                output: Location::generic("seeds", "main").into(),
            },
            Procedure::Slip10Derive {
                chain: Chain::from_u32_hardened([0, 0, 0]),
                input: Slip10DeriveInput::Seed(Location::generic("seeds", "main")),
                output: Location::generic("keys", "account").into(),
            },
            Procedure::PublicKey {
                ty: KeyType::Ed25519,
                private_key: Location::generic("keys", "account"),
            },
            Procedure::Ed25519Sign {
                private_key: Location::generic("keys", "account"),
                msg: b"hello".to_vec(),
            },
        ])
        .await
        .unwrap();

    let mut outputs = outputs.into_iter();
    let mnemonic = outputs.next().unwrap().into_mnemonic().unwrap();
    assert_eq!(mnemonic.split_whitespace().count(), 24);
    outputs.next();
    let public = outputs.next().unwrap().into_public_key().unwrap();
    let signature = outputs.next().unwrap().into_signature().unwrap();
    assert!(ed25519::verify(&public, b"hello", &signature).unwrap());

    // Recovering the phrase elsewhere yields the same key.
    let other = manager.create_client(PATH, "restore").await.unwrap();
    other
        .execute_procedures(vec![
            Procedure::Bip39Recover {
                mnemonic: mnemonic.to_string(),
                passphrase: Some("p".to_string()),
                output: Location::generic("seeds", "main").into(),
            },
            Procedure::Slip10Derive {
                chain: Chain::from_u32_hardened([0, 0, 0]),
                input: Slip10DeriveInput::Seed(Location::generic("seeds", "main")),
                output: Location::generic("keys", "account").into(),
            },
        ])
        .await
        .unwrap();
    let recovered = other
        .execute_procedure(Procedure::PublicKey {
            ty: KeyType::Ed25519,
            private_key: Location::generic("keys", "account"),
        })
        .await
        .unwrap()
        .into_public_key()
        .unwrap();
    assert_eq!(recovered, public);
}

#[tokio::test]
async fn test_invalid_mnemonic_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager.load(PATH, b"password").await.unwrap();
    let client = manager.create_client(PATH, "wallet").await.unwrap();

    let result = client
        .execute_procedure(Procedure::Bip39Recover {
            mnemonic: "not a real mnemonic phrase at all".to_string(),
            passphrase: None,
            output: OutputLocation::from(Location::generic("seeds", "bad")),
        })
        .await;

    assert!(matches!(result, Err(Error::InvalidMnemonic(_))));
    assert!(!client.vault("seeds").exists().await.unwrap());
}

#[tokio::test]
async fn test_peer_without_write_permission() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let snapshot = manager.load(PATH, b"password").await.unwrap();
    let client = manager.create_client(PATH, "wallet").await.unwrap();
    let peer = PeerId::new("peer-1").unwrap();

    snapshot
        .configure_network(|network| {
            *network = NetworkConfig::new(Permissions::allow_none()).with_peer_permissions(
                peer.clone(),
                Permissions::new(
                    ClientAccess::allow_none().with_default_vault_access(true, false, false),
                ),
            );
        })
        .await;

    let write = RemoteRequest::ClientRequest {
        client_path: "wallet".into(),
        request: ClientRequest::WriteToVault {
            location: Location::generic("remote", "r"),
            payload: b"x".to_vec(),
        },
    };
    assert!(matches!(
        snapshot.serve_remote(&peer, write).await,
        Err(Error::PermissionDenied(_))
    ));
    assert!(!client.vault("remote").exists().await.unwrap());

    // Missing and forbidden look the same.
    let check_vault = |client_path: &str| RemoteRequest::ClientRequest {
        client_path: client_path.into(),
        request: ClientRequest::CheckVault {
            vault_path: "remote".into(),
        },
    };
    assert_eq!(
        snapshot.serve_remote(&peer, check_vault("wallet")).await.unwrap(),
        RemoteResponse::Exists(false)
    );
    let stranger = PeerId::new("peer-2").unwrap();
    assert_eq!(
        snapshot.serve_remote(&stranger, check_vault("nobody")).await.unwrap(),
        RemoteResponse::Exists(false)
    );
    let read = RemoteRequest::ClientRequest {
        client_path: "nobody".into(),
        request: ClientRequest::ReadFromStore { key: "k".into() },
    };
    assert!(matches!(
        snapshot.serve_remote(&stranger, read).await,
        Err(Error::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_missing_client_looks_forbidden_to_peers() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let snapshot = manager.load(PATH, b"password").await.unwrap();
    snapshot
        .configure_network(|network| network.allow_all_requests())
        .await;
    let peer = PeerId::new("peer-1").unwrap();

    let requests = [
        ClientRequest::WriteToStore {
            key: "k".into(),
            payload: b"v".to_vec(),
            lifetime: None,
        },
        ClientRequest::DeleteFromStore { key: "k".into() },
        ClientRequest::Procedures {
            procedures: vec![Procedure::GenerateKey {
                ty: KeyType::Ed25519,
                output: Location::generic("keys", "k").into(),
            }],
        },
    ];
    for request in requests {
        let request = RemoteRequest::ClientRequest {
            client_path: "nobody".into(),
            request,
        };
        assert!(matches!(
            snapshot.serve_remote(&peer, request).await,
            Err(Error::PermissionDenied(_))
        ));
    }
    assert!(snapshot.client_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_hierarchy_lists_clonable_vaults() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let snapshot = manager.load(PATH, b"password").await.unwrap();
    let client = manager.create_client(PATH, "wallet").await.unwrap();
    for vault in ["shared", "private"] {
        client
            .vault(vault)
            .insert("r", b"x", RecordHint::new("tag").unwrap())
            .await
            .unwrap();
    }
    let peer = PeerId::new("peer-1").unwrap();
    snapshot
        .configure_network(|network| {
            network.set_peer_permissions(
                peer.clone(),
                Permissions::new(
                    ClientAccess::allow_none().with_vault_access("shared", false, false, true),
                ),
            );
        })
        .await;

    let request = RemoteRequest::SnapshotRequest {
        request: SnapshotRequest::GetRemoteHierarchy,
    };
    let RemoteResponse::Hierarchy(hierarchy) =
        snapshot.serve_remote(&peer, request.clone()).await.unwrap()
    else {
        panic!("expected a hierarchy");
    };
    let vaults = &hierarchy[&ClientId::from("wallet")];
    assert_eq!(vaults.len(), 1);
    assert_eq!(vaults[&VaultPath::from("shared")][0].hint, RecordHint::new("tag").unwrap());

    let stranger = PeerId::new("peer-2").unwrap();
    assert_eq!(
        snapshot.serve_remote(&stranger, request).await.unwrap(),
        RemoteResponse::Hierarchy(Default::default())
    );
}

#[tokio::test]
async fn test_disable_password_clear_keeps_snapshot_open() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let snapshot = manager.load(PATH, b"password").await.unwrap();
    let client = manager.create_client(PATH, "wallet").await.unwrap();

    manager
        .set_password_clear_interval(PATH, Duration::from_millis(50))
        .await
        .unwrap();
    snapshot.disable_password_clear().await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(
        snapshot.status().await.unwrap(),
        Status::Unlocked { remaining: None }
    );
    client
        .vault("keys")
        .insert("a", b"x", RecordHint::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_zero_interval_locks_until_reload() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let snapshot = manager.load(PATH, b"password").await.unwrap();
    let client = manager.create_client(PATH, "wallet").await.unwrap();

    manager
        .set_password_clear_interval(PATH, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(snapshot.status().await.unwrap(), Status::Locked);
    assert!(matches!(
        client.vault("keys").insert("a", b"x", RecordHint::default()).await,
        Err(Error::Locked)
    ));
    assert!(matches!(manager.save(PATH).await, Err(Error::Locked)));

    manager.reload(PATH, b"password").await.unwrap();
    client
        .vault("keys")
        .insert("a", b"x", RecordHint::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_store_entry_expires() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager.load(PATH, b"password").await.unwrap();
    let store = manager.create_client(PATH, "wallet").await.unwrap().store();

    store
        .insert("session", b"token".to_vec(), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(store.get("session").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(store.get("session").await.unwrap(), None);
    assert_eq!(store.remove("session").await.unwrap(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_string_and_byte_paths_address_the_same_record(
        vault in "[a-z0-9]{1,12}",
        record in "[a-z0-9]{1,12}",
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let manager = manager(&dir);
            manager.load(PATH, b"password").await.unwrap();
            let client = manager.create_client(PATH, "wallet").await.unwrap();

            client
                .write_secret(
                    &Location::generic(vault.as_str(), record.as_str()),
                    b"x",
                    RecordHint::default(),
                )
                .await
                .unwrap();

            let by_bytes = Location::generic(vault.as_bytes(), record.as_bytes().to_vec());
            assert!(client.record_exists(&by_bytes).await.unwrap());
        });
    }
}
