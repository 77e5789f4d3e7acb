use std::fs;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use umbra_shared::{CredentialFactory, IdentifierIndex};
use umbra_store::{
    BackupKind, BackupManager, BackupRecord, ConfigStore, EndpointRole, EndpointRotator,
    ExclusiveLock, FileLock, StoreError, StoreSettings, CURRENT_VERSION,
};

fn settings(dir: &std::path::Path) -> StoreSettings {
    StoreSettings::for_data_dir(dir)
}

#[test]
fn test_add_user_yields_usable_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(settings(dir.path())).unwrap();

    store.add_user("alice").unwrap();
    let alice = store.get_user("alice").unwrap().expect("alice was just added");

    assert_eq!(alice.username, "alice");
    assert_eq!(alice.xray_uuid.get_version_num(), 4);
    let key = STANDARD.decode(&alice.wireguard_private_key).unwrap();
    assert_eq!(key.len(), 32);
    assert!(alice.is_active);
    assert!(alice.has_singbox_credentials());
}

#[test]
fn test_backup_then_restore_brings_users_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(settings(dir.path())).unwrap();
    let backups = BackupManager::for_store(&store);

    for name in ["alice", "bob", "carol"] {
        store.add_user(name).unwrap();
    }
    let before = store.list_users().unwrap();

    let record = backups.create_backup("pre-upgrade").unwrap();
    assert_eq!(record.description, "pre-upgrade");

    for user in &before {
        assert!(store.remove_user(&user.username).unwrap());
    }
    assert!(store.list_users().unwrap().is_empty());

    let result = backups.restore_backup(&record.filename).unwrap();
    assert_eq!(result.backup, record.filename);
    assert!(result.manual_steps.is_empty());

    assert_eq!(store.list_users().unwrap(), before);
}

#[test]
fn test_schema_zero_document_is_migrated_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    fs::create_dir_all(&settings.config_dir).unwrap();

    let factory = CredentialFactory::new();
    let mut index = IdentifierIndex::new();
    let mut users = serde_json::Map::new();
    for name in ["alice", "bob", "carol"] {
        let user = factory.new_user(name, &index).unwrap();
        index.insert_user(&user);
        let mut record = serde_json::to_value(&user).unwrap();
        let fields = record.as_object_mut().unwrap();
        for field in [
            "shadowtls_password",
            "shadowsocks_password",
            "hysteria2_password",
            "tuic_uuid",
            "tuic_password",
        ] {
            fields.remove(field);
        }
        users.insert(name.to_string(), record);
    }
    let legacy = json!({
        "schema_version": 0,
        "users": users,
        "server": { "created_at": "2024-01-01T00:00:00" }
    });
    fs::write(settings.store_file(), serde_json::to_vec_pretty(&legacy).unwrap()).unwrap();

    let store = ConfigStore::open(settings.clone()).unwrap();
    let doc = store.load().unwrap();
    assert_eq!(doc.schema_version, CURRENT_VERSION);
    assert_eq!(doc.users.len(), 3);
    assert!(doc.users.values().all(|u| u.has_singbox_credentials()));
    assert!(doc.server.is_none());

    let on_disk: Value = serde_json::from_slice(&fs::read(settings.store_file()).unwrap()).unwrap();
    assert_eq!(on_disk["schema_version"], CURRENT_VERSION);

    let snapshots = store.list_snapshots().unwrap();
    assert!(snapshots.iter().any(|s| s.kind == BackupKind::PreMigration));
}

#[test]
fn test_parallel_writers_lose_no_update() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    ConfigStore::open(settings.clone()).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let settings = settings.clone();
            thread::spawn(move || {
                let store = ConfigStore::open(settings).unwrap();
                for i in 0..5 {
                    store.add_user(&format!("worker{w}_{i}")).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let store = ConfigStore::open(settings).unwrap();
    assert_eq!(store.list_users().unwrap().len(), 20);
}

#[test]
fn test_held_lock_times_out_writers() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    let store = ConfigStore::open(settings.clone()).unwrap();

    let holder = FileLock::new(settings.lock_file());
    let _held = holder.acquire(Duration::from_secs(1)).unwrap();

    settings.lock_timeout = Duration::from_millis(100);
    let impatient = ConfigStore::open(settings.clone()).unwrap();
    assert!(matches!(
        impatient.add_user("alice"),
        Err(StoreError::LockTimeout { .. })
    ));

    // Opening and reading never need the lock.
    assert!(impatient.list_users().unwrap().is_empty());
    assert!(!impatient.status().unwrap().server_initialized);
    assert!(store.list_users().unwrap().is_empty());
}

#[test]
fn test_auto_backups_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(settings(dir.path())).unwrap();
    let backups = BackupManager::for_store(&store);

    backups.create_backup("first manual").unwrap();
    for i in 0..13 {
        backups.create_auto_backup(&format!("auto {i}")).unwrap();
    }
    backups.create_backup("second manual").unwrap();

    let listed = backups.list_backups().unwrap();
    let autos: Vec<&BackupRecord> = listed.iter().filter(|r| r.kind == BackupKind::Auto).collect();
    assert_eq!(autos.len(), 10);
    assert_eq!(listed.len(), 12);
    // The newest autos survive.
    assert_eq!(autos[0].description, "auto 12");
    assert_eq!(autos[9].description, "auto 3");
    assert!(listed.len() <= store.settings().retention.ceiling);
}

#[test]
fn test_failed_restore_keeps_exactly_one_safety_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(settings(dir.path())).unwrap();
    store.add_user("alice").unwrap();
    let backups = BackupManager::for_store(&store);
    let live_before = fs::read(store.path()).unwrap();

    let backup_dir = &store.settings().backup_dir;
    let name = "backup_20240101_120000.tar.gz";
    fs::write(backup_dir.join(name), b"\x1f\x8b truncated garbage").unwrap();
    let record = BackupRecord {
        filename: name.to_string(),
        version: "1.0".to_string(),
        timestamp: "20240101_120000".to_string(),
        description: "corrupt".to_string(),
        size: 20,
        included_items: vec![],
        created_at: None,
        kind: BackupKind::Manual,
    };
    fs::write(
        backup_dir.join("backup_20240101_120000.json"),
        serde_json::to_vec(&record).unwrap(),
    )
    .unwrap();

    let safety_backup = match backups.restore_backup(name) {
        Err(StoreError::Restore { safety_backup, .. }) => safety_backup,
        other => panic!("expected a restore error, got {other:?}"),
    };

    let safety: Vec<BackupRecord> = backups
        .list_backups()
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == BackupKind::PreRestore)
        .collect();
    assert_eq!(safety.len(), 1);
    assert_eq!(safety[0].filename, safety_backup);
    assert_eq!(fs::read(store.path()).unwrap(), live_before);
}

#[test]
fn test_endpoints_travel_with_enhanced_backups() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    let certs = dir.path().join("certs");
    fs::create_dir_all(&certs).unwrap();
    fs::write(certs.join("fullchain.pem"), b"-----BEGIN CERTIFICATE-----").unwrap();
    fs::write(dir.path().join("Caddyfile"), b"example.com {\n}\n").unwrap();
    fs::write(dir.path().join("docker-compose.yml"), b"services: {}\n").unwrap();
    settings.certificates_dir = Some(certs.clone());
    settings.proxy_config = Some(dir.path().join("Caddyfile"));
    settings.orchestration_manifest = Some(dir.path().join("docker-compose.yml"));

    let store = ConfigStore::open(settings.clone()).unwrap();
    store.initialize_server("correct horse battery").unwrap();
    let rotator = EndpointRotator::new(&settings, store.lock_handle());
    let original = rotator.generate(false).unwrap();
    store
        .set_obfuscated_endpoints(original.paths.clone())
        .unwrap();

    let backups = BackupManager::for_store(&store);
    let record = backups.create_backup("full").unwrap();
    assert_eq!(record.version, "2.0");
    assert!(record.included_items.contains(&"endpoints/endpoints.json".to_string()));

    let rotated = rotator.generate(true).unwrap();
    assert_ne!(
        rotated.path(EndpointRole::AdminPanel),
        original.path(EndpointRole::AdminPanel)
    );
    fs::remove_file(certs.join("fullchain.pem")).unwrap();

    let result = backups.restore_backup(&record.filename).unwrap();
    assert_eq!(result.format, "2.0");
    assert_eq!(rotator.current().unwrap(), Some(original.clone()));
    assert!(certs.join("fullchain.pem").is_file());
    assert_eq!(result.manual_steps.len(), 1);
    assert!(result.manual_steps[0].contains("docker-compose.yml"));

    let server = store.load().unwrap().server.unwrap();
    assert_eq!(server.obfuscated_endpoints, original.paths);
}
