mod common;

use common::create_test_dir;
use std::path::PathBuf;
use stepwise_migrations::{
    JsonStorageHandler, MigrationDefinition, MigrationStatus, StorageError, StorageHandler,
};

fn definition(name: &str, raw: &str) -> MigrationDefinition {
    MigrationDefinition::unparsed(name, PathBuf::from("migrations").join(name), raw.to_string())
}

#[tokio::test]
async fn test_start_and_end_migration() {
    let dir = create_test_dir();
    let storage = JsonStorageHandler::new(dir.path().join("migrations.json"));
    let def = definition("001_a.yml", "- type: test\n");

    let started = storage.start_migration(&def, false).await.unwrap();
    assert_eq!(started.status, MigrationStatus::Started);
    assert!(started.execution_date.is_some());
    assert_eq!(started.path, "migrations/001_a.yml");

    // A second start while running is refused
    assert!(matches!(
        storage.start_migration(&def, false).await,
        Err(StorageError::AlreadyExecuting(_))
    ));

    storage
        .end_migration(&started.with_status(MigrationStatus::Done, "ok"), false)
        .await
        .unwrap();
    let loaded = storage.load_migration("001_a.yml").await.unwrap().unwrap();
    assert_eq!(loaded.status, MigrationStatus::Done);
    assert_eq!(loaded.status_message, "ok");

    // Ending again requires force
    assert!(matches!(
        storage
            .end_migration(&loaded.with_status(MigrationStatus::Failed, "late"), false)
            .await,
        Err(StorageError::NotExecuting(_))
    ));
    storage
        .end_migration(&loaded.with_status(MigrationStatus::Failed, "late"), true)
        .await
        .unwrap();
    assert_eq!(
        storage.load_migration("001_a.yml").await.unwrap().unwrap().status,
        MigrationStatus::Failed
    );
}

#[tokio::test]
async fn test_restart_needs_force_unless_to_do() {
    let dir = create_test_dir();
    let storage = JsonStorageHandler::new(dir.path().join("migrations.json"));
    let def = definition("001_a.yml", "[]");

    let added = storage.add_migration(&def).await.unwrap();
    assert_eq!(added.status, MigrationStatus::ToDo);
    assert!(added.execution_date.is_none());
    assert!(matches!(
        storage.add_migration(&def).await,
        Err(StorageError::AlreadyExists(_))
    ));

    let started = storage.start_migration(&def, false).await.unwrap();
    storage
        .end_migration(&started.with_status(MigrationStatus::Done, ""), false)
        .await
        .unwrap();

    assert!(matches!(
        storage.start_migration(&def, false).await,
        Err(StorageError::AlreadyExecuted(_, MigrationStatus::Done))
    ));
    let restarted = storage.start_migration(&def, true).await.unwrap();
    assert_eq!(restarted.status, MigrationStatus::Started);
}

#[tokio::test]
async fn test_content_hash_tracks_source() {
    let dir = create_test_dir();
    let storage = JsonStorageHandler::new(dir.path().join("migrations.json"));

    let first = storage
        .start_migration(&definition("001_a.yml", "- type: a\n"), false)
        .await
        .unwrap();
    let second = storage
        .start_migration(&definition("001_a.yml", "- type: b\n"), true)
        .await
        .unwrap();

    assert_eq!(first.content_hash.len(), 64);
    assert_ne!(first.content_hash, second.content_hash);
}

#[tokio::test]
async fn test_resume_only_from_suspended() {
    let dir = create_test_dir();
    let storage = JsonStorageHandler::new(dir.path().join("migrations.json"));
    let def = definition("001_a.yml", "[]");

    let started = storage.start_migration(&def, false).await.unwrap();
    assert!(matches!(
        storage.resume_migration(&started).await,
        Err(StorageError::NotSuspended(_))
    ));

    storage
        .end_migration(&started.with_status(MigrationStatus::Suspended, "wait"), false)
        .await
        .unwrap();
    let resumed = storage.resume_migration(&started).await.unwrap();
    assert_eq!(resumed.status, MigrationStatus::Started);
    assert_eq!(resumed.status_message, "wait");
}

#[tokio::test]
async fn test_skip_and_delete() {
    let dir = create_test_dir();
    let storage = JsonStorageHandler::new(dir.path().join("migrations.json"));
    let def = definition("001_a.yml", "[]");

    let skipped = storage.skip_migration(&def).await.unwrap();
    assert_eq!(skipped.status, MigrationStatus::Skipped);
    assert!(storage.skip_migration(&def).await.is_err());

    storage.delete_migration(&skipped).await.unwrap();
    assert!(storage.load_migration("001_a.yml").await.unwrap().is_none());

    // Deleting an unknown record is a no-op
    storage.delete_migration(&skipped).await.unwrap();
}

#[tokio::test]
async fn test_queries_by_status_and_path() {
    let dir = create_test_dir();
    let storage = JsonStorageHandler::new(dir.path().join("migrations.json"));

    for name in ["001_a.yml", "002_b.yml", "003_c.yml"] {
        storage.add_migration(&definition(name, "[]")).await.unwrap();
    }
    storage
        .skip_migration(&MigrationDefinition::unparsed(
            "004_d.yml",
            PathBuf::from("other/004_d.yml"),
            "[]".to_string(),
        ))
        .await
        .unwrap();

    let all = storage.load_migrations(None, None).await.unwrap();
    assert_eq!(all.len(), 4);

    let page = storage.load_migrations(Some(2), Some(1)).await.unwrap();
    let names: Vec<&str> = page.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["002_b.yml", "003_c.yml"]);

    let to_do = storage
        .load_migrations_by_status(MigrationStatus::ToDo, None, None)
        .await
        .unwrap();
    assert_eq!(to_do.len(), 3);

    let in_other = storage
        .load_migrations_by_paths(&["other".to_string()], None, None)
        .await
        .unwrap();
    assert_eq!(in_other.len(), 1);
    assert_eq!(in_other[0].name, "004_d.yml");
}

#[tokio::test]
async fn test_records_survive_reopening() {
    let dir = create_test_dir();
    let path = dir.path().join("state/migrations.json");

    JsonStorageHandler::new(path.clone())
        .add_migration(&definition("001_a.yml", "[]"))
        .await
        .unwrap();

    let reopened = JsonStorageHandler::new(path);
    assert!(reopened.load_migration("001_a.yml").await.unwrap().is_some());
}
