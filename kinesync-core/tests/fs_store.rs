use std::sync::Arc;

use kinesync_core::{Result, SyncError};
use kinesync_core::index::ObjectStoreIndex;
use kinesync_core::mirror::{LocalMirror, MirrorOptions};
use kinesync_core::store::{FsObjectStore, ObjectStore};
use kinesync_core::unit::Subject;

async fn dataset() -> Result<(tempfile::TempDir, Arc<FsObjectStore>)> {
    let root = tempfile::tempdir()?;
    let store = Arc::new(FsObjectStore::new(root.path(), 3));
    store
        .put_object("protected/s1/_subject.json", br#"{"state":"pending"}"#.to_vec())
        .await?;
    store
        .put_object("protected/s1/trials/walk/markers.trc", b"frames".to_vec())
        .await?;
    store
        .put_object("protected/s1/trials/jump/markers.trc", b"frames".to_vec())
        .await?;
    store.put_object("protected/empty/", Vec::new()).await?;
    Ok((root, store))
}

#[tokio::test]
async fn index_over_local_directory_finds_subjects() -> Result<()> {
    let (_root, store) = dataset().await?;
    let index = ObjectStoreIndex::new(store);

    let summary = index.refresh("protected/").await?;
    assert_eq!(summary.listed, 4);
    assert_eq!(summary.pages, 2);
    assert!(index.exists("protected/empty"));

    let subjects = Subject::discover(&index.snapshot(), "protected");
    assert_eq!(subjects.len(), 1);
    let mut trials: Vec<_> = subjects[0].trials.iter().map(|t| t.name.as_str()).collect();
    trials.sort();
    assert_eq!(trials, vec!["jump", "walk"]);
    Ok(())
}

#[tokio::test]
async fn mirror_scope_writes_back_to_disk() -> Result<()> {
    let (root, store) = dataset().await?;
    let index = Arc::new(ObjectStoreIndex::new(store));
    index.refresh("").await?;

    LocalMirror::scope(
        index.clone(),
        "protected/s1",
        MirrorOptions::default(),
        |mirror| async move {
            let out = mirror.local_path().join("trials/walk/_results.json");
            tokio::fs::write(out, b"{}").await?;
            Ok::<_, SyncError>(())
        },
    )
    .await?;

    let on_disk = root.path().join("protected/s1/trials/walk/_results.json");
    assert_eq!(std::fs::read(on_disk)?, b"{}");
    assert!(index.exists("protected/s1/trials/walk/_results.json"));

    let subject = Subject::from_snapshot(&index.snapshot(), "protected/s1");
    let walk = subject.trials.iter().find(|t| t.name == "walk").unwrap();
    assert!(walk.results.is_some());
    Ok(())
}

#[tokio::test]
async fn delete_prefix_is_safe_to_repeat() -> Result<()> {
    let (root, store) = dataset().await?;
    let index = ObjectStoreIndex::new(store);
    index.refresh("").await?;

    let removed = index.delete_prefix("protected/s1/trials/jump").await?;
    assert_eq!(removed, 1);
    index.delete_prefix("protected/s1/trials/jump").await?;

    assert!(!root.path().join("protected/s1/trials/jump/markers.trc").exists());
    assert!(!index.exists("protected/s1/trials/jump/markers.trc"));
    assert!(index.exists("protected/s1/trials/walk/markers.trc"));
    Ok(())
}
