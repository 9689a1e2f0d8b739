//! Secondary index consistency of the redb store under random operation sequences.

mod common;

use common::*;
use parcel_core::{FileStatus, Upload};
use parcel_metadata::{FileRepo, PurgeOutcome, RedbStore, UploadRepo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use time::Duration;

async fn random_walk(seed: u64, steps: usize) {
    let store = RedbStore::in_memory().await.unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut uploads: Vec<Upload> = Vec::new();

    for step in 0..steps {
        match rng.random_range(0..7) {
            0 | 1 => {
                let mut upload = if rng.random_bool(0.5) {
                    user_upload_at(["ann", "ben"][rng.random_range(0..2)], step as i64)
                } else {
                    upload_at(step as i64, rng.random_range(0..120))
                };
                upload.removable = rng.random_bool(0.5);
                let files: Vec<_> = (0..rng.random_range(0..4))
                    .map(|i| file_for(&upload.id, &format!("f{step}-{i}")))
                    .collect();
                store.create_upload(&upload, &files).await.unwrap();
                uploads.push(upload);
            }
            2 if !uploads.is_empty() => {
                let upload = &uploads[rng.random_range(0..uploads.len())];
                let at = base_time() + Duration::seconds(step as i64);
                store.soft_delete_upload(&upload.id, at).await.unwrap();
            }
            3 if !uploads.is_empty() => {
                let upload = &uploads[rng.random_range(0..uploads.len())];
                let ttl = rng.random_range(0..600);
                let expire_at = upload.expiration_for(ttl);
                store
                    .set_upload_expiration(&upload.id, ttl, expire_at)
                    .await
                    .unwrap();
            }
            4 | 5 if !uploads.is_empty() => {
                let upload = &uploads[rng.random_range(0..uploads.len())];
                let files = store.get_files(&upload.id).await.unwrap();
                if files.is_empty() {
                    continue;
                }
                let file = &files[rng.random_range(0..files.len())];
                let next = FileStatus::ALL[rng.random_range(0..FileStatus::ALL.len())];
                if file.status.can_transition_to(next) {
                    store
                        .update_file_status(&file.id, file.status, next)
                        .await
                        .unwrap();
                } else {
                    assert!(
                        store
                            .update_file_status(&file.id, file.status, next)
                            .await
                            .is_err()
                    );
                }
            }
            6 if !uploads.is_empty() => {
                let index = rng.random_range(0..uploads.len());
                if store.purge_upload(&uploads[index].id).await.unwrap() == PurgeOutcome::Purged {
                    uploads.swap_remove(index);
                }
            }
            _ => {}
        }

        let report = store.verify_indices().await.unwrap();
        assert!(
            report.is_consistent(),
            "seed {seed} step {step}: index drift {report:?}"
        );
    }
}

#[tokio::test]
async fn test_indices_stay_consistent_under_random_operations() {
    for seed in [1, 7, 42, 1234] {
        random_walk(seed, 200).await;
    }
}

#[tokio::test]
async fn test_indices_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parcel.redb");

    let upload = user_upload_at("dora", 0);
    let file = file_for(&upload.id, "kept.txt");
    {
        let store = RedbStore::open(&path).await.unwrap();
        store.create_upload(&upload, &[file.clone()]).await.unwrap();
        store
            .update_file_status(&file.id, FileStatus::Missing, FileStatus::Uploading)
            .await
            .unwrap();
    }

    let store = RedbStore::open(&path).await.unwrap();
    assert!(store.verify_indices().await.unwrap().is_consistent());
    let uploading = store
        .get_files_by_status(FileStatus::Uploading, None, 10)
        .await
        .unwrap();
    assert_eq!(uploading.len(), 1);
    assert_eq!(uploading[0].id, file.id);
}
