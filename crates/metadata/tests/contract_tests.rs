//! Behaviour every metadata store must share, run against each realization.

mod common;

use common::*;
use parcel_core::{FileId, FileStatus, PagingQuery, SortOrder, UploadFilter, UploadId};
use parcel_metadata::{MetadataError, MetadataStore, PurgeOutcome};
use std::sync::Arc;
use time::Duration;

fn ids<'a>(uploads: impl IntoIterator<Item = &'a parcel_core::Upload>) -> Vec<UploadId> {
    uploads.into_iter().map(|u| u.id.clone()).collect()
}

#[tokio::test]
async fn test_create_and_get_upload_with_files() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let mut upload = upload_at(0, 3600);
        upload.comments = Some("holiday pictures".to_string());
        let a = file_for(&upload.id, "a.txt");
        let b = file_for(&upload.id, "b.txt");

        store
            .create_upload(&upload, &[a.clone(), b.clone()])
            .await
            .expect("create upload");

        let fetched = store.get_upload(&upload.id).await.unwrap().expect("upload");
        assert_eq!(fetched, upload, "{}", store.backend_name());

        let files = store.get_files(&upload.id).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(files.len(), 2);
        assert!(names.contains(&"a.txt") && names.contains(&"b.txt"));
        assert!(files.iter().all(|f| f.status == FileStatus::Missing));
        assert_eq!(store.count_upload_files(&upload.id).await.unwrap(), 2);

        assert!(store.get_upload(&UploadId::new()).await.unwrap().is_none());
        assert!(store.get_file(&FileId::new()).await.unwrap().is_none());
    })
    .await;
}

#[tokio::test]
async fn test_duplicate_upload_is_rejected() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let upload = upload_at(0, 0);
        store.create_upload(&upload, &[]).await.unwrap();
        let result = store.create_upload(&upload, &[]).await;
        assert!(result.is_err(), "{}", store.backend_name());
    })
    .await;
}

#[tokio::test]
async fn test_create_file_requires_alive_upload() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let orphan = file_for(&UploadId::new(), "orphan.bin");
        assert!(matches!(
            store.create_file(&orphan).await,
            Err(MetadataError::NotFound(_))
        ));

        let upload = upload_at(0, 0);
        store.create_upload(&upload, &[]).await.unwrap();
        store.create_file(&file_for(&upload.id, "late.txt")).await.unwrap();

        assert!(store.soft_delete_upload(&upload.id, base_time()).await.unwrap());
        let after_delete = file_for(&upload.id, "too-late.txt");
        assert!(matches!(
            store.create_file(&after_delete).await,
            Err(MetadataError::NotFound(_))
        ));
        assert_eq!(store.count_upload_files(&upload.id).await.unwrap(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_status_compare_and_set() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let upload = upload_at(0, 0);
        let file = file_for(&upload.id, "data.bin");
        store.create_upload(&upload, &[file.clone()]).await.unwrap();

        let updated = store
            .update_file_status(&file.id, FileStatus::Missing, FileStatus::Uploading)
            .await
            .unwrap();
        assert_eq!(updated.status, FileStatus::Uploading);

        // Stale expectation reports what is actually stored.
        match store
            .update_file_status(&file.id, FileStatus::Missing, FileStatus::Uploading)
            .await
        {
            Err(MetadataError::Conflict { expected, actual, .. }) => {
                assert_eq!(expected, FileStatus::Missing);
                assert_eq!(actual, FileStatus::Uploading);
            }
            other => panic!("{}: expected conflict, got {other:?}", store.backend_name()),
        }

        // Illegal edges never reach the store.
        assert!(matches!(
            store
                .update_file_status(&file.id, FileStatus::Uploading, FileStatus::Missing)
                .await,
            Err(MetadataError::InvalidStateTransition { .. })
        ));

        assert!(matches!(
            store
                .update_file_status(&FileId::new(), FileStatus::Missing, FileStatus::Uploading)
                .await,
            Err(MetadataError::NotFound(_))
        ));

        let stored = store.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FileStatus::Uploading);
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_status_claims_have_one_winner() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let upload = upload_at(0, 0);
        let file = file_for(&upload.id, "contested.bin");
        store.create_upload(&upload, &[file.clone()]).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = file.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_file_status(&id, FileStatus::Missing, FileStatus::Uploading)
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(MetadataError::Conflict { .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(winners, 1, "{}", store.backend_name());
    })
    .await;
}

#[tokio::test]
async fn test_update_file_records_upload_result() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let upload = upload_at(0, 0);
        let file = file_in(&upload.id, "photo.jpg", FileStatus::Uploading);
        store.create_upload(&upload, &[file.clone()]).await.unwrap();

        let mut done = file.clone();
        done.status = FileStatus::Uploaded;
        done.size = Some(1234);
        done.md5 = Some("d41d8cd98f00b204e9800998ecf8427e".to_string());
        done.mime_type = Some("image/jpeg".to_string());
        done.backend_details = Some(serde_json::json!({ "path": "xx/yy/zz" }));
        store.update_file(&done, FileStatus::Uploading).await.unwrap();

        let stored = store.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(stored, done);

        // The same write again no longer matches the expected status.
        assert!(matches!(
            store.update_file(&done, FileStatus::Uploading).await,
            Err(MetadataError::Conflict { .. })
        ));
    })
    .await;
}

#[tokio::test]
async fn test_list_uploads_pages_both_ways() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let uploads: Vec<_> = (0..5).map(|i| upload_at(i, 0)).collect();
        for upload in &uploads {
            store.create_upload(upload, &[]).await.unwrap();
        }
        let filter = UploadFilter::default();

        let first = store
            .list_uploads(&filter, &PagingQuery::default().with_limit(2))
            .await
            .unwrap();
        assert_eq!(ids(&first.results), ids([&uploads[4], &uploads[3]]));
        assert!(first.before.is_none());
        let after = first.after.clone().expect("more pages");

        let second = store
            .list_uploads(&filter, &PagingQuery::default().with_limit(2).with_after(after))
            .await
            .unwrap();
        assert_eq!(ids(&second.results), ids([&uploads[2], &uploads[1]]));

        let last = store
            .list_uploads(
                &filter,
                &PagingQuery::default()
                    .with_limit(2)
                    .with_after(second.after.clone().unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(ids(&last.results), ids([&uploads[0]]));
        assert!(last.after.is_none());

        let back = store
            .list_uploads(
                &filter,
                &PagingQuery::default()
                    .with_limit(2)
                    .with_before(second.before.clone().unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(ids(&back.results), ids(&first.results));

        let ascending = store
            .list_uploads(
                &filter,
                &PagingQuery::default().with_limit(10).with_order(SortOrder::Asc),
            )
            .await
            .unwrap();
        assert_eq!(ids(&ascending.results), ids(&uploads));
    })
    .await;
}

#[tokio::test]
async fn test_list_uploads_filters() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let alice = user_upload_at("alice", 0);
        let mut alice_other_token = user_upload_at("alice", 1);
        alice_other_token.token = Some("second-token".to_string());
        let bob = user_upload_at("bob", 2);
        let anonymous = upload_at(3, 0);
        let deleted = user_upload_at("alice", 4);
        for upload in [&alice, &alice_other_token, &bob, &anonymous, &deleted] {
            store.create_upload(upload, &[]).await.unwrap();
        }
        store.soft_delete_upload(&deleted.id, base_time()).await.unwrap();

        let page = store
            .list_uploads(&UploadFilter::for_user("alice"), &PagingQuery::default())
            .await
            .unwrap();
        assert_eq!(ids(&page.results), ids([&alice_other_token, &alice]));

        let by_token = UploadFilter {
            token: Some("second-token".to_string()),
            ..UploadFilter::for_user("alice")
        };
        let page = store.list_uploads(&by_token, &PagingQuery::default()).await.unwrap();
        assert_eq!(ids(&page.results), ids([&alice_other_token]));

        let with_deleted = UploadFilter {
            include_deleted: true,
            ..UploadFilter::for_user("alice")
        };
        let page = store
            .list_uploads(&with_deleted, &PagingQuery::default())
            .await
            .unwrap();
        assert_eq!(page.results.len(), 3);
        assert!(page.results[0].is_deleted());

        let everyone = store
            .list_uploads(&UploadFilter::default(), &PagingQuery::default())
            .await
            .unwrap();
        assert_eq!(everyone.results.len(), 4);
    })
    .await;
}

#[tokio::test]
async fn test_expired_and_deleted_queries() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let short: Vec<_> = (0..3).map(|i| upload_at(i, 10)).collect();
        let long = upload_at(0, 3600);
        let forever = upload_at(0, 0);
        for upload in short.iter().chain([&long, &forever]) {
            store.create_upload(upload, &[]).await.unwrap();
        }

        let now = base_time() + Duration::seconds(60);
        let mut expected = ids(&short);
        expected.sort();

        let first = store.get_expired_uploads(now, None, 2).await.unwrap();
        assert_eq!(ids(&first), expected[..2].to_vec(), "{}", store.backend_name());
        let rest = store
            .get_expired_uploads(now, Some(&first[1].id), 2)
            .await
            .unwrap();
        assert_eq!(ids(&rest), expected[2..].to_vec());

        // Expiry is inclusive of the boundary instant.
        let boundary = short[0].expire_at.unwrap();
        let at_boundary = store.get_expired_uploads(boundary, None, 10).await.unwrap();
        assert_eq!(ids(&at_boundary), ids([&short[0]]));

        assert!(store.get_deleted_uploads(None, 10).await.unwrap().is_empty());
        for upload in &short {
            assert!(store.soft_delete_upload(&upload.id, now).await.unwrap());
        }
        assert!(!store.soft_delete_upload(&short[0].id, now).await.unwrap());

        assert!(store.get_expired_uploads(now, None, 10).await.unwrap().is_empty());
        let deleted = store.get_deleted_uploads(None, 10).await.unwrap();
        assert_eq!(ids(&deleted), expected);
        assert!(deleted.iter().all(|u| u.deleted_at == Some(now)));
        let tail = store
            .get_deleted_uploads(Some(&expected[1]), 10)
            .await
            .unwrap();
        assert_eq!(ids(&tail), expected[2..].to_vec());
    })
    .await;
}

#[tokio::test]
async fn test_set_upload_expiration() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let upload = upload_at(0, 0);
        store.create_upload(&upload, &[]).await.unwrap();

        let expire_at = base_time() + Duration::seconds(30);
        assert!(
            store
                .set_upload_expiration(&upload.id, 30, Some(expire_at))
                .await
                .unwrap()
        );
        let stored = store.get_upload(&upload.id).await.unwrap().unwrap();
        assert_eq!(stored.ttl, 30);
        assert_eq!(stored.expire_at, Some(expire_at));

        let expired = store
            .get_expired_uploads(expire_at, None, 10)
            .await
            .unwrap();
        assert_eq!(ids(&expired), ids([&upload]));

        assert!(
            !store
                .set_upload_expiration(&UploadId::new(), 30, Some(expire_at))
                .await
                .unwrap()
        );
        store.soft_delete_upload(&upload.id, base_time()).await.unwrap();
        assert!(
            !store
                .set_upload_expiration(&upload.id, 0, None)
                .await
                .unwrap()
        );
    })
    .await;
}

#[tokio::test]
async fn test_purge_upload_outcomes() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let upload = upload_at(0, 0);
        let stored = file_in(&upload.id, "kept.bin", FileStatus::Uploaded);
        let never = file_for(&upload.id, "never.bin");
        store
            .create_upload(&upload, &[stored.clone(), never.clone()])
            .await
            .unwrap();

        assert_eq!(
            store.purge_upload(&UploadId::new()).await.unwrap(),
            PurgeOutcome::NotFound
        );
        assert_eq!(
            store.purge_upload(&upload.id).await.unwrap(),
            PurgeOutcome::Alive
        );

        store.soft_delete_upload(&upload.id, base_time()).await.unwrap();
        store
            .update_file_status(&never.id, FileStatus::Missing, FileStatus::Deleted)
            .await
            .unwrap();
        store
            .update_file_status(&stored.id, FileStatus::Uploaded, FileStatus::Removed)
            .await
            .unwrap();

        match store.purge_upload(&upload.id).await.unwrap() {
            PurgeOutcome::Pending(files) => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].id, stored.id);
                assert_eq!(files[0].status, FileStatus::Removed);
            }
            other => panic!("{}: expected pending, got {other:?}", store.backend_name()),
        }
        assert!(store.get_upload(&upload.id).await.unwrap().is_some());
        assert_eq!(store.count_upload_files(&upload.id).await.unwrap(), 2);

        store
            .update_file_status(&stored.id, FileStatus::Removed, FileStatus::Deleted)
            .await
            .unwrap();
        assert_eq!(
            store.purge_upload(&upload.id).await.unwrap(),
            PurgeOutcome::Purged
        );
        assert!(store.get_upload(&upload.id).await.unwrap().is_none());
        assert!(store.get_files(&upload.id).await.unwrap().is_empty());
        assert!(store.get_file(&stored.id).await.unwrap().is_none());
    })
    .await;
}

#[tokio::test]
async fn test_files_by_status_pages_by_id() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let upload = upload_at(0, 0);
        let removed: Vec<_> = (0..5)
            .map(|i| file_in(&upload.id, &format!("r{i}"), FileStatus::Removed))
            .collect();
        let mut all = removed.clone();
        all.push(file_in(&upload.id, "live", FileStatus::Uploaded));
        store.create_upload(&upload, &all).await.unwrap();

        let mut expected: Vec<_> = removed.iter().map(|f| f.id.clone()).collect();
        expected.sort();

        let mut seen = Vec::new();
        let mut after: Option<FileId> = None;
        loop {
            let batch = store
                .get_files_by_status(FileStatus::Removed, after.as_ref(), 2)
                .await
                .unwrap();
            if batch.is_empty() {
                break;
            }
            assert!(batch.len() <= 2);
            after = batch.last().map(|f| f.id.clone());
            seen.extend(batch.into_iter().map(|f| f.id));
        }
        assert_eq!(seen, expected, "{}", store.backend_name());

        let uploaded = store
            .get_files_by_status(FileStatus::Uploaded, None, 10)
            .await
            .unwrap();
        assert_eq!(uploaded.len(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_visitors_and_statistics() {
    run_metadata_test_all(|store: Arc<dyn MetadataStore>| async move {
        let anonymous = upload_at(0, 0);
        let mut anon_file = file_in(&anonymous.id, "anon.bin", FileStatus::Uploaded);
        anon_file.size = Some(100);
        let mut gone = file_in(&anonymous.id, "gone.bin", FileStatus::Deleted);
        gone.size = Some(5000);

        let owned = user_upload_at("carol", 1);
        let mut owned_file = file_in(&owned.id, "owned.bin", FileStatus::Uploaded);
        owned_file.size = Some(50);
        let pending = file_for(&owned.id, "pending.bin");

        let deleted = upload_at(2, 0);
        let mut deleted_file = file_in(&deleted.id, "old.bin", FileStatus::Uploaded);
        deleted_file.size = Some(7);

        store
            .create_upload(&anonymous, &[anon_file, gone])
            .await
            .unwrap();
        store
            .create_upload(&owned, &[owned_file, pending])
            .await
            .unwrap();
        store.create_upload(&deleted, &[deleted_file]).await.unwrap();
        store.soft_delete_upload(&deleted.id, base_time()).await.unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.uploads, 2, "{}", store.backend_name());
        assert_eq!(stats.anonymous_uploads, 1);
        assert_eq!(stats.files, 3);
        assert_eq!(stats.total_size, 150);
        assert_eq!(stats.anonymous_size, 100);

        let mut uploads = 0;
        store
            .for_each_upload(&mut |_| {
                uploads += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(uploads, 3);

        let mut files = 0;
        store
            .for_each_file(&mut |_| {
                files += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(files, 5);

        // A failing visitor stops the walk and surfaces its error.
        let result = store
            .for_each_upload(&mut |_| Err(MetadataError::Internal("stop".to_string())))
            .await;
        assert!(matches!(result, Err(MetadataError::Internal(_))));
    })
    .await;
}
