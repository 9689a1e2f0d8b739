//! Client against a real server bound to a local port.

use parcel_client::{Client, HttpTransport, UploadAccess, collect};
use parcel_core::config::AppConfig;
use parcel_core::{Credentials, FileStatus, UploadParams};
use parcel_metadata::{MetadataStore, SqliteStore};
use parcel_server::{AppState, create_router};
use parcel_storage::{DataBackend, MemoryBackend};
use std::net::TcpListener;
use std::sync::Arc;

const ADMIN_TOKEN: &str = "test-admin-token";

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Serve a fresh in-memory server and return its base URL.
async fn spawn_server() -> String {
    let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let data: Arc<dyn DataBackend> = Arc::new(MemoryBackend::new());
    let state = AppState::new(AppConfig::for_testing(), data, metadata);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn upload_download_and_delete() {
    if !can_bind_localhost() {
        eprintln!("Skipping e2e tests: cannot bind to localhost");
        return;
    }

    let base_url = spawn_server().await;
    let client = Client::new(&base_url).unwrap();
    let upload = client.new_upload(UploadParams::default());
    let report = upload.add_file_with_type("report.txt", "text/plain", "quarterly numbers");
    let notes = upload.add_file("notes.md", "# notes");

    upload.upload().await.unwrap();
    assert!(report.has_been_uploaded());
    assert_eq!(notes.details().unwrap().status, FileStatus::Uploaded);
    assert_eq!(report.details().unwrap().size, Some(17));

    let body = upload.download_file(&report).await.unwrap();
    assert_eq!(collect(body).await.unwrap(), "quarterly numbers");

    upload.delete().await.unwrap();
    let err = upload.download_file(&notes).await.err().expect("expected download to fail");
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn second_upload_of_a_file_conflicts() {
    if !can_bind_localhost() {
        eprintln!("Skipping e2e tests: cannot bind to localhost");
        return;
    }

    let base_url = spawn_server().await;
    let client = Client::new(&base_url).unwrap();
    let upload = client.new_upload(UploadParams::default());
    let file = upload.add_file("once.bin", "first");
    file.upload().await.unwrap();

    // A second handle on the same server upload tries to send it again.
    let created = upload.details().unwrap();
    let access = UploadAccess {
        upload_token: created.upload_token.clone(),
        ..UploadAccess::new(created.id.clone())
    };
    let transport = HttpTransport::new(&base_url).unwrap();
    let remote = file.details().unwrap();
    let err = parcel_client::Transport::upload_file(&transport, &access, &remote, "second".into())
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{err}");
}

#[tokio::test]
async fn one_shot_files_are_served_once() {
    if !can_bind_localhost() {
        eprintln!("Skipping e2e tests: cannot bind to localhost");
        return;
    }

    let base_url = spawn_server().await;
    let client = Client::new(&base_url).unwrap();
    let upload = client.new_upload(UploadParams {
        one_shot: true,
        ..Default::default()
    });
    let file = upload.add_file("secret.txt", "burn after reading");
    upload.upload().await.unwrap();

    let body = file.download().await.unwrap();
    assert_eq!(collect(body).await.unwrap(), "burn after reading");

    let err = file.download().await.err().expect("expected download to fail");
    assert!(err.is_unavailable(), "{err}");
}

#[tokio::test]
async fn password_protected_upload_can_be_reopened() {
    if !can_bind_localhost() {
        eprintln!("Skipping e2e tests: cannot bind to localhost");
        return;
    }

    let base_url = spawn_server().await;
    let client = Client::new(&base_url).unwrap();
    let upload = client.new_upload(UploadParams {
        login: Some("bob".to_string()),
        password: Some("s3cret".to_string()),
        ..Default::default()
    });
    upload.add_file("private.txt", "for bob only");
    upload.upload().await.unwrap();
    let id = upload.id().unwrap();

    let anonymous = client.open_upload(UploadAccess::new(id.clone())).await;
    assert!(anonymous.unwrap_err().is_unauthorized());

    let reopened = client
        .open_upload(UploadAccess {
            credentials: Some(Credentials {
                login: "bob".to_string(),
                password: "s3cret".to_string(),
            }),
            ..UploadAccess::new(id)
        })
        .await
        .unwrap();
    let files = reopened.files();
    assert_eq!(files.len(), 1);
    assert!(files[0].has_been_uploaded());
    let body = reopened.download_file(&files[0]).await.unwrap();
    assert_eq!(collect(body).await.unwrap(), "for bob only");
}

#[tokio::test]
async fn admin_token_reaches_admin_endpoints() {
    if !can_bind_localhost() {
        eprintln!("Skipping e2e tests: cannot bind to localhost");
        return;
    }

    let base_url = spawn_server().await;
    let transport = HttpTransport::new(&base_url)
        .unwrap()
        .with_admin_token(ADMIN_TOKEN);
    let client = Client::with_transport(Arc::new(transport));

    let upload = client.new_upload(UploadParams {
        user: Some("alice".to_string()),
        ..Default::default()
    });
    let created = upload.create().await.unwrap();
    assert_eq!(created.user.as_deref(), Some("alice"));
}
