//! Shared test utilities for the client SDK.

use async_trait::async_trait;
use bytes::Bytes;
use parcel_client::{ByteStream, ClientError, ClientResult, FileSource, Transport, UploadAccess};
use parcel_core::{CreateUpload, File, FileId, FileStatus, NewFile, Upload, UploadView};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// In-process transport that records calls and keeps file data in memory.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockTransport {
    creates: AtomicUsize,
    adds: AtomicUsize,
    uploads: AtomicUsize,
    removes: AtomicUsize,
    data: Mutex<HashMap<FileId, Bytes>>,
    /// Reference the server echoes instead of the one sent.
    wrong_reference: Option<String>,
    /// Name of a file whose upload fails.
    failing_file: Option<String>,
    latency: Duration,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(20),
            ..Default::default()
        }
    }

    pub fn echoing_reference(mut self, reference: &str) -> Self {
        self.wrong_reference = Some(reference.to_string());
        self
    }

    pub fn failing_on(mut self, name: &str) -> Self {
        self.failing_file = Some(name.to_string());
        self
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    fn placeholder(access_id: &parcel_core::UploadId, new: &NewFile) -> File {
        let mut file = File::new(access_id.clone(), new.name.clone(), new.reference.clone());
        file.mime_type = new.mime_type.clone();
        file
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_upload(&self, request: &CreateUpload) -> ClientResult<UploadView> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        let upload = Upload::new(&request.params, 3600, parcel_core::now());
        let files = request
            .files
            .iter()
            .map(|new| {
                let mut file = Self::placeholder(&upload.id, new);
                if let Some(reference) = &self.wrong_reference {
                    file.reference = Some(reference.clone());
                }
                file
            })
            .collect();
        Ok(UploadView { upload, files })
    }

    async fn get_upload(&self, _access: &UploadAccess) -> ClientResult<UploadView> {
        Err(ClientError::Api {
            status: 404,
            code: "not_found".to_string(),
            message: "upload not found".to_string(),
        })
    }

    async fn add_file(&self, access: &UploadAccess, file: &NewFile) -> ClientResult<File> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(Self::placeholder(&access.id, file))
    }

    async fn upload_file(
        &self,
        access: &UploadAccess,
        file: &File,
        source: FileSource,
    ) -> ClientResult<File> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        assert!(access.upload_token.is_some(), "uploads carry the upload token");
        tokio::time::sleep(self.latency).await;

        if self.failing_file.as_deref() == Some(file.name.as_str()) {
            return Err(ClientError::Api {
                status: 502,
                code: "backend_error".to_string(),
                message: "storage unavailable".to_string(),
            });
        }

        let bytes = match source {
            FileSource::Bytes(bytes) => bytes,
            FileSource::Stream(stream) => parcel_client::collect(stream).await?,
        };
        let mut uploaded = file.clone();
        uploaded.status = FileStatus::Uploaded;
        uploaded.size = Some(bytes.len() as u64);
        self.data.lock().unwrap().insert(file.id.clone(), bytes);
        Ok(uploaded)
    }

    async fn download_file(&self, _access: &UploadAccess, file: &File) -> ClientResult<ByteStream> {
        let bytes = self.data.lock().unwrap().get(&file.id).cloned();
        match bytes {
            Some(bytes) => Ok(Box::pin(futures::stream::once(async move { Ok(bytes) }))),
            None => Err(ClientError::Api {
                status: 404,
                code: "unavailable".to_string(),
                message: "file is missing".to_string(),
            }),
        }
    }

    async fn remove_upload(&self, _access: &UploadAccess) -> ClientResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
