//! Client-side file handles.

use crate::error::{ClientError, ClientResult};
use crate::gate::{OnceGate, lock};
use crate::source::{ByteStream, FileSource};
use crate::upload::UploadState;
use parcel_core::{FileId, FileStatus, NewFile};
use std::fmt;
use std::sync::{Arc, Mutex};

pub(crate) struct FileState {
    pub(crate) name: String,
    /// Correlates this object with the record the server creates for it.
    pub(crate) reference: String,
    pub(crate) mime_type: Option<String>,
    source: Mutex<Option<FileSource>>,
    /// The record as last returned by the server.
    remote: Mutex<Option<parcel_core::File>>,
    uploaded: Arc<OnceGate<parcel_core::File>>,
}

impl FileState {
    pub(crate) fn new(
        name: String,
        reference: String,
        mime_type: Option<String>,
        source: FileSource,
    ) -> Self {
        Self {
            name,
            reference,
            mime_type,
            source: Mutex::new(Some(source)),
            remote: Mutex::new(None),
            uploaded: Arc::new(OnceGate::new()),
        }
    }

    /// A file known only from the server. It can be downloaded but not uploaded.
    pub(crate) fn from_remote(file: parcel_core::File) -> Self {
        let uploaded = if file.status == FileStatus::Missing {
            OnceGate::new()
        } else {
            OnceGate::done(file.clone())
        };
        Self {
            name: file.name.clone(),
            reference: file.reference.clone().unwrap_or_else(|| file.id.to_string()),
            mime_type: file.mime_type.clone(),
            source: Mutex::new(None),
            remote: Mutex::new(Some(file)),
            uploaded: Arc::new(uploaded),
        }
    }

    pub(crate) fn remote(&self) -> Option<parcel_core::File> {
        lock(&self.remote).clone()
    }

    pub(crate) fn set_remote(&self, file: parcel_core::File) {
        *lock(&self.remote) = Some(file);
    }

    pub(crate) fn new_file(&self) -> NewFile {
        NewFile {
            name: self.name.clone(),
            reference: Some(self.reference.clone()),
            mime_type: self.mime_type.clone(),
        }
    }

    fn take_source(&self) -> Option<FileSource> {
        lock(&self.source).take()
    }
}

/// A file of an [`Upload`](crate::Upload).
///
/// Handles are cheap to clone and all clones share state: concurrent calls to
/// [`File::upload`] send the data once and return the same result.
#[derive(Clone)]
pub struct File {
    pub(crate) upload: Arc<UploadState>,
    pub(crate) state: Arc<FileState>,
}

impl File {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn reference(&self) -> &str {
        &self.state.reference
    }

    /// Server-assigned ID, once the file is registered.
    pub fn id(&self) -> Option<FileId> {
        self.state.remote().map(|f| f.id)
    }

    /// The server's view of the file.
    pub fn details(&self) -> Option<parcel_core::File> {
        self.state.uploaded.value().or_else(|| self.state.remote())
    }

    pub fn has_been_uploaded(&self) -> bool {
        self.state.uploaded.value().is_some()
    }

    /// Why the upload of this file failed, if it did.
    pub fn error(&self) -> Option<ClientError> {
        self.state.uploaded.outcome().and_then(Result::err)
    }

    /// Send the file's data, creating the upload first if needed.
    pub async fn upload(&self) -> ClientResult<parcel_core::File> {
        let upload = Arc::clone(&self.upload);
        let file = Arc::clone(&self.state);

        self.state
            .uploaded
            .run(move || async move {
                let created = upload.ensure_created().await?;
                let access = upload.access(&created);

                let target = match file.remote() {
                    Some(remote) => remote,
                    // Added after the upload was created.
                    None => {
                        let remote = upload.transport.add_file(&access, &file.new_file()).await?;
                        file.set_remote(remote.clone());
                        remote
                    }
                };

                let source = file
                    .take_source()
                    .ok_or_else(|| ClientError::NoSource(file.name.clone()))?;
                let uploaded = upload.transport.upload_file(&access, &target, source).await?;
                tracing::debug!(
                    upload_id = %access.id,
                    file_id = %uploaded.id,
                    size = ?uploaded.size,
                    "File uploaded"
                );
                file.set_remote(uploaded.clone());
                Ok(uploaded)
            })
            .await
    }

    pub async fn download(&self) -> ClientResult<ByteStream> {
        self.upload.download(&self.state).await
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("name", &self.state.name)
            .field("reference", &self.state.reference)
            .field("id", &self.id())
            .finish()
    }
}
