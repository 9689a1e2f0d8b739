//! Client-side upload handles.

use crate::error::{ClientError, ClientResult};
use crate::file::{File, FileState};
use crate::gate::{OnceGate, lock};
use crate::source::{ByteStream, FileSource};
use crate::transport::{Transport, UploadAccess};
use parcel_core::{CreateUpload, Credentials, UploadId, UploadParams, UploadView};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Login the server assigns to password-protected uploads created without one.
pub const DEFAULT_LOGIN: &str = "parcel";

pub(crate) struct UploadState {
    pub(crate) transport: Arc<dyn Transport>,
    params: UploadParams,
    files: Mutex<Vec<Arc<FileState>>>,
    created: Arc<OnceGate<parcel_core::Upload>>,
}

impl UploadState {
    /// Create the upload on the server unless that already happened.
    pub(crate) async fn ensure_created(self: &Arc<Self>) -> ClientResult<parcel_core::Upload> {
        let state = Arc::clone(self);
        self.created.run(move || state.create_remote()).await
    }

    async fn create_remote(self: Arc<Self>) -> ClientResult<parcel_core::Upload> {
        let files = lock(&self.files).clone();
        let request = CreateUpload {
            params: self.params.clone(),
            files: files.iter().map(|f| f.new_file()).collect(),
        };

        let view = self.transport.create_upload(&request).await?;
        reconcile(&files, view.files)?;
        tracing::debug!(upload_id = %view.upload.id, files = files.len(), "Upload created");
        Ok(view.upload)
    }

    pub(crate) fn access(&self, upload: &parcel_core::Upload) -> UploadAccess {
        let credentials = self.params.password.as_ref().map(|password| Credentials {
            login: self
                .params
                .login
                .clone()
                .or_else(|| upload.login.clone())
                .unwrap_or_else(|| DEFAULT_LOGIN.to_string()),
            password: password.clone(),
        });
        UploadAccess {
            id: upload.id.clone(),
            upload_token: upload.upload_token.clone(),
            credentials,
            stream: upload.stream,
        }
    }

    pub(crate) async fn download(&self, file: &FileState) -> ClientResult<ByteStream> {
        let created = self.created.value().ok_or(ClientError::NotCreated)?;
        let remote = file.remote().ok_or(ClientError::NotCreated)?;
        self.transport
            .download_file(&self.access(&created), &remote)
            .await
    }
}

/// Match the files returned by the server to local ones by reference.
fn reconcile(local: &[Arc<FileState>], remote: Vec<parcel_core::File>) -> ClientResult<()> {
    if remote.len() != local.len() {
        return Err(ClientError::Protocol(format!(
            "sent {} files but the server registered {}",
            local.len(),
            remote.len()
        )));
    }

    let mut matched = Vec::with_capacity(remote.len());
    let mut seen = HashSet::new();
    for file in remote {
        let index = file
            .reference
            .as_deref()
            .and_then(|reference| local.iter().position(|l| l.reference == reference));
        let Some(index) = index else {
            return Err(ClientError::Protocol(format!(
                "no local file matches reference {:?}",
                file.reference
            )));
        };
        if !seen.insert(index) {
            return Err(ClientError::Protocol(format!(
                "the server registered reference {:?} twice",
                file.reference
            )));
        }
        matched.push((index, file));
    }

    // Equal lengths and no repeats leave every local file matched exactly once.
    for (index, file) in matched {
        local[index].set_remote(file);
    }
    Ok(())
}

/// A set of files shared under one policy.
///
/// Files are added locally, then [`Upload::create`] registers the upload and
/// its files in one round trip and [`Upload::upload`] sends their data.
/// Clones share state, and creation happens at most once across all of them.
#[derive(Clone)]
pub struct Upload {
    state: Arc<UploadState>,
}

impl Upload {
    pub(crate) fn new(transport: Arc<dyn Transport>, params: UploadParams) -> Self {
        Self {
            state: Arc::new(UploadState {
                transport,
                params,
                files: Mutex::new(Vec::new()),
                created: Arc::new(OnceGate::new()),
            }),
        }
    }

    /// An upload that already exists on the server.
    pub(crate) fn existing(
        transport: Arc<dyn Transport>,
        params: UploadParams,
        view: UploadView,
    ) -> Self {
        let files = view
            .files
            .into_iter()
            .map(|f| Arc::new(FileState::from_remote(f)))
            .collect();
        Self {
            state: Arc::new(UploadState {
                transport,
                params,
                files: Mutex::new(files),
                created: Arc::new(OnceGate::done(view.upload)),
            }),
        }
    }

    pub fn params(&self) -> &UploadParams {
        &self.state.params
    }

    /// Add a file. Its reference is its position in the upload.
    pub fn add_file(&self, name: impl Into<String>, source: impl Into<FileSource>) -> File {
        self.push(name.into(), None, source.into())
    }

    /// Add a file with a declared content type.
    pub fn add_file_with_type(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        source: impl Into<FileSource>,
    ) -> File {
        self.push(name.into(), Some(mime_type.into()), source.into())
    }

    /// Add a local file, named after the last component of its path.
    pub async fn add_path(&self, path: impl AsRef<Path>) -> ClientResult<File> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::Io(format!("{} has no file name", path.display())))?;
        let source = FileSource::open(path).await?;
        Ok(self.push(name, None, source))
    }

    fn push(&self, name: String, mime_type: Option<String>, source: FileSource) -> File {
        let mut files = lock(&self.state.files);
        let reference = files.len().to_string();
        let state = Arc::new(FileState::new(name, reference, mime_type, source));
        files.push(Arc::clone(&state));
        File {
            upload: Arc::clone(&self.state),
            state,
        }
    }

    pub fn files(&self) -> Vec<File> {
        lock(&self.state.files)
            .iter()
            .map(|state| File {
                upload: Arc::clone(&self.state),
                state: Arc::clone(state),
            })
            .collect()
    }

    pub fn id(&self) -> Option<UploadId> {
        self.details().map(|u| u.id)
    }

    pub fn has_been_created(&self) -> bool {
        self.state.created.value().is_some()
    }

    /// The server's view of the upload, once created.
    pub fn details(&self) -> Option<parcel_core::Upload> {
        self.state.created.value()
    }

    /// Create the upload and register its current files on the server.
    pub async fn create(&self) -> ClientResult<parcel_core::Upload> {
        self.state.ensure_created().await
    }

    /// Create the upload if needed, then send every file concurrently.
    pub async fn upload(&self) -> ClientResult<()> {
        self.create().await?;

        let files = self.files();
        let outcomes = futures::future::join_all(files.iter().map(|f| f.upload())).await;
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        if failed > 0 {
            tracing::warn!(failed, total = files.len(), "Some files failed to upload");
            return Err(ClientError::Incomplete {
                failed,
                total: files.len(),
            });
        }
        Ok(())
    }

    pub async fn download_file(&self, file: &File) -> ClientResult<ByteStream> {
        self.state.download(&file.state).await
    }

    /// Remove the upload and all of its files from the server.
    pub async fn delete(&self) -> ClientResult<()> {
        let created = self.details().ok_or(ClientError::NotCreated)?;
        self.state
            .transport
            .remove_upload(&self.state.access(&created))
            .await
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("id", &self.id())
            .field("files", &lock(&self.state.files).len())
            .finish()
    }
}
