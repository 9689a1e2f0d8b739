//! Entry point of the SDK.

use crate::error::ClientResult;
use crate::transport::{HttpTransport, Transport, UploadAccess};
use crate::upload::Upload;
use parcel_core::UploadParams;
use std::sync::Arc;

/// A parcel server, as seen by the SDK.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
}

impl Client {
    /// Talk to the server at `base_url` over HTTP.
    pub fn new(base_url: &str) -> ClientResult<Self> {
        Ok(Self::with_transport(Arc::new(HttpTransport::new(base_url)?)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Start a new upload. Nothing is sent until it is created or uploaded.
    pub fn new_upload(&self, params: UploadParams) -> Upload {
        Upload::new(Arc::clone(&self.transport), params)
    }

    /// Open an upload that already exists on the server.
    ///
    /// Its files can be downloaded, and with its upload token the upload can
    /// be deleted.
    pub async fn open_upload(&self, access: UploadAccess) -> ClientResult<Upload> {
        let mut view = self.transport.get_upload(&access).await?;
        if view.upload.upload_token.is_none() {
            view.upload.upload_token = access.upload_token.clone();
        }

        let params = UploadParams {
            one_shot: view.upload.one_shot,
            removable: view.upload.removable,
            stream: view.upload.stream,
            ttl: Some(view.upload.ttl),
            comments: view.upload.comments.clone(),
            login: access.credentials.as_ref().map(|c| c.login.clone()),
            password: access.credentials.as_ref().map(|c| c.password.clone()),
            ..Default::default()
        };
        Ok(Upload::existing(Arc::clone(&self.transport), params, view))
    }
}
