//! Wire access to a parcel server.

use crate::error::{ClientError, ClientResult};
use crate::source::{ByteStream, FileSource};
use async_trait::async_trait;
use futures::TryStreamExt;
use parcel_core::{CreateUpload, Credentials, File, NewFile, UploadId, UploadView};
use reqwest::{RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;

/// Header carrying an upload's capability token.
pub const UPLOAD_TOKEN_HEADER: &str = "X-UploadToken";

/// What a request needs to act on an existing upload.
#[derive(Clone, Debug)]
pub struct UploadAccess {
    pub id: UploadId,
    pub upload_token: Option<String>,
    pub credentials: Option<Credentials>,
    /// Stream uploads are downloaded from their own route.
    pub stream: bool,
}

impl UploadAccess {
    pub fn new(id: UploadId) -> Self {
        Self {
            id,
            upload_token: None,
            credentials: None,
            stream: false,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_upload(&self, request: &CreateUpload) -> ClientResult<UploadView>;

    async fn get_upload(&self, access: &UploadAccess) -> ClientResult<UploadView>;

    /// Register a file on an upload that already exists.
    async fn add_file(&self, access: &UploadAccess, file: &NewFile) -> ClientResult<File>;

    async fn upload_file(
        &self,
        access: &UploadAccess,
        file: &File,
        source: FileSource,
    ) -> ClientResult<File>;

    async fn download_file(&self, access: &UploadAccess, file: &File) -> ClientResult<ByteStream>;

    async fn remove_upload(&self, access: &UploadAccess) -> ClientResult<()>;
}

/// [`Transport`] over the server's HTTP API.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    admin_token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            admin_token: None,
        })
    }

    /// Authenticate every request as an administrator.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn file_url(&self, access: &UploadAccess, file: &File, mode: &str) -> ClientResult<Url> {
        self.url([mode, access.id.as_str(), file.id.as_str(), file.name.as_str()])
    }

    fn authorize(&self, req: RequestBuilder, access: Option<&UploadAccess>) -> RequestBuilder {
        let mut req = req;
        if let Some(access) = access {
            if let Some(token) = &access.upload_token {
                req = req.header(UPLOAD_TOKEN_HEADER, token);
            }
            // The server reads Basic credentials only without an admin bearer.
            if self.admin_token.is_none()
                && let Some(credentials) = &access.credentials
            {
                req = req.basic_auth(&credentials.login, Some(&credentials.password));
            }
        }
        if let Some(token) = &self.admin_token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> ClientResult<Response> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), "request failed");
            return Err(ClientError::from_response(status.as_u16(), &body));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> ClientResult<T> {
        let body = self.send(req).await?.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ClientError::Protocol(format!("unexpected response body: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_upload(&self, request: &CreateUpload) -> ClientResult<UploadView> {
        let url = self.url(["upload"])?;
        let req = self.authorize(self.http.post(url).json(request), None);
        self.send_json(req).await
    }

    async fn get_upload(&self, access: &UploadAccess) -> ClientResult<UploadView> {
        let url = self.url(["upload", access.id.as_str()])?;
        let req = self.authorize(self.http.get(url), Some(access));
        self.send_json(req).await
    }

    async fn add_file(&self, access: &UploadAccess, file: &NewFile) -> ClientResult<File> {
        let url = self.url(["file", access.id.as_str()])?;
        let req = self.authorize(self.http.post(url).json(file), Some(access));
        self.send_json(req).await
    }

    async fn upload_file(
        &self,
        access: &UploadAccess,
        file: &File,
        source: FileSource,
    ) -> ClientResult<File> {
        let url = self.file_url(access, file, "file")?;
        let req = self.authorize(self.http.post(url).body(source.into_body()), Some(access));
        self.send_json(req).await
    }

    async fn download_file(&self, access: &UploadAccess, file: &File) -> ClientResult<ByteStream> {
        let mode = if access.stream { "stream" } else { "file" };
        let url = self.file_url(access, file, mode)?;
        let req = self.authorize(self.http.get(url), Some(access));
        let response = self.send(req).await?;
        Ok(Box::pin(response.bytes_stream().map_err(std::io::Error::other)))
    }

    async fn remove_upload(&self, access: &UploadAccess) -> ClientResult<()> {
        let url = self.url(["upload", access.id.as_str()])?;
        let req = self.authorize(self.http.delete(url), Some(access));
        self.send(req).await?;
        Ok(())
    }
}
