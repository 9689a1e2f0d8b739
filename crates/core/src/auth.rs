//! Capability checks.
//!
//! The core never identifies users. Mutations are authorized by presenting the
//! upload token (or an admin assertion from the authentication layer), and
//! password-protected downloads by presenting matching basic credentials.

use crate::upload::Upload;
use base64::Engine;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// What a caller presents alongside a request.
#[derive(Clone, Debug, Default)]
pub struct Capability {
    /// Upload token, if supplied.
    pub upload_token: Option<String>,
    /// The authentication layer asserted admin rights.
    pub admin: bool,
    /// Basic credentials, for password-protected downloads.
    pub credentials: Option<Credentials>,
}

impl Capability {
    /// An anonymous caller.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            upload_token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn admin() -> Self {
        Self {
            admin: true,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, login: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            login: login.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Whether the caller may mutate the upload.
    pub fn owns(&self, upload: &Upload) -> bool {
        if self.admin {
            return true;
        }
        match (&self.upload_token, &upload.upload_token) {
            (Some(presented), Some(expected)) => tokens_match(presented, expected),
            _ => false,
        }
    }

    /// Whether the caller may read a password-protected upload.
    pub fn can_read(&self, upload: &Upload) -> bool {
        if !upload.protected_by_password || self.owns(upload) {
            return true;
        }
        match (&self.credentials, &upload.login, &upload.password_hash) {
            (Some(creds), Some(login), Some(hash)) => {
                tokens_match(&creds.login, login)
                    && tokens_match(&hash_credentials(&creds.login, &creds.password), hash)
            }
            _ => false,
        }
    }
}

/// Login and password presented with HTTP basic authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    /// Decode the value of an `Authorization: Basic ...` header.
    pub fn from_basic_header(value: &str) -> Option<Self> {
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (login, password) = decoded.split_once(':')?;
        Some(Self {
            login: login.to_string(),
            password: password.to_string(),
        })
    }

    /// Encode as an `Authorization` header value.
    pub fn to_basic_header(&self) -> String {
        let raw = format!("{}:{}", self.login, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

/// SHA-256 hex digest of `login:password`.
pub fn hash_credentials(login: &str, password: &str) -> String {
    sha256_hex(format!("{login}:{password}").as_bytes())
}

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time string comparison.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadParams;

    fn upload(password: bool) -> Upload {
        let params = UploadParams {
            login: password.then(|| "alice".to_string()),
            password: password.then(|| "hunter2".to_string()),
            ..Default::default()
        };
        Upload::new(&params, 60, crate::now())
    }

    #[test]
    fn token_holder_owns_upload() {
        let upload = upload(false);
        let token = upload.upload_token.clone().unwrap();
        assert!(Capability::with_token(token).owns(&upload));
        assert!(!Capability::with_token("nope").owns(&upload));
        assert!(!Capability::none().owns(&upload));
        assert!(Capability::admin().owns(&upload));
    }

    #[test]
    fn sanitized_upload_is_owned_by_nobody() {
        let mut upload = upload(false);
        let token = upload.upload_token.clone().unwrap();
        upload.sanitize();
        assert!(!Capability::with_token(token).owns(&upload));
    }

    #[test]
    fn password_protected_reads() {
        let upload = upload(true);
        assert!(!Capability::none().can_read(&upload));
        assert!(
            Capability::none()
                .with_credentials("alice", "hunter2")
                .can_read(&upload)
        );
        assert!(
            !Capability::none()
                .with_credentials("alice", "wrong")
                .can_read(&upload)
        );
        assert!(Capability::none().can_read(&self::upload(false)));
    }

    #[test]
    fn basic_header_roundtrip() {
        let creds = Credentials {
            login: "user".to_string(),
            password: "pa:ss".to_string(),
        };
        let header = creds.to_basic_header();
        assert_eq!(Credentials::from_basic_header(&header), Some(creds));
        assert_eq!(Credentials::from_basic_header("Bearer xyz"), None);
    }
}
