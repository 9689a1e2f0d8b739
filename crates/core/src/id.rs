//! Random identifiers and capability secrets.
//!
//! Upload and file identifiers are short random strings over `[a-zA-Z0-9]`.
//! They are unguessable but are not secrets; the upload token is.

use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of upload and file identifiers.
pub const ID_LENGTH: usize = 16;

/// Length of upload tokens.
pub const TOKEN_LENGTH: usize = 32;

/// Generate a random alphanumeric string from a cryptographically secure RNG.
pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

/// Generate a new upload token.
pub fn new_upload_token() -> String {
    random_string(TOKEN_LENGTH)
}

fn validate(kind: &str, s: &str) -> crate::Result<()> {
    if s.len() != ID_LENGTH || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(crate::Error::InvalidId(format!("invalid {kind} ID: {s:?}")));
    }
    Ok(())
}

macro_rules! random_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a new random ID.
            pub fn new() -> Self {
                Self(random_string(ID_LENGTH))
            }

            /// Parse and validate an ID received from outside.
            pub fn parse(s: &str) -> crate::Result<Self> {
                validate($kind, s)?;
                Ok(Self(s.to_string()))
            }

            /// Wrap a value read back from a trusted store without validation.
            pub fn from_stored(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

random_id!(
    /// Unique identifier for an upload.
    UploadId,
    "upload"
);

random_id!(
    /// Unique identifier for a file within an upload.
    FileId,
    "file"
);
