//! Client SDK for parcel.
//!
//! ```no_run
//! # async fn run() -> parcel_client::ClientResult<()> {
//! use parcel_client::Client;
//! use parcel_core::UploadParams;
//!
//! let client = Client::new("http://localhost:8080")?;
//! let upload = client.new_upload(UploadParams::default());
//! upload.add_file("hello.txt", "hello world");
//! upload.upload().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod file;
pub mod gate;
pub mod source;
pub mod transport;
pub mod upload;

pub use client::Client;
pub use error::{ClientError, ClientResult};
pub use file::File;
pub use gate::OnceGate;
pub use source::{ByteStream, FileSource, collect};
pub use transport::{HttpTransport, Transport, UploadAccess};
pub use upload::Upload;
