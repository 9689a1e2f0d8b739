//! Core domain types and shared logic for parcel.
//!
//! This crate defines the data model used across all other crates:
//! - Uploads, files and the file status state machine
//! - Random identifiers and capability checks
//! - Cursor pagination
//! - Configuration

pub mod auth;
pub mod config;
pub mod error;
pub mod file;
pub mod id;
pub mod paging;
pub mod timestamp;
pub mod upload;

pub use auth::{Capability, Credentials};
pub use error::{Error, Result};
pub use file::{File, FileStatus, NewFile};
pub use id::{FileId, UploadId};
pub use paging::{Cursor, Page, PageWindow, PagingQuery, SortOrder};
pub use timestamp::now;
pub use upload::{CreateUpload, Upload, UploadFilter, UploadParams, UploadView};
