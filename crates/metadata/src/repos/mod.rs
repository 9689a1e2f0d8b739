//! Repository traits for metadata operations.

pub mod files;
pub mod uploads;

pub use files::FileRepo;
pub use uploads::UploadRepo;

use crate::error::MetadataResult;
use parcel_core::{File, Upload};

/// Visitor for full scans of uploads.
pub type UploadVisitor<'a> = dyn FnMut(&Upload) -> MetadataResult<()> + Send + 'a;

/// Visitor for full scans of files.
pub type FileVisitor<'a> = dyn FnMut(&File) -> MetadataResult<()> + Send + 'a;
