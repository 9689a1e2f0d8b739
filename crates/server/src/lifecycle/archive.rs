//! Zip archives of an upload's files.

use super::error::{LifecycleError, LifecycleResult};
use bytes::Bytes;
use futures::StreamExt;
use parcel_storage::ByteStream;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

/// Builds a zip archive in memory, one entry per file.
pub struct ZipBuilder {
    zip: ZipWriter<Cursor<Vec<u8>>>,
    names: HashSet<String>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self {
            zip: ZipWriter::new(Cursor::new(Vec::new())),
            names: HashSet::new(),
        }
    }

    /// Append one entry, copying `body` chunk by chunk.
    pub async fn add(
        &mut self,
        name: &str,
        fallback: &str,
        mut body: ByteStream,
    ) -> LifecycleResult<()> {
        let name = self.entry_name(name, fallback);
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);
        self.zip
            .start_file(name.as_str(), options)
            .map_err(|e| LifecycleError::Archive(format!("cannot add {name}: {e}")))?;

        while let Some(chunk) = body.next().await {
            self.zip
                .write_all(&chunk?)
                .map_err(|e| LifecycleError::Archive(format!("cannot write {name}: {e}")))?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> LifecycleResult<Bytes> {
        let cursor = self
            .zip
            .finish()
            .map_err(|e| LifecycleError::Archive(format!("cannot finalize archive: {e}")))?;
        Ok(Bytes::from(cursor.into_inner()))
    }

    /// Base name of `name`, made unique within the archive.
    fn entry_name(&mut self, name: &str, fallback: &str) -> String {
        let base = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .unwrap_or(fallback)
            .to_string();

        let mut candidate = base.clone();
        let mut n = 1;
        while !self.names.insert(candidate.clone()) {
            candidate = format!("{n}_{base}");
            n += 1;
        }
        candidate
    }
}

impl Default for ZipBuilder {
    fn default() -> Self {
        Self::new()
    }
}
