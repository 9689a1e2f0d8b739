//! Embedded key-value metadata store backed by redb.
//!
//! Records are JSON documents in the `uploads` and `files` tables. Every query
//! other than a lookup by ID goes through the `index` table, whose entries are
//! derived by [`index`] and rewritten in the same transaction as the record.
//! redb is synchronous, so every operation runs on the blocking pool.

pub mod index;

use crate::error::{MetadataError, MetadataResult};
use crate::models::{PurgeOutcome, Statistics};
use crate::repos::files::check_update;
use crate::repos::{FileRepo, FileVisitor, UploadRepo, UploadVisitor};
use crate::store::MetadataStore;
use async_trait::async_trait;
use index::Entry;
use parcel_core::paging::Seek;
use parcel_core::timestamp::to_micros;
use parcel_core::{
    Cursor, File, FileId, FileStatus, Page, PagingQuery, Upload, UploadFilter, UploadId,
};
use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;

const UPLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("uploads");
const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");
const INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index");

/// Records handed to a visitor per blocking round trip.
const SCAN_BATCH: usize = 256;

/// Index drift found by [`RedbStore::verify_indices`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexReport {
    /// Entries present in the index but not derivable from any record.
    pub orphaned: Vec<Vec<u8>>,
    /// Entries derivable from a record but absent or holding another value.
    pub missing: Vec<Vec<u8>>,
}

impl IndexReport {
    pub fn is_consistent(&self) -> bool {
        self.orphaned.is_empty() && self.missing.is_empty()
    }
}

/// redb-based metadata store.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (creating if needed) a database file.
    pub async fn open(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || -> MetadataResult<Database> {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Database::create(&path)?)
        })
        .await
        .map_err(join_error)??;

        let store = Self { db: Arc::new(db) };
        store.migrate().await?;
        Ok(store)
    }

    /// Open a database that lives only in memory.
    pub async fn in_memory() -> MetadataResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        let store = Self { db: Arc::new(db) };
        store.migrate().await?;
        Ok(store)
    }

    async fn blocking<T, F>(&self, f: F) -> MetadataResult<T>
    where
        F: FnOnce(&Database) -> MetadataResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(join_error)?
    }

    /// Recompute every index entry from the records and compare with the stored index.
    pub async fn verify_indices(&self) -> MetadataResult<IndexReport> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            let uploads = txn.open_table(UPLOADS)?;
            let files = txn.open_table(FILES)?;
            let index = txn.open_table(INDEX)?;

            let mut expected: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            for entry in uploads.iter()? {
                let (_, value) = entry?;
                let upload: Upload = serde_json::from_slice(value.value())?;
                expected.extend(index::upload_entries(&upload));
            }
            for entry in files.iter()? {
                let (_, value) = entry?;
                let file: File = serde_json::from_slice(value.value())?;
                expected.extend(index::file_entries(&file));
            }

            let mut report = IndexReport::default();
            let mut seen = BTreeSet::new();
            for entry in index.iter()? {
                let (key, value) = entry?;
                let key = key.value().to_vec();
                match expected.get(&key) {
                    Some(want) if want.as_slice() == value.value() => {}
                    Some(_) => report.missing.push(key.clone()),
                    None => report.orphaned.push(key.clone()),
                }
                seen.insert(key);
            }
            report.missing.extend(
                expected
                    .into_keys()
                    .filter(|key| !seen.contains(key)),
            );
            Ok(report)
        })
        .await
    }
}

fn join_error(err: tokio::task::JoinError) -> MetadataError {
    MetadataError::Internal(format!("blocking task failed: {err}"))
}

// =============================================================================
// Table helpers (run on the blocking pool)
// =============================================================================

fn load<T, R>(table: &R, id: &str) -> MetadataResult<Option<T>>
where
    T: serde::de::DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

/// Keys and values of index entries starting with `prefix`, optionally strictly after `after`.
fn scan_prefix<R>(index: &R, prefix: &[u8], after: Option<&[u8]>) -> MetadataResult<Vec<Entry>>
where
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    let start = match after {
        Some(after) => Bound::Excluded(after),
        None => Bound::Included(prefix),
    };
    let end = index::prefix_end(prefix);
    let end = match &end {
        Some(end) => Bound::Excluded(end.as_slice()),
        None => Bound::Unbounded,
    };

    let mut out = Vec::new();
    for entry in index.range::<&[u8]>((start, end))? {
        let (key, value) = entry?;
        out.push((key.value().to_vec(), value.value().to_vec()));
    }
    Ok(out)
}

fn suffix_str(key: &[u8], skip: usize) -> MetadataResult<String> {
    key.get(skip..)
        .and_then(|rest| std::str::from_utf8(rest).ok())
        .map(str::to_string)
        .ok_or_else(|| MetadataError::Corrupt("malformed index key".to_string()))
}

fn files_of<R, I>(files: &R, index: &I, upload_id: &str) -> MetadataResult<Vec<File>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
    I: ReadableTable<&'static [u8], &'static [u8]>,
{
    let prefix = index::upload_files_prefix(upload_id);
    let mut out = Vec::new();
    for (key, _) in scan_prefix(index, &prefix, None)? {
        let file_id = suffix_str(&key, prefix.len())?;
        match load::<File, _>(files, &file_id)? {
            Some(file) => out.push(file),
            None => {
                return Err(MetadataError::Corrupt(format!(
                    "index lists missing file {file_id}"
                )));
            }
        }
    }
    out.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    Ok(out)
}

fn reindex(
    index: &mut Table<&'static [u8], &'static [u8]>,
    old: Vec<Entry>,
    new: Vec<Entry>,
) -> MetadataResult<()> {
    for (key, _) in old {
        index.remove(key.as_slice())?;
    }
    for (key, value) in new {
        index.insert(key.as_slice(), value.as_slice())?;
    }
    Ok(())
}

fn save_upload(
    uploads: &mut Table<&'static str, &'static [u8]>,
    index: &mut Table<&'static [u8], &'static [u8]>,
    old: Option<&Upload>,
    new: &Upload,
) -> MetadataResult<()> {
    let old_entries = old.map(index::upload_entries).unwrap_or_default();
    reindex(index, old_entries, index::upload_entries(new))?;
    uploads.insert(new.id.as_str(), serde_json::to_vec(new)?.as_slice())?;
    Ok(())
}

fn save_file(
    files: &mut Table<&'static str, &'static [u8]>,
    index: &mut Table<&'static [u8], &'static [u8]>,
    old: Option<&File>,
    new: &File,
) -> MetadataResult<()> {
    let old_entries = old.map(index::file_entries).unwrap_or_default();
    reindex(index, old_entries, index::file_entries(new))?;
    files.insert(new.id.as_str(), serde_json::to_vec(new)?.as_slice())?;
    Ok(())
}

/// Load, mutate and save one alive upload. Returns false if it was missing or deleted.
fn update_alive_upload(
    db: &Database,
    id: &str,
    mutate: impl FnOnce(&mut Upload),
) -> MetadataResult<bool> {
    let txn = db.begin_write()?;
    let updated = {
        let mut uploads = txn.open_table(UPLOADS)?;
        let mut index = txn.open_table(INDEX)?;
        match load::<Upload, _>(&uploads, id)? {
            Some(old) if !old.is_deleted() => {
                let mut new = old.clone();
                mutate(&mut new);
                save_upload(&mut uploads, &mut index, Some(&old), &new)?;
                true
            }
            _ => false,
        }
    };
    if updated {
        txn.commit()?;
    } else {
        txn.abort()?;
    }
    Ok(updated)
}

/// Compare-and-set a file inside one write transaction.
fn update_file_if(
    db: &Database,
    id: &str,
    expected: FileStatus,
    mutate: impl FnOnce(&mut File),
) -> MetadataResult<File> {
    let txn = db.begin_write()?;
    let result = {
        let mut files = txn.open_table(FILES)?;
        let mut index = txn.open_table(INDEX)?;
        match load::<File, _>(&files, id)? {
            None => Err(MetadataError::NotFound(format!("file {id}"))),
            Some(old) if old.status != expected => Err(MetadataError::Conflict {
                id: id.to_string(),
                expected,
                actual: old.status,
            }),
            Some(old) => {
                let mut new = old.clone();
                mutate(&mut new);
                save_file(&mut files, &mut index, Some(&old), &new)?;
                Ok(new)
            }
        }
    };
    match result {
        Ok(file) => {
            txn.commit()?;
            Ok(file)
        }
        Err(err) => {
            txn.abort()?;
            Err(err)
        }
    }
}

#[async_trait]
impl MetadataStore for RedbStore {
    async fn migrate(&self) -> MetadataResult<()> {
        self.blocking(|db| {
            let txn = db.begin_write()?;
            txn.open_table(UPLOADS)?;
            txn.open_table(FILES)?;
            txn.open_table(INDEX)?;
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            txn.open_table(UPLOADS)?.len()?;
            Ok(())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "redb"
    }
}

#[async_trait]
impl UploadRepo for RedbStore {
    async fn create_upload(&self, upload: &Upload, files: &[File]) -> MetadataResult<()> {
        let upload = upload.clone();
        let files = files.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut uploads = txn.open_table(UPLOADS)?;
                let mut files_table = txn.open_table(FILES)?;
                let mut index = txn.open_table(INDEX)?;

                if uploads.get(upload.id.as_str())?.is_some() {
                    return Err(MetadataError::AlreadyExists(format!("upload {}", upload.id)));
                }
                save_upload(&mut uploads, &mut index, None, &upload)?;

                for file in &files {
                    if file.upload_id != upload.id {
                        return Err(MetadataError::Internal(format!(
                            "file {} belongs to upload {}, not {}",
                            file.id, file.upload_id, upload.id
                        )));
                    }
                    if files_table.get(file.id.as_str())?.is_some() {
                        return Err(MetadataError::AlreadyExists(format!("file {}", file.id)));
                    }
                    save_file(&mut files_table, &mut index, None, file)?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_upload(&self, id: &UploadId) -> MetadataResult<Option<Upload>> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            load(&txn.open_table(UPLOADS)?, &id)
        })
        .await
    }

    async fn list_uploads(
        &self,
        filter: &UploadFilter,
        paging: &PagingQuery,
    ) -> MetadataResult<Page<Upload>> {
        let window = paging.window()?;
        let filter = filter.clone();
        let key = |u: &Upload| Cursor::new(u.created_at, u.id.as_str());

        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let uploads = txn.open_table(UPLOADS)?;
            let index = txn.open_table(INDEX)?;

            if let Some(user) = &filter.user {
                // Per-user listings are small: gather them and page in memory.
                let prefix = index::user_prefix(user);
                let mut items = Vec::new();
                for (entry_key, token) in scan_prefix(&index, &prefix, None)? {
                    if let Some(want) = &filter.token
                        && want.as_bytes() != token.as_slice()
                    {
                        continue;
                    }
                    let id = suffix_str(&entry_key, prefix.len() + index::TS_LEN)?;
                    if let Some(upload) = load::<Upload, _>(&uploads, &id)?
                        && filter.matches(&upload)
                    {
                        items.push(upload);
                    }
                }
                return Ok(window.apply(items, key));
            }

            let prefix_len = index::CREATED.len();
            let seek_key = window.seek.as_ref().map(|(cursor, seek)| {
                let mut k = index::CREATED.to_vec();
                k.extend_from_slice(&index::encode_ts(cursor.created_at));
                k.extend_from_slice(cursor.id.as_bytes());
                (k, *seek)
            });
            let end = index::prefix_end(index::CREATED).unwrap_or_default();
            let (lower, upper) = match &seek_key {
                None => (
                    Bound::Included(index::CREATED),
                    Bound::Excluded(end.as_slice()),
                ),
                Some((k, Seek::Below)) => {
                    (Bound::Included(index::CREATED), Bound::Excluded(k.as_slice()))
                }
                Some((k, Seek::Above)) => {
                    (Bound::Excluded(k.as_slice()), Bound::Excluded(end.as_slice()))
                }
            };

            let range = index.range::<&[u8]>((lower, upper))?;
            let entries: Box<dyn Iterator<Item = _>> = if window.descending {
                Box::new(range.rev())
            } else {
                Box::new(range)
            };

            let mut rows = Vec::new();
            for entry in entries {
                if rows.len() >= window.fetch_limit() {
                    break;
                }
                let (k, _) = entry?;
                let id = suffix_str(k.value(), prefix_len + index::TS_LEN)?;
                if let Some(upload) = load::<Upload, _>(&uploads, &id)?
                    && filter.matches(&upload)
                {
                    rows.push(upload);
                }
            }
            Ok(window.finish(rows, key))
        })
        .await
    }

    async fn for_each_upload(&self, visit: &mut UploadVisitor<'_>) -> MetadataResult<()> {
        let mut after: Option<String> = None;
        loop {
            let start = after.clone();
            let batch: Vec<Upload> = self
                .blocking(move |db| {
                    let txn = db.begin_read()?;
                    let uploads = txn.open_table(UPLOADS)?;
                    let lower = match &start {
                        Some(id) => Bound::Excluded(id.as_str()),
                        None => Bound::Unbounded,
                    };
                    let mut out = Vec::new();
                    for entry in uploads.range::<&str>((lower, Bound::Unbounded))?.take(SCAN_BATCH)
                    {
                        let (_, value) = entry?;
                        out.push(serde_json::from_slice(value.value())?);
                    }
                    Ok(out)
                })
                .await?;

            for upload in &batch {
                visit(upload)?;
            }
            if batch.len() < SCAN_BATCH {
                return Ok(());
            }
            after = batch.last().map(|u| u.id.to_string());
        }
    }

    async fn get_expired_uploads(
        &self,
        now: OffsetDateTime,
        after: Option<&UploadId>,
        limit: u32,
    ) -> MetadataResult<Vec<Upload>> {
        let now = to_micros(now);
        let after = after.map(|id| id.to_string());
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let uploads = txn.open_table(UPLOADS)?;
            let index = txn.open_table(INDEX)?;

            let prefix_len = index::EXPIRING.len();
            let mut ids = Vec::new();
            for (key, _) in scan_prefix(&index, index::EXPIRING, None)? {
                let expire_at = index::decode_ts(&key[prefix_len..])
                    .ok_or_else(|| MetadataError::Corrupt("malformed index key".to_string()))?;
                if expire_at > now {
                    break;
                }
                let id = suffix_str(&key, prefix_len + index::TS_LEN)?;
                if after.as_deref().is_none_or(|after| id.as_str() > after) {
                    ids.push(id);
                }
            }
            ids.sort();
            ids.truncate(limit as usize);

            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(upload) = load::<Upload, _>(&uploads, &id)? {
                    out.push(upload);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn get_deleted_uploads(
        &self,
        after: Option<&UploadId>,
        limit: u32,
    ) -> MetadataResult<Vec<Upload>> {
        let after = after.map(|id| index::deleted_key(id.as_str()));
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let uploads = txn.open_table(UPLOADS)?;
            let index = txn.open_table(INDEX)?;

            let mut out = Vec::new();
            for (key, _) in scan_prefix(&index, index::DELETED, after.as_deref())? {
                if out.len() >= limit as usize {
                    break;
                }
                let id = suffix_str(&key, index::DELETED.len())?;
                if let Some(upload) = load::<Upload, _>(&uploads, &id)? {
                    out.push(upload);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn soft_delete_upload(&self, id: &UploadId, now: OffsetDateTime) -> MetadataResult<bool> {
        let id = id.to_string();
        self.blocking(move |db| {
            update_alive_upload(db, &id, |upload| upload.deleted_at = Some(now))
        })
        .await
    }

    async fn set_upload_expiration(
        &self,
        id: &UploadId,
        ttl: i64,
        expire_at: Option<OffsetDateTime>,
    ) -> MetadataResult<bool> {
        let id = id.to_string();
        self.blocking(move |db| {
            update_alive_upload(db, &id, |upload| {
                upload.ttl = ttl;
                upload.expire_at = expire_at;
            })
        })
        .await
    }

    async fn purge_upload(&self, id: &UploadId) -> MetadataResult<PurgeOutcome> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let outcome = {
                let mut uploads = txn.open_table(UPLOADS)?;
                let mut files = txn.open_table(FILES)?;
                let mut index = txn.open_table(INDEX)?;

                match load::<Upload, _>(&uploads, &id)? {
                    None => PurgeOutcome::NotFound,
                    Some(upload) if !upload.is_deleted() => PurgeOutcome::Alive,
                    Some(upload) => {
                        let children = files_of(&files, &index, &id)?;
                        let pending: Vec<File> = children
                            .iter()
                            .filter(|f| f.status != FileStatus::Deleted)
                            .cloned()
                            .collect();
                        if pending.is_empty() {
                            for file in &children {
                                reindex(&mut index, index::file_entries(file), Vec::new())?;
                                files.remove(file.id.as_str())?;
                            }
                            reindex(&mut index, index::upload_entries(&upload), Vec::new())?;
                            uploads.remove(id.as_str())?;
                            PurgeOutcome::Purged
                        } else {
                            PurgeOutcome::Pending(pending)
                        }
                    }
                }
            };
            if outcome == PurgeOutcome::Purged {
                txn.commit()?;
            } else {
                txn.abort()?;
            }
            Ok(outcome)
        })
        .await
    }
}

#[async_trait]
impl FileRepo for RedbStore {
    async fn create_file(&self, file: &File) -> MetadataResult<()> {
        let file = file.clone();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let uploads = txn.open_table(UPLOADS)?;
                let mut files = txn.open_table(FILES)?;
                let mut index = txn.open_table(INDEX)?;

                match load::<Upload, _>(&uploads, file.upload_id.as_str())? {
                    Some(upload) if !upload.is_deleted() => {}
                    _ => {
                        return Err(MetadataError::NotFound(format!(
                            "upload {}",
                            file.upload_id
                        )));
                    }
                }
                if files.get(file.id.as_str())?.is_some() {
                    return Err(MetadataError::AlreadyExists(format!("file {}", file.id)));
                }
                save_file(&mut files, &mut index, None, &file)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_file(&self, id: &FileId) -> MetadataResult<Option<File>> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            load(&txn.open_table(FILES)?, &id)
        })
        .await
    }

    async fn get_files(&self, upload_id: &UploadId) -> MetadataResult<Vec<File>> {
        let upload_id = upload_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let files = txn.open_table(FILES)?;
            let index = txn.open_table(INDEX)?;
            files_of(&files, &index, &upload_id)
        })
        .await
    }

    async fn update_file_status(
        &self,
        id: &FileId,
        expected: FileStatus,
        new: FileStatus,
    ) -> MetadataResult<File> {
        expected.check_transition(new)?;
        let id = id.to_string();
        self.blocking(move |db| update_file_if(db, &id, expected, |file| file.status = new))
            .await
    }

    async fn update_file(&self, file: &File, expected: FileStatus) -> MetadataResult<()> {
        check_update(expected, file.status)?;
        let file = file.clone();
        self.blocking(move |db| {
            update_file_if(db, file.id.as_str(), expected, |stored| {
                // Identity and ownership are immutable.
                let (id, upload_id, created_at) =
                    (stored.id.clone(), stored.upload_id.clone(), stored.created_at);
                *stored = file.clone();
                stored.id = id;
                stored.upload_id = upload_id;
                stored.created_at = created_at;
            })
            .map(|_| ())
        })
        .await
    }

    async fn get_files_by_status(
        &self,
        status: FileStatus,
        after: Option<&FileId>,
        limit: u32,
    ) -> MetadataResult<Vec<File>> {
        let prefix = index::status_prefix(status);
        let after = after.map(|id| [prefix.as_slice(), id.as_str().as_bytes()].concat());
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let files = txn.open_table(FILES)?;
            let index = txn.open_table(INDEX)?;

            let mut out = Vec::new();
            for (key, _) in scan_prefix(&index, &prefix, after.as_deref())? {
                if out.len() >= limit as usize {
                    break;
                }
                let id = suffix_str(&key, prefix.len())?;
                if let Some(file) = load::<File, _>(&files, &id)? {
                    out.push(file);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn count_upload_files(&self, upload_id: &UploadId) -> MetadataResult<u64> {
        let prefix = index::upload_files_prefix(upload_id.as_str());
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let index = txn.open_table(INDEX)?;
            Ok(scan_prefix(&index, &prefix, None)?.len() as u64)
        })
        .await
    }

    async fn for_each_file(&self, visit: &mut FileVisitor<'_>) -> MetadataResult<()> {
        let mut after: Option<String> = None;
        loop {
            let start = after.clone();
            let batch: Vec<File> = self
                .blocking(move |db| {
                    let txn = db.begin_read()?;
                    let files = txn.open_table(FILES)?;
                    let lower = match &start {
                        Some(id) => Bound::Excluded(id.as_str()),
                        None => Bound::Unbounded,
                    };
                    let mut out = Vec::new();
                    for entry in files.range::<&str>((lower, Bound::Unbounded))?.take(SCAN_BATCH) {
                        let (_, value) = entry?;
                        out.push(serde_json::from_slice(value.value())?);
                    }
                    Ok(out)
                })
                .await?;

            for file in &batch {
                visit(file)?;
            }
            if batch.len() < SCAN_BATCH {
                return Ok(());
            }
            after = batch.last().map(|f| f.id.to_string());
        }
    }

    async fn statistics(&self) -> MetadataResult<Statistics> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            let uploads = txn.open_table(UPLOADS)?;
            let files = txn.open_table(FILES)?;
            let index = txn.open_table(INDEX)?;

            let mut stats = Statistics::default();
            for entry in uploads.iter()? {
                let (_, value) = entry?;
                let upload: Upload = serde_json::from_slice(value.value())?;
                if upload.is_deleted() {
                    continue;
                }
                let children = files_of(&files, &index, upload.id.as_str())?;
                stats.add_upload(&upload, &children);
            }
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcel_core::UploadParams;

    fn upload_with_user(user: &str) -> Upload {
        let mut upload = Upload::new(&UploadParams::default(), 60, parcel_core::now());
        upload.user = Some(user.to_string());
        upload.token = Some("tok".to_string());
        upload
    }

    #[tokio::test]
    async fn writes_keep_index_consistent() {
        let store = RedbStore::in_memory().await.unwrap();
        let upload = upload_with_user("alice");
        let file = File::new(upload.id.clone(), "a.txt", Some("0".to_string()));
        store.create_upload(&upload, &[file.clone()]).await.unwrap();
        assert!(store.verify_indices().await.unwrap().is_consistent());

        store
            .update_file_status(&file.id, FileStatus::Missing, FileStatus::Uploading)
            .await
            .unwrap();
        store.soft_delete_upload(&upload.id, parcel_core::now()).await.unwrap();
        assert!(store.verify_indices().await.unwrap().is_consistent());

        store
            .update_file_status(&file.id, FileStatus::Uploading, FileStatus::Removed)
            .await
            .unwrap();
        store
            .update_file_status(&file.id, FileStatus::Removed, FileStatus::Deleted)
            .await
            .unwrap();
        assert_eq!(
            store.purge_upload(&upload.id).await.unwrap(),
            PurgeOutcome::Purged
        );

        let report = store.verify_indices().await.unwrap();
        assert!(report.is_consistent(), "{report:?}");
        assert!(store.get_upload(&upload.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn verify_detects_orphans() {
        let store = RedbStore::in_memory().await.unwrap();
        store
            .blocking(|db| {
                let txn = db.begin_write()?;
                {
                    let mut index = txn.open_table(INDEX)?;
                    index.insert(b"d/nosuchupload00".as_slice(), b"".as_slice())?;
                }
                txn.commit()?;
                Ok(())
            })
            .await
            .unwrap();

        let report = store.verify_indices().await.unwrap();
        assert_eq!(report.orphaned, vec![b"d/nosuchupload00".to_vec()]);
        assert!(report.missing.is_empty());
    }

    #[tokio::test]
    async fn user_listing_filters_by_token() {
        let store = RedbStore::in_memory().await.unwrap();
        let first = upload_with_user("alice");
        let mut second = upload_with_user("alice");
        second.token = Some("other".to_string());
        let third = upload_with_user("bob");
        for upload in [&first, &second, &third] {
            store.create_upload(upload, &[]).await.unwrap();
        }

        let filter = UploadFilter {
            token: Some("tok".to_string()),
            ..UploadFilter::for_user("alice")
        };
        let page = store
            .list_uploads(&filter, &PagingQuery::default())
            .await
            .unwrap();
        let ids: Vec<_> = page.results.iter().map(|u| u.id.clone()).collect();
        assert_eq!(ids, vec![first.id]);
    }
}
