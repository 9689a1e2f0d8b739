//! Cursor pagination over creation order.
//!
//! Listings are ordered by `(created_at, id)`. Cursors are opaque to clients:
//! a base64 encoding of the key of the first or last item of a page.

use crate::timestamp;
use base64::Engine;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Page size used when the client does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Largest page size a client can ask for.
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Listing order over creation time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Paging parameters supplied by a client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PagingQuery {
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub order: Option<SortOrder>,
}

impl PagingQuery {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = Some(order);
        self
    }

    /// Continue after the given cursor (clears any before cursor).
    pub fn with_after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self.before = None;
        self
    }

    /// Go back before the given cursor (clears any after cursor).
    pub fn with_before(mut self, cursor: impl Into<String>) -> Self {
        self.before = Some(cursor.into());
        self.after = None;
        self
    }

    /// Effective page size.
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    /// Resolve the query into a scan window.
    pub fn window(&self) -> crate::Result<PageWindow> {
        let (backward, cursor) = match (&self.after, &self.before) {
            (Some(_), Some(_)) => {
                return Err(crate::Error::InvalidCursor(
                    "after and before are mutually exclusive".to_string(),
                ));
            }
            (Some(after), None) => (false, Some(Cursor::decode(after)?)),
            (None, Some(before)) => (true, Some(Cursor::decode(before)?)),
            (None, None) => (false, None),
        };

        let descending = (self.order.unwrap_or_default() == SortOrder::Desc) != backward;
        let seek = cursor.map(|cursor| {
            let seek = if descending { Seek::Below } else { Seek::Above };
            (cursor, seek)
        });

        Ok(PageWindow {
            descending,
            seek,
            backward,
            limit: self.limit(),
        })
    }
}

/// Position of a listed item in creation order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    /// Creation time in microseconds since the epoch.
    pub created_at: i64,
    pub id: String,
}

impl Cursor {
    pub fn new(created_at: OffsetDateTime, id: impl Into<String>) -> Self {
        Self {
            created_at: timestamp::to_micros(created_at),
            id: id.into(),
        }
    }

    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.created_at, self.id);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(s: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidCursor(s.to_string());
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (ts, id) = raw.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            created_at: ts.parse().map_err(|_| invalid())?,
            id: id.to_string(),
        })
    }
}

/// Which side of the cursor a scan continues on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Seek {
    /// Keys strictly lower than the cursor.
    Below,
    /// Keys strictly greater than the cursor.
    Above,
}

/// A resolved scan: direction, starting point and how to present the rows.
#[derive(Clone, Debug)]
pub struct PageWindow {
    /// Scan in descending key order.
    pub descending: bool,
    /// Start strictly past this cursor.
    pub seek: Option<(Cursor, Seek)>,
    /// The client paged backwards; rows are reversed before presenting.
    pub backward: bool,
    pub limit: usize,
}

impl PageWindow {
    /// Rows to fetch: one extra to detect whether more exist.
    pub fn fetch_limit(&self) -> usize {
        self.limit + 1
    }

    /// Whether a key lies inside the window.
    pub fn admits(&self, key: &Cursor) -> bool {
        match &self.seek {
            None => true,
            Some((cursor, Seek::Below)) => key < cursor,
            Some((cursor, Seek::Above)) => key > cursor,
        }
    }

    /// Turn fetched rows (in scan order, at most `fetch_limit`) into a page.
    pub fn finish<T>(&self, mut rows: Vec<T>, key: impl Fn(&T) -> Cursor) -> Page<T> {
        let has_more = rows.len() > self.limit;
        rows.truncate(self.limit);
        if self.backward {
            rows.reverse();
        }

        let first = rows.first().map(&key);
        let last = rows.last().map(&key);
        let (before, after) = if self.backward {
            (first.filter(|_| has_more), last)
        } else {
            (first.filter(|_| self.seek.is_some()), last.filter(|_| has_more))
        };

        Page {
            results: rows,
            before: before.map(|c| c.encode()),
            after: after.map(|c| c.encode()),
        }
    }

    /// Paginate an in-memory collection.
    pub fn apply<T>(&self, mut items: Vec<T>, key: impl Fn(&T) -> Cursor) -> Page<T> {
        items.sort_by_key(|item| key(item));
        if self.descending {
            items.reverse();
        }
        let rows = items
            .into_iter()
            .filter(|item| self.admits(&key(item)))
            .take(self.fetch_limit())
            .collect();
        self.finish(rows, key)
    }
}

/// One page of results with cursors to its neighbours.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            results: self.results.into_iter().map(f).collect(),
            before: self.before,
            after: self.after,
        }
    }
}
