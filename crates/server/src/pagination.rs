//! Keyset pagination shared by every listing.
//!
//! A cursor is the id of the last item of the previous page. Each backend resolves it to the
//! row's current sort key, fetches `limit + 1` rows strictly after that key and hands them to
//! [`seal`], which trims the lookahead row and reports whether more pages exist.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use hyperlocal_shared::{ListQuery, Page, SortMode};

use crate::error::StoreError;

/// Server-side bounds on the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: i64,
    pub max: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits { min: 15, max: 25 }
    }
}

impl Limits {
    pub fn window(&self, query: &ListQuery) -> Result<Window, StoreError> {
        let limit = match query.limit {
            Some(limit) if limit < 1 => {
                return Err(StoreError::validation("limit must be positive"));
            }
            Some(limit) => limit.clamp(self.min, self.max),
            None => self.min,
        };

        Ok(Window {
            sort: query.sort.unwrap_or_default(),
            cursor: query.cursor,
            limit,
        })
    }
}

/// A validated page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub sort: SortMode,
    pub cursor: Option<i64>,
    pub limit: i64,
}

impl Window {
    /// Rows a backend should fetch: one more than the page holds.
    pub fn fetch_size(&self) -> i64 {
        self.limit + 1
    }
}

/// The columns a listing is ordered by. `id` is the final tie-break in every mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub id: i64,
}

impl SortKey {
    /// Ordering of two rows as they appear in a listing sorted by `sort`.
    pub fn cmp_in(&self, other: &SortKey, sort: SortMode) -> Ordering {
        match sort {
            SortMode::Latest => (other.created_at, other.id).cmp(&(self.created_at, self.id)),
            SortMode::Oldest => (self.created_at, self.id).cmp(&(other.created_at, other.id)),
            SortMode::Top => (other.score, other.created_at, other.id).cmp(&(
                self.score,
                self.created_at,
                self.id,
            )),
        }
    }

    /// Whether `self` comes strictly after the cursor row in `sort` order.
    pub fn follows(&self, cursor: &SortKey, sort: SortMode) -> bool {
        cursor.cmp_in(self, sort) == Ordering::Less
    }
}

/// `ORDER BY` clause for a table aliased as `alias`.
pub fn order_by(sort: SortMode, alias: &str) -> String {
    match sort {
        SortMode::Latest => format!("{alias}.created_at DESC, {alias}.id DESC"),
        SortMode::Oldest => format!("{alias}.created_at ASC, {alias}.id ASC"),
        SortMode::Top => format!("{alias}.score DESC, {alias}.created_at DESC, {alias}.id DESC"),
    }
}

/// Row-value comparison selecting rows after the cursor. Binds are pushed by the caller in the
/// order returned by [`keyset_binds`].
pub fn keyset_columns(sort: SortMode, alias: &str) -> (String, &'static str) {
    match sort {
        SortMode::Latest => (format!("({alias}.created_at, {alias}.id)"), "<"),
        SortMode::Oldest => (format!("({alias}.created_at, {alias}.id)"), ">"),
        SortMode::Top => (format!("({alias}.score, {alias}.created_at, {alias}.id)"), "<"),
    }
}

pub fn keyset_binds(sort: SortMode) -> &'static [KeyPart] {
    match sort {
        SortMode::Latest | SortMode::Oldest => &[KeyPart::CreatedAt, KeyPart::Id],
        SortMode::Top => &[KeyPart::Score, KeyPart::CreatedAt, KeyPart::Id],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
    Score,
    CreatedAt,
    Id,
}

/// Turn a `limit + 1` lookahead fetch into a page.
pub fn seal<T>(mut rows: Vec<T>, limit: i64) -> Page<T> {
    let limit = usize::try_from(limit).unwrap_or(0);
    let has_more = rows.len() > limit;
    rows.truncate(limit);

    Page {
        items: rows,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(id: i64, score: i64, minute: u32) -> SortKey {
        SortKey {
            score,
            created_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap(),
            id,
        }
    }

    #[test]
    fn limit_is_clamped_into_configured_range() {
        let limits = Limits::default();
        let window = |limit| {
            limits.window(&ListQuery {
                limit,
                ..Default::default()
            })
        };

        assert_eq!(window(None).unwrap().limit, 15);
        assert_eq!(window(Some(3)).unwrap().limit, 15);
        assert_eq!(window(Some(20)).unwrap().limit, 20);
        assert_eq!(window(Some(500)).unwrap().limit, 25);
        assert!(matches!(window(Some(0)), Err(StoreError::Validation(_))));
        assert_eq!(window(None).unwrap().sort, SortMode::Latest);
    }

    #[test]
    fn seal_trims_lookahead_row() {
        let page = seal((0..16).collect::<Vec<_>>(), 15);
        assert_eq!(page.items.len(), 15);
        assert!(page.has_more);

        let page = seal(vec![15], 15);
        assert_eq!(page.items, vec![15]);
        assert!(!page.has_more);
    }

    #[test]
    fn top_orders_by_score_then_recency_then_id() {
        let mut keys = vec![key(1, 5, 0), key(2, 9, 1), key(3, 5, 2), key(4, 5, 2)];
        keys.sort_by(|a, b| a.cmp_in(b, SortMode::Top));

        let ids: Vec<_> = keys.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![2, 4, 3, 1]);

        for pair in keys.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(a.score > b.score || (a.score == b.score && a.created_at >= b.created_at));
        }
    }

    #[test]
    fn follows_respects_direction() {
        let older = key(1, 0, 0);
        let newer = key(2, 0, 5);

        assert!(older.follows(&newer, SortMode::Latest));
        assert!(!newer.follows(&older, SortMode::Latest));
        assert!(newer.follows(&older, SortMode::Oldest));
        assert!(!older.follows(&older, SortMode::Oldest));
    }
}
