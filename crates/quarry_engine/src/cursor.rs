//! Cursors and join cursors.
//!
//! A cursor walks a point-in-time snapshot of one database. It never blocks
//! writers and never observes writes committed after it was opened.

use crate::error::{EngineError, EngineResult};
use crate::tree::TreeMap;
use std::collections::HashSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Live-cursor counter shared between a database handle and its cursors.
#[derive(Debug)]
pub(crate) struct CursorGuard(Arc<AtomicUsize>);

impl CursorGuard {
    pub(crate) fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A cursor over one database.
///
/// Iterating yields every `(key, value)` pair in key order, duplicates in
/// their stored order. Iteration starts from the current position.
#[derive(Debug)]
pub struct Cursor {
    database: String,
    snapshot: Arc<TreeMap>,
    position: Option<(Vec<u8>, usize)>,
    _guard: CursorGuard,
}

impl Cursor {
    pub(crate) fn new(database: String, snapshot: Arc<TreeMap>, counter: &Arc<AtomicUsize>) -> Self {
        Self {
            database,
            snapshot,
            position: None,
            _guard: CursorGuard::new(counter),
        }
    }

    /// Database this cursor reads.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    fn pair_at(&self, key: &[u8], idx: usize) -> Option<(Vec<u8>, Vec<u8>)> {
        let value = self.snapshot.get(key)?.get(idx)?;
        Some((key.to_vec(), value.clone()))
    }

    /// Moves to the first record.
    pub fn first(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let key = self.snapshot.keys().next().cloned();
        self.position = key.map(|k| (k, 0));
        self.current()
    }

    /// Moves to the first value of `key`. Leaves the cursor unpositioned when
    /// the key is absent.
    pub fn set(&mut self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.position = self
            .snapshot
            .contains_key(key)
            .then(|| (key.to_vec(), 0));
        self.current()
    }

    /// Moves to the next value of the current key.
    pub fn next_dup(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let (key, idx) = self.position.clone()?;
        let pair = self.pair_at(&key, idx + 1)?;
        self.position = Some((key, idx + 1));
        Some(pair)
    }

    /// Record at the current position.
    #[must_use]
    pub fn current(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let (key, idx) = self.position.as_ref()?;
        self.pair_at(key, *idx)
    }

    /// Number of values stored under the current key.
    #[must_use]
    pub fn dup_count(&self) -> usize {
        self.position
            .as_ref()
            .and_then(|(key, _)| self.snapshot.get(key))
            .map_or(0, Vec::len)
    }

    /// Every value under the current key.
    pub(crate) fn current_values(&self) -> Option<&Vec<Vec<u8>>> {
        let (key, _) = self.position.as_ref()?;
        self.snapshot.get(key)
    }
}

impl Iterator for Cursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let Some((key, idx)) = self.position.clone() else {
            return self.first();
        };
        if let Some(pair) = self.pair_at(&key, idx + 1) {
            self.position = Some((key, idx + 1));
            return Some(pair);
        }
        let next_key = self
            .snapshot
            .range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone());
        match next_key {
            Some(k) => {
                self.position = Some((k, 0));
                self.current()
            }
            None => {
                self.position = None;
                None
            }
        }
    }
}

/// Intersects secondary cursors over a primary database.
///
/// Built by [`Database::join`](crate::Database::join) from cursors already
/// positioned with [`Cursor::set`]. The cursor with the fewest duplicates
/// drives; each candidate primary key must appear under every other cursor's
/// key. Yields `(primary_key, primary_value)`.
#[derive(Debug)]
pub struct JoinCursor {
    primary: Arc<TreeMap>,
    candidates: std::vec::IntoIter<Vec<u8>>,
    filters: Vec<HashSet<Vec<u8>>>,
    _cursors: Vec<Cursor>,
    _guard: CursorGuard,
}

impl JoinCursor {
    pub(crate) fn new(
        primary: Arc<TreeMap>,
        mut cursors: Vec<Cursor>,
        counter: &Arc<AtomicUsize>,
    ) -> EngineResult<Self> {
        if cursors.is_empty() {
            return Err(EngineError::invalid_argument("join needs at least one cursor"));
        }
        if let Some(unpositioned) = cursors.iter().find(|c| c.current().is_none()) {
            return Err(EngineError::invalid_argument(format!(
                "join cursor on {} is not positioned",
                unpositioned.database()
            )));
        }
        cursors.sort_by_key(Cursor::dup_count);

        let candidates = cursors[0].current_values().cloned().unwrap_or_default();
        let filters = cursors[1..]
            .iter()
            .map(|c| c.current_values().into_iter().flatten().cloned().collect())
            .collect();
        Ok(Self {
            primary,
            candidates: candidates.into_iter(),
            filters,
            _cursors: cursors,
            _guard: CursorGuard::new(counter),
        })
    }
}

impl Iterator for JoinCursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        for pk in self.candidates.by_ref() {
            if !self.filters.iter().all(|f| f.contains(&pk)) {
                continue;
            }
            if let Some(value) = self.primary.get(&pk).and_then(|vs| vs.first()) {
                return Some((pk, value.clone()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, &[&str])]) -> Arc<TreeMap> {
        Arc::new(
            entries
                .iter()
                .map(|(k, vs)| {
                    (
                        k.as_bytes().to_vec(),
                        vs.iter().map(|v| v.as_bytes().to_vec()).collect(),
                    )
                })
                .collect(),
        )
    }

    fn pair(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
        (k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    #[test]
    fn iterates_keys_and_duplicates_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cursor = Cursor::new("d".into(), snapshot(&[("a", &["1", "2"]), ("b", &["3"])]), &counter);
        let all: Vec<_> = cursor.collect();
        assert_eq!(all, vec![pair("a", "1"), pair("a", "2"), pair("b", "3")]);
    }

    #[test]
    fn set_and_next_dup() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut cursor = Cursor::new("d".into(), snapshot(&[("a", &["1", "2"]), ("b", &["3"])]), &counter);

        assert_eq!(cursor.set(b"a"), Some(pair("a", "1")));
        assert_eq!(cursor.dup_count(), 2);
        assert_eq!(cursor.next_dup(), Some(pair("a", "2")));
        assert_eq!(cursor.next_dup(), None);
        assert_eq!(cursor.next(), Some(pair("b", "3")));

        assert_eq!(cursor.set(b"zz"), None);
        assert_eq!(cursor.dup_count(), 0);
    }

    #[test]
    fn counter_tracks_live_cursors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = Cursor::new("d".into(), snapshot(&[]), &counter);
        let b = Cursor::new("d".into(), snapshot(&[]), &counter);
        assert_eq!(counter.load(Ordering::Acquire), 2);
        drop(a);
        drop(b);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn join_intersects_positioned_cursors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let primary = snapshot(&[("p1", &["one"]), ("p2", &["two"]), ("p3", &["three"])]);
        let mut by_color = Cursor::new("color".into(), snapshot(&[("red", &["p1", "p2", "p3"])]), &counter);
        let mut by_size = Cursor::new("size".into(), snapshot(&[("xl", &["p2", "p3"])]), &counter);
        by_color.set(b"red");
        by_size.set(b"xl");

        let join = JoinCursor::new(primary, vec![by_color, by_size], &counter).unwrap();
        assert_eq!(counter.load(Ordering::Acquire), 3);
        let rows: Vec<_> = join.collect();
        assert_eq!(rows, vec![pair("p2", "two"), pair("p3", "three")]);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn join_rejects_unpositioned_cursor() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cursor = Cursor::new("color".into(), snapshot(&[("red", &["p1"])]), &counter);
        assert!(JoinCursor::new(snapshot(&[]), vec![cursor], &counter).is_err());
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }
}
