//! Reads and writes of entity payloads through cached handles.
//!
//! Every read returns a lazy iterator that owns its engine cursors; dropping
//! it, early or after exhaustion, releases them.

use crate::catalog::{Entity, EntityDescriptor};
use crate::error::CoreResult;
use crate::identity::KeyValue;
use crate::schema::HandleCache;
use crate::transaction::{Action, TransactionElement};
use quarry_engine::{Cursor, Database, JoinCursor, Txn};
use std::marker::PhantomData;
use std::slice;
use std::sync::Arc;
use tracing::debug;

/// Equality on one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    /// Field name.
    pub field: String,
    /// Value the field must equal.
    pub value: KeyValue,
}

impl Criterion {
    /// `field == value`.
    pub fn new(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

enum Source {
    Empty,
    One(Option<Vec<u8>>),
    Scan(Cursor),
    Index {
        primary: Arc<Database>,
        cursor: Cursor,
        pending: Option<Vec<u8>>,
    },
    Join(JoinCursor),
}

/// Lazily read payloads.
pub struct Payloads {
    source: Source,
}

impl std::fmt::Debug for Payloads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.source {
            Source::Empty => "empty",
            Source::One(_) => "one",
            Source::Scan(_) => "scan",
            Source::Index { .. } => "index",
            Source::Join(_) => "join",
        };
        f.debug_struct("Payloads").field("source", &kind).finish()
    }
}

impl Payloads {
    fn empty() -> Self {
        Self { source: Source::Empty }
    }
}

impl Iterator for Payloads {
    type Item = CoreResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Empty => None,
            Source::One(value) => value.take().map(Ok),
            Source::Scan(cursor) => cursor.next().map(|(_, value)| Ok(value)),
            Source::Index {
                primary,
                cursor,
                pending,
            } => loop {
                let pk = match pending.take() {
                    Some(pk) => pk,
                    None => cursor.next_dup()?.1,
                };
                match primary.get(None, &pk) {
                    Ok(Some(value)) => return Some(Ok(value)),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e.into())),
                }
            },
            Source::Join(join) => join.next().map(|(_, value)| Ok(value)),
        }
    }
}

/// Decoded entities over [`Payloads`].
pub struct Entities<E> {
    payloads: Payloads,
    _marker: PhantomData<fn() -> E>,
}

impl<E> std::fmt::Debug for Entities<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entities")
            .field("payloads", &self.payloads)
            .finish()
    }
}

impl<E: Entity> Entities<E> {
    pub(crate) fn new(payloads: Payloads) -> Self {
        Self {
            payloads,
            _marker: PhantomData,
        }
    }
}

impl<E: Entity> Iterator for Entities<E> {
    type Item = CoreResult<E>;

    fn next(&mut self) -> Option<Self::Item> {
        let payload = self.payloads.next()?;
        Some(payload.and_then(|bytes| E::decode(&bytes)))
    }
}

/// Entity reads and writes against one [`HandleCache`].
#[derive(Debug, Clone, Copy)]
pub struct Repository<'a> {
    cache: &'a HandleCache,
}

impl<'a> Repository<'a> {
    /// Creates a repository over `cache`.
    #[must_use]
    pub fn new(cache: &'a HandleCache) -> Self {
        Self { cache }
    }

    /// Every record of the entity, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the primary cannot be opened.
    pub fn read_all(&self, descriptor: &EntityDescriptor) -> CoreResult<Payloads> {
        let primary = self.cache.primary_handle(descriptor.name())?;
        Ok(Payloads {
            source: Source::Scan(primary.cursor()?),
        })
    }

    /// The record with identity `key`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `key` does not have the entity's
    /// identity shape, or an engine error if the primary cannot be read.
    pub fn read_by_key(&self, descriptor: &EntityDescriptor, key: &KeyValue) -> CoreResult<Option<Vec<u8>>> {
        let primary = self.cache.primary_handle(descriptor.name())?;
        Ok(primary.get(None, &descriptor.identity_bytes(key)?)?)
    }

    /// Records whose indexed `field` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `field` is not indexed.
    pub fn read_by_index(
        &self,
        descriptor: &Arc<EntityDescriptor>,
        field: &str,
        value: &KeyValue,
    ) -> CoreResult<Payloads> {
        self.cache.prepare(slice::from_ref(descriptor))?;
        let secondary = self.cache.index_handle(descriptor, field)?;
        let primary = self.cache.primary_handle(descriptor.name())?;
        let mut cursor = secondary.cursor()?;
        let Some((_, first)) = cursor.set(&value.to_bytes()) else {
            return Ok(Payloads::empty());
        };
        Ok(Payloads {
            source: Source::Index {
                primary,
                cursor,
                pending: Some(first),
            },
        })
    }

    /// Records matching every criterion.
    ///
    /// No criteria reads everything. A single criterion on the identity is a
    /// point lookup and a single criterion on an index is an index read.
    /// Otherwise one secondary cursor is positioned per criterion and the
    /// primary is joined over them; if any cursor finds nothing the result is
    /// empty and the primary is never touched.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a criterion names a field that is
    /// not indexed.
    pub fn read_by_join(&self, descriptor: &Arc<EntityDescriptor>, criteria: &[Criterion]) -> CoreResult<Payloads> {
        match criteria {
            [] => return self.read_all(descriptor),
            [only] if only.field == descriptor.key_field() => {
                let found = self.read_by_key(descriptor, &only.value)?;
                return Ok(Payloads {
                    source: Source::One(found),
                });
            }
            [only] => return self.read_by_index(descriptor, &only.field, &only.value),
            _ => {}
        }

        self.cache.prepare(slice::from_ref(descriptor))?;
        let mut secondaries = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            secondaries.push(self.cache.index_handle(descriptor, &criterion.field)?);
        }

        let mut cursors = Vec::with_capacity(criteria.len());
        for (criterion, secondary) in criteria.iter().zip(&secondaries) {
            let mut cursor = secondary.cursor()?;
            if cursor.set(&criterion.value.to_bytes()).is_none() {
                debug!(
                    entity = descriptor.name(),
                    field = criterion.field.as_str(),
                    "join criterion matched nothing"
                );
                return Ok(Payloads::empty());
            }
            cursors.push(cursor);
        }
        let primary = self.cache.primary_handle(descriptor.name())?;
        Ok(Payloads {
            source: Source::Join(primary.join(cursors)?),
        })
    }

    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// `KeyExist` when the identity or a unique index value is taken,
    /// `ForeignConflict` when a referenced parent is missing.
    pub fn insert(&self, txn: &mut Txn, descriptor: &EntityDescriptor, key: &[u8], payload: &[u8]) -> CoreResult<()> {
        let primary = self.cache.primary_handle(descriptor.name())?;
        primary.put_no_overwrite(txn, key, payload)?;
        Ok(())
    }

    /// Stores a record, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Same as [`insert`](Self::insert), minus the identity check.
    pub fn update(&self, txn: &mut Txn, descriptor: &EntityDescriptor, key: &[u8], payload: &[u8]) -> CoreResult<()> {
        let primary = self.cache.primary_handle(descriptor.name())?;
        primary.put(txn, key, payload)?;
        Ok(())
    }

    /// Removes a record.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent, `ForeignConflict` when still referenced.
    pub fn delete(&self, txn: &mut Txn, descriptor: &EntityDescriptor, key: &[u8]) -> CoreResult<()> {
        let primary = self.cache.primary_handle(descriptor.name())?;
        primary.delete(txn, key)?;
        Ok(())
    }

    pub(crate) fn apply(&self, txn: &mut Txn, element: &TransactionElement) -> CoreResult<()> {
        let descriptor = &element.descriptor;
        match element.action {
            Action::Insert => self.insert(txn, descriptor, &element.key, &element.payload),
            Action::Update => self.update(txn, descriptor, &element.key, &element.payload),
            Action::Delete => self.delete(txn, descriptor, &element.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntitySchema, EntryCatalog, SecondaryKeyDeclaration};
    use quarry_engine::{EnvConfig, Environment, OpenFlags};
    use serde::{Deserialize, Serialize};
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shirt {
        id: i32,
        size: String,
        color: String,
    }

    impl Entity for Shirt {
        fn schema() -> EntitySchema<Self> {
            EntitySchema::new("Shirt")
                .key_i32("id", |s: &Shirt| s.id)
                .field("size", |s: &Shirt| Some(s.size.clone().into()))
                .field("color", |s: &Shirt| Some(s.color.clone().into()))
                .secondary_key("size", SecondaryKeyDeclaration::non_unique())
                .secondary_key("color", SecondaryKeyDeclaration::non_unique())
        }
    }

    fn shirt(id: i32, size: &str, color: &str) -> Shirt {
        Shirt {
            id,
            size: size.into(),
            color: color.into(),
        }
    }

    fn seeded() -> (TempDir, HandleCache, Arc<EntityDescriptor>) {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path(), EnvConfig::default(), OpenFlags::create(), None).unwrap();
        let cache = HandleCache::new(env, Arc::new(EntryCatalog::new()), true);
        let descriptor = cache.catalog().describe::<Shirt>().unwrap();

        let mut txn = cache.prepare_for_transaction(&[Arc::clone(&descriptor)]).unwrap();
        let repo = Repository::new(&cache);
        for s in [shirt(1, "M", "red"), shirt(2, "L", "red"), shirt(3, "M", "blue")] {
            let key = KeyValue::Int32(s.id).to_bytes();
            repo.insert(&mut txn, &descriptor, &key, &s.encode().unwrap()).unwrap();
        }
        txn.commit().unwrap();
        (dir, cache, descriptor)
    }

    fn decode(payloads: Payloads) -> Vec<Shirt> {
        Entities::<Shirt>::new(payloads).map(Result::unwrap).collect()
    }

    #[test]
    fn read_paths() {
        let (_dir, cache, descriptor) = seeded();
        let repo = Repository::new(&cache);

        assert_eq!(decode(repo.read_all(&descriptor).unwrap()).len(), 3);
        let one = repo.read_by_key(&descriptor, &KeyValue::Int32(2)).unwrap().unwrap();
        assert_eq!(Shirt::decode(&one).unwrap(), shirt(2, "L", "red"));

        let medium = decode(repo.read_by_index(&descriptor, "size", &"M".into()).unwrap());
        assert_eq!(medium, vec![shirt(1, "M", "red"), shirt(3, "M", "blue")]);
        assert!(decode(repo.read_by_index(&descriptor, "size", &"XL".into()).unwrap()).is_empty());
    }

    #[test]
    fn join_intersects_criteria() {
        let (_dir, cache, descriptor) = seeded();
        let repo = Repository::new(&cache);
        let found = decode(
            repo.read_by_join(&descriptor, &[Criterion::new("size", "M"), Criterion::new("color", "red")])
                .unwrap(),
        );
        assert_eq!(found, vec![shirt(1, "M", "red")]);

        let by_id = decode(repo.read_by_join(&descriptor, &[Criterion::new("id", 3i32)]).unwrap());
        assert_eq!(by_id, vec![shirt(3, "M", "blue")]);
    }

    #[test]
    fn join_with_a_missing_key_releases_cursors() {
        let (_dir, cache, descriptor) = seeded();
        let repo = Repository::new(&cache);
        let result = repo
            .read_by_join(&descriptor, &[Criterion::new("size", "M"), Criterion::new("color", "green")])
            .unwrap();
        assert_eq!(result.count(), 0);

        let size = cache.index_handle(&descriptor, "size").unwrap();
        let primary = cache.primary_handle("Shirt").unwrap();
        assert_eq!(size.open_cursors(), 0);
        assert_eq!(primary.open_cursors(), 0);
    }

    #[test]
    fn dropping_a_partial_read_releases_its_cursor() {
        let (_dir, cache, descriptor) = seeded();
        let repo = Repository::new(&cache);
        let primary = cache.primary_handle("Shirt").unwrap();
        {
            let mut all = repo.read_all(&descriptor).unwrap();
            assert!(all.next().is_some());
            assert_eq!(primary.open_cursors(), 1);
        }
        assert_eq!(primary.open_cursors(), 0);
    }

    #[test]
    fn unindexed_criteria_are_rejected() {
        let (_dir, cache, descriptor) = seeded();
        let repo = Repository::new(&cache);
        let err = repo
            .read_by_join(&descriptor, &[Criterion::new("id", 1i32), Criterion::new("size", "M")])
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn identity_shape_is_checked() {
        let (_dir, cache, descriptor) = seeded();
        let err = Repository::new(&cache)
            .read_by_key(&descriptor, &KeyValue::Int64(1))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn update_and_delete() {
        let (_dir, cache, descriptor) = seeded();
        let repo = Repository::new(&cache);
        let key = KeyValue::Int32(1).to_bytes();

        let mut txn = cache.prepare_for_transaction(&[Arc::clone(&descriptor)]).unwrap();
        repo.update(&mut txn, &descriptor, &key, &shirt(1, "S", "red").encode().unwrap())
            .unwrap();
        repo.delete(&mut txn, &descriptor, &KeyValue::Int32(3).to_bytes()).unwrap();
        txn.commit().unwrap();

        let small = decode(repo.read_by_index(&descriptor, "size", &"S".into()).unwrap());
        assert_eq!(small, vec![shirt(1, "S", "red")]);
        assert!(decode(repo.read_by_index(&descriptor, "size", &"M".into()).unwrap()).is_empty());
    }
}
