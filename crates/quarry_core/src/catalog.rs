//! Entity metadata: identities, field accessors and key declarations.
//!
//! Each entity type describes itself once through [`Entity::schema`]. The
//! [`EntryCatalog`] turns that into an [`EntityDescriptor`], caches it per
//! type for the life of the store and maps logical entity names to it.

use crate::codec::{CborCodec, PayloadCodec};
use crate::error::{CoreError, CoreResult};
use crate::identity::KeyValue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quarry_engine::Duplicates;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A persistable entity.
///
/// ```rust
/// use quarry_core::{Entity, EntitySchema, SecondaryKeyDeclaration};
/// use serde::{Deserialize, Serialize};
/// use uuid::Uuid;
///
/// #[derive(Serialize, Deserialize)]
/// struct Customer {
///     id: Uuid,
///     email: String,
/// }
///
/// impl Entity for Customer {
///     fn schema() -> EntitySchema<Self> {
///         EntitySchema::new("Customer")
///             .key_guid("id", |c: &Customer| c.id)
///             .field("email", |c: &Customer| Some(c.email.clone().into()))
///             .secondary_key("email", SecondaryKeyDeclaration::unique())
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Describes the entity.
    fn schema() -> EntitySchema<Self>;

    /// Encodes the entity into a stored payload.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    fn encode(&self) -> CoreResult<Vec<u8>> {
        CborCodec::encode(self)
    }

    /// Decodes a stored payload.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the payload does not hold this entity.
    fn decode(bytes: &[u8]) -> CoreResult<Self> {
        CborCodec::decode(bytes)
    }
}

/// Identity shapes an entity may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityShape {
    /// Opaque byte array.
    Bytes,
    /// GUID.
    Guid,
    /// 64-bit integer.
    Int64,
    /// 32-bit integer.
    Int32,
}

/// Cardinality of a foreign-key relationship, seen from the declaring entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Each parent has at most one child.
    OneToOne,
    /// Many children share one parent.
    ManyToOne,
    /// One declaring record relates to many others.
    OneToMany,
    /// Many on both sides.
    ManyToMany,
}

impl RelationKind {
    fn is_unique(self) -> bool {
        self == Self::OneToOne
    }
}

/// A foreign key from a field of this entity to another entity's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDeclaration {
    /// Name of the referenced entity.
    pub referenced: String,
    /// Field path of the navigation property, if the entity has one.
    pub navigation: Option<String>,
    /// Duplicate policy of the backing secondary.
    pub duplicates: Duplicates,
    /// Relationship cardinality.
    pub kind: RelationKind,
}

impl ForeignKeyDeclaration {
    /// References `entity`. The duplicate policy follows from `kind`.
    pub fn new(entity: impl Into<String>, kind: RelationKind) -> Self {
        let duplicates = if kind.is_unique() {
            Duplicates::None
        } else {
            Duplicates::Sorted
        };
        Self {
            referenced: entity.into(),
            navigation: None,
            duplicates,
            kind,
        }
    }

    /// Sets the navigation field path.
    #[must_use]
    pub fn navigation(mut self, path: impl Into<String>) -> Self {
        self.navigation = Some(path.into());
        self
    }

    /// Overrides the duplicate policy.
    #[must_use]
    pub fn duplicates(mut self, duplicates: Duplicates) -> Self {
        self.duplicates = duplicates;
        self
    }
}

/// A plain secondary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryKeyDeclaration {
    /// Duplicate policy of the backing secondary.
    pub duplicates: Duplicates,
}

impl SecondaryKeyDeclaration {
    /// At most one record per key.
    #[must_use]
    pub const fn unique() -> Self {
        Self {
            duplicates: Duplicates::None,
        }
    }

    /// Many records per key, kept in primary-key order.
    #[must_use]
    pub const fn non_unique() -> Self {
        Self {
            duplicates: Duplicates::Sorted,
        }
    }
}

type KeyAccessor<E> = Arc<dyn Fn(&E) -> KeyValue + Send + Sync>;
type FieldAccessor<E> = Arc<dyn Fn(&E) -> Option<KeyValue> + Send + Sync>;

/// Reads one field's canonical key bytes from a stored payload.
pub(crate) type PayloadReader = Arc<dyn Fn(&[u8]) -> Result<Option<Vec<u8>>, String> + Send + Sync>;

/// Typed description of an entity, built by [`Entity::schema`].
pub struct EntitySchema<E> {
    name: String,
    keys: Vec<(String, IdentityShape, KeyAccessor<E>)>,
    fields: Vec<(String, FieldAccessor<E>)>,
    foreign_keys: Vec<(String, ForeignKeyDeclaration)>,
    secondary_keys: Vec<(String, SecondaryKeyDeclaration)>,
}

impl<E: Entity> EntitySchema<E> {
    /// Starts a schema for the entity `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            fields: Vec::new(),
            foreign_keys: Vec::new(),
            secondary_keys: Vec::new(),
        }
    }

    fn identity(mut self, field: &str, shape: IdentityShape, accessor: KeyAccessor<E>) -> Self {
        self.keys.push((field.to_string(), shape, Arc::clone(&accessor)));
        let reader: FieldAccessor<E> = Arc::new(move |e: &E| Some(accessor(e)));
        self.fields.push((field.to_string(), reader));
        self
    }

    /// Identity is a byte array.
    #[must_use]
    pub fn key_bytes(self, field: &str, accessor: impl Fn(&E) -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.identity(
            field,
            IdentityShape::Bytes,
            Arc::new(move |e: &E| KeyValue::Bytes(accessor(e))),
        )
    }

    /// Identity is a GUID.
    #[must_use]
    pub fn key_guid(self, field: &str, accessor: impl Fn(&E) -> Uuid + Send + Sync + 'static) -> Self {
        self.identity(field, IdentityShape::Guid, Arc::new(move |e: &E| KeyValue::Guid(accessor(e))))
    }

    /// Identity is a 64-bit integer.
    #[must_use]
    pub fn key_i64(self, field: &str, accessor: impl Fn(&E) -> i64 + Send + Sync + 'static) -> Self {
        self.identity(field, IdentityShape::Int64, Arc::new(move |e: &E| KeyValue::Int64(accessor(e))))
    }

    /// Identity is a 32-bit integer.
    #[must_use]
    pub fn key_i32(self, field: &str, accessor: impl Fn(&E) -> i32 + Send + Sync + 'static) -> Self {
        self.identity(field, IdentityShape::Int32, Arc::new(move |e: &E| KeyValue::Int32(accessor(e))))
    }

    /// Registers a readable field. `None` leaves the record out of any
    /// index over the field.
    #[must_use]
    pub fn field(
        mut self,
        name: &str,
        accessor: impl Fn(&E) -> Option<KeyValue> + Send + Sync + 'static,
    ) -> Self {
        let accessor: FieldAccessor<E> = Arc::new(accessor);
        self.fields.push((name.to_string(), accessor));
        self
    }

    /// Declares `field` a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, field: &str, declaration: ForeignKeyDeclaration) -> Self {
        self.foreign_keys.push((field.to_string(), declaration));
        self
    }

    /// Declares `field` a secondary key.
    #[must_use]
    pub fn secondary_key(mut self, field: &str, declaration: SecondaryKeyDeclaration) -> Self {
        self.secondary_keys.push((field.to_string(), declaration));
        self
    }
}

/// Type-erased entity metadata.
pub struct EntityDescriptor {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    key_field: String,
    identity: IdentityShape,
    fields: Vec<String>,
    foreign_keys: BTreeMap<String, ForeignKeyDeclaration>,
    secondary_keys: BTreeMap<String, SecondaryKeyDeclaration>,
    readers: HashMap<String, PayloadReader>,
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("key_field", &self.key_field)
            .field("identity", &self.identity)
            .field("foreign_keys", &self.foreign_keys)
            .field("secondary_keys", &self.secondary_keys)
            .finish_non_exhaustive()
    }
}

impl EntityDescriptor {
    /// Logical entity name, also the primary database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Native type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Field holding the identity.
    #[must_use]
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Identity shape.
    #[must_use]
    pub fn identity(&self) -> IdentityShape {
        self.identity
    }

    /// Readable fields, in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Foreign keys by field.
    #[must_use]
    pub fn foreign_keys(&self) -> &BTreeMap<String, ForeignKeyDeclaration> {
        &self.foreign_keys
    }

    /// Secondary keys by field.
    #[must_use]
    pub fn secondary_keys(&self) -> &BTreeMap<String, SecondaryKeyDeclaration> {
        &self.secondary_keys
    }

    /// Duplicate policy of the index over `field`, if the field is indexed.
    #[must_use]
    pub fn index_duplicates(&self, field: &str) -> Option<Duplicates> {
        self.secondary_keys
            .get(field)
            .map(|d| d.duplicates)
            .or_else(|| self.foreign_keys.get(field).map(|d| d.duplicates))
    }

    /// Name of the secondary database for the index over `field`.
    #[must_use]
    pub fn secondary_name(&self, field: &str) -> String {
        format!("{}-->{}", self.name, field)
    }

    /// Canonical bytes of an identity value.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `key` has another shape than the
    /// entity's identity.
    pub fn identity_bytes(&self, key: &KeyValue) -> CoreResult<Vec<u8>> {
        if key.identity_shape() != Some(self.identity) {
            return Err(CoreError::configuration(format!(
                "identity of {} is {:?}, got {key}",
                self.name, self.identity
            )));
        }
        Ok(key.to_bytes())
    }

    pub(crate) fn field_reader(&self, field: &str) -> CoreResult<PayloadReader> {
        self.readers.get(field).cloned().ok_or_else(|| {
            CoreError::configuration(format!(
                "entity {} has no accessor for field {field}",
                self.name
            ))
        })
    }
}

/// A cached descriptor plus the typed identity accessor.
pub(crate) struct TypedEntry<E> {
    pub descriptor: Arc<EntityDescriptor>,
    key: KeyAccessor<E>,
}

impl<E: Entity> TypedEntry<E> {
    fn build(schema: EntitySchema<E>) -> CoreResult<Self> {
        let EntitySchema {
            name,
            mut keys,
            fields,
            foreign_keys,
            secondary_keys,
        } = schema;

        if name.is_empty() {
            return Err(CoreError::configuration(format!(
                "entity type {} has an empty name",
                std::any::type_name::<E>()
            )));
        }
        if keys.len() > 1 {
            return Err(CoreError::configuration(format!(
                "entity {name} declares {} identities",
                keys.len()
            )));
        }
        let Some((key_field, identity, key)) = keys.pop() else {
            return Err(CoreError::configuration(format!(
                "entity {name} exposes no byte array, GUID, 64-bit or 32-bit integer identity"
            )));
        };

        let mut indexed: BTreeMap<String, SecondaryKeyDeclaration> = BTreeMap::new();
        for (field, declaration) in secondary_keys {
            if indexed.insert(field.clone(), declaration).is_some() {
                return Err(ambiguous(&name, &field));
            }
        }
        let mut foreign: BTreeMap<String, ForeignKeyDeclaration> = BTreeMap::new();
        for (field, declaration) in foreign_keys {
            if indexed.contains_key(&field) || foreign.contains_key(&field) {
                return Err(ambiguous(&name, &field));
            }
            if declaration.kind.is_unique() == declaration.duplicates.allows_duplicates() {
                return Err(CoreError::configuration(format!(
                    "foreign key {name}.{field} is {:?} but its index uses {:?} duplicates",
                    declaration.kind, declaration.duplicates
                )));
            }
            foreign.insert(field, declaration);
        }
        if indexed.contains_key(&key_field) || foreign.contains_key(&key_field) {
            return Err(CoreError::configuration(format!(
                "identity field {name}.{key_field} cannot also be an index"
            )));
        }

        let mut order = Vec::with_capacity(fields.len());
        let mut readers = HashMap::with_capacity(fields.len());
        for (field, accessor) in fields {
            if readers.contains_key(&field) {
                return Err(CoreError::configuration(format!(
                    "field {name}.{field} is registered twice"
                )));
            }
            let reader: PayloadReader = Arc::new(move |payload: &[u8]| {
                let entity = E::decode(payload).map_err(|e| e.to_string())?;
                Ok(accessor(&entity).map(|v| v.to_bytes()))
            });
            order.push(field.clone());
            readers.insert(field, reader);
        }

        debug!(entity = %name, fields = order.len(), "described entity");
        Ok(Self {
            descriptor: Arc::new(EntityDescriptor {
                name,
                type_id: TypeId::of::<E>(),
                type_name: std::any::type_name::<E>(),
                key_field,
                identity,
                fields: order,
                foreign_keys: foreign,
                secondary_keys: indexed,
                readers,
            }),
            key,
        })
    }

    /// Canonical primary-key bytes of `entity`.
    pub fn key_of(&self, entity: &E) -> Vec<u8> {
        (self.key)(entity).to_bytes()
    }
}

fn ambiguous(entity: &str, field: &str) -> CoreError {
    CoreError::configuration(format!("field {entity}.{field} is declared as more than one index"))
}

/// Process-lifetime cache of entity descriptors.
#[derive(Default)]
pub struct EntryCatalog {
    entries: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    names: DashMap<String, Arc<EntityDescriptor>>,
}

impl fmt::Debug for EntryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryCatalog")
            .field("entities", &self.names.len())
            .finish()
    }
}

impl EntryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor for `E`, built on first use.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the schema is invalid or its name is
    /// already taken by another type.
    pub fn describe<E: Entity>(&self) -> CoreResult<Arc<EntityDescriptor>> {
        Ok(Arc::clone(&self.entry::<E>()?.descriptor))
    }

    pub(crate) fn entry<E: Entity>(&self) -> CoreResult<Arc<TypedEntry<E>>> {
        let id = TypeId::of::<E>();
        let cached = self.entries.get(&id).map(|e| Arc::clone(e.value()));
        if let Some(found) = cached {
            return downcast(found);
        }

        let built = Arc::new(TypedEntry::build(E::schema())?);
        let name = built.descriptor.name.clone();
        if let Some(other) = self.names.get(&name) {
            if other.type_id != id {
                return Err(taken(&name, other.type_name, built.descriptor.type_name));
            }
        }

        let erased: Arc<dyn Any + Send + Sync> = built;
        let winner = downcast::<E>(Arc::clone(self.entries.entry(id).or_insert(erased).value()))?;
        match self.names.entry(name.clone()) {
            Entry::Occupied(other) if other.get().type_id != id => {
                let other_type = other.get().type_name;
                drop(other);
                self.entries.remove(&id);
                return Err(taken(&name, other_type, winner.descriptor.type_name));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&winner.descriptor));
            }
        }
        Ok(winner)
    }

    /// Descriptor registered under the logical `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.names.get(name).map(|d| Arc::clone(d.value()))
    }

    /// Described entities with a foreign key into `name`.
    #[must_use]
    pub fn referencing(&self, name: &str) -> Vec<Arc<EntityDescriptor>> {
        self.names
            .iter()
            .filter(|e| e.value().foreign_keys.values().any(|fk| fk.referenced == name))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Registered entity names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of described entity types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True before the first entity is described.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn downcast<E: Entity>(any: Arc<dyn Any + Send + Sync>) -> CoreResult<Arc<TypedEntry<E>>> {
    any.downcast::<TypedEntry<E>>()
        .map_err(|_| CoreError::configuration(format!("catalog entry for {} has the wrong type", std::any::type_name::<E>())))
}

fn taken(name: &str, first: &str, second: &str) -> CoreError {
    CoreError::configuration(format!("entity name {name} is used by both {first} and {second}"))
}
