//! Identity map: at most one managed instance per table and primary key.

use persist_core::{Error, ManagedEntity, Model, ModelRef, Result, Value, downcast, hash_key, same_key};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Key identifying a row within a unit of work.
///
/// Equality compares the key values themselves; the cached hash only
/// selects the bucket.
#[derive(Debug, Clone)]
pub struct ObjectKey {
    table: &'static str,
    pk_hash: u64,
    pk: Arc<[Value]>,
}

impl ObjectKey {
    pub fn new(table: &'static str, pk: &[Value]) -> Self {
        Self {
            table,
            pk_hash: hash_key(pk),
            pk: pk.into(),
        }
    }

    pub fn of<M: Model>(pk: &[Value]) -> Self {
        Self::new(M::TABLE_NAME, pk)
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn pk_hash(&self) -> u64 {
        self.pk_hash
    }

    pub fn pk(&self) -> &[Value] {
        &self.pk
    }
}

impl PartialEq for ObjectKey {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.pk_hash == other.pk_hash && same_key(&self.pk, &other.pk)
    }
}

impl Eq for ObjectKey {}

impl Hash for ObjectKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.pk_hash.hash(state);
    }
}

/// Managed instances by [`ObjectKey`].
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, Arc<dyn ManagedEntity>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start managing `entity` under its current primary key.
    ///
    /// Registering the same instance twice is a no-op; a different instance
    /// under an occupied key fails with `DuplicateIdentity`.
    #[allow(clippy::result_large_err)]
    pub fn register(&mut self, entity: Arc<dyn ManagedEntity>) -> Result<ObjectKey> {
        let pk = entity.primary_key();
        let key = ObjectKey::new(entity.table(), &pk);
        if let Some(existing) = self.entries.get(&key) {
            if existing.same_instance(&*entity) {
                return Ok(key);
            }
            return Err(Error::duplicate_identity(entity.table(), pk));
        }
        tracing::trace!(table = key.table, pk_hash = key.pk_hash, "registered in identity map");
        self.entries.insert(key.clone(), entity);
        Ok(key)
    }

    /// Typed lookup by primary key.
    pub fn get<M: Model>(&self, pk: &[Value]) -> Option<ModelRef<M>> {
        let entity = self.entries.get(&ObjectKey::of::<M>(pk))?;
        downcast::<M>(&**entity)
    }

    pub fn entity(&self, key: &ObjectKey) -> Option<&Arc<dyn ManagedEntity>> {
        self.entries.get(key)
    }

    /// Primary key values the entity was registered under.
    pub fn pk_values(&self, key: &ObjectKey) -> Option<&[Value]> {
        self.entries.get_key_value(key).map(|(k, _)| k.pk())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    /// The key `entity` is managed under, if this exact instance is managed.
    pub fn key_of(&self, entity: &dyn ManagedEntity) -> Option<ObjectKey> {
        let key = ObjectKey::new(entity.table(), &entity.primary_key());
        self.entries
            .get(&key)
            .is_some_and(|managed| managed.same_instance(entity))
            .then_some(key)
    }

    pub fn evict(&mut self, key: &ObjectKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict every instance of `table`; returns the evicted keys.
    pub fn evict_table(&mut self, table: &str) -> Vec<ObjectKey> {
        let keys: Vec<ObjectKey> = self.entries.keys().filter(|k| k.table == table).cloned().collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys
    }

    /// Drop every entry, as at the end of a unit of work.
    pub fn evict_all(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> + '_ {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Member, Team};
    use persist_core::{Managed, read_model};

    fn managed_team(id: i64, name: &str) -> Arc<dyn ManagedEntity> {
        Arc::new(Managed::new(Team::new(Some(id), name)))
    }

    #[test]
    fn test_identity_map_register_and_get() {
        let mut map = IdentityMap::new();
        let key = map.register(managed_team(1, "A")).unwrap();
        assert_eq!(key, ObjectKey::of::<Team>(&[Value::BigInt(1)]));
        assert!(map.contains(&key));

        let team = map.get::<Team>(&[Value::Int(1)]).unwrap();
        assert_eq!(read_model(&team).name, "A");
        assert!(map.get::<Member>(&[Value::BigInt(1)]).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_identity_map_same_instance_twice() {
        let mut map = IdentityMap::new();
        let team = managed_team(1, "A");
        map.register(Arc::clone(&team)).unwrap();
        map.register(Arc::clone(&team)).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.key_of(&*team), Some(ObjectKey::of::<Team>(&[Value::BigInt(1)])));
    }

    #[test]
    fn test_identity_map_duplicate_identity() {
        let mut map = IdentityMap::new();
        map.register(managed_team(1, "A")).unwrap();
        let twin = managed_team(1, "A");
        let err = map.register(Arc::clone(&twin)).unwrap_err();
        assert!(err.is_duplicate_identity());
        assert_eq!(map.key_of(&*twin), None);
    }

    #[test]
    fn test_identity_map_evict_table() {
        let mut map = IdentityMap::new();
        map.register(managed_team(1, "A")).unwrap();
        map.register(managed_team(2, "B")).unwrap();
        map.register(Arc::new(Managed::new(Member::new(Some(1), "m", 10, None))))
            .unwrap();
        assert_eq!(map.evict_table("team").len(), 2);
        assert_eq!(map.len(), 1);
        map.evict_all();
        assert!(map.is_empty());
    }

    #[test]
    fn test_keys_with_equal_hashes_stay_distinct() {
        let one = ObjectKey::of::<Team>(&[Value::BigInt(1)]);
        let mut other = ObjectKey::of::<Team>(&[Value::BigInt(2)]);
        other.pk_hash = one.pk_hash;
        assert_ne!(one, other);

        let mut map = IdentityMap::new();
        map.entries.insert(one.clone(), managed_team(1, "A"));
        map.entries.insert(other.clone(), managed_team(2, "B"));
        assert_eq!(map.len(), 2);
        assert_eq!(map.pk_values(&other), Some(&[Value::BigInt(2)][..]));

        // integer widths name the same row
        assert_eq!(one, ObjectKey::of::<Team>(&[Value::Int(1)]));
    }
}
