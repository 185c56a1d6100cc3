//! Client-side entity repository.

use crate::error::{ClientError, ClientResult};
use replicant_protocol::{ChannelAddress, EntityKey};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A verification hook run against entities of one type during world
/// validation. Returns a description of the failure, if any.
pub type EntityVerifier = Box<dyn Fn(&Entity) -> Result<(), String>>;

/// One locally replicated entity.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Type and id.
    pub key: EntityKey,
    /// Merged attribute data.
    pub data: serde_json::Map<String, Value>,
    /// Channels this entity is linked through.
    pub subscriptions: HashSet<ChannelAddress>,
    /// Set once `link` has run after the entity's latest change.
    pub linked: bool,
    /// Set when the entity has been removed from the world.
    pub disposed: bool,
}

impl Entity {
    fn new(key: EntityKey) -> Self {
        Self {
            key,
            data: serde_json::Map::new(),
            subscriptions: HashSet::new(),
            linked: false,
            disposed: false,
        }
    }

    /// Reads an attribute.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Holds all locally replicated entities for one connector.
#[derive(Default)]
pub struct EntityRepository {
    entities: HashMap<EntityKey, Entity>,
    verifiers: HashMap<u32, EntityVerifier>,
}

impl EntityRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a verification hook for a replicated type.
    pub fn register_verifier(
        &mut self,
        type_id: u32,
        verifier: impl Fn(&Entity) -> Result<(), String> + 'static,
    ) {
        self.verifiers.insert(type_id, Box::new(verifier));
    }

    /// Creates or updates an entity, merging `data` over existing
    /// attributes. A freshly changed entity needs relinking.
    pub fn create_or_update(
        &mut self,
        key: EntityKey,
        data: &serde_json::Map<String, Value>,
    ) -> &mut Entity {
        let entity = self.entities.entry(key).or_insert_with(|| Entity::new(key));
        entity.disposed = false;
        entity.linked = false;
        for (name, value) in data {
            entity.data.insert(name.clone(), value.clone());
        }
        entity
    }

    /// Looks up an entity.
    pub fn get(&self, key: &EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    /// Looks up an entity mutably.
    pub fn get_mut(&mut self, key: &EntityKey) -> Option<&mut Entity> {
        self.entities.get_mut(key)
    }

    /// Disposes an entity. Removing an entity that does not exist locally
    /// is tolerated and returns false.
    pub fn dispose(&mut self, key: &EntityKey) -> bool {
        self.entities.remove(key).is_some()
    }

    /// Marks an entity linked. Returns true if a live entity was linked.
    pub fn link(&mut self, key: &EntityKey) -> bool {
        match self.entities.get_mut(key) {
            Some(entity) if !entity.disposed => {
                entity.linked = true;
                true
            }
            _ => false,
        }
    }

    /// Detaches an entity from a channel; disposes it when no channel
    /// references remain. Returns true if the entity was disposed.
    pub fn unlink_from_channel(&mut self, key: &EntityKey, address: &ChannelAddress) -> bool {
        if let Some(entity) = self.entities.get_mut(key) {
            entity.subscriptions.remove(address);
            if entity.subscriptions.is_empty() {
                self.entities.remove(key);
                return true;
            }
        }
        false
    }

    /// Validates every tracked entity: none may be disposed-but-referenced
    /// and each must satisfy its type's verification contract.
    pub fn validate_world(&self) -> ClientResult<()> {
        for entity in self.entities.values() {
            if entity.disposed {
                return Err(ClientError::Verification {
                    key: entity.key,
                    message: "disposed entity still referenced".into(),
                });
            }
            if let Some(verifier) = self.verifiers.get(&entity.key.type_id) {
                verifier(entity).map_err(|message| ClientError::Verification {
                    key: entity.key,
                    message,
                })?;
            }
        }
        Ok(())
    }

    /// Iterates live entities.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Returns the number of tracked entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if no entities are tracked.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Drops every entity (connection disposal path).
    pub fn clear(&mut self) {
        self.entities.clear();
    }
}

impl std::fmt::Debug for EntityRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRepository")
            .field("entities", &self.entities.len())
            .field("verifiers", &self.verifiers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn create_then_update_merges() {
        let mut repo = EntityRepository::new();
        let key = EntityKey::new(0, 1);

        repo.create_or_update(key, &data(&[("name", json!("a")), ("n", json!(1))]));
        repo.create_or_update(key, &data(&[("n", json!(2))]));

        let entity = repo.get(&key).unwrap();
        assert_eq!(entity.attribute("name"), Some(&json!("a")));
        assert_eq!(entity.attribute("n"), Some(&json!(2)));
        assert!(!entity.linked);
    }

    #[test]
    fn dispose_missing_is_tolerated() {
        let mut repo = EntityRepository::new();
        assert!(!repo.dispose(&EntityKey::new(0, 99)));
    }

    #[test]
    fn unlink_last_channel_disposes() {
        let mut repo = EntityRepository::new();
        let key = EntityKey::new(0, 1);
        let addr = ChannelAddress::new(1, 0);

        repo.create_or_update(key, &serde_json::Map::new());
        repo.get_mut(&key).unwrap().subscriptions.insert(addr);

        assert!(repo.unlink_from_channel(&key, &addr));
        assert!(repo.get(&key).is_none());
    }

    #[test]
    fn verifier_failure_surfaces() {
        let mut repo = EntityRepository::new();
        let key = EntityKey::new(7, 1);
        repo.register_verifier(7, |entity| {
            if entity.attribute("name").is_some() {
                Ok(())
            } else {
                Err("missing name".into())
            }
        });
        repo.create_or_update(key, &serde_json::Map::new());

        let err = repo.validate_world().unwrap_err();
        assert!(matches!(err, ClientError::Verification { .. }));

        repo.create_or_update(key, &data(&[("name", json!("x"))]));
        repo.validate_world().unwrap();
    }
}
