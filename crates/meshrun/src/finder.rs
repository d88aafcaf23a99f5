//! # Entity location
//!
//! Two questions the runtime cannot answer on its own: which server owns an
//! entity (`AddressFinder`), and whether this server hosts it right now
//! (`LocalEntityFinder`). `LocalEntities` and `ShardedAddressFinder` are the
//! stock answers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::entity::EmptyRef;
use crate::entity::EntityRef;
use crate::entity::LocalRef;
use crate::identity::EntityAddress;
use crate::mailbox::Mailbox;
use crate::mailbox::MessageHandler;

pub trait LocalEntityFinder: Send + Sync + 'static {
    /// True if this server is responsible for the entity.
    fn is_local_entity(&self, entity_type: i32, entity_id: i64) -> bool;

    /// A `Local` ref when the entity is live here, `Empty` otherwise.
    fn get_local_entity(&self, entity_type: i32, entity_id: i64) -> EntityRef;

    fn exists(&self, entity_type: i32, entity_id: i64) -> bool {
        matches!(self.get_local_entity(entity_type, entity_id), EntityRef::Local(_))
    }
}

pub trait AddressFinder: Send + Sync + 'static {
    fn find_address(&self, entity_type: i32, entity_id: i64) -> Option<EntityAddress>;
}

impl<F> AddressFinder for F
where
    F: Fn(i32, i64) -> Option<EntityAddress> + Send + Sync + 'static,
{
    fn find_address(&self, entity_type: i32, entity_id: i64) -> Option<EntityAddress> {
        self(entity_type, entity_id)
    }
}

/// Maps each entity type to a server type and spreads ids over its servers
/// by `entity_id mod server_count`.
#[derive(Debug, Clone, Default)]
pub struct ShardedAddressFinder {
    shards: HashMap<i32, (i32, Vec<i32>)>,
}

impl ShardedAddressFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shard(mut self, entity_type: i32, server_type: i32, server_ids: Vec<i32>) -> Self {
        self.shards.insert(entity_type, (server_type, server_ids));
        self
    }
}

impl AddressFinder for ShardedAddressFinder {
    fn find_address(&self, entity_type: i32, entity_id: i64) -> Option<EntityAddress> {
        let (server_type, ids) = self.shards.get(&entity_type)?;
        if ids.is_empty() {
            return None;
        }
        let idx = entity_id.rem_euclid(ids.len() as i64) as usize;
        Some(EntityAddress::new(*server_type, ids[idx]))
    }
}

/// The entities hosted by this server, each behind its own mailbox.
pub struct LocalEntities {
    local: EntityAddress,
    address_finder: Arc<dyn AddressFinder>,
    entities: DashMap<(i32, i64), Mailbox>,
    sweep_interval: Duration,
    not_exists_code: i32,
}

impl LocalEntities {
    pub fn new(local: EntityAddress, address_finder: Arc<dyn AddressFinder>, config: &ClusterConfig) -> Self {
        Self {
            local,
            address_finder,
            entities: DashMap::new(),
            sweep_interval: config.addon_sweep_interval,
            not_exists_code: config.not_exists_code,
        }
    }

    /// Starts an entity, replacing any previous instance with the same id.
    pub fn spawn(&self, entity_type: i32, entity_id: i64, handler: impl MessageHandler) -> Mailbox {
        let mailbox = Mailbox::spawn(entity_type, entity_id, Arc::new(handler), self.sweep_interval);
        if self.entities.insert((entity_type, entity_id), mailbox.clone()).is_some() {
            debug!(entity_type, entity_id, "replaced running entity");
        }
        mailbox
    }

    /// Stops routing to an entity. Its task ends once queued work drains.
    pub fn remove(&self, entity_type: i32, entity_id: i64) -> bool {
        self.entities.remove(&(entity_type, entity_id)).is_some()
    }

    pub fn get(&self, entity_type: i32, entity_id: i64) -> Option<Mailbox> {
        self.entities
            .get(&(entity_type, entity_id))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl LocalEntityFinder for LocalEntities {
    fn is_local_entity(&self, entity_type: i32, entity_id: i64) -> bool {
        self.entities.contains_key(&(entity_type, entity_id))
            || self.address_finder.find_address(entity_type, entity_id) == Some(self.local)
    }

    fn get_local_entity(&self, entity_type: i32, entity_id: i64) -> EntityRef {
        match self.get(entity_type, entity_id) {
            Some(mailbox) if !mailbox.is_closed() => {
                EntityRef::Local(LocalRef::new(mailbox))
            }
            _ => EntityRef::Empty(EmptyRef::new(entity_type, entity_id, self.not_exists_code)),
        }
    }
}
