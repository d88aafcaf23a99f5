//! # Router
//!
//! Picks the connection that carries traffic toward a server.
//!
//! The first choice is a direct link to the destination (or to a server that
//! declared the destination as a child). Without one, traffic goes through a
//! cross-connect server: the relay types are tried in configured order and the
//! link is chosen by `dst_id mod link_count` over links sorted by server id,
//! so one destination always rides the same relay while the set is stable.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::connection::Link;
use crate::identity::ServerIdentity;

/// How a destination is reached.
#[derive(Debug, Clone)]
pub enum Hop {
    /// The link ends at the destination.
    Direct(Arc<Link>),
    /// The link ends at a relay that has the destination's link.
    Relay(Arc<Link>),
}

impl Hop {
    pub fn link(&self) -> &Arc<Link> {
        match self {
            Self::Direct(link) | Self::Relay(link) => link,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(_))
    }
}

pub struct Router {
    local: ServerIdentity,
    cross_connect: Vec<i32>,
    links: DashMap<i32, DashMap<i32, Arc<Link>>>,
}

impl Router {
    pub fn new(local: ServerIdentity, cross_connect: Vec<i32>) -> Self {
        Self {
            local,
            cross_connect,
            links: DashMap::new(),
        }
    }

    pub fn local(&self) -> &ServerIdentity {
        &self.local
    }

    /// True if `(server_type, server_id)` names this node or one of its children.
    pub fn is_local(&self, server_type: i32, server_id: i32) -> bool {
        self.local.server_type == server_type && self.local.is_include(server_id)
    }

    /// Registers a link, returning the one it replaced.
    pub fn add(&self, link: Arc<Link>) -> Option<Arc<Link>> {
        let peer = link.peer().clone();
        debug!(peer = %peer, "link added");
        self.links
            .entry(peer.server_type)
            .or_default()
            .insert(peer.server_id, link)
    }

    /// Removes `link` if it is still the registered link for its peer.
    pub fn remove(&self, link: &Arc<Link>) -> bool {
        let peer = link.peer();
        let removed = match self.links.get(&peer.server_type) {
            Some(by_id) => by_id
                .remove_if(&peer.server_id, |_, current| Arc::ptr_eq(current, link))
                .is_some(),
            None => false,
        };
        if removed {
            debug!(peer = %peer, "link removed");
        }
        removed
    }

    pub fn get(&self, server_type: i32, server_id: i32) -> Option<Arc<Link>> {
        let by_id = self.links.get(&server_type)?;
        let link = by_id.get(&server_id)?;
        Some(link.value().clone())
    }

    /// An active link that ends at the destination, or at a server that
    /// declared it as a child.
    pub fn direct(&self, server_type: i32, server_id: i32) -> Option<Arc<Link>> {
        let by_id = self.links.get(&server_type)?;
        if let Some(link) = by_id.get(&server_id) {
            if link.is_active() {
                return Some(link.value().clone());
            }
        }
        by_id
            .iter()
            .find(|e| e.value().is_active() && e.value().peer().is_include(server_id))
            .map(|e| e.value().clone())
    }

    /// A relay link for destination id `dst_id`.
    pub fn relay(&self, dst_id: i32) -> Option<Arc<Link>> {
        for relay_type in &self.cross_connect {
            let mut candidates = self.active_links_of(*relay_type);
            if candidates.is_empty() {
                continue;
            }
            candidates.sort_by_key(|link| link.peer().server_id);
            let idx = dst_id.rem_euclid(candidates.len() as i32) as usize;
            return Some(candidates.swap_remove(idx));
        }
        None
    }

    pub fn route(&self, server_type: i32, server_id: i32) -> Option<Hop> {
        if let Some(link) = self.direct(server_type, server_id) {
            return Some(Hop::Direct(link));
        }
        if self.cross_connect.contains(&server_type) {
            // Relays do not relay for each other.
            return None;
        }
        self.relay(server_id).map(Hop::Relay)
    }

    pub fn active_links_of(&self, server_type: i32) -> Vec<Arc<Link>> {
        match self.links.get(&server_type) {
            Some(by_id) => by_id
                .iter()
                .filter(|e| e.value().is_active())
                .map(|e| e.value().clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn links(&self) -> Vec<Arc<Link>> {
        self.links
            .iter()
            .flat_map(|by_id| by_id.iter().map(|e| e.value().clone()).collect::<Vec<_>>())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.iter().map(|by_id| by_id.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
