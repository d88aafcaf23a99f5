//! # Server identities and entity addresses

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

use meshrpc::AuthRequest;
use meshrpc::AuthResponse;

/// A server process in the cluster, plus the child ids it also answers for.
///
/// Two identities are equal when type and id match; children are ignored.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub server_type: i32,
    pub server_id: i32,
    pub child_ids: Vec<i32>,
}

impl ServerIdentity {
    pub fn new(server_type: i32, server_id: i32) -> Self {
        Self {
            server_type,
            server_id,
            child_ids: Vec::new(),
        }
    }

    pub fn with_children(mut self, child_ids: impl IntoIterator<Item = i32>) -> Self {
        self.child_ids.extend(child_ids);
        self
    }

    /// True if `id` is this server or one of its declared children.
    pub fn is_include(&self, id: i32) -> bool {
        self.server_id == id || self.child_ids.contains(&id)
    }

    pub fn address(&self) -> EntityAddress {
        EntityAddress::new(self.server_type, self.server_id)
    }

    pub(crate) fn auth_request(&self) -> AuthRequest {
        AuthRequest {
            server_type: self.server_type,
            server_id: self.server_id,
            child_ids: self.child_ids.clone(),
        }
    }

    pub(crate) fn auth_response(&self) -> AuthResponse {
        AuthResponse {
            server_type: self.server_type,
            server_id: self.server_id,
        }
    }
}

impl From<AuthRequest> for ServerIdentity {
    fn from(req: AuthRequest) -> Self {
        Self {
            server_type: req.server_type,
            server_id: req.server_id,
            child_ids: req.child_ids,
        }
    }
}

impl From<AuthResponse> for ServerIdentity {
    fn from(resp: AuthResponse) -> Self {
        Self::new(resp.server_type, resp.server_id)
    }
}

impl PartialEq for ServerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.server_type == other.server_type && self.server_id == other.server_id
    }
}

impl Eq for ServerIdentity {}

impl Hash for ServerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.server_type.hash(state);
        self.server_id.hash(state);
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}/{}", self.server_type, self.server_id)
    }
}

/// The server that owns an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityAddress {
    pub server_type: i32,
    pub server_id: i32,
}

impl EntityAddress {
    pub const fn new(server_type: i32, server_id: i32) -> Self {
        Self { server_type, server_id }
    }
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_type, self.server_id)
    }
}
