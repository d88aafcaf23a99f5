//! # Meshrun
//!
//! Location-transparent messaging for a cluster of typed servers.
//!
//! ## Architecture
//!
//! - **Node**: `ClusterNode` owns everything one server needs. There is no
//!   global state, so tests run whole topologies in one process.
//! - **Links**: each authenticated peer is a `Link`, which pairs a
//!   `Connection` with an `RpcAddon` that tracks its outstanding requests.
//! - **Router**: sends traffic over a direct link when one exists. Otherwise
//!   it goes through exactly one cross-connect relay.
//! - **Entities**: `EntityRef` hides whether an entity is local, remote or
//!   missing. Remote refs confirm existence once, queue meanwhile, then stream.
//!
//! ## Sequence numbers
//!
//! Each requester numbers its own requests from 1 upward and wraps back to
//! 1, never 0. A reply carries the negated request number. Sequence spaces
//! are per requester (one per link, ref, or mailbox) and never shared.

pub mod callback;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod entity;
pub mod finder;
mod forward;
pub mod identity;
pub mod mailbox;
pub mod node;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod seq;
pub mod tcp;
pub mod transport;

pub use callback::CallError;
pub use callback::CallResult;
pub use callback::Reply;

pub use channel::DuplexChannelTransport;
pub use config::ClusterConfig;

pub use connection::Connection;
pub use connection::Link;
pub use connection::PeerConnection;

pub use entity::EntityRef;
pub use entity::RefState;
pub use entity::RemoteRef;

pub use finder::AddressFinder;
pub use finder::LocalEntities;
pub use finder::LocalEntityFinder;
pub use finder::ShardedAddressFinder;

pub use identity::EntityAddress;
pub use identity::ServerIdentity;

pub use mailbox::Mailbox;
pub use mailbox::MessageHandler;

pub use node::ClusterNode;
pub use node::NodeBuilder;

pub use registry::Registry;
pub use router::Hop;
pub use router::Router;
pub use rpc::RpcAddon;
pub use seq::SeqGenerator;
pub use tcp::TcpTransport;
pub use transport::Transport;

#[cfg(test)]
mod tests;
