//! # Message ids and return codes
//!
//! Ids below `FIRST_USER_ID` belong to the cluster protocol itself; the
//! dispatcher intercepts them before any user handler sees a frame.

pub mod msg_id {
    pub const AUTH_REQUEST: i32 = 1;
    pub const AUTH_RESPONSE: i32 = 2;
    pub const HEARTBEAT: i32 = 3;
    pub const RETURN_CODE: i32 = 4;

    pub const FORWARD: i32 = 10;
    pub const RPC_FORWARD: i32 = 11;
    pub const MULTI_FORWARD: i32 = 12;
    pub const ENTITY_CHECK_REQUEST: i32 = 13;
    pub const ENTITY_CHECK_RESPONSE: i32 = 14;
    pub const ENTITY_FORWARD_REQUEST: i32 = 15;
    pub const ENTITY_FORWARD_RESPONSE: i32 = 16;

    pub const FIRST_USER_ID: i32 = 100;

    /// True for ids reserved by the cluster protocol.
    pub fn is_system(id: i32) -> bool {
        (0..FIRST_USER_ID).contains(&id)
    }
}

/// Values carried by `ReturnCode` replies.
pub mod code {
    pub const OK: i32 = 0;
    /// No connection to the destination server could be resolved.
    pub const DESTINATION_UNREACHABLE: i32 = 1001;
    /// The addressed entity has no live instance.
    pub const ENTITY_NOT_EXISTS: i32 = 1002;
    /// The forwarded payload could not be decoded at the destination.
    pub const DECODE_FAILED: i32 = 1003;
    /// A relay hop could not pass an RPC-Forward on.
    pub const FORWARD_FAILED: i32 = 1004;
    /// The destination decoded the payload but had no handler for it.
    pub const NO_HANDLER: i32 = 1005;
    /// The request was not answered in time.
    pub const TIMEOUT: i32 = 1006;
    /// The connection was inactive when the request was issued.
    pub const INVALID_CONNECTION: i32 = 1007;
    /// The connection dropped while the request was in flight.
    pub const CONNECTION_LOST: i32 = 1008;
    /// The owner of the pending request shut down.
    pub const SHUTDOWN: i32 = 1009;
    /// The request could not be encoded.
    pub const ENCODE_FAILED: i32 = 1010;
}
