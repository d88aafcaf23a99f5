use crate::*;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use meshpack::Cursor;
use meshpack::Encoder;
use meshpack::Frame;
use meshrpc::BoxMessage;
use meshrpc::EntityEnvelope;
use meshrpc::EntityKind;
use meshrpc::ForwardEnvelope;
use meshrpc::ForwardKind;
use meshrpc::Heartbeat;
use meshrpc::Message;
use meshrpc::MessageType;
use meshrpc::ReturnCode;
use meshrpc::Route;
use meshrpc::code;
use meshrpc::decode_body;
use meshrpc::frame_of;
use meshrpc::msg_id;
use tokio::time::Instant;

use crate::callback::Callback;
use crate::callback::CallbackCache;
use crate::entity::SweepOutcome;
use crate::entity::SweepPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Ping {
    text: String,
}

impl Message for Ping {
    fn msg_id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, enc: &mut Encoder) -> meshrpc::Result<()> {
        enc.str(&self.text)?;
        Ok(())
    }
}

impl MessageType for Ping {
    const ID: i32 = 100;

    fn decode(cur: &mut Cursor<'_>) -> meshrpc::Result<Self> {
        Ok(Self { text: cur.str()?.to_string() })
    }
}

fn ping(text: &str) -> Ping {
    Ping { text: text.to_string() }
}

fn ping_bytes(text: &str) -> Vec<u8> {
    (&ping(text) as &dyn Message).to_bytes().expect("encode ping")
}

fn text_of(msg: &BoxMessage) -> Option<&str> {
    msg.downcast_ref::<Ping>().map(|p| p.text.as_str())
}

fn echo(msg: BoxMessage) -> Option<BoxMessage> {
    Some(msg)
}

/// A connection that records every frame instead of writing it.
struct RecordingConnection {
    peer: ServerIdentity,
    active: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<Frame>>,
}

impl RecordingConnection {
    fn new(server_type: i32, server_id: i32) -> Arc<Self> {
        Self::with_peer(ServerIdentity::new(server_type, server_id))
    }

    fn with_peer(peer: ServerIdentity) -> Arc<Self> {
        Arc::new(Self {
            peer,
            active: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    async fn wait_for(&self, n: usize) -> Vec<Frame> {
        for _ in 0..200 {
            if self.count() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.take()
    }
}

impl Connection for RecordingConnection {
    fn peer(&self) -> &ServerIdentity {
        &self.peer
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn send(&self, frame: Frame) -> connection::Result<()> {
        if !self.is_active() || self.fail_sends.load(Ordering::Acquire) {
            return Err(connection::Error::Closed);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn router_with_peer(peer: ServerIdentity) -> (Arc<Router>, Arc<RecordingConnection>) {
    let local = ServerIdentity::new(1, 1);
    let router = Arc::new(Router::new(local.clone(), vec![9]));
    let conn = RecordingConnection::with_peer(peer);
    router.add(Arc::new(Link::new(conn.clone(), &local)));
    (router, conn)
}

fn remote_ref(router: Arc<Router>, address: Option<EntityAddress>) -> Arc<RemoteRef> {
    Arc::new(RemoteRef::new(50, 7, address, router, code::ENTITY_NOT_EXISTS))
}

fn policy() -> SweepPolicy {
    SweepPolicy {
        check_timeout: Duration::from_secs(60),
        invalid_grace: Duration::from_secs(30),
        idle_threshold: Duration::from_secs(600),
    }
}

// ============================================================================
//  SEQUENCE NUMBERS
// ============================================================================

#[test]
fn test_seq_starts_at_one_and_wraps_past_max() {
    let seq = SeqGenerator::new();
    assert_eq!(seq.next(), 1);
    assert_eq!(seq.next(), 2);

    let seq = SeqGenerator::starting_after(i32::MAX - 1);
    assert_eq!(seq.next(), i32::MAX);
    assert_eq!(seq.next(), 1);
}

#[test]
fn test_seq_unique_across_threads() {
    let seq = SeqGenerator::new();
    let all: Vec<i32> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| (0..1000).map(|_| seq.next()).collect::<Vec<_>>()))
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    let unique: HashSet<i32> = all.iter().copied().collect();
    assert_eq!(unique.len(), 8000);
    assert!(all.iter().all(|s| *s > 0));
}

// ============================================================================
//  CALLBACK CACHE
// ============================================================================

#[tokio::test]
async fn test_cache_resolves_once() -> anyhow::Result<()> {
    let cache = CallbackCache::new();
    let (cb, reply) = Callback::new(1, Duration::from_secs(5));
    cache.add(cb);

    assert!(cache.receive_response(1, Box::new(ping("first"))));
    assert!(!cache.receive_response(1, Box::new(ping("second"))));
    assert!(!cache.handle_exception(1, CallError::Timeout));

    let msg = reply.await?;
    assert_eq!(text_of(&msg), Some("first"));
    assert!(cache.is_empty());
    Ok(())
}

#[test]
fn test_cache_acknowledges_unmatched_return_code() {
    let cache = CallbackCache::new();
    assert!(cache.receive_response(3, Box::new(ReturnCode::ok())));
    assert!(!cache.receive_response(3, Box::new(ping("stray"))));
}

#[tokio::test]
async fn test_cache_error_code_becomes_error() {
    let cache = CallbackCache::new();
    let (cb, reply) = Callback::new(4, Duration::from_secs(5));
    cache.add(cb);
    cache.receive_response(4, Box::new(ReturnCode::new(code::NO_HANDLER)));
    assert_eq!(reply.await.unwrap_err(), CallError::NoHandler);
}

#[tokio::test]
async fn test_cache_expiry_is_idempotent() {
    let cache = CallbackCache::new();
    let (short, short_reply) = Callback::new(1, Duration::from_millis(100));
    let (long, _long_reply) = Callback::new(2, Duration::from_secs(60));
    cache.add(short);
    cache.add(long);

    let later = Instant::now() + Duration::from_secs(1);
    assert_eq!(cache.check_expired(later), 1);
    assert_eq!(cache.check_expired(later), 0);
    assert_eq!(short_reply.await.unwrap_err(), CallError::Timeout);

    // A reply after expiry finds nothing.
    assert!(!cache.receive_response(1, Box::new(ping("late"))));
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_cache_handler_callback_runs() {
    let cache = CallbackCache::new();
    let (tx, rx) = tokio::sync::oneshot::channel();
    cache.add(Callback::with_handler(9, Duration::from_secs(5), move |result| {
        let _ = tx.send(result.map(|m| text_of(&m).map(str::to_string)));
    }));
    cache.receive_response(9, Box::new(ping("via handler")));
    assert_eq!(rx.await.unwrap(), Ok(Some("via handler".to_string())));
}

#[tokio::test]
async fn test_cache_fail_all() {
    let cache = CallbackCache::new();
    let (a, ra) = Callback::new(1, Duration::from_secs(5));
    let (b, rb) = Callback::new(2, Duration::from_secs(5));
    cache.add(a);
    cache.add(b);
    assert_eq!(cache.fail_all(CallError::ConnectionLost), 2);
    assert_eq!(ra.await.unwrap_err(), CallError::ConnectionLost);
    assert_eq!(rb.await.unwrap_err(), CallError::ConnectionLost);
}

// ============================================================================
//  CONNECTION RPC
// ============================================================================

#[tokio::test]
async fn test_rpc_ask_on_inactive_connection_fails_fast() {
    let conn = RecordingConnection::new(2, 1);
    conn.close();
    let link = Link::new(conn.clone(), &ServerIdentity::new(1, 1));

    let err = link.rpc.ask(&ping("x"), Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err, CallError::InvalidConnection);
    assert_eq!(link.rpc.pending_count(), 0);
    assert_eq!(conn.count(), 0);
}

#[tokio::test]
async fn test_rpc_send_failure_fails_callback() {
    let conn = RecordingConnection::new(2, 1);
    conn.fail_sends.store(true, Ordering::Release);
    let link = Link::new(conn.clone(), &ServerIdentity::new(1, 1));

    let err = link.rpc.ask(&ping("x"), Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err, CallError::ConnectionLost);
    assert_eq!(link.rpc.pending_count(), 0);
}

#[tokio::test]
async fn test_rpc_forward_ask_wraps_request() -> anyhow::Result<()> {
    let conn = RecordingConnection::new(9, 1);
    let link = Link::new(conn.clone(), &ServerIdentity::new(1, 1));

    let reply = link.rpc.forward_ask(3, 4, &ping("hop"), Duration::from_secs(5));
    let sent = conn.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_id, msg_id::RPC_FORWARD);
    assert_eq!(sent[0].seq, 0);

    let env = ForwardEnvelope::from_frame(&sent[0])?;
    assert_eq!(env.route, Route::new(1, 1, 3, 4));
    assert_eq!(env.fwd_seq, 1);
    assert_eq!(env.fwd_msg_id, Ping::ID);

    link.rpc.receive_response(1, Box::new(ping("back")));
    assert_eq!(text_of(&reply.await?), Some("back"));
    Ok(())
}

// ============================================================================
//  ROUTER
// ============================================================================

#[test]
fn test_router_prefers_direct_then_relay() {
    let local = ServerIdentity::new(1, 1);
    let router = Router::new(local.clone(), vec![9]);
    for id in [3, 1, 2] {
        router.add(Arc::new(Link::new(RecordingConnection::new(9, id), &local)));
    }
    let parent = RecordingConnection::with_peer(ServerIdentity::new(2, 5).with_children([6]));
    router.add(Arc::new(Link::new(parent, &local)));

    let hop = router.route(2, 5).unwrap();
    assert!(hop.is_direct());
    assert_eq!(hop.link().peer().server_id, 5);

    let child = router.route(2, 6).unwrap();
    assert!(child.is_direct());
    assert_eq!(child.link().peer().server_id, 5);

    // Relays sorted by id: [1, 2, 3]; 4 mod 3 picks the middle one.
    let relayed = router.route(3, 4).unwrap();
    assert!(!relayed.is_direct());
    assert_eq!(relayed.link().peer().server_id, 2);
    assert_eq!(router.route(3, -2).unwrap().link().peer().server_id, 2);

    // Relay servers are never reached through another relay.
    assert!(router.route(9, 7).is_none());
    assert!(router.is_local(1, 1));
    assert!(!router.is_local(1, 2));
    assert_eq!(router.len(), 4);
}

#[test]
fn test_router_skips_inactive_links() {
    let local = ServerIdentity::new(1, 1);
    let router = Router::new(local.clone(), vec![9]);
    let dead = RecordingConnection::new(9, 1);
    dead.close();
    router.add(Arc::new(Link::new(dead, &local)));
    router.add(Arc::new(Link::new(RecordingConnection::new(9, 2), &local)));

    assert_eq!(router.relay(0).unwrap().peer().server_id, 2);
    assert!(router.direct(9, 1).is_none());
}

#[test]
fn test_router_remove_only_current_link() {
    let local = ServerIdentity::new(1, 1);
    let router = Router::new(local.clone(), Vec::new());
    let old = Arc::new(Link::new(RecordingConnection::new(2, 1), &local));
    let new = Arc::new(Link::new(RecordingConnection::new(2, 1), &local));
    router.add(old.clone());
    assert!(router.add(new.clone()).is_some());

    assert!(!router.remove(&old));
    assert!(router.get(2, 1).is_some());
    assert!(router.remove(&new));
    assert!(router.is_empty());
}

// ============================================================================
//  FINDERS AND MAILBOXES
// ============================================================================

#[test]
fn test_sharded_finder() {
    let finder = ShardedAddressFinder::new().with_shard(50, 2, vec![10, 11, 12]);
    assert_eq!(finder.find_address(50, 4), Some(EntityAddress::new(2, 11)));
    assert_eq!(finder.find_address(50, -1), Some(EntityAddress::new(2, 12)));
    assert_eq!(finder.find_address(51, 4), None);
}

#[tokio::test]
async fn test_mailbox_ask_without_response_is_ok() -> anyhow::Result<()> {
    let mailbox = Mailbox::spawn(
        50,
        1,
        Arc::new(|_msg: BoxMessage| -> Option<BoxMessage> { None }),
        Duration::from_secs(1),
    );
    let msg = mailbox.ask(Box::new(ping("hi")), Duration::from_secs(5)).await?;
    assert_eq!(msg.downcast_ref::<ReturnCode>(), Some(&ReturnCode::ok()));
    assert_eq!(mailbox.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_mailbox_handles_in_order() -> anyhow::Result<()> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let mailbox = Mailbox::spawn(
        50,
        2,
        Arc::new(move |msg: BoxMessage| -> Option<BoxMessage> {
            log.lock().unwrap().push(text_of(&msg).unwrap_or_default().to_string());
            Some(msg)
        }),
        Duration::from_secs(1),
    );
    for i in 0..5 {
        assert!(mailbox.tell(Box::new(ping(&i.to_string()))));
    }
    let last = mailbox.ask(Box::new(ping("end")), Duration::from_secs(5)).await?;
    assert_eq!(text_of(&last), Some("end"));
    assert_eq!(*seen.lock().unwrap(), vec!["0", "1", "2", "3", "4", "end"]);
    Ok(())
}

// ============================================================================
//  REMOTE REFS
// ============================================================================

#[tokio::test]
async fn test_concurrent_asks_send_one_check() -> anyhow::Result<()> {
    init_tracing();
    let (router, conn) = router_with_peer(ServerIdentity::new(3, 1));
    let r = remote_ref(router, Some(EntityAddress::new(3, 1)));

    let replies: Vec<Reply> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let r = &r;
                s.spawn(move || r.ask(&ping(&format!("m{i}")), Duration::from_secs(5)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let sent = conn.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_id, msg_id::ENTITY_CHECK_REQUEST);
    assert_eq!(r.state(), RefState::Check);
    assert_eq!(r.queued_len(), 8);

    r.on_check_result(true);
    assert_eq!(r.state(), RefState::Run);
    let forwarded = conn.take();
    assert_eq!(forwarded.len(), 8);
    for frame in &forwarded {
        let env = EntityEnvelope::from_frame(frame)?;
        assert_eq!(env.kind, EntityKind::ForwardRequest);
        let resp = env.forward_response(env.fwd_msg_id, env.fwd_data.clone());
        assert!(r.on_forward_response(-resp.fwd_seq, Box::new(decode_body::<Ping>(&resp.fwd_data)?)));
    }

    let mut texts = Vec::new();
    for reply in replies {
        texts.push(text_of(&reply.await?).unwrap_or_default().to_string());
    }
    texts.sort();
    assert_eq!(texts, (0..8).map(|i| format!("m{i}")).collect::<Vec<_>>());
    assert_eq!(r.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_entity_fails_queue() {
    let (router, conn) = router_with_peer(ServerIdentity::new(3, 1));
    let r = remote_ref(router, Some(EntityAddress::new(3, 1)));

    let a = r.ask(&ping("a"), Duration::from_secs(5));
    r.tell(&ping("b"));
    let c = r.ask(&ping("c"), Duration::from_secs(5));
    assert_eq!(conn.take().len(), 1);

    r.on_check_result(false);
    assert_eq!(r.state(), RefState::Invalid);
    assert_eq!(r.queued_len(), 0);
    assert_eq!(a.await.unwrap_err(), CallError::EntityNotExists);
    assert_eq!(c.await.unwrap_err(), CallError::EntityNotExists);

    // Later calls fail without traffic.
    let d = r.ask(&ping("d"), Duration::from_secs(5));
    assert_eq!(d.await.unwrap_err(), CallError::EntityNotExists);
    assert_eq!(conn.count(), 0);
}

#[tokio::test]
async fn test_flush_is_fifo_and_skips_expired() -> anyhow::Result<()> {
    let (router, conn) = router_with_peer(ServerIdentity::new(3, 1));
    let r = remote_ref(router, Some(EntityAddress::new(3, 1)));

    r.tell(&ping("first"));
    let expired = r.ask(&ping("second"), Duration::from_millis(100));
    let kept = r.ask(&ping("third"), Duration::from_secs(60));
    conn.take();

    assert_eq!(r.sweep(Instant::now() + Duration::from_secs(1), &policy()), SweepOutcome::Keep);
    assert_eq!(expired.await.unwrap_err(), CallError::Timeout);

    r.on_check_result(true);
    let sent: Vec<EntityEnvelope> = conn
        .take()
        .iter()
        .map(EntityEnvelope::from_frame)
        .collect::<meshrpc::Result<_>>()?;
    let texts: Vec<String> = sent
        .iter()
        .map(|env| decode_body::<Ping>(&env.fwd_data).map(|p| p.text))
        .collect::<meshrpc::Result<_>>()?;
    assert_eq!(texts, vec!["first", "third"]);
    assert_eq!(sent[0].fwd_seq, 0);
    assert!(sent[1].fwd_seq > 0);

    r.on_forward_response(sent[1].fwd_seq, Box::new(ping("ok")));
    assert_eq!(text_of(&kept.await?), Some("ok"));
    Ok(())
}

#[tokio::test]
async fn test_unresolved_address_is_invalid_without_traffic() {
    let (router, conn) = router_with_peer(ServerIdentity::new(3, 1));
    let r = remote_ref(router, None);
    assert_eq!(r.state(), RefState::Invalid);

    let err = r.ask(&ping("x"), Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err, CallError::EntityNotExists);
    r.tell(&ping("y"));
    assert_eq!(conn.count(), 0);
}

#[tokio::test]
async fn test_unroutable_check_fails_unreachable_and_retries() {
    let (router, conn) = router_with_peer(ServerIdentity::new(3, 1));
    let r = remote_ref(router.clone(), Some(EntityAddress::new(4, 1)));

    let err = r.ask(&ping("x"), Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err, CallError::Unreachable);
    assert_eq!(r.state(), RefState::Init);
    assert_eq!(r.pending_count(), 0);
    assert_eq!(r.queued_len(), 0);
    assert_eq!(conn.count(), 0);

    // Once the owner is linked the next call checks again.
    let owner = RecordingConnection::new(4, 1);
    router.add(Arc::new(Link::new(owner.clone(), &ServerIdentity::new(1, 1))));
    let _reply = r.ask(&ping("y"), Duration::from_secs(5));
    assert_eq!(r.state(), RefState::Check);
    let sent = owner.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_id, msg_id::ENTITY_CHECK_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn test_stale_check_invalidates_and_is_reclaimed() {
    let (router, _conn) = router_with_peer(ServerIdentity::new(3, 1));
    let r = remote_ref(router, Some(EntityAddress::new(3, 1)));
    let reply = r.ask(&ping("x"), Duration::from_secs(600));

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(r.sweep(Instant::now(), &policy()), SweepOutcome::Keep);
    assert_eq!(r.state(), RefState::Check);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(r.sweep(Instant::now(), &policy()), SweepOutcome::Keep);
    assert_eq!(r.state(), RefState::Invalid);
    assert_eq!(reply.await.unwrap_err(), CallError::EntityNotExists);

    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(r.sweep(Instant::now(), &policy()), SweepOutcome::Keep);
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(r.sweep(Instant::now(), &policy()), SweepOutcome::Remove);
}

#[tokio::test]
async fn test_not_exists_reply_invalidates() {
    let (router, conn) = router_with_peer(ServerIdentity::new(3, 1));
    let r = remote_ref(router, Some(EntityAddress::new(3, 1)));
    let first = r.ask(&ping("x"), Duration::from_secs(5));
    r.on_check_result(true);
    let frames = conn.take();
    let env = EntityEnvelope::from_frame(&frames[1]).unwrap();

    r.on_forward_response(env.fwd_seq, Box::new(ReturnCode::new(code::ENTITY_NOT_EXISTS)));
    assert_eq!(first.await.unwrap_err(), CallError::EntityNotExists);
    assert_eq!(r.state(), RefState::Invalid);
}

// ============================================================================
//  DISPATCH
// ============================================================================

fn test_node(identity: ServerIdentity) -> Arc<ClusterNode> {
    ClusterNode::builder(identity)
        .config(ClusterConfig::new().with_cross_connect(9))
        .register::<Ping>()
        .address_finder(ShardedAddressFinder::new().with_shard(50, 2, vec![1]).with_shard(60, 3, vec![1]))
        .handler(Ping::ID, echo)
        .build()
}

#[tokio::test]
async fn test_heartbeat_is_answered() {
    let node = test_node(ServerIdentity::new(2, 1));
    let conn = RecordingConnection::new(1, 1);
    let link = node.add_link(conn.clone());

    node.handle_frame(&link, Frame::new(Heartbeat::ID, 3, Vec::new()));
    assert_eq!(conn.take(), vec![Frame::new(Heartbeat::ID, -3, Vec::new())]);
}

#[tokio::test]
async fn test_plain_request_reaches_handler() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(2, 1));
    let conn = RecordingConnection::new(1, 1);
    let link = node.add_link(conn.clone());

    node.handle_frame(&link, Frame::new(Ping::ID, 4, ping_bytes("hello")));
    let sent = conn.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq, -4);
    assert_eq!(decode_body::<Ping>(&sent[0].body)?, ping("hello"));
    Ok(())
}

#[tokio::test]
async fn test_plain_reply_resolves_link_rpc() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(2, 1));
    let conn = RecordingConnection::new(1, 1);
    let link = node.add_link(conn.clone());

    let reply = link.rpc.ask(&ping("q"), Duration::from_secs(5));
    let request = conn.take().remove(0);
    node.handle_frame(&link, Frame::new(Ping::ID, -request.seq, ping_bytes("a")));
    assert_eq!(text_of(&reply.await?), Some("a"));
    assert_eq!(conn.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_undecodable_request_gets_error_reply() -> anyhow::Result<()> {
    let node = ClusterNode::builder(ServerIdentity::new(2, 1)).build();
    let conn = RecordingConnection::new(1, 1);
    let link = node.add_link(conn.clone());

    node.handle_frame(&link, Frame::new(Ping::ID, 7, vec![1, 2, 3]));
    let sent = conn.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_id, msg_id::RETURN_CODE);
    assert_eq!(sent[0].seq, -7);
    assert_eq!(decode_body::<ReturnCode>(&sent[0].body)?.code, code::DECODE_FAILED);
    Ok(())
}

#[tokio::test]
async fn test_entity_forward_to_missing_entity() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(2, 1));
    let caller = RecordingConnection::new(1, 1);
    let link = node.add_link(caller.clone());
    let other = RecordingConnection::new(4, 1);
    node.add_link(other.clone());

    let req = EntityEnvelope::forward_request(Route::new(1, 1, 2, 1), 5, 50, 9, Ping::ID, ping_bytes("x"));
    node.handle_frame(&link, frame_of(&req, 0)?);

    let sent = caller.take();
    assert_eq!(sent.len(), 1);
    let resp = EntityEnvelope::from_frame(&sent[0])?;
    assert_eq!(resp.kind, EntityKind::ForwardResponse);
    assert_eq!(resp.fwd_seq, -5);
    assert_eq!(resp.route, Route::new(2, 1, 1, 1));
    assert_eq!(decode_body::<ReturnCode>(&resp.fwd_data)?.code, code::ENTITY_NOT_EXISTS);
    assert_eq!(other.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_entity_forward_to_live_entity() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(2, 1));
    node.entities().unwrap().spawn(50, 9, echo);
    let caller = RecordingConnection::new(1, 1);
    let link = node.add_link(caller.clone());

    let req = EntityEnvelope::forward_request(Route::new(1, 1, 2, 1), 8, 50, 9, Ping::ID, ping_bytes("hi"));
    node.handle_frame(&link, frame_of(&req, 0)?);

    let sent = caller.wait_for(1).await;
    let resp = EntityEnvelope::from_frame(&sent[0])?;
    assert_eq!(resp.fwd_seq, -8);
    assert_eq!(decode_body::<Ping>(&resp.fwd_data)?, ping("hi"));
    Ok(())
}

#[tokio::test]
async fn test_check_request_answered_locally() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(2, 1));
    node.entities().unwrap().spawn(50, 9, echo);
    let caller = RecordingConnection::new(1, 1);
    let link = node.add_link(caller.clone());

    for (id, exists) in [(9, true), (10, false)] {
        let req = EntityEnvelope::check_request(Route::new(1, 1, 2, 1), 50, id);
        node.handle_frame(&link, frame_of(&req, 0)?);
        let resp = EntityEnvelope::from_frame(&caller.take()[0])?;
        assert_eq!(resp.kind, EntityKind::CheckResponse);
        assert_eq!(resp.exists, exists);
    }
    Ok(())
}

#[tokio::test]
async fn test_relay_without_link_answers_unreachable() -> anyhow::Result<()> {
    let relay = test_node(ServerIdentity::new(9, 1));
    let caller = RecordingConnection::new(1, 1);
    let link = relay.add_link(caller.clone());

    let req = ForwardEnvelope::wrap(ForwardKind::Rpc, Route::new(1, 1, 3, 4), 11, &ping("x"))?;
    relay.handle_frame(&link, frame_of(&req, 0)?);

    let sent = caller.take();
    assert_eq!(sent.len(), 1);
    let resp = ForwardEnvelope::from_frame(&sent[0])?;
    assert_eq!(resp.kind, ForwardKind::Rpc);
    assert_eq!(resp.fwd_seq, -11);
    assert_eq!(resp.route, Route::new(3, 4, 1, 1));
    assert_eq!(decode_body::<ReturnCode>(&resp.fwd_data)?.code, code::DESTINATION_UNREACHABLE);
    Ok(())
}

#[tokio::test]
async fn test_relay_send_failure_answers_forward_failed() -> anyhow::Result<()> {
    let relay = test_node(ServerIdentity::new(9, 1));
    let caller = RecordingConnection::new(1, 1);
    let link = relay.add_link(caller.clone());
    let target = RecordingConnection::new(3, 4);
    target.fail_sends.store(true, Ordering::Release);
    relay.add_link(target.clone());

    let req = ForwardEnvelope::wrap(ForwardKind::Rpc, Route::new(1, 1, 3, 4), 12, &ping("x"))?;
    relay.handle_frame(&link, frame_of(&req, 0)?);

    let resp = ForwardEnvelope::from_frame(&caller.take()[0])?;
    assert_eq!(resp.fwd_seq, -12);
    assert_eq!(decode_body::<ReturnCode>(&resp.fwd_data)?.code, code::FORWARD_FAILED);
    Ok(())
}

#[tokio::test]
async fn test_relay_passes_forwards_on() -> anyhow::Result<()> {
    let relay = test_node(ServerIdentity::new(9, 1));
    let caller = RecordingConnection::new(1, 1);
    let link = relay.add_link(caller.clone());
    let target = RecordingConnection::new(3, 4);
    relay.add_link(target.clone());

    let rpc = frame_of(&ForwardEnvelope::wrap(ForwardKind::Rpc, Route::new(1, 1, 3, 4), 12, &ping("r"))?, 0)?;
    relay.handle_frame(&link, rpc.clone());
    let oneway = frame_of(&ForwardEnvelope::wrap(ForwardKind::Oneway, Route::new(1, 1, 3, 4), 0, &ping("o"))?, 0)?;
    relay.handle_frame(&link, oneway);

    let sent = target.take();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], rpc);
    assert_eq!(sent[1], Frame::new(Ping::ID, 0, ping_bytes("o")));
    assert_eq!(caller.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_forwarded_request_answered_at_destination() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(3, 4));
    let relay = RecordingConnection::new(9, 1);
    let link = node.add_link(relay.clone());

    let req = ForwardEnvelope::wrap(ForwardKind::Rpc, Route::new(1, 1, 3, 4), 21, &ping("there"))?;
    node.handle_frame(&link, frame_of(&req, 0)?);

    let resp = ForwardEnvelope::from_frame(&relay.take()[0])?;
    assert_eq!(resp.fwd_seq, -21);
    assert_eq!(resp.route, Route::new(3, 4, 1, 1));
    assert_eq!(decode_body::<Ping>(&resp.fwd_data)?, ping("there"));
    Ok(())
}

#[tokio::test]
async fn test_forwarded_request_with_bad_payload_gets_decode_failed() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(3, 4));
    let relay = RecordingConnection::new(9, 1);
    let link = node.add_link(relay.clone());

    let mut req = ForwardEnvelope::wrap(ForwardKind::Rpc, Route::new(1, 1, 3, 4), 22, &ping("x"))?;
    req.fwd_data = vec![0xFF];
    node.handle_frame(&link, frame_of(&req, 0)?);

    let sent = relay.take();
    assert_eq!(sent.len(), 1);
    let resp = ForwardEnvelope::from_frame(&sent[0])?;
    assert_eq!(resp.kind, ForwardKind::Rpc);
    assert_eq!(resp.fwd_seq, -22);
    assert_eq!(resp.route, Route::new(3, 4, 1, 1));
    assert_eq!(resp.fwd_msg_id, msg_id::RETURN_CODE);
    assert_eq!(decode_body::<ReturnCode>(&resp.fwd_data)?.code, code::DECODE_FAILED);
    Ok(())
}

#[tokio::test]
async fn test_forwarded_request_without_handler_gets_no_handler() -> anyhow::Result<()> {
    let node = ClusterNode::builder(ServerIdentity::new(3, 4)).register::<Ping>().build();
    let relay = RecordingConnection::new(9, 1);
    let link = node.add_link(relay.clone());

    let req = ForwardEnvelope::wrap(ForwardKind::Rpc, Route::new(1, 1, 3, 4), 23, &ping("x"))?;
    node.handle_frame(&link, frame_of(&req, 0)?);

    let resp = ForwardEnvelope::from_frame(&relay.take()[0])?;
    assert_eq!(resp.fwd_seq, -23);
    assert_eq!(resp.route, Route::new(3, 4, 1, 1));
    assert_eq!(decode_body::<ReturnCode>(&resp.fwd_data)?.code, code::NO_HANDLER);

    // One-way traffic is never answered, handled or not.
    let tell = ForwardEnvelope::wrap(ForwardKind::Oneway, Route::new(1, 1, 3, 4), 0, &ping("y"))?;
    node.handle_frame(&link, frame_of(&tell, 0)?);
    assert_eq!(relay.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_protocol_ids_bypass_fallback_handler() -> anyhow::Result<()> {
    let node = ClusterNode::builder(ServerIdentity::new(2, 1))
        .register::<Ping>()
        .fallback_handler(echo)
        .build();
    let conn = RecordingConnection::new(1, 1);
    let link = node.add_link(conn.clone());

    let body = (&ReturnCode::new(code::OK) as &dyn Message).to_bytes()?;
    node.handle_frame(&link, Frame::new(msg_id::RETURN_CODE, 5, body));
    let sent = conn.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq, -5);
    assert_eq!(decode_body::<ReturnCode>(&sent[0].body)?.code, code::NO_HANDLER);

    node.handle_frame(&link, Frame::new(Ping::ID, 6, ping_bytes("user")));
    let sent = conn.take();
    assert_eq!(sent[0].seq, -6);
    assert_eq!(decode_body::<Ping>(&sent[0].body)?, ping("user"));
    Ok(())
}

#[tokio::test]
async fn test_oversized_request_fails_only_that_call() -> anyhow::Result<()> {
    let (near, far) = DuplexChannelTransport::pair();
    let conn = PeerConnection::spawn(ServerIdentity::new(3, 1), Arc::new(near), 64);
    let link = Link::new(conn.clone(), &ServerIdentity::new(1, 1));

    let big = link.rpc.ask(&ping(&"x".repeat(100)), Duration::from_secs(5));
    assert_eq!(big.await.unwrap_err(), CallError::Encode);
    assert!(link.is_active());
    assert_eq!(link.rpc.pending_count(), 0);

    let _small = link.rpc.ask(&ping("ok"), Duration::from_secs(5));
    let bytes = far.recv().await?.expect("frame written");
    let frame = Frame::decode(&bytes)?;
    assert_eq!(frame.seq, 2);
    assert_eq!(decode_body::<Ping>(&frame.body)?, ping("ok"));
    Ok(())
}

// ============================================================================
//  REGISTRY
// ============================================================================

#[tokio::test]
async fn test_registry_ref_kinds() {
    let node = test_node(ServerIdentity::new(2, 1));
    node.entities().unwrap().spawn(50, 1, echo);

    assert!(node.get_ref(50, 1).is_local());
    assert!(node.get_ref(50, 2).is_empty());

    let a = node.get_ref(60, 1);
    let b = node.get_ref(60, 1);
    match (a, b) {
        (EntityRef::Remote(a), EntityRef::Remote(b)) => assert!(Arc::ptr_eq(&a, &b)),
        other => panic!("expected remote refs, got {:?}", other),
    }

    let EntityRef::Remote(unknown) = node.get_ref(70, 1) else {
        panic!("expected a remote ref");
    };
    assert_eq!(unknown.state(), RefState::Invalid);
    assert_eq!(node.registry().len(), 2);
}

#[tokio::test]
async fn test_registry_resolves_check_and_forward_responses() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(2, 1));
    let owner = RecordingConnection::new(3, 1);
    let link = node.add_link(owner.clone());

    let reply = node.get_ref(60, 1).ask(Box::new(ping("remote")), Duration::from_secs(5));
    let check = EntityEnvelope::from_frame(&owner.take()[0])?;
    assert_eq!(check.kind, EntityKind::CheckRequest);
    assert_eq!(check.route, Route::new(2, 1, 3, 1));

    node.handle_frame(&link, frame_of(&check.check_response(true), 0)?);
    let req = EntityEnvelope::from_frame(&owner.take()[0])?;
    assert_eq!(req.kind, EntityKind::ForwardRequest);

    let resp = req.forward_response(Ping::ID, ping_bytes("pong"));
    node.handle_frame(&link, frame_of(&resp, 0)?);
    assert_eq!(text_of(&reply.await?), Some("pong"));
    Ok(())
}

#[tokio::test]
async fn test_sweep_keeps_idle_ref_held_by_caller() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(2, 1));
    let owner = RecordingConnection::new(3, 1);
    let link = node.add_link(owner.clone());

    let EntityRef::Remote(held) = node.get_ref(60, 1) else {
        panic!("expected a remote ref");
    };
    held.check();
    let check = EntityEnvelope::from_frame(&owner.take()[0])?;
    node.handle_frame(&link, frame_of(&check.check_response(true), 0)?);
    assert_eq!(held.state(), RefState::Run);

    // Idle, but still held: the registry hands out the same ref.
    assert_eq!(node.registry().sweep(Instant::now() + Duration::from_secs(601)), 0);
    match node.get_ref(60, 1) {
        EntityRef::Remote(again) => assert!(Arc::ptr_eq(&held, &again)),
        other => panic!("expected a remote ref, got {:?}", other),
    }

    let mine = held.ask(&ping("mine"), Duration::from_secs(5));
    let req = EntityEnvelope::from_frame(&owner.take()[0])?;
    let resp = req.forward_response(Ping::ID, ping_bytes("reply-for-mine"));
    node.handle_frame(&link, frame_of(&resp, 0)?);
    assert_eq!(text_of(&mine.await?), Some("reply-for-mine"));

    drop(held);
    assert_eq!(node.registry().sweep(Instant::now() + Duration::from_secs(700)), 1);
    assert!(node.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_ref_checks_again_once_owner_is_linked() -> anyhow::Result<()> {
    let node = test_node(ServerIdentity::new(2, 1));
    let early = node.get_ref(60, 1).ask(Box::new(ping("early")), Duration::from_secs(5));
    assert_eq!(early.await.unwrap_err(), CallError::Unreachable);

    let owner = RecordingConnection::new(3, 1);
    node.add_link(owner.clone());
    let _later = node.get_ref(60, 1).ask(Box::new(ping("later")), Duration::from_secs(5));
    let sent = owner.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(EntityEnvelope::from_frame(&sent[0])?.kind, EntityKind::CheckRequest);
    Ok(())
}

#[tokio::test]
async fn test_registry_sweep_reclaims_invalid_refs() {
    let node = test_node(ServerIdentity::new(2, 1));
    node.get_ref(70, 1);
    node.get_ref(70, 2);
    assert_eq!(node.registry().sweep(Instant::now()), 0);
    assert_eq!(node.registry().sweep(Instant::now() + Duration::from_secs(31)), 2);
    assert!(node.registry().is_empty());
}

#[tokio::test]
async fn test_shutdown_fails_pending() {
    let node = test_node(ServerIdentity::new(2, 1));
    let owner = RecordingConnection::new(3, 1);
    node.add_link(owner.clone());

    let entity = node.get_ref(60, 1).ask(Box::new(ping("x")), Duration::from_secs(5));
    let direct = node.ask_server(3, 1, &ping("y"), Duration::from_secs(5));
    node.shutdown();

    assert_eq!(entity.await.unwrap_err(), CallError::Shutdown);
    assert_eq!(direct.await.unwrap_err(), CallError::Shutdown);
    assert!(!owner.is_active());
    assert!(node.forward(3, 1, &ping("z")).is_err());
}
