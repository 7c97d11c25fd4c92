// Integration tests driving real nodes over loopback: mirrored handshake,
// messages, the encrypted send policy, file transfer and the user-trust
// exchange, each against two live ServerContexts.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::time::{Duration, Instant};

use rsa::RsaPrivateKey;

use veilnet::auth::{
    derive_session_user, DenyAll, MemoryTrustStore, NodeIdentity, Operator, TrustStore,
    TrustedUser,
};
use veilnet::client::{self, LinkState};
use veilnet::error::NetError;
use veilnet::server::{ServerConfig, ServerContext};
use veilnet::types::ServerEvent;

/// RSA key generation dominates test time, so every node shares one cached
/// key. The protocol never compares peer keys against its own.
fn identity() -> NodeIdentity {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    let key = KEY
        .get_or_init(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("test keygen"));
    NodeIdentity::from_private(key.clone()).expect("identity")
}

fn scratch_dir(label: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "veilnet-it-{}-{}-{}",
        label,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn start_node_with(
    name: &str,
    operator: Arc<dyn Operator>,
    store: Arc<MemoryTrustStore>,
    downloads: PathBuf,
) -> (Arc<ServerContext>, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel();
    let config = ServerConfig {
        name: name.to_string(),
        port: 0,
        download_dir: downloads,
    };
    let ctx = ServerContext::start(config, identity(), store, operator, tx).expect("start node");
    (ctx, rx)
}

fn start_node(name: &str) -> (Arc<ServerContext>, mpsc::Receiver<ServerEvent>) {
    start_node_with(
        name,
        Arc::new(DenyAll),
        Arc::new(MemoryTrustStore::new()),
        scratch_dir(name),
    )
}

fn wait_event(
    rx: &mpsc::Receiver<ServerEvent>,
    what: &str,
    pred: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let left = match deadline.checked_duration_since(Instant::now()) {
            Some(d) => d,
            None => panic!("timed out waiting for {}", what),
        };
        match rx.recv_timeout(left) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => continue,
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }
}

fn poll_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(20));
    }
}

struct ScriptedOperator {
    answer: bool,
    calls: AtomicUsize,
}

impl ScriptedOperator {
    fn new(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
        })
    }
}

impl Operator for ScriptedOperator {
    fn approve_user(&self, _peer: &str, _user: &TrustedUser, _cancelled: &dyn Fn() -> bool) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[test]
fn nodes_connect_exchange_a_message_and_close() {
    let (a, _a_rx) = start_node("alpha");
    let (b, b_rx) = start_node("bravo");

    let conn = client::open(&a, "127.0.0.1", b.listen_port()).expect("open");
    assert!(conn.is_established());
    assert_eq!(conn.peer_name(), "bravo");

    wait_event(&b_rx, "peer connected on bravo", |e| {
        matches!(e, ServerEvent::PeerConnected { name, .. } if name == "alpha")
    });
    poll_until("bravo sees the link established", || {
        b.find_by_name("alpha").is_some_and(|c| c.is_established())
    });

    a.send_message("bravo", "hello").expect("send message");
    let event = wait_event(&b_rx, "message on bravo", |e| {
        matches!(e, ServerEvent::Message { .. })
    });
    match event {
        ServerEvent::Message { from, text } => {
            assert_eq!(from, "alpha");
            assert_eq!(text, "hello");
        }
        _ => unreachable!(),
    }
    let b_conn = b.find_by_name("alpha").expect("bravo's connection");
    poll_until("bravo back to idling", || b_conn.state() == LinkState::Idling);

    assert!(a.close_connection(conn.id(), true));
    wait_event(&b_rx, "peer closed on bravo", |e| {
        matches!(e, ServerEvent::PeerClosed { name, .. } if name == "alpha")
    });
    poll_until("bravo's registry drained", || b.connections().is_empty());
    assert!(a.connections().is_empty());

    a.stop();
    b.stop();
}

#[test]
fn open_is_idempotent_per_endpoint() {
    let (a, _a_rx) = start_node("alpha");
    let (b, _b_rx) = start_node("bravo");

    let first = client::open(&a, "127.0.0.1", b.listen_port()).expect("first open");
    let second = client::open(&a, "127.0.0.1", b.listen_port()).expect("second open");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(a.connections().len(), 1);

    a.stop();
    a.close_all(false);
    b.stop();
    b.close_all(false);
}

#[test]
fn handshake_timeout_leaves_no_registry_entry() {
    let (a, _a_rx) = start_node("alpha");
    // A bare listener that never answers the handshake.
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = silent.local_addr().unwrap().port();

    let started = Instant::now();
    let err = client::open(&a, "127.0.0.1", port).unwrap_err();
    assert!(matches!(err, NetError::Timeout(_)), "got {:?}", err);
    assert!(started.elapsed() >= client::HANDSHAKE_TIMEOUT);
    assert!(a.connections().is_empty());

    a.stop();
}

// ============================================================================
// Send policy
// ============================================================================

#[test]
fn encrypted_policy_delivers_messages() {
    let (a, _a_rx) = start_node("alpha");
    let (b, b_rx) = start_node("bravo");

    client::open(&a, "127.0.0.1", b.listen_port()).expect("open");
    a.set_encrypted(true);
    assert!(a.encrypted());

    a.send_message("bravo", "sealed hello").expect("send");
    wait_event(&b_rx, "sealed message on bravo", |e| {
        matches!(e, ServerEvent::Message { text, .. } if text == "sealed hello")
    });

    a.stop();
    a.close_all(false);
    b.stop();
    b.close_all(false);
}

// ============================================================================
// File transfer
// ============================================================================

#[test]
fn files_arrive_byte_identical() {
    let (a, _a_rx) = start_node("alpha");
    let downloads = scratch_dir("bravo-downloads");
    let (b, b_rx) = start_node_with(
        "bravo",
        Arc::new(DenyAll),
        Arc::new(MemoryTrustStore::new()),
        downloads.clone(),
    );

    client::open(&a, "127.0.0.1", b.listen_port()).expect("open");

    let payload: Vec<u8> = (0..10 * 1024 + 37).map(|i| (i % 251) as u8).collect();
    let src = scratch_dir("alpha-files").join("payload.bin");
    std::fs::write(&src, &payload).unwrap();

    a.send_file_to("bravo", &src).expect("send file");
    let event = wait_event(&b_rx, "file received on bravo", |e| {
        matches!(e, ServerEvent::FileReceived { .. })
    });
    match event {
        ServerEvent::FileReceived { from, path, len } => {
            assert_eq!(from, "alpha");
            assert_eq!(len, payload.len() as u64);
            assert_eq!(path, downloads.join("payload.bin"));
            assert_eq!(std::fs::read(&path).unwrap(), payload);
        }
        _ => unreachable!(),
    }

    a.stop();
    a.close_all(false);
    b.stop();
    b.close_all(false);
}

// ============================================================================
// User trust
// ============================================================================

#[test]
fn trust_is_negotiated_and_revoked() {
    let operator = ScriptedOperator::new(true);
    let (a, a_rx) = start_node("alpha");
    let (b, b_rx) = start_node_with(
        "bravo",
        Arc::clone(&operator) as Arc<dyn Operator>,
        Arc::new(MemoryTrustStore::new()),
        scratch_dir("bravo"),
    );

    client::open(&a, "127.0.0.1", b.listen_port()).expect("open");
    a.login(derive_session_user("alice", "hunter2"));
    b.login(derive_session_user("bob", "letmein"));

    a.request_user_trust("bravo").expect("request trust");
    wait_event(&b_rx, "trust established on bravo", |e| {
        matches!(e, ServerEvent::TrustEstablished { user, .. } if user == "alice")
    });
    wait_event(&a_rx, "trust established on alpha", |e| {
        matches!(e, ServerEvent::TrustEstablished { user, .. } if user == "bob")
    });
    assert_eq!(operator.calls.load(Ordering::SeqCst), 1);
    let b_conn = b.find_by_name("alpha").unwrap();
    assert_eq!(b_conn.logged_user().map(|u| u.name), Some("alice".to_string()));

    a.end_user_trust("bravo").expect("end trust");
    wait_event(&b_rx, "trust revoked on bravo", |e| {
        matches!(e, ServerEvent::TrustRevoked { .. })
    });
    poll_until("bravo's trust session dropped", || {
        b_conn.logged_user().is_none()
    });

    a.stop();
    a.close_all(false);
    b.stop();
    b.close_all(false);
}

#[test]
fn operator_denial_is_reported_not_trusted() {
    let operator = ScriptedOperator::new(false);
    let (a, a_rx) = start_node("alpha");
    let (b, _b_rx) = start_node_with(
        "bravo",
        Arc::clone(&operator) as Arc<dyn Operator>,
        Arc::new(MemoryTrustStore::new()),
        scratch_dir("bravo"),
    );

    client::open(&a, "127.0.0.1", b.listen_port()).expect("open");
    a.login(derive_session_user("alice", "hunter2"));
    b.login(derive_session_user("bob", "letmein"));

    a.request_user_trust("bravo").expect("request trust");
    poll_until("operator asked", || operator.calls.load(Ordering::SeqCst) == 1);

    std::thread::sleep(Duration::from_millis(300));
    assert!(b.find_by_name("alpha").unwrap().logged_user().is_none());
    assert!(a.find_by_name("bravo").unwrap().logged_user().is_none());
    for event in a_rx.try_iter() {
        assert!(
            !matches!(event, ServerEvent::TrustEstablished { .. }),
            "denied trust must not establish"
        );
    }

    a.stop();
    a.close_all(false);
    b.stop();
    b.close_all(false);
}

#[test]
fn mismatched_keys_never_reach_the_operator() {
    let operator = ScriptedOperator::new(true);
    let store = Arc::new(MemoryTrustStore::new());
    let stale = TrustedUser {
        name: "alice".to_string(),
        key: vec![0x11; 32],
        iv: vec![0x22; 16],
    };
    store.create_or_update(stale.clone());

    let (a, _a_rx) = start_node("alpha");
    let (b, _b_rx) = start_node_with(
        "bravo",
        Arc::clone(&operator) as Arc<dyn Operator>,
        Arc::clone(&store),
        scratch_dir("bravo"),
    );

    client::open(&a, "127.0.0.1", b.listen_port()).expect("open");
    a.login(derive_session_user("alice", "a fresh password"));
    b.login(derive_session_user("bob", "letmein"));

    a.request_user_trust("bravo").expect("request trust");
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(operator.calls.load(Ordering::SeqCst), 0);
    assert!(b.find_by_name("alpha").unwrap().logged_user().is_none());
    // The stale record must survive untouched.
    assert_eq!(store.find_user("alice"), Some(stale));

    a.stop();
    a.close_all(false);
    b.stop();
    b.close_all(false);
}

#[test]
fn trust_without_a_local_session_is_refused() {
    let operator = ScriptedOperator::new(true);
    let (a, _a_rx) = start_node("alpha");
    let (b, _b_rx) = start_node_with(
        "bravo",
        Arc::clone(&operator) as Arc<dyn Operator>,
        Arc::new(MemoryTrustStore::new()),
        scratch_dir("bravo"),
    );

    client::open(&a, "127.0.0.1", b.listen_port()).expect("open");
    a.login(derive_session_user("alice", "hunter2"));
    // bravo never logs in.

    a.request_user_trust("bravo").expect("request trust");
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(operator.calls.load(Ordering::SeqCst), 0);
    assert!(b.find_by_name("alpha").unwrap().logged_user().is_none());

    // Requesting without our own session fails locally.
    a.logout();
    let err = a.request_user_trust("bravo").unwrap_err();
    assert!(matches!(err, NetError::Trust(_)));

    a.stop();
    a.close_all(false);
    b.stop();
    b.close_all(false);
}
