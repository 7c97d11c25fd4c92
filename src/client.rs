//! One peer link: an asymmetric pair of sockets plus the thread that
//! processes its incoming packets.
//!
//! The half we dialed is the "mirror": everything we send travels over it.
//! The half the peer dialed back to our listener is the "local" socket,
//! where everything we receive arrives. Each connection gets one reader
//! thread; shared server state is only touched through the registry.

use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;

use crate::auth::{evaluate_user_init, NodeIdentity, TrustedUser, UserInitVerdict};
use crate::error::{NetError, Result};
use crate::net::{self, Packet, PacketKind, PeerInfo, INVALID_ID};
use crate::server::ServerContext;
use crate::transfer;
use crate::types::ServerEvent;
use crate::{crypto, utils};

/// Budget for the whole establish exchange on the initiator side.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    None,
    Establishing,
    Idling,
    ProcessingPacket,
    Closed,
}

/// What we know about the peer on the other side of a link.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub name: String,
    pub listen_port: u16,
    /// SPKI DER bytes; empty until the peer's Info frame arrives.
    pub public_key: Vec<u8>,
}

pub struct Connection {
    id: u32,
    peer: RwLock<PeerIdentity>,
    peer_ip: IpAddr,
    parsed_key: RwLock<Option<RsaPublicKey>>,
    /// Outbound half, the socket we dialed. All sends go here.
    mirror: Mutex<TcpStream>,
    /// Inbound half, dialed back by the peer. All reads come from here.
    local: RwLock<Option<TcpStream>>,
    state: RwLock<LinkState>,
    established: Mutex<bool>,
    established_cv: Condvar,
    logged_user: RwLock<Option<TrustedUser>>,
    close_once: Mutex<bool>,
    closing: AtomicBool,
    /// True once a PeerConnected event went out for this link.
    announced: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    identity: Arc<NodeIdentity>,
    encrypted_sends: Arc<AtomicBool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_ip", &self.peer_ip)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Link we initiated: the mirror is connected, the local half arrives
    /// later via the peer's dial-back.
    pub(crate) fn new_outbound(
        id: u32,
        mirror: TcpStream,
        peer_ip: IpAddr,
        peer_port: u16,
        identity: Arc<NodeIdentity>,
        encrypted_sends: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer: RwLock::new(PeerIdentity {
                name: String::new(),
                listen_port: peer_port,
                public_key: Vec::new(),
            }),
            peer_ip,
            parsed_key: RwLock::new(None),
            mirror: Mutex::new(mirror),
            local: RwLock::new(None),
            state: RwLock::new(LinkState::Establishing),
            established: Mutex::new(false),
            established_cv: Condvar::new(),
            logged_user: RwLock::new(None),
            close_once: Mutex::new(false),
            closing: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            reader: Mutex::new(None),
            identity,
            encrypted_sends,
        })
    }

    /// Link a peer initiated: both halves exist already.
    pub(crate) fn new_inbound(
        id: u32,
        local: TcpStream,
        mirror: TcpStream,
        info: &PeerInfo,
        peer_ip: IpAddr,
        identity: Arc<NodeIdentity>,
        encrypted_sends: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        local.set_read_timeout(None)?;
        let conn = Self::new_outbound(id, mirror, peer_ip, info.listen_port, identity, encrypted_sends);
        *conn.local.write().unwrap() = Some(local);
        conn.peer.write().unwrap().name = info.name.clone();
        conn.update_peer_key(&info.public_key)?;
        Ok(conn)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer_name(&self) -> String {
        self.peer.read().unwrap().name.clone()
    }

    pub fn peer_addr(&self) -> (IpAddr, u16) {
        (self.peer_ip, self.peer.read().unwrap().listen_port)
    }

    pub fn state(&self) -> LinkState {
        *self.state.read().unwrap()
    }

    pub fn is_established(&self) -> bool {
        *self.established.lock().unwrap()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_announced(&self) {
        self.announced.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_announced(&self) -> bool {
        self.announced.load(Ordering::SeqCst)
    }

    pub fn logged_user(&self) -> Option<TrustedUser> {
        self.logged_user.read().unwrap().clone()
    }

    pub fn key_fingerprint(&self) -> String {
        utils::key_fingerprint(&self.peer.read().unwrap().public_key)
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        *self.state.write().unwrap() = state;
    }

    pub(crate) fn set_peer_name(&self, name: &str) {
        self.peer.write().unwrap().name = name.to_string();
    }

    pub(crate) fn set_logged_user(&self, user: Option<TrustedUser>) -> Option<TrustedUser> {
        std::mem::replace(&mut *self.logged_user.write().unwrap(), user)
    }

    pub(crate) fn peer_key(&self) -> Option<RsaPublicKey> {
        self.parsed_key.read().unwrap().clone()
    }

    /// Record the peer's public key. An empty buffer leaves the current key
    /// alone; a malformed one faults the connection.
    pub(crate) fn update_peer_key(&self, der: &[u8]) -> Result<()> {
        if der.is_empty() {
            return Ok(());
        }
        let parsed = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| NetError::Crypto(format!("peer public key unparsable: {}", e)))?;
        self.peer.write().unwrap().public_key = der.to_vec();
        *self.parsed_key.write().unwrap() = Some(parsed);
        Ok(())
    }

    pub(crate) fn set_listen_port(&self, port: u16) {
        self.peer.write().unwrap().listen_port = port;
    }

    /// Attach the inbound half once the peer's dial-back arrives.
    pub(crate) fn attach_local(&self, stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(None)?;
        stream.set_nodelay(true).ok();
        let mut slot = self.local.write().unwrap();
        if slot.is_some() {
            return Err(NetError::Protocol("duplicate mirror dial-back".to_string()));
        }
        *slot = Some(stream);
        Ok(())
    }

    pub(crate) fn local_reader(&self) -> Result<TcpStream> {
        let guard = self.local.read().unwrap();
        let stream = guard.as_ref().ok_or_else(|| {
            NetError::Socket(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "inbound half not attached",
            ))
        })?;
        Ok(stream.try_clone()?)
    }

    pub(crate) fn mark_established(&self) {
        *self.established.lock().unwrap() = true;
        self.established_cv.notify_all();
    }

    /// Wait until the link is established, the link dies, or the budget runs
    /// out. Returns the established flag.
    pub(crate) fn wait_established(&self, budget: Duration) -> bool {
        let guard = self.established.lock().unwrap();
        let (guard, _) = self
            .established_cv
            .wait_timeout_while(guard, budget, |est| !*est && !self.is_closing())
            .unwrap();
        *guard
    }

    /// Send an application packet through the configured send policy.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        if self.is_closing() {
            return Err(NetError::Socket(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is closed",
            )));
        }
        let mut mirror = self.mirror.lock().unwrap();
        if self.encrypted_sends.load(Ordering::SeqCst) {
            crypto::seal_packet(&mut *mirror, &self.identity.private, packet)
        } else {
            net::write_packet(&mut *mirror, packet)
        }
    }

    /// Send a handshake frame, never enveloped.
    pub(crate) fn write_plain(&self, packet: &Packet) -> Result<()> {
        let mut mirror = self.mirror.lock().unwrap();
        net::write_packet(&mut *mirror, packet)
    }

    /// Tear the link down. Runs its body exactly once no matter how many
    /// callers race; later calls return immediately.
    pub fn close(&self, send_farewell: bool) {
        {
            let mut done = self.close_once.lock().unwrap();
            if *done {
                return;
            }
            *done = true;
        }
        self.closing.store(true, Ordering::SeqCst);

        if send_farewell {
            let mut mirror = self.mirror.lock().unwrap();
            if let Err(e) = net::write_packet(&mut *mirror, &Packet::ClosingConnection) {
                debug!("farewell to peer {} not delivered: {}", self.id, e);
            }
        }

        // Shutting the sockets down unblocks the reader thread.
        {
            let mirror = self.mirror.lock().unwrap();
            let _ = mirror.shutdown(Shutdown::Both);
        }
        if let Some(local) = self.local.read().unwrap().as_ref() {
            let _ = local.shutdown(Shutdown::Both);
        }

        self.set_state(LinkState::Closed);
        *self.logged_user.write().unwrap() = None;
        *self.parsed_key.write().unwrap() = None;
        self.peer.write().unwrap().public_key = Vec::new();
        self.established_cv.notify_all();
    }

    pub(crate) fn start_reader(self: &Arc<Self>, ctx: Arc<ServerContext>) {
        let conn = Arc::clone(self);
        let handle = std::thread::spawn(move || processing_loop(ctx, conn));
        *self.reader.lock().unwrap() = Some(handle);
    }

    pub(crate) fn take_reader(&self) -> Option<JoinHandle<()>> {
        self.reader.lock().unwrap().take()
    }
}

/// Open a link to `host:port`, or return the existing one.
///
/// Dials the mirror, announces ourselves, then waits for the peer's
/// dial-back and its Established frame within `HANDSHAKE_TIMEOUT`. A timeout
/// leaves no trace in the registry.
pub fn open(ctx: &Arc<ServerContext>, host: &str, port: u16) -> Result<Arc<Connection>> {
    let addr = resolve(host, port)?;
    if let Some(existing) = ctx.find_by_address(addr.ip(), port) {
        debug!("reusing connection {} to {}:{}", existing.id(), host, port);
        return Ok(existing);
    }

    let mirror = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
        NetError::ConnectFailed {
            addr: addr.to_string(),
            source: e,
        }
    })?;
    mirror.set_nodelay(true).ok();

    let id = ctx.allocate_id();
    let conn = Connection::new_outbound(
        id,
        mirror,
        addr.ip(),
        port,
        Arc::clone(ctx.identity()),
        ctx.encrypted_flag(),
    );
    ctx.register(Arc::clone(&conn));

    let hello = Packet::Info(PeerInfo {
        mirror_id: id,
        idret: INVALID_ID,
        listen_port: ctx.listen_port(),
        name: ctx.node_name(),
        public_key: ctx.identity().public_der.clone(),
    });
    if let Err(e) = conn.write_plain(&hello) {
        ctx.close_connection(id, false);
        return Err(e);
    }

    if !conn.wait_established(HANDSHAKE_TIMEOUT) {
        ctx.close_connection(id, false);
        return Err(NetError::Timeout("connection establishment"));
    }

    if let Err(e) = conn.write_plain(&Packet::Established) {
        ctx.close_connection(id, false);
        return Err(e);
    }

    info!("connection {} to {} established", id, addr);
    conn.mark_announced();
    ctx.emit(ServerEvent::PeerConnected {
        id,
        name: conn.peer_name(),
        addr: addr.to_string(),
    });
    Ok(conn)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::HostUnknown(host.to_string()))?
        .next()
        .ok_or_else(|| NetError::HostUnknown(host.to_string()))
}

enum Flow {
    Continue,
    Stop,
}

/// Per-connection reader: block on the next frame, dispatch, repeat.
pub(crate) fn processing_loop(ctx: Arc<ServerContext>, conn: Arc<Connection>) {
    let mut local = match conn.local_reader() {
        Ok(s) => s,
        Err(e) => {
            warn!("connection {} has no readable half: {}", conn.id(), e);
            teardown(&ctx, &conn);
            return;
        }
    };

    loop {
        if conn.is_closing() {
            break;
        }
        conn.set_state(LinkState::Idling);
        let kind = match net::read_kind(&mut local) {
            Ok(k) => k,
            Err(e) => {
                if !conn.is_closing() {
                    debug!("connection {} read ended: {}", conn.id(), e);
                }
                break;
            }
        };
        conn.set_state(LinkState::ProcessingPacket);
        match handle_frame(&ctx, &conn, kind, &mut local) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(e) if e.is_recoverable() => {
                warn!("connection {} ({}): {}", conn.id(), conn.peer_name(), e);
            }
            Err(e) => {
                warn!("closing connection {} ({}): {}", conn.id(), conn.peer_name(), e);
                break;
            }
        }
    }
    teardown(&ctx, &conn);
}

fn teardown(ctx: &Arc<ServerContext>, conn: &Arc<Connection>) {
    conn.close(false);
    ctx.deregister(conn);
}

fn handle_frame(
    ctx: &Arc<ServerContext>,
    conn: &Arc<Connection>,
    kind: PacketKind,
    local: &mut TcpStream,
) -> Result<Flow> {
    match kind {
        PacketKind::SendFileChunk => Err(NetError::Protocol(
            "file chunk outside an active transfer".to_string(),
        )),
        PacketKind::EncryptedChunk => {
            Err(NetError::Protocol("encrypted chunk without a header".to_string()))
        }
        PacketKind::EncryptedInfo => {
            let header = match net::read_body(local, kind)? {
                Packet::EncryptedInfo(h) => h,
                _ => unreachable!("read_body returns the requested kind"),
            };
            let key = conn
                .peer_key()
                .ok_or_else(|| NetError::Crypto("no public key for peer".to_string()))?;
            let inner = crypto::open_packet(local, &key, &header)?;
            dispatch(ctx, conn, inner, local)
        }
        _ => {
            let packet = net::read_body(local, kind)?;
            dispatch(ctx, conn, packet, local)
        }
    }
}

fn dispatch(
    ctx: &Arc<ServerContext>,
    conn: &Arc<Connection>,
    packet: Packet,
    local: &mut TcpStream,
) -> Result<Flow> {
    match packet {
        Packet::Message(text) => {
            info!("message from {}: {}", conn.peer_name(), text);
            ctx.emit(ServerEvent::Message {
                from: conn.peer_name(),
                text,
            });
            Ok(Flow::Continue)
        }
        Packet::Name(name) => {
            debug!("peer {} renamed to {}", conn.id(), name);
            ctx.rename_peer(conn, &name);
            Ok(Flow::Continue)
        }
        Packet::Established => {
            conn.mark_established();
            Ok(Flow::Continue)
        }
        Packet::ClosingConnection => {
            info!("peer {} ({}) said farewell", conn.id(), conn.peer_name());
            Ok(Flow::Stop)
        }
        Packet::Info(info) => {
            // A repeated Info refreshes name, key and advertised port.
            conn.update_peer_key(&info.public_key)?;
            conn.set_listen_port(info.listen_port);
            ctx.rename_peer(conn, &info.name);
            Ok(Flow::Continue)
        }
        Packet::SendFileInfo(info) => {
            transfer::receive_file(ctx, conn, local, info)?;
            Ok(Flow::Continue)
        }
        Packet::SendFileTerminate => {
            debug!("stray transfer terminate from {}", conn.peer_name());
            Ok(Flow::Continue)
        }
        Packet::AbortOperation => {
            info!("peer {} aborted an operation", conn.peer_name());
            Ok(Flow::Continue)
        }
        Packet::UserInit(user) => handle_user_init(ctx, conn, user).map(|_| Flow::Continue),
        Packet::UserInitResponse(user) => {
            info!(
                "peer {} accepted user trust as '{}'",
                conn.peer_name(),
                user.name
            );
            ctx.trust().create_or_update(user.clone());
            conn.set_logged_user(Some(user.clone()));
            ctx.emit(ServerEvent::TrustEstablished {
                peer: conn.peer_name(),
                user: user.name,
            });
            Ok(Flow::Continue)
        }
        Packet::UserInitNotAccepted => {
            info!("peer {} declined user trust", conn.peer_name());
            Ok(Flow::Continue)
        }
        Packet::UserInitNotLoggedIn => {
            info!("peer {} has no logged-in session", conn.peer_name());
            Ok(Flow::Continue)
        }
        Packet::UserInitAlreadyExists => {
            warn!(
                "peer {} reports our user name with different key material",
                conn.peer_name()
            );
            Ok(Flow::Continue)
        }
        Packet::UserEnd => {
            let had = conn.set_logged_user(None);
            conn.send(&Packet::UserEndResponse)?;
            if had.is_some() {
                ctx.emit(ServerEvent::TrustRevoked {
                    peer: conn.peer_name(),
                });
            }
            Ok(Flow::Continue)
        }
        Packet::UserEndResponse => {
            let had = conn.set_logged_user(None);
            if had.is_some() {
                ctx.emit(ServerEvent::TrustRevoked {
                    peer: conn.peer_name(),
                });
            }
            Ok(Flow::Continue)
        }
        Packet::SendFileChunk(_) | Packet::EncryptedInfo(_) | Packet::EncryptedChunk(_) => Err(
            NetError::Protocol(format!("unexpected {} frame", packet.kind())),
        ),
    }
}

fn handle_user_init(ctx: &Arc<ServerContext>, conn: &Arc<Connection>, user: TrustedUser) -> Result<()> {
    let me = match ctx.session_user() {
        Some(u) => u,
        None => {
            conn.send(&Packet::UserInitNotLoggedIn)?;
            return Ok(());
        }
    };
    match evaluate_user_init(ctx.trust().as_ref(), Some(&me), &user) {
        UserInitVerdict::NotLoggedIn => {
            conn.send(&Packet::UserInitNotLoggedIn)?;
        }
        UserInitVerdict::AlreadyTrusted => {
            info!(
                "user '{}' from {} already trusted, accepting",
                user.name,
                conn.peer_name()
            );
            let name = user.name.clone();
            conn.set_logged_user(Some(user));
            conn.send(&Packet::UserInitResponse(me))?;
            ctx.emit(ServerEvent::TrustEstablished {
                peer: conn.peer_name(),
                user: name,
            });
        }
        UserInitVerdict::KeyMismatch => {
            warn!(
                "user '{}' from {} presented different key material, refusing",
                user.name,
                conn.peer_name()
            );
            conn.send(&Packet::UserInitAlreadyExists)?;
        }
        UserInitVerdict::AskOperator => {
            let accepted =
                ctx.operator()
                    .approve_user(&conn.peer_name(), &user, &|| conn.is_closing());
            if accepted {
                ctx.trust().create_or_update(user.clone());
                let name = user.name.clone();
                conn.set_logged_user(Some(user));
                conn.send(&Packet::UserInitResponse(me))?;
                ctx.emit(ServerEvent::TrustEstablished {
                    peer: conn.peer_name(),
                    user: name,
                });
            } else {
                conn.send(&Packet::UserInitNotAccepted)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::OnceLock;

    fn identity() -> Arc<NodeIdentity> {
        static ID: OnceLock<Arc<NodeIdentity>> = OnceLock::new();
        Arc::clone(ID.get_or_init(|| Arc::new(NodeIdentity::generate().expect("keygen"))))
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).expect("connect");
        let (b, _) = listener.accept().expect("accept");
        (a, b)
    }

    #[test]
    fn concurrent_close_sends_exactly_one_farewell() {
        let (a, mut b) = socket_pair();
        let ip = a.peer_addr().unwrap().ip();
        let conn = Connection::new_outbound(
            1,
            a,
            ip,
            7777,
            identity(),
            Arc::new(AtomicBool::new(false)),
        );

        let c1 = Arc::clone(&conn);
        let c2 = Arc::clone(&conn);
        let t1 = std::thread::spawn(move || c1.close(true));
        let t2 = std::thread::spawn(move || c2.close(true));
        t1.join().unwrap();
        t2.join().unwrap();

        let mut seen = Vec::new();
        b.read_to_end(&mut seen).unwrap();
        assert_eq!(seen, vec![PacketKind::ClosingConnection.tag()]);
        assert_eq!(conn.state(), LinkState::Closed);
    }

    #[test]
    fn close_releases_key_and_session() {
        let (a, _b) = socket_pair();
        let ip = a.peer_addr().unwrap().ip();
        let conn = Connection::new_outbound(
            2,
            a,
            ip,
            7777,
            identity(),
            Arc::new(AtomicBool::new(false)),
        );
        conn.update_peer_key(&identity().public_der).unwrap();
        conn.set_logged_user(Some(TrustedUser {
            name: "alice".to_string(),
            key: vec![1; 32],
            iv: vec![2; 16],
        }));
        assert!(conn.peer_key().is_some());

        conn.close(false);
        assert!(conn.peer_key().is_none());
        assert!(conn.logged_user().is_none());
        assert!(conn.send(&Packet::UserEnd).is_err());
    }

    #[test]
    fn wait_established_times_out() {
        let (a, _b) = socket_pair();
        let ip = a.peer_addr().unwrap().ip();
        let conn = Connection::new_outbound(
            3,
            a,
            ip,
            7777,
            identity(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(!conn.wait_established(Duration::from_millis(50)));
        conn.mark_established();
        assert!(conn.wait_established(Duration::from_millis(50)));
    }
}
