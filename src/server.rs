//! Server context: the listener, the connection registry, and the shared
//! state every connection thread works against.
//!
//! The accept loop runs on its own thread and spawns one handshake thread
//! per raw socket; established connections each get their own reader thread
//! (see `client`). The registry's two maps are the only structures touched
//! by more than one thread, guarded by a single mutex held just long enough
//! to mutate them.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::auth::{NodeIdentity, Operator, TrustStore, TrustedUser};
use crate::client::{Connection, CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::error::{NetError, Result};
use crate::net::{self, Packet, PeerInfo, INVALID_ID};
use crate::transfer;
use crate::types::{EventSender, ProgressFn, ServerEvent};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct ServerConfig {
    pub name: String,
    /// Port to listen on; 0 picks an ephemeral one.
    pub port: u16,
    pub download_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: whoami::username(),
            port: 0,
            download_dir: PathBuf::from("."),
        }
    }
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<u32, Arc<Connection>>,
    by_name: HashMap<String, u32>,
    next_id: u32,
}

pub struct ServerContext {
    name: RwLock<String>,
    local_port: u16,
    download_dir: PathBuf,
    identity: Arc<NodeIdentity>,
    registry: Mutex<Registry>,
    encrypted_sends: Arc<AtomicBool>,
    trust: Arc<dyn TrustStore>,
    operator: Arc<dyn Operator>,
    session: RwLock<Option<TrustedUser>>,
    events: EventSender,
    progress: RwLock<Option<ProgressFn>>,
    running: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerContext {
    /// Bind the listener and start accepting. Returns the shared context the
    /// console and the connection threads work with.
    pub fn start(
        config: ServerConfig,
        identity: NodeIdentity,
        trust: Arc<dyn TrustStore>,
        operator: Arc<dyn Operator>,
        events: EventSender,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        let local_port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let ctx = Arc::new(Self {
            name: RwLock::new(config.name),
            local_port,
            download_dir: config.download_dir,
            identity: Arc::new(identity),
            registry: Mutex::new(Registry::default()),
            encrypted_sends: Arc::new(AtomicBool::new(false)),
            trust,
            operator,
            session: RwLock::new(None),
            events,
            progress: RwLock::new(None),
            running: AtomicBool::new(true),
            listener: Mutex::new(Some(listener)),
            accept_thread: Mutex::new(None),
        });

        let accept_ctx = Arc::clone(&ctx);
        let handle = thread::spawn(move || accept_loop(accept_ctx));
        *ctx.accept_thread.lock().unwrap() = Some(handle);

        info!("listening on port {}", local_port);
        ctx.emit(ServerEvent::Started { port: local_port });
        Ok(ctx)
    }

    /// Stop accepting new peers. Existing connections stay up; callers that
    /// want them gone enumerate and close them (see `close_all`).
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.listener.lock().unwrap() = None;
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("listener stopped");
        self.emit(ServerEvent::Stopped);
    }

    pub fn close_all(&self, farewell: bool) {
        let ids: Vec<u32> = self.registry.lock().unwrap().by_id.keys().copied().collect();
        for id in ids {
            self.close_connection(id, farewell);
        }
    }

    /// Close one connection and wait for its reader thread to finish.
    pub fn close_connection(&self, id: u32, farewell: bool) -> bool {
        let conn = match self.registry.lock().unwrap().by_id.get(&id) {
            Some(c) => Arc::clone(c),
            None => return false,
        };
        conn.close(farewell);
        self.deregister(&conn)
    }

    pub(crate) fn deregister(&self, conn: &Arc<Connection>) -> bool {
        let removed = {
            let mut reg = self.registry.lock().unwrap();
            let present = reg.by_id.remove(&conn.id()).is_some();
            let name = conn.peer_name();
            if reg.by_name.get(&name) == Some(&conn.id()) {
                reg.by_name.remove(&name);
            }
            present
        };
        if removed {
            if let Some(handle) = conn.take_reader() {
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
            info!("connection {} ({}) removed", conn.id(), conn.peer_name());
            // Links torn down before their PeerConnected went out (failed
            // opens) stay out of the event stream.
            if conn.is_announced() {
                self.emit(ServerEvent::PeerClosed {
                    id: conn.id(),
                    name: conn.peer_name(),
                });
            }
        }
        removed
    }

    pub(crate) fn allocate_id(&self) -> u32 {
        let mut reg = self.registry.lock().unwrap();
        loop {
            let id = reg.next_id;
            reg.next_id = reg.next_id.wrapping_add(1);
            if id != INVALID_ID && !reg.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn register(&self, conn: Arc<Connection>) {
        let mut reg = self.registry.lock().unwrap();
        let name = conn.peer_name();
        if !name.is_empty() {
            reg.by_name.insert(name, conn.id());
        }
        reg.by_id.insert(conn.id(), conn);
    }

    pub(crate) fn rename_peer(&self, conn: &Arc<Connection>, new_name: &str) {
        let old = conn.peer_name();
        {
            let mut reg = self.registry.lock().unwrap();
            if reg.by_name.get(&old) == Some(&conn.id()) {
                reg.by_name.remove(&old);
            }
            if !new_name.is_empty() {
                reg.by_name.insert(new_name.to_string(), conn.id());
            }
        }
        conn.set_peer_name(new_name);
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Connection>> {
        let reg = self.registry.lock().unwrap();
        let id = reg.by_name.get(name)?;
        reg.by_id.get(id).cloned()
    }

    pub(crate) fn find_by_id(&self, id: u32) -> Option<Arc<Connection>> {
        self.registry.lock().unwrap().by_id.get(&id).cloned()
    }

    /// Idempotency lookup for `open`: a live link to this peer endpoint.
    pub fn find_by_address(&self, ip: IpAddr, port: u16) -> Option<Arc<Connection>> {
        let reg = self.registry.lock().unwrap();
        reg.by_id
            .values()
            .find(|c| c.peer_addr() == (ip, port))
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.lock().unwrap().by_id.values().cloned().collect()
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub(crate) fn encrypted_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.encrypted_sends)
    }

    /// Global send policy: plain frames or the RSA envelope.
    pub fn set_encrypted(&self, enabled: bool) {
        self.encrypted_sends.store(enabled, Ordering::SeqCst);
        info!(
            "outbound sends are now {}",
            if enabled { "encrypted" } else { "plain" }
        );
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted_sends.load(Ordering::SeqCst)
    }

    pub fn node_name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn listen_port(&self) -> u16 {
        self.local_port
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir.clone()
    }

    pub fn trust(&self) -> &Arc<dyn TrustStore> {
        &self.trust
    }

    pub fn operator(&self) -> &Arc<dyn Operator> {
        &self.operator
    }

    pub fn login(&self, user: TrustedUser) {
        info!("logged in as '{}'", user.name);
        *self.session.write().unwrap() = Some(user);
    }

    pub fn logout(&self) {
        *self.session.write().unwrap() = None;
    }

    pub fn session_user(&self) -> Option<TrustedUser> {
        self.session.read().unwrap().clone()
    }

    pub fn set_progress(&self, progress: ProgressFn) {
        *self.progress.write().unwrap() = Some(progress);
    }

    pub(crate) fn progress(&self) -> Option<ProgressFn> {
        self.progress.read().unwrap().clone()
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn send_message(&self, peer: &str, text: &str) -> Result<()> {
        let conn = self
            .find_by_name(peer)
            .ok_or_else(|| NetError::Argument(format!("no peer named '{}'", peer)))?;
        conn.send(&Packet::Message(text.to_string()))
    }

    pub fn broadcast(&self, text: &str) {
        for conn in self.connections() {
            if let Err(e) = conn.send(&Packet::Message(text.to_string())) {
                warn!("broadcast to {} failed: {}", conn.peer_name(), e);
            }
        }
    }

    /// Change our display name and tell every peer.
    pub fn announce_name(&self, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.len() > net::MAXBUF {
            return Err(NetError::Argument("unusable node name".to_string()));
        }
        *self.name.write().unwrap() = new_name.to_string();
        for conn in self.connections() {
            if let Err(e) = conn.send(&Packet::Name(new_name.to_string())) {
                warn!("name announcement to {} failed: {}", conn.peer_name(), e);
            }
        }
        Ok(())
    }

    pub fn send_file_to(&self, peer: &str, path: &Path) -> Result<()> {
        let conn = self
            .find_by_name(peer)
            .ok_or_else(|| NetError::Argument(format!("no peer named '{}'", peer)))?;
        transfer::send_file(&conn, path)
    }

    /// Ask a peer to accept our logged-in user.
    pub fn request_user_trust(&self, peer: &str) -> Result<()> {
        let user = self
            .session_user()
            .ok_or_else(|| NetError::Trust("log in before requesting user trust".to_string()))?;
        let conn = self
            .find_by_name(peer)
            .ok_or_else(|| NetError::Argument(format!("no peer named '{}'", peer)))?;
        conn.send(&Packet::UserInit(user))
    }

    /// Drop the user-trust session with a peer (both sides).
    pub fn end_user_trust(&self, peer: &str) -> Result<()> {
        let conn = self
            .find_by_name(peer)
            .ok_or_else(|| NetError::Argument(format!("no peer named '{}'", peer)))?;
        conn.send(&Packet::UserEnd)?;
        if conn.set_logged_user(None).is_some() {
            self.emit(ServerEvent::TrustRevoked {
                peer: conn.peer_name(),
            });
        }
        Ok(())
    }
}

fn accept_loop(ctx: Arc<ServerContext>) {
    while ctx.running.load(Ordering::SeqCst) {
        let accepted = {
            let guard = ctx.listener.lock().unwrap();
            match guard.as_ref() {
                Some(listener) => listener.accept(),
                None => break,
            }
        };
        match accepted {
            Ok((stream, addr)) => {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || handshake(ctx, stream, addr));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                if ctx.running.load(Ordering::SeqCst) {
                    warn!("accept failed: {}", e);
                }
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// First contact on a raw socket: the only legal opening frame is Info.
/// `idret == INVALID_ID` announces a fresh peer; anything else completes a
/// connection we initiated ourselves.
fn handshake(ctx: Arc<ServerContext>, mut stream: TcpStream, addr: SocketAddr) {
    stream.set_nodelay(true).ok();
    if let Err(e) = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)) {
        warn!("handshake setup for {} failed: {}", addr, e);
        return;
    }
    match net::read_packet(&mut stream) {
        Ok(Packet::Info(info)) if info.idret == INVALID_ID => {
            accept_new_peer(&ctx, stream, addr, info)
        }
        Ok(Packet::Info(info)) => complete_pending(&ctx, stream, addr, info),
        Ok(other) => warn!(
            "protocol violation from {}: {} as first packet, dropping",
            addr,
            other.kind()
        ),
        Err(e) => warn!("handshake read from {} failed: {}", addr, e),
    }
}

fn accept_new_peer(ctx: &Arc<ServerContext>, local: TcpStream, addr: SocketAddr, info: PeerInfo) {
    let mirror_addr = SocketAddr::new(addr.ip(), info.listen_port);
    let mirror = match TcpStream::connect_timeout(&mirror_addr, CONNECT_TIMEOUT) {
        Ok(m) => m,
        Err(e) => {
            warn!("mirror dial-back to {} failed: {}", mirror_addr, e);
            return;
        }
    };
    mirror.set_nodelay(true).ok();

    let id = ctx.allocate_id();
    let conn = match Connection::new_inbound(
        id,
        local,
        mirror,
        &info,
        addr.ip(),
        Arc::clone(ctx.identity()),
        ctx.encrypted_flag(),
    ) {
        Ok(c) => c,
        Err(e) => {
            warn!("rejecting peer at {}: {}", addr, e);
            return;
        }
    };

    let reply = Packet::Info(PeerInfo {
        mirror_id: id,
        idret: info.mirror_id,
        listen_port: ctx.listen_port(),
        name: ctx.node_name(),
        public_key: ctx.identity().public_der.clone(),
    });
    if let Err(e) = conn.write_plain(&reply) {
        warn!("handshake reply to {} failed: {}", addr, e);
        return;
    }

    ctx.register(Arc::clone(&conn));
    conn.start_reader(Arc::clone(ctx));
    if let Err(e) = conn.write_plain(&Packet::Established) {
        warn!("established frame to {} failed: {}", addr, e);
        ctx.close_connection(id, false);
        return;
    }

    info!("peer {} ({}) connected from {}", id, info.name, addr);
    conn.mark_announced();
    ctx.emit(ServerEvent::PeerConnected {
        id,
        name: info.name,
        addr: addr.to_string(),
    });
}

fn complete_pending(ctx: &Arc<ServerContext>, stream: TcpStream, addr: SocketAddr, info: PeerInfo) {
    let conn = match ctx.find_by_id(info.idret) {
        Some(c) => c,
        None => {
            warn!("dial-back for unknown connection {} from {}", info.idret, addr);
            return;
        }
    };
    if conn.peer_addr().0 != addr.ip() {
        warn!(
            "dial-back for connection {} from mismatched address {}",
            info.idret, addr
        );
        return;
    }
    if let Err(e) = conn.attach_local(stream) {
        warn!("dial-back for connection {} rejected: {}", info.idret, e);
        return;
    }
    if let Err(e) = conn.update_peer_key(&info.public_key) {
        warn!("peer key from {} rejected: {}", addr, e);
        ctx.close_connection(conn.id(), false);
        return;
    }
    conn.set_listen_port(info.listen_port);
    ctx.rename_peer(&conn, &info.name);
    conn.start_reader(Arc::clone(ctx));
}

// The initiator half of the handshake lives in `client::open`.
pub use crate::client::open;
