//! Shared type aliases and the event stream the networking code feeds back
//! to whatever front end is driving the node.
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

/// Channel end the server pushes events into; the console drains the other end.
pub type EventSender = mpsc::Sender<ServerEvent>;

/// Callback invoked while a file transfer is running: (name, bytes so far, total).
pub type ProgressFn = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Things the engine tells the operator about.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started { port: u16 },
    Stopped,
    PeerConnected { id: u32, name: String, addr: String },
    PeerClosed { id: u32, name: String },
    Message { from: String, text: String },
    FileReceived { from: String, path: PathBuf, len: u64 },
    TrustEstablished { peer: String, user: String },
    TrustRevoked { peer: String },
}
