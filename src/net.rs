//! Wire codec: typed binary frames exchanged between peers.
//!
//! Every frame is a one-byte type tag followed by a body whose size is fixed
//! by the tag (text packets carry a NUL-padded MAXBUF buffer, structured
//! packets a fixed layout, control packets nothing at all). There is no
//! generic length prefix; the reader knows from the tag exactly how many
//! bytes to take. All multi-byte integers travel big-endian.
//!
//! The one exception is the file chunk frame, whose body length is implied
//! by the transfer that is in progress; the transfer code reads those with
//! an explicit expected length.

use std::fmt;
use std::io::{Read, Write};

use crate::auth::TrustedUser;
use crate::error::{NetError, Result};

/// Size of the fixed text buffers (names, messages, file names).
pub const MAXBUF: usize = 1024;
/// Size of one RSA ciphertext block on the wire.
pub const RSA_SIZE: usize = 256;
/// Marker for "no id yet" in the Info handshake frame.
pub const INVALID_ID: u32 = u32::MAX;
/// Upper bound for the size-prefixed buffers inside Info and user frames.
pub const MAX_BLOB: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Name = 0x01,
    Message = 0x02,
    ClosingConnection = 0x03,
    Established = 0x04,
    SendFileInfo = 0x05,
    SendFileChunk = 0x06,
    SendFileTerminate = 0x07,
    AbortOperation = 0x08,
    Info = 0x09,
    EncryptedInfo = 0x0a,
    EncryptedChunk = 0x0b,
    UserInit = 0x0c,
    UserInitResponse = 0x0d,
    UserInitNotAccepted = 0x0e,
    UserInitNotLoggedIn = 0x0f,
    UserInitAlreadyExists = 0x10,
    UserEnd = 0x11,
    UserEndResponse = 0x12,
}

impl PacketKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        use PacketKind::*;
        Some(match tag {
            0x01 => Name,
            0x02 => Message,
            0x03 => ClosingConnection,
            0x04 => Established,
            0x05 => SendFileInfo,
            0x06 => SendFileChunk,
            0x07 => SendFileTerminate,
            0x08 => AbortOperation,
            0x09 => Info,
            0x0a => EncryptedInfo,
            0x0b => EncryptedChunk,
            0x0c => UserInit,
            0x0d => UserInitResponse,
            0x0e => UserInitNotAccepted,
            0x0f => UserInitNotLoggedIn,
            0x10 => UserInitAlreadyExists,
            0x11 => UserEnd,
            0x12 => UserEndResponse,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketKind::Name => "name",
            PacketKind::Message => "message",
            PacketKind::ClosingConnection => "closing-connection",
            PacketKind::Established => "established",
            PacketKind::SendFileInfo => "file-info",
            PacketKind::SendFileChunk => "file-chunk",
            PacketKind::SendFileTerminate => "file-terminate",
            PacketKind::AbortOperation => "abort-operation",
            PacketKind::Info => "client-info",
            PacketKind::EncryptedInfo => "encrypted-info",
            PacketKind::EncryptedChunk => "encrypted-chunk",
            PacketKind::UserInit => "user-init",
            PacketKind::UserInitResponse => "user-init-response",
            PacketKind::UserInitNotAccepted => "user-init-not-accepted",
            PacketKind::UserInitNotLoggedIn => "user-init-not-logged-in",
            PacketKind::UserInitAlreadyExists => "user-init-already-exists",
            PacketKind::UserEnd => "user-end",
            PacketKind::UserEndResponse => "user-end-response",
        };
        f.write_str(s)
    }
}

/// Descriptor announcing a file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub total_length: u64,
    pub chunk_length: u32,
    pub last_chunk_size: u32,
    pub chunk_count: u32,
    pub has_chunks: bool,
    pub file_name: String,
}

/// Identity block exchanged during the mirrored handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub mirror_id: u32,
    pub idret: u32,
    pub listen_port: u16,
    pub name: String,
    /// SPKI DER encoding of the peer's RSA public key; may be empty.
    pub public_key: Vec<u8>,
}

/// Header announcing an encrypted envelope: the inner packet's tag plus the
/// chunk layout of the ciphertext that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub inner_type: u8,
    pub chunk_count: u32,
    pub last_chunk_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Name(String),
    Message(String),
    ClosingConnection,
    Established,
    SendFileInfo(FileInfo),
    SendFileChunk(Vec<u8>),
    SendFileTerminate,
    AbortOperation,
    Info(PeerInfo),
    EncryptedInfo(EnvelopeHeader),
    EncryptedChunk(Vec<u8>),
    UserInit(TrustedUser),
    UserInitResponse(TrustedUser),
    UserInitNotAccepted,
    UserInitNotLoggedIn,
    UserInitAlreadyExists,
    UserEnd,
    UserEndResponse,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Name(_) => PacketKind::Name,
            Packet::Message(_) => PacketKind::Message,
            Packet::ClosingConnection => PacketKind::ClosingConnection,
            Packet::Established => PacketKind::Established,
            Packet::SendFileInfo(_) => PacketKind::SendFileInfo,
            Packet::SendFileChunk(_) => PacketKind::SendFileChunk,
            Packet::SendFileTerminate => PacketKind::SendFileTerminate,
            Packet::AbortOperation => PacketKind::AbortOperation,
            Packet::Info(_) => PacketKind::Info,
            Packet::EncryptedInfo(_) => PacketKind::EncryptedInfo,
            Packet::EncryptedChunk(_) => PacketKind::EncryptedChunk,
            Packet::UserInit(_) => PacketKind::UserInit,
            Packet::UserInitResponse(_) => PacketKind::UserInitResponse,
            Packet::UserInitNotAccepted => PacketKind::UserInitNotAccepted,
            Packet::UserInitNotLoggedIn => PacketKind::UserInitNotLoggedIn,
            Packet::UserInitAlreadyExists => PacketKind::UserInitAlreadyExists,
            Packet::UserEnd => PacketKind::UserEnd,
            Packet::UserEndResponse => PacketKind::UserEndResponse,
        }
    }
}

fn put_text(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > MAXBUF {
        return Err(NetError::Argument(format!(
            "text of {} bytes exceeds the {} byte frame",
            bytes.len(),
            MAXBUF
        )));
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + (MAXBUF - bytes.len()), 0);
    Ok(())
}

fn take_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn put_blob(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_BLOB {
        return Err(NetError::Argument(format!(
            "buffer of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_BLOB
        )));
    }
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_buf<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    if len > MAX_BLOB {
        return Err(NetError::Protocol(format!(
            "size-prefixed buffer claims {} bytes (limit {})",
            len, MAX_BLOB
        )));
    }
    read_buf(r, len)
}

fn encode_body_into(packet: &Packet, out: &mut Vec<u8>) -> Result<()> {
    match packet {
        Packet::Name(s) | Packet::Message(s) => put_text(out, s)?,
        Packet::SendFileInfo(fi) => {
            if fi.total_length > u32::MAX as u64 {
                return Err(NetError::Argument(format!(
                    "file of {} bytes is too large for the transfer protocol",
                    fi.total_length
                )));
            }
            out.extend_from_slice(&(fi.total_length as u32).to_be_bytes());
            out.extend_from_slice(&fi.chunk_length.to_be_bytes());
            out.extend_from_slice(&fi.last_chunk_size.to_be_bytes());
            out.extend_from_slice(&fi.chunk_count.to_be_bytes());
            out.push(fi.has_chunks as u8);
            put_text(out, &fi.file_name)?;
        }
        Packet::SendFileChunk(data) => out.extend_from_slice(data),
        Packet::Info(info) => {
            out.extend_from_slice(&info.mirror_id.to_be_bytes());
            out.extend_from_slice(&info.idret.to_be_bytes());
            out.extend_from_slice(&(info.listen_port as u32).to_be_bytes());
            put_text(out, &info.name)?;
            put_blob(out, &info.public_key)?;
        }
        Packet::EncryptedInfo(h) => {
            out.push(h.inner_type);
            out.extend_from_slice(&h.chunk_count.to_be_bytes());
            out.extend_from_slice(&h.last_chunk_size.to_be_bytes());
        }
        Packet::EncryptedChunk(block) => {
            if block.len() != RSA_SIZE {
                return Err(NetError::Argument(format!(
                    "encrypted chunk must be exactly {} bytes, got {}",
                    RSA_SIZE,
                    block.len()
                )));
            }
            out.extend_from_slice(block);
        }
        Packet::UserInit(user) | Packet::UserInitResponse(user) => {
            put_text(out, &user.name)?;
            put_blob(out, &user.key)?;
            put_blob(out, &user.iv)?;
        }
        Packet::ClosingConnection
        | Packet::Established
        | Packet::SendFileTerminate
        | Packet::AbortOperation
        | Packet::UserInitNotAccepted
        | Packet::UserInitNotLoggedIn
        | Packet::UserInitAlreadyExists
        | Packet::UserEnd
        | Packet::UserEndResponse => {}
    }
    Ok(())
}

/// Encode a packet's body (without the leading tag byte).
pub fn encode_body(packet: &Packet) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_body_into(packet, &mut out)?;
    Ok(out)
}

/// Write one complete frame (tag + body) and flush.
pub fn write_packet<W: Write>(w: &mut W, packet: &Packet) -> Result<()> {
    let mut frame = Vec::with_capacity(1 + MAXBUF);
    frame.push(packet.kind().tag());
    encode_body_into(packet, &mut frame)?;
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Read the next frame's type tag.
pub fn read_kind<R: Read>(r: &mut R) -> Result<PacketKind> {
    let tag = read_u8(r)?;
    PacketKind::from_tag(tag)
        .ok_or_else(|| NetError::Protocol(format!("unknown packet type 0x{:02x}", tag)))
}

/// Read the body of a frame whose tag is already known.
///
/// File chunk bodies cannot be read here because their length comes from the
/// active transfer; asking for one is reported as a protocol violation.
pub fn read_body<R: Read>(r: &mut R, kind: PacketKind) -> Result<Packet> {
    Ok(match kind {
        PacketKind::Name => Packet::Name(take_text(&read_buf(r, MAXBUF)?)),
        PacketKind::Message => Packet::Message(take_text(&read_buf(r, MAXBUF)?)),
        PacketKind::ClosingConnection => Packet::ClosingConnection,
        PacketKind::Established => Packet::Established,
        PacketKind::SendFileInfo => {
            let total_length = read_u32(r)? as u64;
            let chunk_length = read_u32(r)?;
            let last_chunk_size = read_u32(r)?;
            let chunk_count = read_u32(r)?;
            let has_chunks = read_u8(r)? != 0;
            let file_name = take_text(&read_buf(r, MAXBUF)?);
            Packet::SendFileInfo(FileInfo {
                total_length,
                chunk_length,
                last_chunk_size,
                chunk_count,
                has_chunks,
                file_name,
            })
        }
        PacketKind::SendFileChunk => {
            return Err(NetError::Protocol(
                "file chunk frame outside an active transfer".to_string(),
            ))
        }
        PacketKind::SendFileTerminate => Packet::SendFileTerminate,
        PacketKind::AbortOperation => Packet::AbortOperation,
        PacketKind::Info => {
            let mirror_id = read_u32(r)?;
            let idret = read_u32(r)?;
            let port = read_u32(r)?;
            if port > u16::MAX as u32 {
                return Err(NetError::Protocol(format!("listen port {} out of range", port)));
            }
            let name = take_text(&read_buf(r, MAXBUF)?);
            let public_key = read_blob(r)?;
            Packet::Info(PeerInfo {
                mirror_id,
                idret,
                listen_port: port as u16,
                name,
                public_key,
            })
        }
        PacketKind::EncryptedInfo => {
            let inner_type = read_u8(r)?;
            let chunk_count = read_u32(r)?;
            let last_chunk_size = read_u32(r)?;
            Packet::EncryptedInfo(EnvelopeHeader {
                inner_type,
                chunk_count,
                last_chunk_size,
            })
        }
        PacketKind::EncryptedChunk => Packet::EncryptedChunk(read_buf(r, RSA_SIZE)?),
        PacketKind::UserInit | PacketKind::UserInitResponse => {
            let name = take_text(&read_buf(r, MAXBUF)?);
            let key = read_blob(r)?;
            let iv = read_blob(r)?;
            let user = TrustedUser { name, key, iv };
            if kind == PacketKind::UserInit {
                Packet::UserInit(user)
            } else {
                Packet::UserInitResponse(user)
            }
        }
        PacketKind::UserInitNotAccepted => Packet::UserInitNotAccepted,
        PacketKind::UserInitNotLoggedIn => Packet::UserInitNotLoggedIn,
        PacketKind::UserInitAlreadyExists => Packet::UserInitAlreadyExists,
        PacketKind::UserEnd => Packet::UserEnd,
        PacketKind::UserEndResponse => Packet::UserEndResponse,
    })
}

/// Read one complete self-describing frame.
pub fn read_packet<R: Read>(r: &mut R) -> Result<Packet> {
    let kind = read_kind(r)?;
    read_body(r, kind)
}

/// Decode a packet body that arrived inside an encrypted envelope.
///
/// Unlike the socket path, a file chunk body is legal here: its length is
/// simply the envelope payload's length.
pub fn decode_body(kind: PacketKind, body: &[u8]) -> Result<Packet> {
    if kind == PacketKind::SendFileChunk {
        return Ok(Packet::SendFileChunk(body.to_vec()));
    }
    let mut r = body;
    let packet = read_body(&mut r, kind)?;
    if !r.is_empty() {
        return Err(NetError::Protocol(format!(
            "{} byte(s) trailing a {} body",
            r.len(),
            kind
        )));
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) -> Packet {
        let mut wire = Vec::new();
        write_packet(&mut wire, &packet).expect("encode");
        let mut r: &[u8] = &wire;
        let back = read_packet(&mut r).expect("decode");
        assert!(r.is_empty(), "reader must consume the whole frame");
        back
    }

    #[test]
    fn text_packets_round_trip() {
        let p = Packet::Message("hello there".to_string());
        assert_eq!(round_trip(p.clone()), p);
        let p = Packet::Name("node-b".to_string());
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn text_frames_are_fixed_size() {
        let mut wire = Vec::new();
        write_packet(&mut wire, &Packet::Message("x".to_string())).unwrap();
        assert_eq!(wire.len(), 1 + MAXBUF);
    }

    #[test]
    fn oversized_text_is_refused() {
        let text = "a".repeat(MAXBUF + 1);
        let err = encode_body(&Packet::Message(text)).unwrap_err();
        assert!(matches!(err, NetError::Argument(_)));
    }

    #[test]
    fn info_round_trips() {
        let p = Packet::Info(PeerInfo {
            mirror_id: 7,
            idret: INVALID_ID,
            listen_port: 8888,
            name: "alpha".to_string(),
            public_key: vec![1, 2, 3, 4, 5],
        });
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn file_info_round_trips() {
        let p = Packet::SendFileInfo(FileInfo {
            total_length: 10 * 1024 + 37,
            chunk_length: 1024,
            last_chunk_size: 37,
            chunk_count: 11,
            has_chunks: true,
            file_name: "data.bin".to_string(),
        });
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn control_frames_are_one_byte() {
        for p in [
            Packet::ClosingConnection,
            Packet::Established,
            Packet::SendFileTerminate,
            Packet::AbortOperation,
            Packet::UserEnd,
            Packet::UserEndResponse,
            Packet::UserInitNotAccepted,
            Packet::UserInitNotLoggedIn,
            Packet::UserInitAlreadyExists,
        ] {
            let mut wire = Vec::new();
            write_packet(&mut wire, &p).unwrap();
            assert_eq!(wire.len(), 1, "{} should have no body", p.kind());
            assert_eq!(round_trip(p.clone()), p);
        }
    }

    #[test]
    fn user_packets_round_trip() {
        let user = crate::auth::TrustedUser {
            name: "carol".to_string(),
            key: vec![9; 32],
            iv: vec![7; 16],
        };
        let p = Packet::UserInit(user.clone());
        assert_eq!(round_trip(p.clone()), p);
        let p = Packet::UserInitResponse(user);
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn unknown_tag_is_a_violation() {
        let wire = [0xeeu8];
        let mut r: &[u8] = &wire;
        let err = read_packet(&mut r).unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[test]
    fn short_frame_is_fatal() {
        let mut wire = Vec::new();
        write_packet(&mut wire, &Packet::Message("cut off".to_string())).unwrap();
        wire.truncate(100);
        let mut r: &[u8] = &wire;
        let err = read_packet(&mut r).unwrap_err();
        assert!(matches!(err, NetError::Socket(_)));
    }

    #[test]
    fn hostile_blob_length_is_refused() {
        let mut wire = Vec::new();
        wire.push(PacketKind::Info.tag());
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.extend_from_slice(&INVALID_ID.to_be_bytes());
        wire.extend_from_slice(&4000u32.to_be_bytes());
        wire.extend_from_slice(&[0u8; MAXBUF]);
        wire.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut r: &[u8] = &wire;
        let err = read_packet(&mut r).unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[test]
    fn integers_travel_big_endian() {
        let mut wire = Vec::new();
        write_packet(
            &mut wire,
            &Packet::EncryptedInfo(EnvelopeHeader {
                inner_type: 2,
                chunk_count: 0x0102_0304,
                last_chunk_size: 5,
            }),
        )
        .unwrap();
        assert_eq!(&wire[2..6], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn envelope_chunk_body_decodes_with_implied_length() {
        let p = decode_body(PacketKind::SendFileChunk, &[1, 2, 3]).unwrap();
        assert_eq!(p, Packet::SendFileChunk(vec![1, 2, 3]));
    }
}
