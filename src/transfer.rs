//! Chunked file transfer.
//!
//! A transfer is a `SendFileInfo` descriptor, the announced chunk frames,
//! and a trailing `SendFileTerminate`. Small files (under one frame) travel
//! as a single chunk; larger ones as fixed-size chunks with a shorter final
//! one. Either side may signal `AbortOperation`; a receiver that cannot take
//! the file still drains the announced frames so the stream stays usable.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::client::Connection;
use crate::error::{NetError, Result};
use crate::net::{self, FileInfo, Packet, PacketKind, MAXBUF};
use crate::server::ServerContext;
use crate::types::{ProgressFn, ServerEvent};
use crate::{crypto, utils};

/// Chunk size for multi-chunk transfers; also the largest single-block file.
pub const FILE_CHUNK: usize = MAXBUF;

/// Build the wire descriptor for a file of `total` bytes.
pub(crate) fn describe(total: u64, name: &str) -> Result<FileInfo> {
    if total > u32::MAX as u64 {
        return Err(NetError::Argument(format!(
            "file of {} bytes is too large for the transfer protocol",
            total
        )));
    }
    if total < FILE_CHUNK as u64 {
        return Ok(FileInfo {
            total_length: total,
            chunk_length: 0,
            last_chunk_size: 0,
            chunk_count: 0,
            has_chunks: false,
            file_name: name.to_string(),
        });
    }
    let chunk = FILE_CHUNK as u64;
    let count = ((total + chunk - 1) / chunk) as u32;
    let rem = (total % chunk) as u32;
    let last = if rem == 0 { FILE_CHUNK as u32 } else { rem };
    Ok(FileInfo {
        total_length: total,
        chunk_length: FILE_CHUNK as u32,
        last_chunk_size: last,
        chunk_count: count,
        has_chunks: true,
        file_name: name.to_string(),
    })
}

/// Send `path` over `conn`. The terminate frame is attempted even when
/// reading the source fails mid-way, so the receiver can abort cleanly.
pub fn send_file(conn: &Connection, path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .map_err(|e| NetError::Transfer(format!("open {}: {}", path.display(), e)))?;
    if !meta.is_file() {
        return Err(NetError::Argument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NetError::Argument("path has no usable file name".to_string()))?;
    let info = describe(meta.len(), name)?;

    let mut file = BufReader::new(
        File::open(path).map_err(|e| NetError::Transfer(format!("open {}: {}", path.display(), e)))?,
    );
    conn.send(&Packet::SendFileInfo(info.clone()))?;
    let outcome = stream_chunks(conn, &mut file, &info);
    let terminate = conn.send(&Packet::SendFileTerminate);
    outcome?;
    terminate?;
    info!("sent {} ({} bytes) to {}", name, meta.len(), conn.peer_name());
    Ok(())
}

fn stream_chunks<R: Read>(conn: &Connection, file: &mut R, info: &FileInfo) -> Result<()> {
    let count = if info.has_chunks { info.chunk_count } else { 1 };
    for index in 0..count {
        let want = if !info.has_chunks {
            info.total_length as usize
        } else if index + 1 == count {
            info.last_chunk_size as usize
        } else {
            info.chunk_length as usize
        };
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf)
            .map_err(|e| NetError::Transfer(format!("reading the source failed: {}", e)))?;
        conn.send(&Packet::SendFileChunk(buf))?;
    }
    Ok(())
}

/// Handle an announced transfer inside the connection's processing loop.
pub(crate) fn receive_file(
    ctx: &Arc<ServerContext>,
    conn: &Arc<Connection>,
    local: &mut TcpStream,
    info: FileInfo,
) -> Result<()> {
    let (path, len) = receive_into(conn, local, &info, &ctx.download_dir(), ctx.progress())?;
    info!(
        "received {} ({} bytes) from {}",
        path.display(),
        len,
        conn.peer_name()
    );
    ctx.emit(ServerEvent::FileReceived {
        from: conn.peer_name(),
        path,
        len,
    });
    Ok(())
}

fn validate(info: &FileInfo) -> Result<()> {
    if info.total_length > u32::MAX as u64 {
        return Err(NetError::Protocol("descriptor length out of range".to_string()));
    }
    if info.has_chunks {
        if info.chunk_length == 0
            || info.chunk_length as usize > MAXBUF
            || info.chunk_count == 0
            || info.last_chunk_size == 0
            || info.last_chunk_size > info.chunk_length
        {
            return Err(NetError::Protocol(
                "inconsistent chunked file descriptor".to_string(),
            ));
        }
        let promised = (info.chunk_count as u64 - 1) * info.chunk_length as u64
            + info.last_chunk_size as u64;
        if promised != info.total_length {
            return Err(NetError::Protocol(
                "file descriptor chunks do not add up to its length".to_string(),
            ));
        }
    } else if info.total_length >= MAXBUF as u64 {
        return Err(NetError::Protocol(
            "single-block transfer exceeds one frame".to_string(),
        ));
    }
    Ok(())
}

/// Receive the announced file into `dir`. On failures that leave the stream
/// position known, the remaining frames are drained so the connection can
/// return to idling; partial files are deleted.
pub(crate) fn receive_into(
    conn: &Arc<Connection>,
    local: &mut TcpStream,
    info: &FileInfo,
    dir: &Path,
    progress: Option<ProgressFn>,
) -> Result<(PathBuf, u64)> {
    validate(info)?;
    let total = info.total_length;
    let count = if info.has_chunks { info.chunk_count } else { 1 };
    let size_of = |index: u32| -> usize {
        if !info.has_chunks {
            total as usize
        } else if index + 1 == count {
            info.last_chunk_size as usize
        } else {
            info.chunk_length as usize
        }
    };

    let name = match utils::sanitize_file_name(&info.file_name) {
        Some(n) => n,
        None => {
            abandon(conn, local, 0, count, &size_of);
            return Err(NetError::Transfer(format!(
                "peer sent an unusable file name {:?}",
                info.file_name
            )));
        }
    };

    let path = dir.join(&name);
    let mut file = match File::create(&path) {
        Ok(f) => BufWriter::new(f),
        Err(e) => {
            abandon(conn, local, 0, count, &size_of);
            return Err(NetError::Transfer(format!(
                "cannot create {}: {}",
                path.display(),
                e
            )));
        }
    };

    let mut written = 0u64;
    for index in 0..count {
        let want = size_of(index);
        match next_frame(conn, local, Some(want)) {
            Ok(Frame::Chunk(data)) => {
                if data.len() != want {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    abandon(conn, local, index + 1, count, &size_of);
                    return Err(NetError::Transfer(format!(
                        "chunk {} carried {} bytes, descriptor promised {}",
                        index + 1,
                        data.len(),
                        want
                    )));
                }
                if let Err(e) = file.write_all(&data) {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    abandon(conn, local, index + 1, count, &size_of);
                    return Err(NetError::Transfer(format!(
                        "writing {} failed: {}",
                        path.display(),
                        e
                    )));
                }
                written += want as u64;
                if let Some(p) = progress.as_ref() {
                    p(&name, written, total);
                }
            }
            Ok(Frame::Terminate) => {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(NetError::Transfer(
                    "transfer ended before all chunks arrived".to_string(),
                ));
            }
            Ok(Frame::Abort) => {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(NetError::Transfer("peer aborted the transfer".to_string()));
            }
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        }
    }

    match next_frame(conn, local, None) {
        Ok(Frame::Terminate) => {}
        Ok(Frame::Abort) => {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(NetError::Transfer(
                "peer aborted after the last chunk".to_string(),
            ));
        }
        Ok(Frame::Chunk(_)) => unreachable!("next_frame refuses chunks when none are expected"),
        Err(e) => {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(e);
        }
    }

    file.flush().map_err(|e| {
        let _ = fs::remove_file(&path);
        NetError::Transfer(format!("writing {} failed: {}", path.display(), e))
    })?;
    Ok((path, total))
}

enum Frame {
    Chunk(Vec<u8>),
    Terminate,
    Abort,
}

/// Read the next transfer frame, transparently unwrapping enveloped ones.
/// `expected` is the chunk length implied by the active transfer; None means
/// no further chunk is legal.
fn next_frame(conn: &Connection, r: &mut TcpStream, expected: Option<usize>) -> Result<Frame> {
    match net::read_kind(r)? {
        PacketKind::SendFileChunk => {
            let want = expected.ok_or_else(|| {
                NetError::Protocol("file chunk after the final announced chunk".to_string())
            })?;
            let mut buf = vec![0u8; want];
            r.read_exact(&mut buf)?;
            Ok(Frame::Chunk(buf))
        }
        PacketKind::SendFileTerminate => Ok(Frame::Terminate),
        PacketKind::AbortOperation => Ok(Frame::Abort),
        PacketKind::EncryptedInfo => {
            let header = match net::read_body(r, PacketKind::EncryptedInfo)? {
                Packet::EncryptedInfo(h) => h,
                _ => unreachable!("read_body returns the requested kind"),
            };
            let key = conn
                .peer_key()
                .ok_or_else(|| NetError::Crypto("no public key for peer".to_string()))?;
            match crypto::open_packet(r, &key, &header)? {
                Packet::SendFileChunk(data) => {
                    if expected.is_none() {
                        return Err(NetError::Protocol(
                            "file chunk after the final announced chunk".to_string(),
                        ));
                    }
                    Ok(Frame::Chunk(data))
                }
                Packet::SendFileTerminate => Ok(Frame::Terminate),
                Packet::AbortOperation => Ok(Frame::Abort),
                other => Err(NetError::Protocol(format!(
                    "unexpected {} inside a transfer",
                    other.kind()
                ))),
            }
        }
        kind => Err(NetError::Protocol(format!(
            "unexpected {} during a file transfer",
            kind
        ))),
    }
}

/// Notify the peer and read past the frames it will still send.
fn abandon(conn: &Connection, r: &mut TcpStream, from: u32, count: u32, size_of: &dyn Fn(u32) -> usize) {
    if let Err(e) = conn.send(&Packet::AbortOperation) {
        debug!("abort signal to {} not delivered: {}", conn.peer_name(), e);
    }
    for index in from..count {
        match next_frame(conn, r, Some(size_of(index))) {
            Ok(Frame::Chunk(_)) => continue,
            _ => return,
        }
    }
    let _ = next_frame(conn, r, None);
}
