//! RSA chunked-encryption envelope.
//!
//! Sensitive packets are not framed directly: the sender emits an
//! `EncryptedInfo` header naming the inner packet type and the chunk layout,
//! followed by that many fixed-size `EncryptedChunk` frames. Each chunk holds
//! up to `RSA_SIZE - 11` plaintext bytes under PKCS#1 v1.5 block-type-1
//! padding.
//!
//! The transform runs in the signing direction: a packet is sealed with the
//! *sender's private key* and opened with the sender's public key, so a peer
//! can only read traffic from a node whose key it learned during the
//! handshake. This is authenticity, not confidentiality, and it is the
//! protocol's defined behavior.
//!
//! Chunk arithmetic is kept exactly as the protocol defines it: a payload of
//! `len > 0` bytes becomes `len / USABLE_CHUNK + 1` chunks with
//! `last_chunk_size = len % USABLE_CHUNK`, so the final chunk carries zero
//! plaintext bytes whenever `len` is an exact multiple of the usable size.

use std::io::{Read, Write};

use num_bigint_dig::BigUint;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::{NetError, Result};
use crate::net::{self, EnvelopeHeader, Packet, PacketKind, RSA_SIZE};

/// Plaintext bytes carried per ciphertext block.
pub const USABLE_CHUNK: usize = RSA_SIZE - 11;

/// Refuse envelope headers claiming absurd chunk counts before allocating.
const MAX_CHUNKS: u32 = 1 << 20;

/// Chunk layout for a payload of `len` bytes: (chunk count, last chunk size).
pub fn chunk_layout(len: usize) -> (u32, u32) {
    if len == 0 {
        return (0, 0);
    }
    ((len / USABLE_CHUNK + 1) as u32, (len % USABLE_CHUNK) as u32)
}

fn expected_chunk_size(header: &EnvelopeHeader, index: u32) -> usize {
    if index + 1 == header.chunk_count {
        header.last_chunk_size as usize
    } else {
        USABLE_CHUNK
    }
}

/// Seal `packet` with our private key and write the envelope to `w`.
pub fn seal_packet<W: Write>(w: &mut W, key: &RsaPrivateKey, packet: &Packet) -> Result<()> {
    let kind = packet.kind();
    if kind == PacketKind::EncryptedInfo || kind == PacketKind::EncryptedChunk {
        return Err(NetError::Argument(format!("cannot seal a {} frame", kind)));
    }
    let body = net::encode_body(packet)?;
    let (chunk_count, last_chunk_size) = chunk_layout(body.len());
    let header = EnvelopeHeader {
        inner_type: kind.tag(),
        chunk_count,
        last_chunk_size,
    };
    net::write_packet(w, &Packet::EncryptedInfo(header))?;
    for index in 0..chunk_count {
        let offset = index as usize * USABLE_CHUNK;
        let take = expected_chunk_size(&header, index);
        let block = private_encrypt(key, &body[offset..offset + take])?;
        net::write_packet(w, &Packet::EncryptedChunk(block))?;
    }
    Ok(())
}

/// Read the chunk frames announced by `header` from `r`, decrypt them with
/// the sender's public key and decode the reassembled inner packet.
///
/// A header with `chunk_count == 0` reads nothing and yields an empty body.
pub fn open_packet<R: Read>(
    r: &mut R,
    sender_key: &RsaPublicKey,
    header: &EnvelopeHeader,
) -> Result<Packet> {
    let inner = PacketKind::from_tag(header.inner_type).ok_or_else(|| {
        NetError::Protocol(format!(
            "envelope carries unknown inner type 0x{:02x}",
            header.inner_type
        ))
    })?;
    if inner == PacketKind::EncryptedInfo || inner == PacketKind::EncryptedChunk {
        return Err(NetError::Protocol("nested encrypted envelope".to_string()));
    }
    if header.chunk_count > MAX_CHUNKS {
        return Err(NetError::Protocol(format!(
            "envelope claims {} chunks",
            header.chunk_count
        )));
    }
    if header.last_chunk_size as usize > USABLE_CHUNK {
        return Err(NetError::Protocol(format!(
            "last chunk of {} bytes exceeds the usable chunk size",
            header.last_chunk_size
        )));
    }

    let mut body = Vec::with_capacity(
        header.chunk_count.saturating_sub(1) as usize * USABLE_CHUNK
            + header.last_chunk_size as usize,
    );
    for index in 0..header.chunk_count {
        let block = match net::read_packet(r)? {
            Packet::EncryptedChunk(block) => block,
            other => {
                return Err(NetError::Protocol(format!(
                    "expected encrypted chunk {}/{}, got {}",
                    index + 1,
                    header.chunk_count,
                    other.kind()
                )))
            }
        };
        let plain = public_decrypt(sender_key, &block)?;
        if plain.len() != expected_chunk_size(header, index) {
            return Err(NetError::Crypto(format!(
                "chunk {} decrypted to {} bytes, header promised {}",
                index + 1,
                plain.len(),
                expected_chunk_size(header, index)
            )));
        }
        body.extend_from_slice(&plain);
    }
    net::decode_body(inner, &body)
}

/// Raw RSA with the private exponent over a block-type-1 padded message.
fn private_encrypt(key: &RsaPrivateKey, msg: &[u8]) -> Result<Vec<u8>> {
    let k = key.size();
    if k != RSA_SIZE {
        return Err(NetError::Crypto(format!(
            "key size {} does not match the {} byte wire block",
            k, RSA_SIZE
        )));
    }
    if msg.len() > k - 11 {
        return Err(NetError::Argument(format!(
            "{} plaintext bytes exceed one padded block",
            msg.len()
        )));
    }
    // EM = 00 01 FF..FF 00 M, deterministic fill
    let mut em = vec![0xffu8; k];
    em[0] = 0x00;
    em[1] = 0x01;
    em[k - msg.len() - 1] = 0x00;
    em[k - msg.len()..].copy_from_slice(msg);

    let m = BigUint::from_bytes_be(&em);
    let c = m.modpow(key.d(), key.n());
    Ok(to_fixed_width(&c, k))
}

/// Inverse of `private_encrypt`: raise with the public exponent and unpad.
fn public_decrypt(key: &RsaPublicKey, block: &[u8]) -> Result<Vec<u8>> {
    let k = key.size();
    if block.len() != k {
        return Err(NetError::Crypto(format!(
            "ciphertext block of {} bytes does not match the key size {}",
            block.len(),
            k
        )));
    }
    let c = BigUint::from_bytes_be(block);
    if &c >= key.n() {
        return Err(NetError::Crypto("ciphertext out of range".to_string()));
    }
    let m = c.modpow(key.e(), key.n());
    let em = to_fixed_width(&m, k);

    if em[0] != 0x00 || em[1] != 0x01 {
        return Err(NetError::Crypto("bad block padding".to_string()));
    }
    let mut pos = 2;
    while pos < em.len() && em[pos] == 0xff {
        pos += 1;
    }
    if pos < 10 || pos >= em.len() || em[pos] != 0x00 {
        return Err(NetError::Crypto("bad block padding".to_string()));
    }
    Ok(em[pos + 1..].to_vec())
}

fn to_fixed_width(value: &BigUint, width: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}
