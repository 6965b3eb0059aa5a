// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Streaming archive encryption: AES-256-GCM with an Argon2id-derived key.
//!
//! Archives can be many gigabytes, so the plaintext is sealed in fixed-size
//! chunks instead of one buffer.
//!
//! ```text
//! header: [ARCB][v1][m_cost u32][t_cost u32][p_cost u32][salt:16][nonce_prefix:7]
//! chunk:  [last u8][len u32][ciphertext+tag:len]
//! nonce:  nonce_prefix || chunk counter (u32 BE) || last flag
//! ```
//!
//! The header is authenticated as associated data of every chunk. The last
//! flag is bound into the nonce, so truncating the stream or reordering chunks
//! fails authentication.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand_core::{OsRng, RngCore};
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

const MAGIC: &[u8; 4] = b"ARCB";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = 4 + 1 + 12 + SALT_LEN + NONCE_PREFIX_LEN;
const TAG_LEN: usize = 16;
const CHUNK_SIZE: usize = 1024 * 1024;

// Upper bounds for header-supplied Argon2 costs; the header is only
// authenticated after the key has been derived.
const MAX_M_COST_KIB: u32 = 1024 * 1024;
const MAX_T_COST: u32 = 16;
const MAX_P_COST: u32 = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("not an encrypted archive (bad header)")]
    BadHeader,
    #[error("unsupported encryption format version {0}")]
    UnsupportedVersion(u8),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("authentication failed: wrong passphrase or corrupted archive")]
    Authentication,
    #[error("encrypted archive is truncated")]
    Truncated,
    #[error("key derivation parameters out of range (m_cost={m_cost_kib} KiB, t_cost={t_cost}, p_cost={p_cost})")]
    KdfOutOfRange { m_cost_kib: u32, t_cost: u32, p_cost: u32 },
    #[error("passphrase is empty")]
    EmptyPassphrase,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Argon2id cost parameters, stored in the header so they can change later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl KdfParams {
    fn within_limits(&self) -> bool {
        (1..=MAX_M_COST_KIB).contains(&self.m_cost_kib)
            && (1..=MAX_T_COST).contains(&self.t_cost)
            && (1..=MAX_P_COST).contains(&self.p_cost)
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost_kib: 65536,
            t_cost: 3,
            p_cost: 4,
        }
    }
}

fn derive_key(passphrase: &str, salt: &[u8], params: KdfParams) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let argon_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Read until `buf` is full or EOF; returns bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt `reader` into `writer`.
pub fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    passphrase: &str,
    params: KdfParams,
) -> Result<(), CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut prefix);

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.push(FORMAT_VERSION);
    header.extend_from_slice(&params.m_cost_kib.to_be_bytes());
    header.extend_from_slice(&params.t_cost.to_be_bytes());
    header.extend_from_slice(&params.p_cost.to_be_bytes());
    header.extend_from_slice(&salt);
    header.extend_from_slice(&prefix);
    writer.write_all(&header)?;

    let key = derive_key(passphrase, &salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::KeyDerivation("invalid key length".into()))?;

    let mut current = vec![0u8; CHUNK_SIZE];
    let mut next = vec![0u8; CHUNK_SIZE];
    let mut current_len = fill(&mut reader, &mut current)?;
    let mut counter: u32 = 0;

    loop {
        let next_len = if current_len == CHUNK_SIZE {
            fill(&mut reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let nonce = chunk_nonce(&prefix, counter, last);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &current[..current_len],
                    aad: &header,
                },
            )
            .map_err(|_| CryptoError::Authentication)?;

        writer.write_all(&[u8::from(last)])?;
        writer.write_all(&(sealed.len() as u32).to_be_bytes())?;
        writer.write_all(&sealed)?;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        counter = counter.checked_add(1).ok_or(CryptoError::Truncated)?;
    }
    writer.flush()?;
    Ok(())
}

/// Decrypt a stream produced by [`encrypt_stream`].
pub fn decrypt_stream<R: Read, W: Write>(mut reader: R, mut writer: W, passphrase: &str) -> Result<(), CryptoError> {
    let mut header = [0u8; HEADER_LEN];
    if fill(&mut reader, &mut header)? != HEADER_LEN || &header[..4] != MAGIC {
        return Err(CryptoError::BadHeader);
    }
    if header[4] != FORMAT_VERSION {
        return Err(CryptoError::UnsupportedVersion(header[4]));
    }

    let read_u32 = |offset: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&header[offset..offset + 4]);
        u32::from_be_bytes(raw)
    };
    let params = KdfParams {
        m_cost_kib: read_u32(5),
        t_cost: read_u32(9),
        p_cost: read_u32(13),
    };
    if !params.within_limits() {
        return Err(CryptoError::KdfOutOfRange {
            m_cost_kib: params.m_cost_kib,
            t_cost: params.t_cost,
            p_cost: params.p_cost,
        });
    }
    let salt = &header[17..17 + SALT_LEN];
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    prefix.copy_from_slice(&header[17 + SALT_LEN..HEADER_LEN]);

    let key = derive_key(passphrase, salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::KeyDerivation("invalid key length".into()))?;

    let mut counter: u32 = 0;
    let mut sealed = Vec::with_capacity(CHUNK_SIZE + TAG_LEN);
    loop {
        let mut frame = [0u8; 5];
        if fill(&mut reader, &mut frame)? != frame.len() {
            return Err(CryptoError::Truncated);
        }
        let last = match frame[0] {
            0 => false,
            1 => true,
            _ => return Err(CryptoError::Authentication),
        };
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(CryptoError::Authentication);
        }

        sealed.resize(len, 0);
        if fill(&mut reader, &mut sealed)? != len {
            return Err(CryptoError::Truncated);
        }

        let nonce = chunk_nonce(&prefix, counter, last);
        let plain = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &sealed,
                        aad: &header,
                    },
                )
                .map_err(|_| CryptoError::Authentication)?,
        );
        writer.write_all(&plain)?;

        if last {
            let mut trailing = [0u8; 1];
            if fill(&mut reader, &mut trailing)? != 0 {
                return Err(CryptoError::Authentication);
            }
            break;
        }
        counter = counter.checked_add(1).ok_or(CryptoError::Authentication)?;
    }
    writer.flush()?;
    Ok(())
}

/// Encrypt `src` into `dest` via a `.partial` file.
pub fn encrypt_file(src: &Path, dest: &Path, passphrase: &str, params: KdfParams) -> Result<u64, CryptoError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut partial = dest.as_os_str().to_os_string();
    partial.push(".partial");
    let partial = std::path::PathBuf::from(partial);

    let result = (|| {
        let reader = BufReader::new(fs::File::open(src)?);
        let file = fs::File::create(&partial)?;
        let mut writer = BufWriter::new(file);
        encrypt_stream(reader, &mut writer, passphrase, params)?;
        let file = writer.into_inner().map_err(|e| CryptoError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok::<_, CryptoError>(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, dest)?;
    Ok(fs::metadata(dest)?.len())
}

/// Decrypt `src` into `dest`. A partially written `dest` is removed on failure.
pub fn decrypt_file(src: &Path, dest: &Path, passphrase: &str) -> Result<(), CryptoError> {
    let result = (|| {
        let reader = BufReader::new(fs::File::open(src)?);
        let mut writer = BufWriter::new(fs::File::create(dest)?);
        decrypt_stream(reader, &mut writer, passphrase)?;
        writer.flush()?;
        Ok::<_, CryptoError>(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams {
            m_cost_kib: 256,
            t_cost: 1,
            p_cost: 1,
        }
    }

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let mut sealed = Vec::new();
        encrypt_stream(data, &mut sealed, "correct horse", fast()).unwrap();
        let mut out = Vec::new();
        decrypt_stream(sealed.as_slice(), &mut out, "correct horse").unwrap();
        out
    }

    #[test]
    fn test_roundtrip_across_chunk_boundaries() {
        assert_eq!(roundtrip(b""), b"");
        let exact: Vec<u8> = (0..CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&exact), exact);
        let larger: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 13) as u8).collect();
        assert_eq!(roundtrip(&larger), larger);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let mut sealed = Vec::new();
        encrypt_stream(&b"secret"[..], &mut sealed, "right", fast()).unwrap();
        let result = decrypt_stream(sealed.as_slice(), Vec::new(), "wrong");
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_truncation_detected() {
        let data: Vec<u8> = vec![7u8; CHUNK_SIZE + 10];
        let mut sealed = Vec::new();
        encrypt_stream(data.as_slice(), &mut sealed, "pw", fast()).unwrap();

        // Drop the final chunk entirely: the remaining stream ends on a non-last chunk.
        let first_chunk_end = HEADER_LEN + 5 + CHUNK_SIZE + TAG_LEN;
        let result = decrypt_stream(&sealed[..first_chunk_end], Vec::new(), "pw");
        assert!(matches!(result, Err(CryptoError::Truncated)));
    }

    #[test]
    fn test_header_tamper_detected() {
        let mut sealed = Vec::new();
        encrypt_stream(&b"data"[..], &mut sealed, "pw", fast()).unwrap();
        sealed[HEADER_LEN - 1] ^= 0x01;
        assert!(decrypt_stream(sealed.as_slice(), Vec::new(), "pw").is_err());
        assert!(matches!(
            decrypt_stream(&b"PK\x03\x04"[..], Vec::new(), "pw"),
            Err(CryptoError::BadHeader)
        ));
    }

    #[test]
    fn test_oversized_kdf_cost_rejected_before_derivation() {
        let mut sealed = Vec::new();
        encrypt_stream(&b"data"[..], &mut sealed, "pw", fast()).unwrap();
        sealed[5..9].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decrypt_stream(sealed.as_slice(), Vec::new(), "pw"),
            Err(CryptoError::KdfOutOfRange { m_cost_kib: u32::MAX, .. })
        ));

        let mut sealed = Vec::new();
        encrypt_stream(&b"data"[..], &mut sealed, "pw", fast()).unwrap();
        sealed[9..13].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            decrypt_stream(sealed.as_slice(), Vec::new(), "pw"),
            Err(CryptoError::KdfOutOfRange { t_cost: 0, .. })
        ));
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let result = encrypt_stream(&b"x"[..], Vec::new(), "", fast());
        assert!(matches!(result, Err(CryptoError::EmptyPassphrase)));
    }
}
