//! Optional symmetric encryption of UDP payloads.
//!
//! The whole payload is encrypted, control datagrams included, so the two
//! endpoints must agree on algorithm and key or every datagram (even a PING)
//! is dropped after a failed decrypt.
//!
//! AES runs in CBC mode with PKCS#7 padding and a fixed all-zero IV. The
//! zero IV is required for wire compatibility and is a compatibility-only
//! mode: equal plaintext prefixes produce equal ciphertext prefixes across
//! datagrams. Deployments that do not need the historical wire format should
//! use an AEAD with a per-datagram nonce instead.

use std::fmt;
use std::str::FromStr;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::Deserialize;

use crate::error::{Result, TunnelError};

/// AES block size; the worst-case growth of an encrypted payload.
pub const BLOCK_LEN: usize = 16;

const ZERO_IV: [u8; BLOCK_LEN] = [0u8; BLOCK_LEN];

/// Payload cipher selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CipherAlgorithm {
    #[serde(rename = "xor")]
    Xor,
    #[serde(rename = "aes-128")]
    Aes128Cbc,
    #[serde(rename = "aes-192")]
    Aes192Cbc,
    #[serde(rename = "aes-256")]
    Aes256Cbc,
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherAlgorithm::Xor => "xor",
            CipherAlgorithm::Aes128Cbc => "aes-128",
            CipherAlgorithm::Aes192Cbc => "aes-192",
            CipherAlgorithm::Aes256Cbc => "aes-256",
        };
        f.write_str(name)
    }
}

impl FromStr for CipherAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "xor" => Ok(CipherAlgorithm::Xor),
            "aes-128" => Ok(CipherAlgorithm::Aes128Cbc),
            "aes-192" => Ok(CipherAlgorithm::Aes192Cbc),
            "aes-256" => Ok(CipherAlgorithm::Aes256Cbc),
            other => Err(format!(
                "unknown cipher '{other}' (expected xor, aes-128, aes-192 or aes-256)"
            )),
        }
    }
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Symmetric payload cipher; the same key drives both directions.
#[derive(Debug, Clone)]
pub struct Cipher {
    algorithm: CipherAlgorithm,
    /// Raw key bytes, cycled by the XOR cipher.
    key: Vec<u8>,
    /// Key material zero-padded to the largest AES key size; the AES modes
    /// read their key length from the front.
    material: [u8; 32],
}

impl Cipher {
    pub fn new(algorithm: CipherAlgorithm, key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(TunnelError::EmptyKey);
        }
        let mut material = [0u8; 32];
        let n = key.len().min(material.len());
        material[..n].copy_from_slice(&key[..n]);
        Ok(Self { algorithm, key: key.to_vec(), material })
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Encrypt `src` into `dst` and return the ciphertext length.
    ///
    /// `dst` must hold at least `src.len() + BLOCK_LEN` bytes; a zero return
    /// means the output did not fit and the caller must drop the payload.
    pub fn encrypt(&self, src: &[u8], dst: &mut [u8]) -> usize {
        match self.algorithm {
            CipherAlgorithm::Xor => self.xor(src, dst),
            CipherAlgorithm::Aes128Cbc => {
                Aes128CbcEnc::new(&self.aes_key::<16>().into(), &ZERO_IV.into())
                    .encrypt_padded_b2b_mut::<Pkcs7>(src, dst)
                    .map(|out| out.len())
                    .unwrap_or(0)
            }
            CipherAlgorithm::Aes192Cbc => {
                Aes192CbcEnc::new(&self.aes_key::<24>().into(), &ZERO_IV.into())
                    .encrypt_padded_b2b_mut::<Pkcs7>(src, dst)
                    .map(|out| out.len())
                    .unwrap_or(0)
            }
            CipherAlgorithm::Aes256Cbc => {
                Aes256CbcEnc::new(&self.aes_key::<32>().into(), &ZERO_IV.into())
                    .encrypt_padded_b2b_mut::<Pkcs7>(src, dst)
                    .map(|out| out.len())
                    .unwrap_or(0)
            }
        }
    }

    /// Decrypt `src` into `dst`; `None` signals a corrupt or foreign
    /// datagram that the caller must drop.
    pub fn decrypt(&self, src: &[u8], dst: &mut [u8]) -> Option<usize> {
        match self.algorithm {
            CipherAlgorithm::Xor => Some(self.xor(src, dst)),
            CipherAlgorithm::Aes128Cbc => {
                Aes128CbcDec::new(&self.aes_key::<16>().into(), &ZERO_IV.into())
                    .decrypt_padded_b2b_mut::<Pkcs7>(src, dst)
                    .map(|out| out.len())
                    .ok()
            }
            CipherAlgorithm::Aes192Cbc => {
                Aes192CbcDec::new(&self.aes_key::<24>().into(), &ZERO_IV.into())
                    .decrypt_padded_b2b_mut::<Pkcs7>(src, dst)
                    .map(|out| out.len())
                    .ok()
            }
            CipherAlgorithm::Aes256Cbc => {
                Aes256CbcDec::new(&self.aes_key::<32>().into(), &ZERO_IV.into())
                    .decrypt_padded_b2b_mut::<Pkcs7>(src, dst)
                    .map(|out| out.len())
                    .ok()
            }
        }
    }

    /// XOR with the cycled key; its own inverse.
    fn xor(&self, src: &[u8], dst: &mut [u8]) -> usize {
        for (i, byte) in src.iter().enumerate() {
            dst[i] = byte ^ self.key[i % self.key.len()];
        }
        src.len()
    }

    fn aes_key<const N: usize>(&self) -> [u8; N] {
        let mut key = [0u8; N];
        key.copy_from_slice(&self.material[..N]);
        key
    }
}
