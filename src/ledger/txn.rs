//! Algorand wire encoding: addresses, asset-transfer transactions, signed
//! envelopes and transaction ids.
//!
//! Transactions are canonical msgpack: map keys in sorted order, zero and
//! empty values omitted.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha512_256};

use super::SuggestedParams;
use crate::error::SignerError;

const CHECKSUM_LEN: usize = 4;
/// Domain-separation prefix for transaction signing and ids.
pub const TX_TAG: &[u8] = b"TX";

/// 32-byte ed25519 public key, rendered as checksummed base32.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 32]);

impl Address {
    fn checksum(key: &[u8; 32]) -> [u8; CHECKSUM_LEN] {
        let digest = Sha512_256::digest(key);
        let mut out = [0u8; CHECKSUM_LEN];
        out.copy_from_slice(&digest[digest.len() - CHECKSUM_LEN..]);
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw = Vec::with_capacity(32 + CHECKSUM_LEN);
        raw.extend_from_slice(&self.0);
        raw.extend_from_slice(&Self::checksum(&self.0));
        f.write_str(&BASE32_NOPAD.encode(&raw))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|e| SignerError::InvalidAddress(format!("{}: {}", s, e)))?;
        if raw.len() != 32 + CHECKSUM_LEN {
            return Err(SignerError::InvalidAddress(format!("{}: wrong length", s)));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw[..32]);
        if raw[32..] != Self::checksum(&key) {
            return Err(SignerError::InvalidAddress(format!("{}: bad checksum", s)));
        }
        Ok(Address(key))
    }
}

/// Plain asset transfer from `sender` to `receiver`.
#[derive(Debug, Clone)]
pub struct AssetTransfer<'a> {
    pub sender: Address,
    pub receiver: Address,
    pub asset_id: u64,
    pub amount: u64,
    pub note: &'a [u8],
    pub params: &'a SuggestedParams,
}

enum Field<'a> {
    Uint(u64),
    Bin(&'a [u8]),
    Str(&'a str),
}

impl Field<'_> {
    fn is_empty(&self) -> bool {
        match self {
            Field::Uint(v) => *v == 0,
            Field::Bin(b) => b.is_empty(),
            Field::Str(s) => s.is_empty(),
        }
    }
}

fn encoding_error(err: impl fmt::Display) -> SignerError {
    SignerError::Encoding(err.to_string())
}

/// `fields` must already be sorted by key.
fn write_canonical_map(fields: &[(&str, Field<'_>)]) -> Result<Vec<u8>, SignerError> {
    let present: Vec<&(&str, Field<'_>)> = fields.iter().filter(|(_, f)| !f.is_empty()).collect();
    let mut buf = Vec::with_capacity(256);
    rmp::encode::write_map_len(&mut buf, present.len() as u32).map_err(encoding_error)?;
    for (key, field) in present {
        rmp::encode::write_str(&mut buf, key).map_err(encoding_error)?;
        match field {
            Field::Uint(v) => {
                rmp::encode::write_uint(&mut buf, *v).map_err(encoding_error)?;
            }
            Field::Bin(b) => rmp::encode::write_bin(&mut buf, b).map_err(encoding_error)?,
            Field::Str(s) => rmp::encode::write_str(&mut buf, s).map_err(encoding_error)?,
        }
    }
    Ok(buf)
}

impl AssetTransfer<'_> {
    /// Canonical msgpack of the unsigned transaction.
    pub fn encode(&self) -> Result<Vec<u8>, SignerError> {
        write_canonical_map(&[
            ("aamt", Field::Uint(self.amount)),
            ("arcv", Field::Bin(&self.receiver.0)),
            ("fee", Field::Uint(self.params.fee)),
            ("fv", Field::Uint(self.params.first_valid)),
            ("gen", Field::Str(&self.params.genesis_id)),
            ("gh", Field::Bin(&self.params.genesis_hash)),
            ("lv", Field::Uint(self.params.last_valid)),
            ("note", Field::Bin(self.note)),
            ("snd", Field::Bin(&self.sender.0)),
            ("type", Field::Str("axfer")),
            ("xaid", Field::Uint(self.asset_id)),
        ])
    }
}

/// Bytes that get signed for an encoded transaction.
pub fn bytes_to_sign(unsigned: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(TX_TAG.len() + unsigned.len());
    msg.extend_from_slice(TX_TAG);
    msg.extend_from_slice(unsigned);
    msg
}

pub fn transaction_id(unsigned: &[u8]) -> String {
    BASE32_NOPAD.encode(&Sha512_256::digest(bytes_to_sign(unsigned)))
}

/// `{sig, txn}` envelope around an already-encoded transaction.
pub fn encode_signed(signature: &[u8; 64], unsigned: &[u8]) -> Result<Vec<u8>, SignerError> {
    let mut buf = Vec::with_capacity(unsigned.len() + 80);
    rmp::encode::write_map_len(&mut buf, 2).map_err(encoding_error)?;
    rmp::encode::write_str(&mut buf, "sig").map_err(encoding_error)?;
    rmp::encode::write_bin(&mut buf, signature).map_err(encoding_error)?;
    rmp::encode::write_str(&mut buf, "txn").map_err(encoding_error)?;
    buf.extend_from_slice(unsigned);
    Ok(buf)
}
