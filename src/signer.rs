//! Transaction signing.
//!
//! [`LocalKeyStore`] holds ed25519 keys parsed from 25-word mnemonics found in
//! `ALGO_MNEMONIC_*` environment variables.

use std::collections::HashMap;

use bip39::Language;
use ed25519_dalek::{Signer as _, SigningKey};
use sha2::{Digest, Sha512_256};
use tracing::{info, warn};

use crate::directory::{EnvelopeKind, TxnEnvelope};
use crate::error::SignerError;
use crate::ledger::txn::{bytes_to_sign, encode_signed, transaction_id, Address};

pub const MNEMONIC_ENV_PREFIX: &str = "ALGO_MNEMONIC_";
const MNEMONIC_WORDS: usize = 25;
const BITS_PER_WORD: u32 = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub txid: String,
    pub bytes: Vec<u8>,
}

/// Signs encoded transactions on behalf of an account.
pub trait TransactionSigner: Send + Sync {
    fn has_account(&self, account: &str) -> bool;

    /// Sign the canonical msgpack bytes of an unsigned transaction.
    fn sign_transaction(
        &self,
        account: &str,
        unsigned: &[u8],
    ) -> Result<SignedTransaction, SignerError>;
}

#[derive(Default)]
pub struct LocalKeyStore {
    keys: HashMap<String, SigningKey>,
}

impl LocalKeyStore {
    /// Load every `ALGO_MNEMONIC_*` variable. Unparseable ones are skipped with a warning.
    pub fn from_env() -> Self {
        let mut store = Self::default();
        for (name, value) in std::env::vars() {
            if !name.starts_with(MNEMONIC_ENV_PREFIX) {
                continue;
            }
            match store.add_mnemonic(&value) {
                Ok(address) => info!(var = %name, %address, "Loaded signing key"),
                Err(e) => warn!(var = %name, error = %e, "Ignoring mnemonic"),
            }
        }
        store
    }

    /// Add a key, returning its address.
    pub fn add_mnemonic(&mut self, phrase: &str) -> Result<String, SignerError> {
        let seed = key_from_mnemonic(phrase)?;
        let key = SigningKey::from_bytes(&seed);
        let address = Address(key.verifying_key().to_bytes()).to_string();
        self.keys.insert(address.clone(), key);
        Ok(address)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl TransactionSigner for LocalKeyStore {
    fn has_account(&self, account: &str) -> bool {
        self.keys.contains_key(account)
    }

    fn sign_transaction(
        &self,
        account: &str,
        unsigned: &[u8],
    ) -> Result<SignedTransaction, SignerError> {
        let key = self
            .keys
            .get(account)
            .ok_or_else(|| SignerError::UnknownAccount(account.to_string()))?;
        let signature = key.sign(&bytes_to_sign(unsigned)).to_bytes();
        Ok(SignedTransaction {
            txid: transaction_id(unsigned),
            bytes: encode_signed(&signature, unsigned)?,
        })
    }
}

/// Sign the unsigned envelopes with `account`, pass pre-signed ones through,
/// and concatenate everything into one submittable group.
pub fn sign_envelopes<S>(
    signer: &S,
    account: &str,
    envelopes: &[TxnEnvelope],
) -> Result<Vec<u8>, SignerError>
where
    S: TransactionSigner + ?Sized,
{
    let mut group = Vec::new();
    for envelope in envelopes {
        match envelope.kind {
            EnvelopeKind::Presigned => group.extend_from_slice(&envelope.bytes),
            EnvelopeKind::Unsigned => {
                let signed = signer.sign_transaction(account, &envelope.bytes)?;
                group.extend_from_slice(&signed.bytes);
            }
        }
    }
    Ok(group)
}

/// Little-endian repacking of `bits_in`-bit values into `bits_out`-bit values.
fn repack(values: impl IntoIterator<Item = u32>, bits_in: u32, bits_out: u32) -> Vec<u32> {
    let mask = (1u32 << bits_out) - 1;
    let mut out = Vec::new();
    let mut buffer: u32 = 0;
    let mut held = 0u32;
    for value in values {
        buffer |= value << held;
        held += bits_in;
        while held >= bits_out {
            out.push(buffer & mask);
            buffer >>= bits_out;
            held -= bits_out;
        }
    }
    if held != 0 {
        out.push(buffer & mask);
    }
    out
}

fn checksum_word_index(key: &[u8; 32]) -> u32 {
    let digest = Sha512_256::digest(key);
    repack(digest[..2].iter().map(|b| *b as u32), 8, BITS_PER_WORD)[0]
}

/// Parse a 25-word mnemonic into a 32-byte ed25519 seed.
pub fn key_from_mnemonic(phrase: &str) -> Result<[u8; 32], SignerError> {
    let words: Vec<String> = phrase
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.len() != MNEMONIC_WORDS {
        return Err(SignerError::InvalidMnemonic(format!(
            "expected {} words, got {}",
            MNEMONIC_WORDS,
            words.len()
        )));
    }
    let mut indices = Vec::with_capacity(MNEMONIC_WORDS);
    for word in &words {
        let index = Language::English
            .find_word(word)
            .ok_or_else(|| SignerError::InvalidMnemonic(format!("unknown word {:?}", word)))?;
        indices.push(index as u32);
    }

    let bytes = repack(indices[..24].iter().copied(), BITS_PER_WORD, 8);
    // 24 words carry 264 bits, the last byte is padding
    if bytes.len() != 33 || bytes[32] != 0 {
        return Err(SignerError::InvalidMnemonic("malformed key bits".into()));
    }
    let mut key = [0u8; 32];
    for (dst, src) in key.iter_mut().zip(&bytes[..32]) {
        *dst = *src as u8;
    }
    if checksum_word_index(&key) != indices[24] {
        return Err(SignerError::InvalidMnemonic("checksum mismatch".into()));
    }
    Ok(key)
}

pub fn mnemonic_from_key(key: &[u8; 32]) -> String {
    let list = Language::English.word_list();
    let mut words: Vec<&str> = repack(key.iter().map(|b| *b as u32), 8, BITS_PER_WORD)
        .into_iter()
        .map(|i| list[i as usize])
        .collect();
    words.push(list[checksum_word_index(key) as usize]);
    words.join(" ")
}
