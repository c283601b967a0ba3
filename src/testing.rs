//! In-memory fakes for the directory, ledger and signer seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::directory::{
    DirectoryClient, DirectoryResult, EnvelopeKind, SearchQuery, SendFromVaultRequest,
    SendToVaultRequest, TxnEnvelope, View,
};
use crate::error::{DirectoryError, LedgerError};
use crate::ledger::txn::Address;
use crate::ledger::{AccountBalance, AssetParams, LedgerClient, LedgerResult, SuggestedParams};
use crate::model::CandidateRecord;
use crate::signer::{mnemonic_from_key, LocalKeyStore};

/// Checksummed address derived from a single repeated byte.
pub fn address(seed: u8) -> String {
    Address([seed; 32]).to_string()
}

/// A key store holding one key, and that key's address.
pub fn key_store(seed: u8) -> (LocalKeyStore, String) {
    let mut store = LocalKeyStore::default();
    let address = store
        .add_mnemonic(&mnemonic_from_key(&[seed; 32]))
        .expect("generated mnemonic is valid");
    (store, address)
}

pub fn record(name: &str, owner: &str, deposit: &str, vault: &str) -> CandidateRecord {
    let mut record = CandidateRecord {
        name: name.to_string(),
        owner: owner.to_string(),
        deposit_account: deposit.to_string(),
        nfd_account: vault.to_string(),
        ..Default::default()
    };
    record
        .properties
        .internal
        .insert("ver".into(), "2.11".into());
    record
}

#[derive(Default)]
struct LedgerState {
    assets: HashMap<u64, AssetParams>,
    holdings: HashMap<(String, u64), u64>,
    balances: HashMap<String, AccountBalance>,
    /// Receivers whose transfers the node rejects.
    rejected_receivers: Vec<[u8; 32]>,
    /// Errors returned by the next `send_raw` calls, oldest first.
    send_errors: VecDeque<LedgerError>,
    /// Errors returned by the next `suggested_params` calls.
    params_errors: VecDeque<LedgerError>,
    submitted: Vec<Vec<u8>>,
}

pub struct FakeLedger {
    state: Mutex<LedgerState>,
    params: SuggestedParams,
    latency: Duration,
    params_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            params: SuggestedParams::from_node(1_000, 1_000, "testnet-v1.0".into(), [9; 32]),
            latency: Duration::ZERO,
            params_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl FakeLedger {
    /// Each submission takes `latency` to confirm.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn set_asset(&self, asset_id: u64, params: AssetParams) {
        self.state.lock().unwrap().assets.insert(asset_id, params);
    }

    pub fn set_holding(&self, account: &str, asset_id: u64, amount: u64) {
        self.state
            .lock()
            .unwrap()
            .holdings
            .insert((account.to_string(), asset_id), amount);
    }

    pub fn set_balance(&self, account: &str, amount: u64, min_balance: u64) {
        self.state.lock().unwrap().balances.insert(
            account.to_string(),
            AccountBalance {
                amount,
                min_balance,
            },
        );
    }

    pub fn reject_receiver(&self, receiver: &str) {
        let address: Address = receiver.parse().expect("valid test address");
        self.state.lock().unwrap().rejected_receivers.push(address.0);
    }

    pub fn fail_next_send(&self, err: LedgerError) {
        self.state.lock().unwrap().send_errors.push_back(err);
    }

    pub fn fail_next_params(&self, err: LedgerError) {
        self.state.lock().unwrap().params_errors.push_back(err);
    }

    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn params_calls(&self) -> usize {
        self.params_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn not_found(what: String) -> LedgerError {
    LedgerError::Rejected {
        status: 404,
        message: format!("{} not found", what),
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn asset_params(&self, asset_id: u64) -> LedgerResult<AssetParams> {
        self.state
            .lock()
            .unwrap()
            .assets
            .get(&asset_id)
            .cloned()
            .ok_or_else(|| not_found(format!("asset {}", asset_id)))
    }

    async fn asset_holding(&self, account: &str, asset_id: u64) -> LedgerResult<u64> {
        self.state
            .lock()
            .unwrap()
            .holdings
            .get(&(account.to_string(), asset_id))
            .copied()
            .ok_or_else(|| not_found(format!("holding of {} in {}", asset_id, account)))
    }

    async fn account_balance(&self, account: &str) -> LedgerResult<AccountBalance> {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(account)
            .copied()
            .ok_or_else(|| not_found(format!("account {}", account)))
    }

    async fn suggested_params(&self) -> LedgerResult<SuggestedParams> {
        self.params_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.state.lock().unwrap().params_errors.pop_front() {
            return Err(err);
        }
        Ok(self.params.clone())
    }

    async fn send_raw(&self, signed: &[u8]) -> LedgerResult<String> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.send_errors.pop_front() {
                return Err(err);
            }
            let rejected = state
                .rejected_receivers
                .iter()
                .any(|key| signed.windows(32).any(|w| w == key));
            if rejected {
                return Err(LedgerError::Rejected {
                    status: 400,
                    message: "receiver not opted in to asset".into(),
                });
            }
            state.submitted.push(signed.to_vec());
            state.submitted.len()
        };
        Ok(format!("TX{:04}", id))
    }

    async fn wait_for_confirmation(&self, txid: &str, _rounds: u64) -> LedgerResult<u64> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let seq: u64 = txid.trim_start_matches("TX").parse().unwrap_or(0);
        Ok(self.params.first_valid + seq)
    }
}

#[derive(Default)]
struct DirectoryState {
    records: HashMap<String, CandidateRecord>,
    roots: Vec<CandidateRecord>,
    segments: HashMap<u64, Vec<CandidateRecord>>,
    /// Errors returned by the next calls of any kind, oldest first.
    errors: VecDeque<DirectoryError>,
    searches: Vec<SearchQuery>,
    fetched_views: Vec<View>,
    vault_sends: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<DirectoryState>,
}

impl FakeDirectory {
    /// Register a fetchable record that also shows up in unscoped searches.
    pub fn add_root(&self, record: CandidateRecord) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(record.name.clone(), record.clone());
        state.roots.push(record);
    }

    pub fn add_segment(&self, parent_app_id: u64, record: CandidateRecord) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(record.name.clone(), record.clone());
        state.segments.entry(parent_app_id).or_default().push(record);
    }

    pub fn fail_next(&self, err: DirectoryError) {
        self.state.lock().unwrap().errors.push_back(err);
    }

    pub fn searches(&self) -> Vec<SearchQuery> {
        self.state.lock().unwrap().searches.clone()
    }

    pub fn fetched_views(&self) -> Vec<View> {
        self.state.lock().unwrap().fetched_views.clone()
    }

    /// `(endpoint, receiver)` for every vault send request.
    pub fn vault_sends(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().vault_sends.clone()
    }

    fn scripted_error(&self) -> DirectoryResult<()> {
        match self.state.lock().unwrap().errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn vault_group() -> Vec<TxnEnvelope> {
        vec![
            TxnEnvelope {
                kind: EnvelopeKind::Unsigned,
                bytes: vec![0x81, 0xa4, b't', b'y', b'p', b'e', 0xa4, b'a', b'p', b'p', b'l'],
            },
            TxnEnvelope {
                kind: EnvelopeKind::Presigned,
                bytes: vec![0x80],
            },
        ]
    }
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn get_record(&self, name: &str, view: View) -> DirectoryResult<CandidateRecord> {
        self.scripted_error()?;
        let mut state = self.state.lock().unwrap();
        state.fetched_views.push(view);
        state
            .records
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::Api {
                message: format!("{} not found", name),
            })
    }

    async fn search(&self, query: &SearchQuery) -> DirectoryResult<Vec<CandidateRecord>> {
        self.scripted_error()?;
        let mut state = self.state.lock().unwrap();
        state.searches.push(query.clone());
        let pool: Vec<CandidateRecord> = match query.parent_app_id {
            Some(parent) => state.segments.get(&parent).cloned().unwrap_or_default(),
            None if query.only_roots => state.roots.clone(),
            None => {
                let mut all = state.roots.clone();
                for segments in state.segments.values() {
                    all.extend(segments.iter().cloned());
                }
                all
            }
        };
        Ok(pool
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect())
    }

    async fn send_from_vault(
        &self,
        vault: &str,
        request: &SendFromVaultRequest,
    ) -> DirectoryResult<Vec<TxnEnvelope>> {
        self.scripted_error()?;
        self.state
            .lock()
            .unwrap()
            .vault_sends
            .push((format!("sendFrom/{}", vault), request.receiver.clone()));
        Ok(Self::vault_group())
    }

    async fn send_to_vault(
        &self,
        name: &str,
        _request: &SendToVaultRequest,
    ) -> DirectoryResult<Vec<TxnEnvelope>> {
        self.scripted_error()?;
        self.state
            .lock()
            .unwrap()
            .vault_sends
            .push((format!("sendTo/{}", name), name.to_string()));
        Ok(Self::vault_group())
    }
}
