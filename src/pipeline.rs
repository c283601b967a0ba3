//! Bounded-concurrency transfer engine.
//!
//! One producer turns recipients into [`TransferUnit`]s and pushes them into
//! a queue of capacity `P`. `P` workers share the receiving end and execute
//! units concurrently, each sending its [`TransferOutcome`] into a result
//! channel of capacity `P`. A single consumer owns the [`OutcomeSink`] and
//! the progress bar.
//!
//! Shutdown runs front to back: the producer returns and drops the queue
//! sender, workers drain what is left and exit, the last result sender goes
//! with them, and the consumer returns once the result channel is empty.
//! Every dispatched unit therefore has its outcome recorded.
//!
//! A worker takes its next unit only after the consumer has acknowledged
//! that the previous outcome is on disk. If a log write fails the consumer
//! raises the halt flag and stops acknowledging, so no further transfer is
//! submitted and `run` returns the [`SinkError`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RunContext;
use crate::directory::{DirectoryClient, SendFromVaultRequest, SendToVaultRequest};
use crate::error::{DropError, SinkError, TransferError};
use crate::ledger::txn::{Address, AssetTransfer};
use crate::ledger::{fresh_params, LedgerClient, SuggestedParams};
use crate::model::{
    AssetDescriptor, Recipient, SourceContext, TransferOutcome, TransferStatus, TransferUnit,
};
use crate::retry::{retry_directory_call, retry_ledger_call, RetryPolicy};
use crate::signer::{sign_envelopes, TransactionSigner};
use crate::sink::{OutcomeSink, SinkTotals};

/// How long fetched suggested params are reused before the producer refreshes them.
pub const PARAMS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Forward operator interrupts to a running pipeline.
///
/// The first interrupt flips `shutdown` so dispatch stops and in-flight units
/// finish. Returns `true` when a second interrupt arrives, at which point the
/// caller should exit without waiting. Returns `false` if interrupts can no
/// longer be observed.
pub async fn watch_interrupts<F, Fut>(mut interrupt: F, shutdown: watch::Sender<bool>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    warn!("Interrupt received, finishing in-flight transfers (interrupt again to abort)");
    let _ = shutdown.send(true);
    interrupt().await.is_ok()
}

/// What one run of the pipeline did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub dispatched: usize,
    pub totals: SinkTotals,
    pub interrupted: bool,
    pub elapsed: Duration,
}

/// Executes a single unit. Shared by all workers, holds no mutable state.
struct UnitExecutor {
    ledger: Arc<dyn LedgerClient>,
    directory: Arc<dyn DirectoryClient>,
    signer: Arc<dyn TransactionSigner>,
    retry: RetryPolicy,
    dry_run: bool,
}

impl UnitExecutor {
    async fn execute(&self, unit: TransferUnit) -> TransferOutcome {
        let status = if self.dry_run {
            TransferStatus::Simulated
        } else {
            match self.submit(&unit).await {
                Ok((round, txid)) => TransferStatus::Confirmed { round, txid },
                Err(e) => {
                    debug!(recipient = %unit.recipient.display_name, error = %e, "Transfer failed");
                    TransferStatus::Failed(e.to_string())
                }
            }
        };
        TransferOutcome {
            recipient: unit.recipient,
            asset: unit.asset,
            base_units: unit.base_units,
            status,
        }
    }

    async fn submit(&self, unit: &TransferUnit) -> Result<(u64, String), TransferError> {
        let signed = self.signed_payload(unit).await?;
        let txid = retry_ledger_call(&self.retry, || self.ledger.send_raw(&signed)).await?;
        let rounds = unit.params.validity_window();
        let round = retry_ledger_call(&self.retry, || {
            self.ledger.wait_for_confirmation(&txid, rounds)
        })
        .await?;
        Ok((round, txid))
    }

    /// Signed bytes ready for submission: a vault group built by the
    /// directory, or a locally built asset transfer.
    async fn signed_payload(&self, unit: &TransferUnit) -> Result<Vec<u8>, TransferError> {
        let source = &unit.source;
        let recipient = &unit.recipient;
        let note = unit.note.to_string();

        if let Some(vault) = &source.vault_name {
            let (receiver, receiver_type) = if recipient.destination_is_vault {
                (recipient.display_name.clone(), "nfdVault")
            } else {
                (recipient.destination_account.clone(), "account")
            };
            let request = SendFromVaultRequest {
                amount: unit.base_units,
                assets: vec![unit.asset.asset_id],
                receiver,
                receiver_type: receiver_type.to_string(),
                sender: source.sender.clone(),
                note,
            };
            let envelopes =
                retry_directory_call(|| self.directory.send_from_vault(vault, &request)).await?;
            return Ok(sign_envelopes(&*self.signer, &source.sender, &envelopes)?);
        }

        if recipient.destination_is_vault {
            let request = SendToVaultRequest {
                amount: unit.base_units,
                assets: vec![unit.asset.asset_id],
                sender: source.sender.clone(),
                note,
            };
            let envelopes = retry_directory_call(|| {
                self.directory
                    .send_to_vault(&recipient.display_name, &request)
            })
            .await?;
            return Ok(sign_envelopes(&*self.signer, &source.sender, &envelopes)?);
        }

        let sender: Address = source.sender.parse()?;
        let receiver: Address = recipient.destination_account.parse()?;
        let unsigned = AssetTransfer {
            sender,
            receiver,
            asset_id: unit.asset.asset_id,
            amount: unit.base_units,
            note: unit.note.as_bytes(),
            params: &unit.params,
        }
        .encode()?;
        let signed = self.signer.sign_transaction(&source.sender, &unsigned)?;
        debug!(txid = %signed.txid, recipient = %recipient.display_name, "Signed transfer");
        Ok(signed.bytes)
    }
}

/// An outcome on its way to the consumer, with the channel that
/// acknowledges it was written.
type Completed = (TransferOutcome, oneshot::Sender<()>);

pub struct TransferPipeline {
    ledger: Arc<dyn LedgerClient>,
    directory: Arc<dyn DirectoryClient>,
    signer: Arc<dyn TransactionSigner>,
    source: Arc<SourceContext>,
    parallelism: usize,
    dry_run: bool,
    submit_retry: RetryPolicy,
    params_retry: RetryPolicy,
    show_progress: bool,
}

impl TransferPipeline {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        directory: Arc<dyn DirectoryClient>,
        signer: Arc<dyn TransactionSigner>,
        source: SourceContext,
        ctx: &RunContext,
    ) -> Self {
        Self {
            ledger,
            directory,
            signer,
            source: Arc::new(source),
            parallelism: ctx.parallelism.max(1),
            dry_run: ctx.dry_run,
            submit_retry: RetryPolicy::ledger(),
            params_retry: RetryPolicy::forever(),
            show_progress: true,
        }
    }

    /// Override the submission and params retry policies.
    pub fn with_retry_policies(mut self, submit: RetryPolicy, params: RetryPolicy) -> Self {
        self.submit_retry = submit;
        self.params_retry = params;
        self
    }

    pub fn without_progress(mut self) -> Self {
        self.show_progress = false;
        self
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} Sending | ETA: {eta} | Speed: {per_sec}")
            .map(|s| s.progress_chars("##-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }

    /// Send `base_units` of `asset` to every recipient, recording each outcome in `sink`.
    ///
    /// Flipping `shutdown` to `true` stops dispatch; units already queued or
    /// in flight still complete and are recorded. A failed log write halts
    /// the whole pool and is returned as [`DropError::Sink`].
    pub async fn run(
        &self,
        recipients: Vec<Recipient>,
        asset: Arc<AssetDescriptor>,
        base_units: u64,
        note: &str,
        sink: OutcomeSink,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(PipelineReport, OutcomeSink), DropError> {
        let started = Instant::now();
        let p = self.parallelism;
        info!(
            recipients = recipients.len(),
            parallelism = p,
            dry_run = self.dry_run,
            "Starting transfers"
        );

        let executor = Arc::new(UnitExecutor {
            ledger: self.ledger.clone(),
            directory: self.directory.clone(),
            signer: self.signer.clone(),
            retry: self.submit_retry.clone(),
            dry_run: self.dry_run,
        });
        let halted = Arc::new(AtomicBool::new(false));

        let (unit_tx, unit_rx) = mpsc::channel::<TransferUnit>(p);
        let unit_rx = Arc::new(Mutex::new(unit_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<Completed>(p);

        // Consumer: sole owner of the sink and the bar
        let pb = self.progress_bar(recipients.len() as u64);
        let consumer_pb = pb.clone();
        let consumer_halted = halted.clone();
        let consumer = tokio::spawn(async move {
            let mut sink = sink;
            while let Some((outcome, recorded)) = result_rx.recv().await {
                if let Err(e) = sink.record(&outcome) {
                    consumer_halted.store(true, Ordering::SeqCst);
                    error!(error = %e, outcome = %outcome, "Outcome log write failed, halting");
                    result_rx.close();
                    while let Some((outcome, _)) = result_rx.recv().await {
                        error!(outcome = %outcome, "Outcome not recorded");
                    }
                    return Err(e);
                }
                if let TransferStatus::Failed(_) = outcome.status {
                    consumer_pb.println(format!("❌ {}", outcome));
                }
                consumer_pb.inc(1);
                let _ = recorded.send(());
            }
            Ok::<OutcomeSink, SinkError>(sink)
        });

        // Workers
        let mut workers = JoinSet::new();
        for worker_id in 0..p {
            let unit_rx = unit_rx.clone();
            let result_tx = result_tx.clone();
            let executor = executor.clone();
            let halted = halted.clone();
            workers.spawn(async move {
                loop {
                    if halted.load(Ordering::SeqCst) {
                        break;
                    }
                    let unit = {
                        let mut rx = unit_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(unit) = unit else {
                        break;
                    };
                    if halted.load(Ordering::SeqCst) {
                        break;
                    }
                    let outcome = executor.execute(unit).await;
                    let (recorded_tx, recorded_rx) = oneshot::channel();
                    if let Err(SendError((outcome, _))) = result_tx.send((outcome, recorded_tx)).await {
                        error!(outcome = %outcome, "Outcome not recorded");
                        break;
                    }
                    if recorded_rx.await.is_err() {
                        break;
                    }
                }
                debug!(worker_id, "Worker done");
            });
        }
        drop(unit_rx);
        drop(result_tx);

        // Producer
        let ledger = self.ledger.clone();
        let source = self.source.clone();
        let params_retry = self.params_retry.clone();
        let note: Arc<str> = Arc::from(note);
        let producer_halted = halted.clone();
        let producer = tokio::spawn(async move {
            let mut params: SuggestedParams = fresh_params(ledger.as_ref(), &params_retry).await;
            let mut fetched_at = Instant::now();
            let mut dispatched = 0usize;
            let mut interrupted = false;

            for recipient in recipients {
                if *shutdown.borrow() {
                    interrupted = true;
                    break;
                }
                if producer_halted.load(Ordering::SeqCst) {
                    break;
                }
                if fetched_at.elapsed() > PARAMS_REFRESH_INTERVAL {
                    params = fresh_params(ledger.as_ref(), &params_retry).await;
                    fetched_at = Instant::now();
                    debug!(first_valid = params.first_valid, "Refreshed params");
                }
                let permit = tokio::select! {
                    permit = unit_tx.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    Ok(()) = shutdown.changed() => {
                        interrupted = true;
                        break;
                    }
                };
                permit.send(TransferUnit {
                    recipient: Arc::new(recipient),
                    asset: asset.clone(),
                    base_units,
                    note: note.clone(),
                    params: params.clone(),
                    source: source.clone(),
                });
                dispatched += 1;
            }
            (dispatched, interrupted)
        });

        let (dispatched, interrupted) = producer
            .await
            .map_err(|e| DropError::Task(format!("producer: {}", e)))?;
        if interrupted {
            warn!(dispatched, "Interrupted, waiting for in-flight transfers");
            pb.println(format!(
                "⚠️  Interrupted after dispatching {} transfers, letting them finish",
                dispatched
            ));
        }
        while let Some(joined) = workers.join_next().await {
            joined.map_err(|e| DropError::Task(format!("worker: {}", e)))?;
        }
        let sink = consumer
            .await
            .map_err(|e| DropError::Task(format!("consumer: {}", e)))??;
        pb.finish_and_clear();

        let report = PipelineReport {
            dispatched,
            totals: sink.totals(),
            interrupted,
            elapsed: started.elapsed(),
        };
        info!(
            dispatched,
            successes = report.totals.successes,
            failures = report.totals.failures,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Transfers finished"
        );
        Ok((report, sink))
    }
}
