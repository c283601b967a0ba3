use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use nfd_dropper::{
    assets::{fetch_asset, per_recipient_base_units},
    balance::BalanceGuard,
    config::{BatchSendConfig, NetworkConfig, RunContext, DEFAULT_PARALLELISM},
    directory::{DirectoryClient, NfdApiClient, View},
    ledger::{txn::Address, AlgodClient, LedgerClient},
    model::{Recipient, SourceContext},
    pipeline::{watch_interrupts, TransferPipeline},
    recipients::{write_recipients_csv, RecipientResolver, Resolution},
    retry::{retry_directory_call, retry_ledger_call, RetryPolicy},
    signer::{LocalKeyStore, TransactionSigner, MNEMONIC_ENV_PREFIX},
    sink::OutcomeSink,
};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[clap(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[clap(long, global = true)]
    json_logs: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve recipients and send the configured asset to each of them
    Send(SendArgs),
    /// Resolve recipients only and write them to a CSV file for review
    Recipients(RecipientsArgs),
}

#[derive(Parser)]
struct CommonArgs {
    /// Network to use
    #[clap(long, default_value = "mainnet", value_parser = ["mainnet", "testnet", "betanet"])]
    network: String,

    /// Account that signs and pays fees
    #[clap(long)]
    sender: String,

    /// Send from this NFD's vault instead of the sender account
    #[clap(long)]
    vault: Option<String>,

    /// Send configuration
    #[clap(long, default_value = "send.json")]
    config: PathBuf,

    /// Client-side limit on NFD api requests per second
    #[clap(long)]
    api_rate_limit: Option<u32>,
}

#[derive(Parser)]
struct SendArgs {
    #[clap(flatten)]
    common: CommonArgs,

    /// Number of transfers in flight at once
    #[clap(long, default_value_t = DEFAULT_PARALLELISM)]
    parallel: usize,

    /// Resolve and validate everything but submit nothing
    #[clap(long)]
    dry_run: bool,

    /// Skip confirmation prompt
    #[clap(long)]
    yes: bool,

    /// Directory for success.txt and failure.txt
    #[clap(long, default_value = ".")]
    output_dir: PathBuf,
}

#[derive(Parser)]
struct RecipientsArgs {
    #[clap(flatten)]
    common: CommonArgs,

    /// Output CSV file
    #[clap(long, default_value = "recipients.csv")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs)?;

    match cli.command {
        Commands::Send(args) => send(args).await,
        Commands::Recipients(args) => export_recipients(args).await,
    }
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {:?}", level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Clients and source context shared by both subcommands.
struct Setup {
    config: BatchSendConfig,
    ledger: Arc<dyn LedgerClient>,
    directory: Arc<dyn DirectoryClient>,
    source: SourceContext,
}

async fn setup(args: &CommonArgs) -> Result<Setup> {
    args.sender
        .parse::<Address>()
        .with_context(|| format!("invalid sender address {}", args.sender))?;

    let network = NetworkConfig::from_env(&args.network)?;
    let config = BatchSendConfig::load(&args.config)?;
    println!("🌐 Network: {}", network.name);
    println!("📁 Config: {}", args.config.display());
    println!("🎯 Destination: {}", config.destination);

    let ledger: Arc<dyn LedgerClient> =
        Arc::new(AlgodClient::new(&network.algod_url, &network.algod_token)?);
    let directory: Arc<dyn DirectoryClient> =
        Arc::new(NfdApiClient::new(&network.nfd_api_url, args.api_rate_limit)?);

    // Doubles as a connectivity check
    retry_ledger_call(&RetryPolicy::ledger(), || ledger.suggested_params())
        .await
        .with_context(|| format!("algod at {} is not reachable", network.algod_url))?;

    let source = match &args.vault {
        Some(vault) => {
            let record = retry_directory_call(|| directory.get_record(vault, View::Brief))
                .await
                .with_context(|| format!("failed to fetch vault NFD {}", vault))?;
            if record.owner != args.sender {
                bail!(
                    "{} is owned by {}, not the sender {}",
                    vault,
                    record.owner,
                    args.sender
                );
            }
            if record.nfd_account.is_empty() {
                bail!("{} has no vault account", vault);
            }
            println!("🏦 Sending from vault {} ({})", vault, record.nfd_account);
            SourceContext {
                sender: args.sender.clone(),
                source_account: record.nfd_account,
                vault_name: Some(vault.clone()),
            }
        }
        None => SourceContext {
            sender: args.sender.clone(),
            source_account: args.sender.clone(),
            vault_name: None,
        },
    };

    Ok(Setup {
        config,
        ledger,
        directory,
        source,
    })
}

fn resolver(setup: &Setup) -> RecipientResolver {
    let resolver = RecipientResolver::new(
        setup.directory.clone(),
        setup.config.destination.clone(),
        setup.source.sender.clone(),
    );
    if setup.source.is_vault() {
        resolver.with_source_vault(setup.source.source_account.clone())
    } else {
        resolver
    }
}

fn print_resolution(resolution: &Resolution) {
    println!("👥 Recipients: {}", resolution.recipients.len());
    println!("   {}", resolution.stats);
}

async fn export_recipients(args: RecipientsArgs) -> Result<()> {
    let setup = setup(&args.common).await?;
    let resolution = resolver(&setup).resolve().await?;
    print_resolution(&resolution);
    write_recipients_csv(&args.output, &resolution.recipients)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!(
        "Wrote {} recipients to {}",
        resolution.recipients.len(),
        args.output.display()
    );
    Ok(())
}

async fn send(args: SendArgs) -> Result<()> {
    println!("\n🚀 Starting NFD asset drop...");
    let keys = LocalKeyStore::from_env();
    if !keys.has_account(&args.common.sender) {
        bail!(
            "no mnemonic for sender {} found in {}* environment variables ({} keys loaded)",
            args.common.sender,
            MNEMONIC_ENV_PREFIX,
            keys.len()
        );
    }

    let setup = setup(&args.common).await?;
    let ctx = RunContext {
        parallelism: args.parallel,
        dry_run: args.dry_run,
        output_dir: args.output_dir.clone(),
    };
    let intent = setup.config.to_intent(setup.source.is_vault());
    let policy = RetryPolicy::ledger();

    // Recipients and the asset are independent, fetch them together
    let resolver = resolver(&setup);
    let (resolution, asset) = tokio::try_join!(
        async { resolver.resolve().await.context("failed to resolve recipients") },
        async {
            fetch_asset(
                setup.ledger.as_ref(),
                intent.asset_id,
                &setup.source.source_account,
                &policy,
            )
            .await
            .with_context(|| format!("failed to fetch asset {}", intent.asset_id))
        }
    )?;
    print_resolution(&resolution);
    if resolution.recipients.is_empty() {
        println!("No eligible recipients, nothing to send.");
        return Ok(());
    }
    let count = resolution.recipients.len();

    let per_recipient = per_recipient_base_units(&asset, &intent, count)
        .context("amount does not convert to base units")?;
    if per_recipient == 0 {
        bail!(
            "{} {} across {} recipients is less than one base unit each",
            intent.amount,
            asset.unit_name,
            count
        );
    }

    let params = retry_ledger_call(&policy, || setup.ledger.suggested_params()).await?;
    BalanceGuard::new(&asset, &intent, params.min_fee)
        .verify(
            setup.ledger.as_ref(),
            &setup.source.sender,
            per_recipient,
            count,
            &policy,
        )
        .await?;

    println!(
        "💰 Asset: {} ({}), balance {}",
        asset.asset_id,
        asset.unit_name,
        asset.format_amount(asset.existing_source_balance)
    );
    println!(
        "📦 Sending {} {} to each of {} recipients ({} total) from {}",
        asset.format_amount(per_recipient),
        asset.unit_name,
        count,
        asset.format_amount(per_recipient.saturating_mul(count as u64)),
        setup.source.source_account
    );

    if args.dry_run {
        println!("\n=== DRY RUN: nothing will be submitted ===");
    } else if !args.yes {
        println!("\nReady to send? [y/N] ");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    } else {
        println!("\nProceeding with send (--yes flag set)");
    }

    let sink = OutcomeSink::open(&ctx.output_dir)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, shutdown_tx).await {
            eprintln!("\n❌ Aborted, transfers still in flight are not recorded");
            std::process::exit(130);
        }
    });

    let signer: Arc<dyn TransactionSigner> = Arc::new(keys);
    let pipeline = TransferPipeline::new(
        setup.ledger.clone(),
        setup.directory.clone(),
        signer,
        setup.source.clone(),
        &ctx,
    );
    let recipients: Vec<Recipient> = resolution.recipients;
    let (report, sink) = pipeline
        .run(
            recipients,
            Arc::new(asset),
            per_recipient,
            &intent.note,
            sink,
            shutdown_rx,
        )
        .await?;

    if report.interrupted {
        println!("\n⚠️  Interrupted: {} of {} transfers dispatched", report.dispatched, count);
    } else {
        println!("\n✅ Drop complete!");
    }
    println!(
        "   Success: {}, Failed: {}, Time: {:.1}s",
        report.totals.successes,
        report.totals.failures,
        report.elapsed.as_secs_f64()
    );
    println!("   Success log: {}", sink.success_path().display());
    if report.totals.failures > 0 {
        println!("   ❌ See failures in {}", sink.failure_path().display());
    }
    Ok(())
}
