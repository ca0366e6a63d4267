use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use relayer_core::admission::{reconcile_orphaned_rollbacks, AdmissionConfig, AdmissionGate};
use relayer_core::api::RelayerCore;
use relayer_core::audit::InMemoryAuditLog;
use relayer_core::chain::mock::MockChainAdapter;
use relayer_core::chain::ChainAdapter;
use relayer_core::config::{Cli, RelayerConfig};
use relayer_core::http;
use relayer_core::kv::InMemoryKvStore;
use relayer_core::lifecycle::{LifecycleConfig, LifecycleManager};
use relayer_core::money::Amount;
use relayer_core::queue::PriorityQueue;
use relayer_core::scheduler::{JobStore, Scheduler, SchedulerConfig};
use relayer_core::shutdown::SigDown;
use relayer_core::status::StatusBus;
use relayer_core::telemetry;
use relayer_core::wallet::{SelectionPolicy, WalletPool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

/// Parses the CLI and config file before the async runtime starts, since
/// `worker_threads` (spec §6) sizes the runtime itself and so cannot be read
/// from inside it.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = match RelayerConfig::load_from_path(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to load configuration, falling back to defaults");
            serde_json::from_str("{}").expect("empty object satisfies every field default")
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?
        .block_on(run(config))
}

async fn run(config: RelayerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let kv = Arc::new(InMemoryKvStore::new());
    let audit = Arc::new(InMemoryAuditLog::new(10_000));
    let queue = Arc::new(PriorityQueue::new(kv.clone(), config.max_queue_size));

    let admission = Arc::new(AdmissionGate::new(
        kv.clone(),
        queue.clone(),
        audit.clone(),
        AdmissionConfig {
            api_key: config.api_key.clone(),
            max_requests_per_minute: config.max_requests_per_minute,
            signature_window: config.signature_window(),
            replay_ttl: config.replay_ttl(),
            max_transaction_amount: Amount::from_str(&config.max_transaction_amount)
                .unwrap_or(Amount::ZERO),
            rollback_ttl: config.rollback_ttl(),
        },
    ));

    let reconciled = reconcile_orphaned_rollbacks(kv.as_ref(), &admission).await;
    if reconciled > 0 {
        info!(reconciled, "reconciled orphaned rollback records on startup");
    }

    let chain: Arc<dyn ChainAdapter> = Arc::new(MockChainAdapter::new());
    let resolved_keys = config.resolve_wallet_keys().unwrap_or_default();
    let mut signers = Vec::with_capacity(resolved_keys.len());
    for raw_key in resolved_keys {
        match PrivateKeySigner::from_str(&raw_key) {
            Ok(signer) => signers.push(signer),
            Err(err) => error!(%err, "skipping unparseable wallet key"),
        }
    }
    if signers.is_empty() {
        info!("no wallet keys configured, generating an ephemeral wallet for local use");
        signers.push(PrivateKeySigner::random());
    }
    let wallets = Arc::new(WalletPool::from_keys(signers, chain.clone()).await?);
    let min_balance_threshold = alloy_primitives::U256::from_str(&config.min_balance_threshold)
        .unwrap_or(alloy_primitives::U256::ZERO);

    let status_bus = Arc::new(StatusBus::new());
    let job_store = Arc::new(JobStore::new(kv.clone()));
    let lifecycle = Arc::new(LifecycleManager::new(
        chain,
        kv.clone(),
        wallets.clone(),
        status_bus.clone(),
        audit,
        LifecycleConfig {
            gas_limit: config.gas_limit,
            gas_price_multiplier: config.gas_price_multiplier,
            confirmation_blocks: config.confirmation_blocks,
            max_attempts: config.max_attempts,
            processing_timeout: config.processing_timeout(),
        },
    ));

    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        wallets.clone(),
        lifecycle,
        job_store.clone(),
        SchedulerConfig {
            max_concurrent: config.max_concurrent,
            base_retry_delay: config.base_retry_delay(),
            max_retry_delay: config.max_retry_delay(),
            idle_poll_interval: std::time::Duration::from_millis(200),
            selection_policy: SelectionPolicy {
                min_balance_threshold,
            },
        },
    ));

    let core = Arc::new(RelayerCore::new(
        admission,
        queue,
        wallets.clone(),
        status_bus,
        job_store,
        kv,
        config.max_concurrent,
    ));

    let sig_down = SigDown::try_new()?;
    let cancel = sig_down.cancellation_token();
    let tracker = sig_down.tracker();

    let scheduler_handle = tracker.spawn(scheduler.run(cancel.clone()));

    let balance_poller_wallets = wallets.clone();
    let balance_poll_interval = config.balance_poll_interval();
    let balance_poller_cancel = cancel.clone();
    let balance_poller = tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = balance_poller_cancel.cancelled() => break,
                _ = tokio::time::sleep(balance_poll_interval) => {}
            }
            if let Err(err) = balance_poller_wallets
                .poll_balances(min_balance_threshold)
                .await
            {
                error!(%err, "balance poll failed");
            }
        }
    });

    let app = http::router(core);
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("relayer-core listening on 0.0.0.0:8080");

    let serve_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
        .await?;

    sig_down.recv().await;
    let _ = scheduler_handle.await;
    let _ = balance_poller.await;
    Ok(())
}
