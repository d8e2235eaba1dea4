use chain_history_sync::config::{CONFIG_ENV, WalletSyncConfig};
use chain_history_sync::provider::{
	EvmProvider, EvmRpcClient, PreloadedAddressProvider, UtxoIndexerClient, UtxoProvider,
};
use chain_history_sync::relay::{HttpRelayHealthCheck, RelaySelector};
use chain_history_sync::wallet::AddressDirectory;
use chain_history_sync::wallet::sync::{
	EvmSyncHandler, LoggingHandler, SyncOrchestrator, UtxoSyncHandler, bridge_utxo_provider,
	consensus::ConsensusTracker,
	events::{EventDispatcher, SyncEvent},
	evm_scanner::EvmScanner, state_persistence::StatePersistenceService,
	utxo_sync::UtxoSynchronizer,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const EVENT_QUEUE_CAPACITY: usize = 256;
const PERIODIC_SYNC_SECS: u64 = 60;

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into())
				.add_directive(
					"chain_history_sync=debug"
						.parse()
						.unwrap_or_else(|_| tracing::Level::DEBUG.into()),
				),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Sync service failed: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
	info!("Starting chain history sync service (config from ${})", CONFIG_ENV);
	let config = WalletSyncConfig::load()?;
	let account = &config.account;

	let persistence = Arc::new(StatePersistenceService::from_config(&config.storage));

	let indexer = UtxoIndexerClient::new(
		config.utxo.indexer_url.clone(),
		config.utxo.indexer_ws_url.clone(),
		config.utxo.min_confirmations,
	)?;
	let head_task = indexer.start();
	let utxo_provider: Arc<dyn UtxoProvider> = Arc::new(indexer);
	info!("Created indexer client for {}", config.utxo.indexer_url);

	let evm_provider: Arc<dyn EvmProvider> = Arc::new(
		EvmRpcClient::new(
			&config.evm.rpc_url,
			Duration::from_secs(config.evm.rpc_timeout_secs),
		)?
		.with_nonce_method(config.evm.nonce_method.clone()),
	);
	info!("Created EVM client for {}", config.evm.rpc_url);

	let hub = Arc::new(PreloadedAddressProvider::new(
		account.external_addresses.clone(),
		account.internal_addresses.clone(),
		account.known_external,
		account.known_internal,
	));
	let (external, internal) = account.tracked();

	let (live_sink, live) = mpsc::unbounded_channel();
	let synchronizer = UtxoSynchronizer::new(
		account.id.clone(),
		utxo_provider.clone(),
		hub,
		AddressDirectory::from_addresses(external.clone(), internal.clone()),
		persistence
			.load_store(&StatePersistenceService::utxo_scope(&account.id))
			.await?,
		&config.utxo,
		live_sink,
	);

	let scanners = config
		.evm
		.tokens
		.iter()
		.map(|token| EvmScanner::new(evm_provider.clone(), &config.evm, token))
		.collect::<Result<Vec<_>, _>>()?;
	let evm_store = persistence
		.load_store(&StatePersistenceService::evm_scope(&account.id))
		.await?;

	let mut dispatcher = EventDispatcher::new();
	dispatcher.register_handler(Box::new(LoggingHandler));
	dispatcher.register_handler(Box::new(UtxoSyncHandler::new(
		synchronizer,
		ConsensusTracker::new(Duration::from_secs(config.utxo.visibility_resync_secs)),
		persistence.clone(),
	)));
	dispatcher.register_handler(Box::new(EvmSyncHandler::new(
		&account.id,
		scanners,
		evm_store,
		persistence.clone(),
	)));

	let (orchestrator, events) = SyncOrchestrator::new(account.id.clone(), dispatcher, EVENT_QUEUE_CAPACITY);
	let mut actor = orchestrator.spawn();
	let bridge = bridge_utxo_provider(utxo_provider, live, events.clone());

	events
		.send(SyncEvent::AddressSetChanged { external, internal })
		.await?;
	events
		.send(SyncEvent::EvmAddressChanged {
			address: account.evm_address.clone(),
		})
		.await?;

	if !config.relay.relay_hub.is_empty() {
		let health = HttpRelayHealthCheck::new(Duration::from_millis(config.relay.health_timeout_ms))?;
		let selector = RelaySelector::new(evm_provider.clone(), Box::new(health), config.relay.clone());
		match selector.select().await {
			Ok(relay) => info!(
				"Using relay {} (base fee {}, pct fee {})",
				relay.candidate.url, relay.candidate.base_fee, relay.candidate.pct_fee
			),
			Err(e) => warn!("Relay selection failed: {}", e),
		}
	}

	let mut ticker = tokio::time::interval(Duration::from_secs(PERIODIC_SYNC_SECS));
	let outcome = loop {
		tokio::select! {
			_ = ticker.tick() => {
				if events.send(SyncEvent::SyncRequested).await.is_err() {
					break None;
				}
			}
			result = &mut actor => break Some(result),
			_ = tokio::signal::ctrl_c() => {
				info!("Shutdown requested");
				break None;
			}
		}
	};

	bridge.abort();
	head_task.abort();
	drop(events);

	let result = match outcome {
		Some(result) => result,
		None => actor.await,
	};
	match result {
		Ok(Ok(())) => {
			info!("Sync service stopped");
			Ok(())
		}
		Ok(Err(e)) => Err(e.into()),
		Err(e) => Err(e.into()),
	}
}
