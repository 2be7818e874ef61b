use clap::Parser;
use ledger_bridge::abi::EventRegistry;
use ledger_bridge::abi::contracts::bundled_abis;
use ledger_bridge::broker::{AmqpConnector, BrokerHandle, Connector, InMemoryBroker};
use ledger_bridge::commands::{CommandGateway, CommandWorker};
use ledger_bridge::config::{BrokerKind, Cli, Settings};
use ledger_bridge::events::{
	CursorStore, EventConsumer, EventLog, EventPoller, EventPublisher, EventSink, EventSubscriber, Feed,
	FileCursorStore, MemoryCursorStore,
};
use ledger_bridge::http::{self, AppState};
use ledger_bridge::ledger::{ContractClient, EthereumClient, LogFilter, LogSource};
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive("lapin=warn".parse()?)
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let cli = Cli::parse();
	cli.validate()?;
	let settings = &cli.settings;

	info!("Starting ledger bridge ({:?})", cli.role);

	let connector: Arc<dyn Connector> = match settings.broker {
		BrokerKind::Amqp => Arc::new(AmqpConnector::new(settings.amqp_url.clone())),
		BrokerKind::Memory => Arc::new(InMemoryBroker::new()),
	};
	let broker = Arc::new(BrokerHandle::new(connector));
	let ethereum = EthereumClient::new(settings.rpc_url.clone(), settings.ws_url.clone())?;

	let shutdown = CancellationToken::new();
	let mut tasks = JoinSet::new();
	let events = EventLog::default();

	if cli.role.works() {
		let ledger = ContractClient::connect(ethereum.clone(), settings.contract_client_config()?).await?;
		let worker = CommandWorker::new(broker.clone(), Arc::new(ledger)).with_concurrency(cli.role.concurrency());
		tasks.spawn(worker.run(shutdown.child_token()));
	}

	if cli.role.ingests() {
		spawn_ingestion(&mut tasks, settings, broker.clone(), Arc::new(ethereum), &shutdown)?;
	}

	if cli.role.consumes() {
		let consumer = EventConsumer::new(broker.clone(), events.clone());
		tasks.spawn(consumer.run(shutdown.child_token()));
	}

	let server = if cli.role.serves_http() {
		let listener = TcpListener::bind(settings.http_addr).await?;
		let mut state = AppState::default();
		if cli.role.issues_commands() {
			let gateway = CommandGateway::new(broker.clone())
				.with_timeout(settings.reply_timeout())
				.with_shutdown(shutdown.clone());
			state = state.with_gateway(gateway);
		}
		if cli.role.consumes() {
			state = state.with_events(events);
		}
		Some(tokio::spawn(http::serve(listener, state, shutdown.clone())))
	} else {
		None
	};

	tokio::signal::ctrl_c().await?;
	info!("Shutdown requested");
	shutdown.cancel();

	if let Some(server) = server {
		match server.await {
			Ok(Ok(())) => info!("HTTP server stopped"),
			Ok(Err(e)) => error!("HTTP server failed: {}", e),
			Err(e) => error!("HTTP server task panicked: {}", e),
		}
	}

	while let Some(result) = tasks.join_next().await {
		if let Err(e) = result {
			error!("Task failed during shutdown: {}", e);
		}
	}

	broker.close().await?;
	info!("Ledger bridge stopped");
	Ok(())
}

/// One poller per bundled ABI plus a subscriber over the merged registry, all
/// publishing to the event queue.
fn spawn_ingestion(
	tasks: &mut JoinSet<()>,
	settings: &Settings,
	broker: Arc<BrokerHandle>,
	source: Arc<dyn LogSource>,
	shutdown: &CancellationToken,
) -> Result<(), BoxError> {
	let abis = bundled_abis()?;
	let sink: Arc<dyn EventSink> = Arc::new(EventPublisher::new(broker));
	let store: Arc<dyn CursorStore> = match &settings.cursor_dir {
		Some(dir) => Arc::new(FileCursorStore::new(dir.clone())),
		None => Arc::new(MemoryCursorStore::new()),
	};

	for (name, abi) in &abis {
		let feed = Feed {
			name: name.to_string(),
			addresses: settings.contract_addresses.clone(),
			registry: Arc::new(EventRegistry::from_abi(abi)),
		};
		let poller = EventPoller::new(feed, source.clone(), sink.clone(), store.clone(), settings.start_block)
			.with_interval(settings.poll_interval());
		tasks.spawn(poller.run(shutdown.child_token()));
	}

	let registry = Arc::new(EventRegistry::merged(abis.iter().map(|(_, abi)| abi)));
	let filter = LogFilter {
		addresses: settings.contract_addresses.clone(),
		..Default::default()
	};
	let subscriber = EventSubscriber::new(source, sink, registry, filter);
	tasks.spawn(subscriber.run(shutdown.child_token()));
	Ok(())
}
