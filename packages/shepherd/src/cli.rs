use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shepherd_error::ShepherdError;

use crate::bus::EventBus;
use crate::config::ShepherdConfig;
use crate::gateway::{self, ChannelBroker, Dispatcher, LastMessageCache};
use crate::router::{build_router, AppState};
use crate::supervisor::AgentSupervisor;

#[derive(Parser, Debug)]
#[command(name = "shepherd", bin_name = "shepherd")]
#[command(about = "Supervise a flock of simulation agents over a message bus")]
#[command(arg_required_else_help = true)]
pub struct ShepherdCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the shepherd HTTP/websocket server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Path to the JSON config file.
    #[arg(long, short = 'c', default_value = "shepherd.json")]
    config: PathBuf,

    /// Override the configured listen host.
    #[arg(long, short = 'H')]
    host: Option<String>,

    /// Override the configured listen port.
    #[arg(long, short = 'p')]
    port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Shepherd(#[from] ShepherdError),
    #[error("{0}")]
    Server(String),
}

pub fn run_shepherd() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = ShepherdCli::parse();
    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    // Config failures are fatal before anything is started.
    let mut config = ShepherdConfig::load(&args.config)?;
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let broker = ChannelBroker::new();
        let producer = Arc::new(broker.producer());
        let consumer = broker.consumer(&config.kafka.subscribe);

        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(LastMessageCache::new());
        let supervisor = Arc::new(AgentSupervisor::new(&config, producer.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            supervisor.clone(),
            bus.clone(),
            cache.clone(),
        ));
        let poll = gateway::spawn_poll_loop(consumer, dispatcher);

        let state = Arc::new(AppState {
            supervisor,
            bus,
            cache,
            producer,
            topics: config.kafka.topics.clone(),
        });
        let router = build_router(state, config.public_dir.as_deref());

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            group = %config.kafka.group_id,
            subscribe = ?config.kafka.subscribe,
            "shepherd listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("shutting down");
                    }
                    _ = poll => {
                        tracing::error!("gateway poll loop exited, shutting down");
                    }
                }
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}
