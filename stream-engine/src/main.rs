//! Entry point for `stream-engine`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, argument parsing, the demo service).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use stream_engine::connection::{Crud, UserType};
use stream_engine::service::{Request, ServiceError};
use stream_engine::socket::Endpoint;
use stream_engine::{
    EngineConfig, OpenRequest, Service, ServiceDescriptor, ServiceId, Services, Side,
};

const ECHO: ServiceId = ServiceId(1);

/// Reliable request/response streams over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Timing wheel tick in milliseconds.
    #[arg(long, default_value_t = 100, global = true)]
    tick_ms: u64,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve the echo service.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
    },
    /// Send one request and print the response.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Request body.
        #[arg(short, long, default_value = "hello")]
        message: String,
        /// Seconds to wait for the response.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

/// Returns the request body unchanged.
struct Echo(ServiceDescriptor);

impl Service for Echo {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.0
    }

    fn serve(&self, request: &Request) -> Result<Vec<u8>, ServiceError> {
        log::info!(
            "[echo] {} bytes on stream {} from {}",
            request.body.len(),
            request.stream,
            request.origin
        );
        Ok(request.body.clone())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = EngineConfig {
        tick_interval: Duration::from_millis(cli.tick_ms),
        ..EngineConfig::default()
    };

    match cli.mode {
        Mode::Server { bind } => serve(bind, config).await,
        Mode::Client {
            server,
            message,
            timeout,
        } => request(server, &message, Duration::from_secs(timeout), config).await,
    }
}

async fn serve(bind: SocketAddr, config: EngineConfig) -> anyhow::Result<()> {
    let mut services = Services::new();
    services.register(Arc::new(Echo(ServiceDescriptor {
        id: ECHO,
        uri: "/echo".into(),
        user_types: UserType::ALL,
        crud: Crud::READ,
    })))?;

    let (mut endpoint, _delivered) = Endpoint::bind(bind, Side::Server, config, Arc::new(services))
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Serving /echo on {}", endpoint.local_addr());

    // Never stops on its own; the sender lives until the process exits.
    let (_stop, stop_rx) = watch::channel(false);
    endpoint.run(stop_rx).await?;
    Ok(())
}

async fn request(
    server: SocketAddr,
    message: &str,
    timeout: Duration,
    config: EngineConfig,
) -> anyhow::Result<()> {
    let local: SocketAddr = "0.0.0.0:0".parse()?;
    let (mut endpoint, mut delivered) =
        Endpoint::bind(local, Side::Peer, config, Arc::new(Services::new())).await?;

    let open = OpenRequest {
        port: server.port(),
        ..OpenRequest::new(ECHO)
    };
    let key = endpoint.request(server, open, message.as_bytes()).await?;
    log::info!("Request sent on {key}, waiting up to {timeout:?}");

    let (stop, stop_rx) = watch::channel(false);
    let run = endpoint.run(stop_rx);
    tokio::pin!(run);

    let response = tokio::select! {
        finished = &mut run => {
            finished?;
            bail!("endpoint stopped before a response arrived");
        }
        received = tokio::time::timeout(timeout, delivered.recv()) => {
            received
                .context("no response before the timeout")?
                .context("dispatcher closed")?
        }
    };
    println!("{}", String::from_utf8_lossy(&response.body));

    // Let the loop flush the final ACK before exiting.
    stop.send(true)?;
    run.await?;
    Ok(())
}
