//! treefs server binary
//!
//! ```text
//! treefs naming                         # tree + locks, ports 6000/6001
//! treefs storage --root /srv/a --naming-host meta.local
//! ```
//!
//! Both roles also serve `/metrics` and `/healthz` over HTTP.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use treefs::config::{
    DEFAULT_COPY_CHUNK_SIZE, REGISTRATION_PORT, REPLICATION_THRESHOLD, SERVICE_PORT,
};
use treefs::error::{Error, Result};
use treefs::{metrics, NamingConfig, NamingServer, RegistrationStub, StorageConfig, StorageServer};

// =============================================================================
// CLI Arguments
// =============================================================================

/// treefs - distributed file store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9100", global = true)]
    metrics_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the naming service
    Naming {
        /// Interface both naming contracts bind to
        #[arg(long, env = "NAMING_BIND_IP", default_value = "0.0.0.0")]
        bind_ip: IpAddr,

        /// Port of the client service contract
        #[arg(long, env = "SERVICE_PORT", default_value_t = SERVICE_PORT)]
        service_port: u16,

        /// Port of the registration contract
        #[arg(long, env = "REGISTRATION_PORT", default_value_t = REGISTRATION_PORT)]
        registration_port: u16,

        /// Shared locks on a file before it is replicated
        #[arg(long, env = "REPLICATION_THRESHOLD", default_value_t = REPLICATION_THRESHOLD)]
        replication_threshold: u64,
    },

    /// Run a storage server
    Storage {
        /// Local directory holding this server's files
        #[arg(long, env = "STORAGE_ROOT")]
        root: PathBuf,

        /// Host running the naming service
        #[arg(long, env = "NAMING_HOST", default_value = "127.0.0.1")]
        naming_host: String,

        /// Registration port of the naming service
        #[arg(long, env = "REGISTRATION_PORT", default_value_t = REGISTRATION_PORT)]
        registration_port: u16,

        /// Interface the storage contracts bind to
        #[arg(long, env = "STORAGE_BIND_IP", default_value = "0.0.0.0")]
        bind_ip: IpAddr,

        /// Hostname published to the naming service
        #[arg(long, env = "ADVERTISE_HOST", default_value = "127.0.0.1")]
        advertise_host: String,

        /// Largest chunk moved per read during replication
        #[arg(long, env = "COPY_CHUNK_SIZE", default_value_t = DEFAULT_COPY_CHUNK_SIZE)]
        copy_chunk_size: u32,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = run_http_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    match args.role {
        Role::Naming {
            bind_ip,
            service_port,
            registration_port,
            replication_threshold,
        } => {
            let config = NamingConfig {
                service_addr: SocketAddr::new(bind_ip, service_port),
                registration_addr: SocketAddr::new(bind_ip, registration_port),
                replication_threshold,
            };
            info!("Starting naming server");
            info!("  Service: {}", config.service_addr);
            info!("  Registration: {}", config.registration_addr);
            info!("  Replication threshold: {}", config.replication_threshold);

            let server = NamingServer::new(config);
            server.start().await?;
            wait_for_shutdown().await;
            server.stop().await;
        }
        Role::Storage {
            root,
            naming_host,
            registration_port,
            bind_ip,
            advertise_host,
            copy_chunk_size,
        } => {
            let config = StorageConfig {
                root,
                bind_ip,
                advertise_host,
                copy_chunk_size,
            };
            info!("Starting storage server");
            info!("  Root: {}", config.root.display());
            info!("  Naming service: {}:{}", naming_host, registration_port);
            info!("  Advertised as: {}", config.advertise_host);

            let naming = RegistrationStub::connect(&naming_host, registration_port)?;
            let server = StorageServer::new(config);
            if let Err(e) = server.start(&naming).await {
                error!("Storage server failed to start: {}", e);
                server.stop().await;
                return Err(e);
            }
            wait_for_shutdown().await;
            server.stop().await;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics and Health Server
// =============================================================================

async fn run_http_server(addr: SocketAddr) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => reply(StatusCode::OK, "ok"),
            "/metrics" => match metrics::gather() {
                Ok(buffer) => {
                    let mut response = reply(StatusCode::OK, buffer);
                    if let Ok(value) = HeaderValue::from_str(&metrics::content_type()) {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            _ => reply(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
