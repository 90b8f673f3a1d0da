//! localtun server
//!
//! Hands out tunnels to remote clients and routes public HTTP traffic for
//! `<id>.<domain>` through them.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use localtun_auth::{JwtClaims, JwtValidator, StaticTokens};
use localtun_control::SessionConfig;
use localtun_pool::PortManager;
use localtun_server_http::{HttpServer, HttpServerConfig, DEFAULT_LANDING_PAGE};

use crate::config::{ServerConfig, Settings, TokenAuth};

/// localtun - expose local HTTP servers on public subdomains
#[derive(Parser, Debug)]
#[command(name = "localtun")]
#[command(about = "Run a localtun tunnel server", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a JWT token accepted by a server started with --jwt-secret
    GenerateToken {
        /// JWT secret (must match the server's --jwt-secret)
        #[arg(long, env = "LOCALTUN_JWT_SECRET")]
        secret: String,

        /// Token subject
        #[arg(long, default_value = "client")]
        subject: String,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Print a configuration file template
    InitConfig,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Configuration file (YAML); flags override its values
    #[arg(short, long, env = "LOCALTUN_CONFIG")]
    config: Option<PathBuf>,

    /// Listen on this port for outside requests [default: 80]
    #[arg(short, long, env = "LOCALTUN_PORT")]
    port: Option<u16>,

    /// IP address to bind to [default: 0.0.0.0]
    #[arg(long, env = "LOCALTUN_ADDRESS")]
    address: Option<IpAddr>,

    /// Base domain name; required when serving from a subdomain
    /// (e.g. lt.example.com where tunnels are <id>.lt.example.com)
    #[arg(long, env = "LOCALTUN_DOMAIN")]
    domain: Option<String>,

    /// Hand out https:// tunnel URLs
    #[arg(short, long, env = "LOCALTUN_SECURE")]
    secure: bool,

    /// Where requests to the bare domain are redirected
    #[arg(long, env = "LOCALTUN_LANDING")]
    landing: Option<String>,

    /// Route /<id>/... to tunnels when the host carries no subdomain
    #[arg(long, env = "LOCALTUN_PATH_ROUTING")]
    path_routing: bool,

    /// Maximum number of tunnel sockets per client [default: 10]
    #[arg(long, env = "LOCALTUN_MAX_SOCKETS")]
    max_sockets: Option<usize>,

    /// Ports for tunnel listeners (format: "first:last")
    #[arg(long, env = "LOCALTUN_PORT_RANGE", conflicts_with_all = ["min_port", "max_port"])]
    port_range: Option<String>,

    /// Lowest tunnel listener port [default: 8000]
    #[arg(long, env = "LOCALTUN_MIN_PORT")]
    min_port: Option<u16>,

    /// Highest tunnel listener port [default: 65535]
    #[arg(long, env = "LOCALTUN_MAX_PORT")]
    max_port: Option<u16>,

    /// Milliseconds a client may stay without tunnel sockets [default: 1000]
    #[arg(long, env = "LOCALTUN_GRACE_MS")]
    grace_ms: Option<u64>,

    /// Shared secret for HS256 tokens; enables token authentication
    #[arg(long, env = "LOCALTUN_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Require one of the configured --token values as bearer token
    #[arg(long, env = "LOCALTUN_REQUIRE_TOKEN")]
    require_token: bool,

    /// Accepted bearer token (repeatable)
    #[arg(long = "token", env = "LOCALTUN_TOKENS", value_delimiter = ',', hide_env_values = true)]
    tokens: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOCALTUN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl ServerArgs {
    /// Values given on the command line or through the environment
    fn overrides(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            address: self.address,
            domain: self.domain.clone(),
            secure: self.secure.then_some(true),
            landing: self.landing.clone(),
            path_routing: self.path_routing.then_some(true),
            max_sockets: self.max_sockets,
            port_range: self.port_range.clone(),
            min_port: self.min_port,
            max_port: self.max_port,
            grace_period_ms: self.grace_ms,
            jwt_secret: self.jwt_secret.clone(),
            require_token: self.require_token.then_some(true),
            tokens: self.tokens.clone(),
        }
    }
}

fn generate_token(secret: &str, subject: &str, hours: i64) -> Result<()> {
    let claims = JwtClaims::new(subject, chrono::Duration::hours(hours)).with_issuer("localtun");

    let token = JwtValidator::encode(secret.as_bytes(), &claims)
        .map_err(|e| anyhow::anyhow!("Failed to generate token: {}", e))?;

    println!("Subject:   {}", subject);
    println!("Valid for: {} hours", hours);
    println!();
    println!("{}", token);
    println!();
    println!("Usage:");
    println!("  curl -H \"Authorization: Bearer {}\" http://<server>/?new", token);

    Ok(())
}

fn init_logging(log_level: &str, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { log_level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

fn build_server(settings: Settings) -> HttpServer {
    let port_manager = Arc::new(PortManager::with_range(settings.port_range));

    let config = HttpServerConfig {
        bind_addr: settings.bind_addr,
        base_domain: settings.domain,
        secure: settings.secure,
        landing_page: settings
            .landing
            .unwrap_or_else(|| DEFAULT_LANDING_PAGE.to_string()),
        path_routing: settings.path_routing,
        session: SessionConfig {
            grace_period: settings.grace_period,
            max_sockets: settings.max_sockets,
            bind_ip: settings.bind_addr.ip(),
            port_manager: Some(port_manager),
        },
    };

    let server = HttpServer::new(config);
    match settings.auth {
        TokenAuth::Jwt(secret) => {
            info!("Token authentication: JWT (HS256)");
            server.with_token_validator(Arc::new(JwtValidator::new(secret.as_bytes())))
        }
        TokenAuth::Static(tokens) => {
            info!("Token authentication: {} static token(s)", tokens.len());
            server.with_token_validator(Arc::new(StaticTokens::new(tokens)))
        }
        TokenAuth::Disabled => {
            warn!("Token authentication disabled: anyone can create tunnels");
            server
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Error listening for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Error listening for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle subcommands
    if let Some(command) = cli.command {
        return match command {
            Commands::GenerateToken {
                secret,
                subject,
                hours,
            } => generate_token(&secret, &subject, hours),
            Commands::InitConfig => {
                print!("{}", ServerConfig::template());
                Ok(())
            }
        };
    }

    // Otherwise, run the server
    let args = cli.server_args;
    init_logging(&args.log_level, args.verbose)?;

    let file_config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let settings = file_config
        .merge(args.overrides())
        .resolve()
        .context("Invalid configuration")?;

    info!("Starting localtun server {}", env!("GIT_TAG"));
    info!("Public HTTP: {}", settings.bind_addr);
    info!("Tunnel ports: {}", settings.port_range);
    match &settings.domain {
        Some(domain) => info!("Base domain: {}", domain),
        None => info!("Base domain: taken from request hosts"),
    }

    let server = build_server(settings);
    let shutdown = CancellationToken::new();
    let mut server_handle = tokio::spawn(server.run(shutdown.clone()));

    info!("Press Ctrl+C to stop");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            shutdown.cancel();
        }
        result = &mut server_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
            };
        }
    }

    server_handle
        .await
        .context("Server task failed")?
        .context("Server stopped with an error")?;

    info!("localtun server stopped");
    Ok(())
}
