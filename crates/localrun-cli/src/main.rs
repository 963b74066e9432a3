//! localrun CLI - expose a local server through a tunnel broker

use anyhow::{bail, Context, Result};
use clap::Parser;
use localrun_client::config::is_valid_subdomain;
use localrun_client::{TlsOptions, Tunnel, TunnelConfig, TunnelEvent};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Expose a local server to the Internet
#[derive(Parser, Debug)]
#[command(name = "localrun")]
#[command(about = "Expose a local server to the Internet through a tunnel broker", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH")))]
#[command(disable_help_flag = true)]
struct Cli {
    /// Local port to expose
    #[arg(short, long, env = "LR_PORT")]
    port: u16,

    /// Broker base URL
    #[arg(short = 'h', long, env = "LR_HOST", default_value = localrun_client::DEFAULT_BROKER_URL)]
    host: String,

    /// Requested subdomain (exactly 10 alphanumeric characters)
    #[arg(short, long, env = "LR_SUBDOMAIN", value_parser = parse_subdomain)]
    subdomain: Option<String>,

    /// Hostname of the local server
    #[arg(short = 'l', long, env = "LR_LOCAL_HOST", default_value = "localhost")]
    local_host: String,

    /// Dial the local server over HTTPS
    #[arg(long, env = "LR_LOCAL_HTTPS")]
    local_https: bool,

    /// Certificate file for the local HTTPS server
    #[arg(long, env = "LR_LOCAL_CERT")]
    local_cert: Option<PathBuf>,

    /// Key file for the local HTTPS server
    #[arg(long, env = "LR_LOCAL_KEY")]
    local_key: Option<PathBuf>,

    /// CA bundle for the local HTTPS server
    #[arg(long, env = "LR_LOCAL_CA")]
    local_ca: Option<PathBuf>,

    /// Skip certificate verification for the local server
    #[arg(long, env = "LR_ALLOW_INVALID_CERT")]
    allow_invalid_cert: bool,

    /// Request timeout in milliseconds
    #[arg(long, env = "LR_TIMEOUT", default_value_t = 15_000)]
    timeout: u64,

    /// Retries per forwarded request
    #[arg(long, env = "LR_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Open the tunnel URL in the default browser
    #[arg(short, long, env = "LR_OPEN")]
    open: bool,

    /// Print each forwarded request
    #[arg(long, env = "LR_PRINT_REQUESTS")]
    print_requests: bool,

    /// Print help
    #[arg(long, action = clap::ArgAction::HelpLong)]
    help: Option<bool>,
}

fn parse_subdomain(value: &str) -> Result<String, String> {
    if is_valid_subdomain(value) {
        Ok(value.to_string())
    } else {
        Err(format!(
            "'{}' is not a valid subdomain: must be exactly 10 alphanumeric characters",
            value
        ))
    }
}

fn init_logging() {
    // DEBUG raises verbosity; RUST_LOG still wins when set.
    let default_filter = if std::env::var_os("DEBUG").is_some() {
        "localrun=debug,localrun_client=debug,localrun_proto=debug"
    } else {
        "localrun=info,localrun_client=info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// With --local-https and verification on, the client certificate material
/// must be present before we register with the broker.
fn validate_tls(cli: &Cli) -> Result<()> {
    if !cli.local_https || cli.allow_invalid_cert {
        return Ok(());
    }

    let (Some(cert), Some(key)) = (&cli.local_cert, &cli.local_key) else {
        bail!("--local-https requires --local-cert and --local-key (or --allow-invalid-cert)");
    };
    for path in [cert, key].into_iter().chain(cli.local_ca.as_ref()) {
        std::fs::File::open(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
    }
    Ok(())
}

/// Best-effort browser launch via the platform opener.
fn open_in_browser(url: &str) {
    let result = if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(url).spawn()
    } else if cfg!(target_os = "windows") {
        std::process::Command::new("cmd")
            .args(["/c", "start", url])
            .spawn()
    } else {
        std::process::Command::new("xdg-open").arg(url).spawn()
    };

    if let Err(e) = result {
        warn!("Could not open browser: {}", e);
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}

async fn graceful_exit(tunnel: Tunnel) {
    info!("Shutting down gracefully...");
    tunnel.graceful_shutdown().await;
    tunnel.wait().await;
}

async fn run(cli: Cli) -> Result<()> {
    validate_tls(&cli)?;

    let mut builder = TunnelConfig::builder(cli.port)
        .broker_url(cli.host.clone())
        .local_host(cli.local_host.clone())
        .request_timeout(Duration::from_millis(cli.timeout))
        .max_retries(cli.max_retries)
        .tls(TlsOptions {
            use_tls: cli.local_https,
            cert_path: cli.local_cert.clone(),
            key_path: cli.local_key.clone(),
            ca_path: cli.local_ca.clone(),
            allow_invalid_cert: cli.allow_invalid_cert,
        });
    if let Some(subdomain) = &cli.subdomain {
        builder = builder.subdomain(subdomain.clone());
    }
    let config = builder.build().context("Invalid configuration")?;

    let mut tunnel = Tunnel::open(config)
        .await
        .context("Failed to open tunnel")?;

    println!("your url is: {}", tunnel.url());
    if let Some(cached_url) = &tunnel.info().cached_url {
        println!("your cached url is: {}", cached_url);
    }
    info!(
        "Forwarding {} -> {}:{}",
        tunnel.url(),
        cli.local_host,
        cli.port
    );

    if cli.open {
        open_in_browser(tunnel.url());
    }

    enum Turn {
        Event(Option<TunnelEvent>),
        Interrupt,
        Terminate,
    }

    loop {
        let turn = tokio::select! {
            event = tunnel.next_event() => Turn::Event(event),
            _ = tokio::signal::ctrl_c() => Turn::Interrupt,
            _ = terminate_signal() => Turn::Terminate,
        };

        match turn {
            Turn::Event(Some(TunnelEvent::Url(url))) => info!("Tunnel connected at {}", url),
            Turn::Event(Some(TunnelEvent::Request { method, path, .. })) => {
                if cli.print_requests {
                    println!("{} {}", method, path);
                }
            }
            Turn::Event(Some(TunnelEvent::Error(message))) => error!("Tunnel error: {}", message),
            Turn::Event(Some(TunnelEvent::CircuitBreakerOpen {
                consecutive_errors,
                cooldown,
            })) => {
                warn!(
                    "Circuit breaker opened after {} consecutive errors; retrying in {}s",
                    consecutive_errors,
                    cooldown.as_secs()
                );
            }
            Turn::Event(Some(TunnelEvent::CircuitBreakerClosed)) => {
                info!("Circuit breaker closed, forwarding resumed");
            }
            Turn::Event(Some(TunnelEvent::Closed)) | Turn::Event(None) => {
                info!("Tunnel closed");
                return Ok(());
            }
            Turn::Interrupt => {
                info!("Received interrupt");
                graceful_exit(tunnel).await;
                std::process::exit(130);
            }
            Turn::Terminate => {
                info!("Received terminate signal");
                graceful_exit(tunnel).await;
                std::process::exit(143);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
