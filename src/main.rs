use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use smartproxy::config::{self, Config};
use smartproxy::proxy;

#[derive(Parser)]
#[command(name = "smartproxy")]
#[command(about = "Forward HTTP(S) proxy with upstreams addressed via proxy credentials", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(
        short,
        long,
        env = "SMARTPROXY_CONFIG",
        default_value = "configs/config.yaml",
        value_name = "FILE"
    )]
    config: PathBuf,
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    init_logging(&config);
    info!(
        config = %cli.config.display(),
        log_level = %config.logging.level,
        "loaded configuration"
    );
    debug!(
        http_port = config.server.http_port,
        https_mitm = config.server.https_mitm,
        max_idle_conns = config.server.max_idle_conns,
        max_idle_conns_per_host = config.server.max_idle_conns_per_host,
        read_buffer_size = config.server.read_buffer_size,
        write_buffer_size = config.server.write_buffer_size,
        direct_extensions = config.direct_extensions.len(),
        direct_domains = config.direct_domains.len(),
        ad_blocking_enabled = config.ad_blocking.enabled,
        "configuration details"
    );

    let ad_domains = if config.ad_blocking.enabled {
        match config::load_ad_domains(&config.ad_blocking.domains_file) {
            Ok(domains) => {
                info!(count = domains.len(), "loaded ad domains");
                if !domains.is_empty() {
                    debug!(
                        samples = ?&domains[..domains.len().min(5)],
                        total = domains.len(),
                        "sample ad domains"
                    );
                }
                domains
            }
            Err(err) => {
                warn!(
                    file = %config.ad_blocking.domains_file.display(),
                    "failed to load ad domains: {err}"
                );
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    // Upstreams are not configured here; each request carries its own in
    // the Proxy-Authorization header.
    info!("starting in smart proxy mode - upstream configured via authentication");
    debug!(
        username = "schema (http or socks5)",
        password = "base64(host:port) or base64(host:port:user:pass)",
        "smart proxy authentication format"
    );

    let state = proxy::build_state(&config, ad_domains)?;

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("shutdown signal received, stopping proxy server");
            shutdown.cancel();
        }
    });

    proxy::start(state, listener, shutdown).await?;
    info!("server gracefully stopped");

    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            // still honor ctrl-c
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
