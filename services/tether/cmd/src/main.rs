//! Tether agent binary.
//!
//! Maintains one TCP/TLS command channel with the controller: establish it
//! per the channel URL (or adopt an inherited descriptor), run the dispatch
//! loop, and on recoverable failure reset and re-establish until the
//! session expires or a signal ends the agent.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_session::{dispatch, timebase, NullScheduler, Remote, Timeouts, Transport};

mod config;
mod handler;

use config::AgentConfig;
use handler::LogHandler;

/// Remote agent command channel
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Remote agent command channel")]
struct Args {
    /// Channel URL, e.g. tcp://192.0.2.1:4444, tcp://:4444 (bind), or
    /// tcp6://[fe80::1]:4444?3
    #[arg(long)]
    url: Option<String>,

    /// Adopt a connected socket inherited from a prior stage
    #[arg(long)]
    inherited_fd: Option<RawFd>,

    /// Idle timeout: end the session this long after the last packet
    #[arg(long)]
    comms_timeout: Option<humantime::Duration>,

    /// Total window to retry failed connects
    #[arg(long)]
    retry_total: Option<humantime::Duration>,

    /// Wait between connect attempts
    #[arg(long)]
    retry_wait: Option<humantime::Duration>,

    /// Hard session deadline measured from startup
    #[arg(long)]
    expiry: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "tether.yaml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("tether={}", args.log_level).parse()?)
        .add_directive(format!("tether_session={}", args.log_level).parse()?)
        .add_directive(format!("tether_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!("Starting tether agent v{}", env!("CARGO_PKG_VERSION"));

    let file_config = AgentConfig::load_from_file(&args.config)?;

    let url = args.url.clone().or_else(|| file_config.url.clone());
    if url.is_none() && args.inherited_fd.is_none() {
        anyhow::bail!(
            "must specify --url or --inherited-fd (or a url in {})",
            args.config.display()
        );
    }

    let secs = |arg: Option<humantime::Duration>, file: Option<u64>, fallback: u64| {
        arg.map(|duration| duration.as_secs())
            .or(file)
            .unwrap_or(fallback)
    };
    let timeouts = Timeouts {
        comms: secs(args.comms_timeout, file_config.comms_timeout_secs, 300),
        retry_total: secs(args.retry_total, file_config.retry_total_secs, 3600),
        retry_wait: secs(args.retry_wait, file_config.retry_wait_secs, 10),
        expiry: secs(args.expiry, file_config.expiry_secs, 7 * 24 * 3600),
    };

    info!(
        "Session config: url={:?}, comms={}s, retry_total={}s, retry_wait={}s, expiry={}s",
        url, timeouts.comms, timeouts.retry_total, timeouts.retry_wait, timeouts.expiry
    );

    let transport = Transport::new(url, timeouts);
    let expiration_end = transport.expiration_end();
    let remote = Arc::new(Remote::new(
        transport,
        Arc::new(LogHandler),
        Arc::new(NullScheduler),
    ));

    let (terminate_tx, terminate_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {err}");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!("Failed to install SIGINT handler: {err}");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        let _ = terminate_tx.send(true);
    });

    // The inherited descriptor is adopted on the first establishment only;
    // later rounds reconnect from the address the adoption remembered.
    let mut inherited = args.inherited_fd;

    loop {
        if *terminate_rx.borrow() {
            break;
        }
        if timebase::now_secs() > expiration_end {
            info!("Session expired before the channel came up");
            break;
        }

        let configured = {
            let mut transport = remote.transport().lock().await;
            transport.configure(inherited.take()).await
        };
        if let Err(err) = configured {
            warn!("Channel establishment failed: {err}");
            if timebase::now_secs() > expiration_end {
                break;
            }
            timebase::sleep_secs(timeouts.retry_wait).await;
            continue;
        }

        info!("Channel established, entering dispatch");
        match dispatch::run(&remote, &terminate_rx).await {
            Ok(()) => {
                info!("Dispatch ended cleanly, session over");
                let mut transport = remote.transport().lock().await;
                transport.deinit();
                break;
            }
            Err(err) => {
                warn!("Dispatch ended with error: {err}; resetting transport");
                let mut transport = remote.transport().lock().await;
                transport.deinit();
                transport.reset();
            }
        }
    }

    info!("Agent shutting down");
    Ok(())
}
