//! pwacache - command-line host for the offline cache.
//!
//! Without arguments it boots offline support, applies new worker versions
//! as they are announced, and re-boots whenever a reload is requested.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use pwacache_core::{
    ChannelPageHost, Config, OfflineApp, Platform, PurgeReport, ResourceRequest, UpdateNotice,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directory for an additional daily rolling log file
const LOG_DIR_ENV: &str = "PWACACHE_LOG_DIR";

const USAGE: &str = "\
Usage: pwacache [COMMAND]

Commands:
  (none)              Boot offline support and wait for updates (Ctrl-C to quit)
  --status [--json]   Print cache, worker and local storage state
  --fetch <url>       Fetch a resource through the cache strategies
  --clear <pattern>.. Delete cache partitions whose name contains a pattern
  --purge             Delete all caches and worker registrations, keep login
  --nuke              Full reset: caches, registrations, local state
  --help              Show this message";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "pwacache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

/// Build an app session on the native platform.
fn build(config: &Config) -> Result<(OfflineApp, mpsc::Receiver<UpdateNotice>, mpsc::UnboundedReceiver<()>)> {
    let (host, reloads) = ChannelPageHost::new();
    let platform = Platform::native(config, Arc::new(host))?;
    let (app, notices) = OfflineApp::new(config.clone(), platform)?;
    Ok((app, notices, reloads))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::load().context("Failed to load configuration")?;

    match args.first().map(String::as_str) {
        None => run(config).await,
        Some("--status") => status(&config, args.get(1).map(String::as_str) == Some("--json")).await,
        Some("--fetch") => {
            let url = args.get(1).ok_or_else(|| anyhow::anyhow!("--fetch needs a URL"))?;
            fetch(&config, url).await
        }
        Some("--clear") => clear(&config, &args[1..]).await,
        Some("--purge") => purge(&config, false).await,
        Some("--nuke") => purge(&config, true).await,
        Some("--help") | Some("-h") => {
            println!("{}", USAGE);
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown argument: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

/// Boot, apply updates as they arrive, and re-boot on every reload.
async fn run(config: Config) -> Result<()> {
    info!(origin = %config.origin, base_path = %config.base_path, "pwacache starting");
    loop {
        let (app, mut notices, mut reloads) = build(&config)?;
        app.boot();
        eprintln!("Offline support running for {}", config.scope_url()?);

        let reload = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break false,
                Some(notice) = notices.recv() => {
                    eprintln!("A new version is available, updating...");
                    notice.apply().await;
                }
                Some(()) = reloads.recv() => break true,
            }
        };

        app.shutdown().await;
        if !reload {
            info!("pwacache shutting down");
            return Ok(());
        }
        eprintln!("Reloading");
    }
}

async fn status(config: &Config, json: bool) -> Result<()> {
    let (app, _notices, _reloads) = build(config)?;
    let report = app.diagnostics().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

async fn fetch(config: &Config, url: &str) -> Result<()> {
    let (app, _notices, _reloads) = build(config)?;
    let request = ResourceRequest::get(config.base_url()?.join(url).context("Invalid URL")?);
    let response = app.engine().fetch(request).await?;
    eprintln!(
        "{} {} ({})",
        response.status,
        response.url,
        if response.is_from_cache() { "cache" } else { "network" }
    );
    println!("{}", response.text());
    Ok(())
}

async fn clear(config: &Config, patterns: &[String]) -> Result<()> {
    if patterns.is_empty() {
        anyhow::bail!("--clear needs at least one pattern");
    }
    let (app, _notices, _reloads) = build(config)?;
    let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
    let report = app.purge().clear_caches_by_pattern(&patterns).await;
    print_report(&report);
    Ok(())
}

async fn purge(config: &Config, everything: bool) -> Result<()> {
    let (app, _notices, _reloads) = build(config)?;
    let report = if everything {
        app.purge().nuke_all_caches().await
    } else {
        app.purge().force_app_update().await
    };
    print_report(&report);
    Ok(())
}

fn print_report(report: &PurgeReport) {
    if report.removed.is_empty() {
        println!("Nothing to remove");
    }
    for target in &report.removed {
        println!("Removed {}", target);
    }
    for failure in &report.failures {
        eprintln!("{}", failure);
    }
}
