use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use glidescan::config::{EngineConfig, PathScanRequest, PortScanRequest, WordlistSource};
use glidescan::ports::parse_port_range;
use glidescan::probe::http::FoundPolicy;
use glidescan::results::{PathSortKey, ScanRecord, SortOrder};
use glidescan::server;
use glidescan::session::{Engine, Session};
use glidescan::types::{PathResult, PortResult, ScanEvent, ScanStatus};

/// glidescan: concurrent port scanner, service fingerprinter and HTTP path brute-forcer.
#[derive(Debug, Parser)]
#[command(name = "glidescan", version, about, long_about = None)]
struct Cli {
    /// JSON engine config (progress policy, grace periods, user agent).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan a TCP port range on one host and fingerprint open ports.
    Ports {
        /// Host name or IP address.
        target: String,

        /// Port or inclusive range, e.g. 22 or 1-1024.
        #[arg(long, default_value = "1-1024")]
        range: String,

        /// Max concurrent connect attempts.
        #[arg(long, default_value_t = glidescan::config::DEFAULT_PORT_CONCURRENCY)]
        concurrency: usize,

        /// Per-port timeout in milliseconds.
        #[arg(long = "timeout-ms", default_value_t = 1000)]
        timeout_ms: u64,

        /// Only report open ports; skip service identification.
        #[arg(long = "no-fingerprint", default_value_t = false)]
        no_fingerprint: bool,

        /// Write results as pretty JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Brute-force paths under a base URL.
    Paths {
        /// Base URL, e.g. https://example.com/app
        url: String,

        /// Wordlist file, one path per line.
        #[arg(long)]
        wordlist: PathBuf,

        #[arg(long, default_value_t = glidescan::config::DEFAULT_PATH_CONCURRENCY)]
        concurrency: usize,

        /// Per-request timeout in milliseconds.
        #[arg(long = "timeout-ms", default_value_t = 10_000)]
        timeout_ms: u64,

        /// Status codes counted as found, e.g. "200,301,!404".
        #[arg(long = "status-codes")]
        status_codes: Option<String>,

        /// Sort field for the printed table.
        #[arg(long, value_parser = parse_sort_key)]
        sort: Option<PathSortKey>,

        #[arg(long, default_value_t = false)]
        desc: bool,

        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Serve the JSON HTTP API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

fn parse_sort_key(s: &str) -> Result<PathSortKey, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown sort field '{s}' (path, fullUrl, statusCode, contentType, contentLength)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("glidescan=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = Engine::new(config);

    match cli.command {
        Command::Ports { target, range, concurrency, timeout_ms, no_fingerprint, output } => {
            let range = parse_port_range(&range)?;
            let req = PortScanRequest::new(target, range.start().into(), range.end().into())
                .with_concurrency(concurrency)
                .with_timeout(Duration::from_millis(timeout_ms))
                .with_fingerprint(!no_fingerprint);
            let session = Arc::new(engine.port_scan(req));
            run_session(&session).await?;
            let results = session.results();
            print_ports_table(&results, session.progress().scanned);
            if let Some(path) = output.as_deref() {
                write_results_json(path, &results)?;
                info!(path = %path.display(), "wrote JSON results");
            }
        }
        Command::Paths { url, wordlist, concurrency, timeout_ms, status_codes, sort, desc, output } => {
            let mut req = PathScanRequest::new(url, WordlistSource::File(wordlist))
                .with_concurrency(concurrency)
                .with_timeout(Duration::from_millis(timeout_ms));
            if let Some(codes) = status_codes.as_deref() {
                req = req.with_policy(FoundPolicy::from_codes(codes)?);
            }
            let session = Arc::new(engine.path_scan(req));
            run_session(&session).await?;
            let order = if desc { SortOrder::Desc } else { SortOrder::Asc };
            let results = match sort {
                Some(key) => session.sorted_results(key, order),
                None => session.results(),
            };
            print_paths_table(&results, session.progress().scanned);
            if let Some(path) = output.as_deref() {
                write_results_json(path, &results)?;
                info!(path = %path.display(), "wrote JSON results");
            }
        }
        Command::Serve { bind } => {
            tokio::select! {
                res = server::spawn_server(&bind, engine) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
    }
    Ok(())
}

/// Start, log progress until finished, and cancel on Ctrl-C.
async fn run_session<R: ScanRecord + Serialize>(session: &Arc<Session<R>>) -> Result<()> {
    let mut events = session.events().context("event stream already taken")?;
    session.start().await?;

    let canceller = session.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            canceller.cancel().await;
        }
    });

    let mut last_decile = 0u64;
    while let Some(ev) = events.recv().await {
        match ev {
            ScanEvent::Progress(p) => {
                let decile = (p.percent / 10.0) as u64;
                if decile > last_decile {
                    last_decile = decile;
                    info!(scanned = p.scanned, total = p.total, found = p.found, rate = p.rate.round(), "{:.0}%", p.percent);
                }
            }
            ScanEvent::Found(r) => {
                info!(result = %serde_json::to_string(&r).unwrap_or_default(), "found");
            }
            ScanEvent::Finished { status, error } => {
                ctrl_c.abort();
                match (status, error) {
                    (ScanStatus::Error, Some(e)) => bail!("scan failed: {e}"),
                    (status, _) => info!(%status, "scan finished"),
                }
                break;
            }
        }
    }
    Ok(())
}

fn print_ports_table(results: &[PortResult], scanned: u64) {
    let service = |r: &PortResult| {
        let mut s = r.service.clone();
        if r.tls && s != "https" {
            s.push_str("/tls");
        }
        s
    };
    let product = |r: &PortResult| match (&r.product_name, &r.version) {
        (Some(p), Some(v)) => format!("{p} {v}"),
        (Some(p), None) => p.clone(),
        _ => String::new(),
    };
    let mut svc_w = "service".len();
    let mut prod_w = "product".len();
    for r in results {
        svc_w = svc_w.max(service(r).chars().count());
        prod_w = prod_w.max(product(r).chars().count().min(40));
    }
    let port_w = 5usize;
    let os_w = "os".len().max(results.iter().filter_map(|r| r.operating_system.as_ref()).map(String::len).max().unwrap_or(0));

    println!("\nOpen ports: {} (scanned: {})", results.len(), scanned);
    println!("{:>port_w$}  {:<svc_w$}  {:<prod_w$}  {:<os_w$}  banner", "port", "service", "product", "os");
    println!("{:-<port_w$}  {:-<svc_w$}  {:-<prod_w$}  {:-<os_w$}  {:-<6}", "", "", "", "", "");
    for r in results {
        let prod = clip(&product(r), 40);
        let banner = clip(r.banner.as_deref().unwrap_or_default(), 60);
        println!(
            "{:>port_w$}  {:<svc_w$}  {:<prod_w$}  {:<os_w$}  {}",
            r.port,
            service(r),
            prod,
            r.operating_system.as_deref().unwrap_or_default(),
            banner
        );
    }
}

/// First `max` chars of `s`; fingerprint text may carry multi-byte replacement chars.
fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn print_paths_table(results: &[PathResult], scanned: u64) {
    let path_w = "path".len().max(results.iter().map(|r| r.path.len().min(60)).max().unwrap_or(0));
    let type_w = "content-type".len().max(results.iter().map(|r| r.content_type.len().min(40)).max().unwrap_or(0));

    println!("\nFound paths: {} (scanned: {})", results.len(), scanned);
    println!("{:<path_w$}  {:>6}  {:>10}  {:<type_w$}", "path", "status", "length", "content-type");
    println!("{:-<path_w$}  {:-<6}  {:-<10}  {:-<type_w$}", "", "", "", "");
    for r in results {
        println!(
            "{:<path_w$}  {:>6}  {:>10}  {:<type_w$}",
            r.path, r.status_code, r.content_length, r.content_type
        );
    }
}

fn write_results_json<T: Serialize>(path: &Path, results: &[T]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}
