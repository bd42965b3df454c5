use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bmnotify_api::{classify_raw, FlushOutcome, Notifier, NotifierConfig, PortEvent, PortEventHandler};
use bmnotify_core::{Sink, TransitionFilter, BAREMETAL_VNIC_TYPE};
use bmnotify_sink::{HttpSink, HttpSinkConfig, LogSink, DEFAULT_API_VERSION};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bmnotifyctl", version, about = "Forward bare-metal port transitions to the events API")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Vnic type of the ports to report on
    #[arg(long = "vnic-type", env = "BMNOTIFY_VNIC_TYPE", global = true, default_value = BAREMETAL_VNIC_TYPE)]
    vnic_type: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read port callbacks (JSON lines) and forward classified events in batches
    Run {
        /// Read callbacks from this file instead of stdin
        #[arg(long = "input")]
        input: Option<PathBuf>,
        /// Seconds between flushes
        #[arg(long = "interval-secs", env = "BMNOTIFY_SEND_EVENTS_INTERVAL", default_value_t = 2.0)]
        interval_secs: f64,
        /// Print batches to stdout instead of posting them
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        #[command(flatten)]
        sink: SinkArgs,
    },
    /// Classify port callbacks and print the result without sending anything
    Classify {
        /// Read callbacks from this file instead of stdin
        #[arg(long = "input")]
        input: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct SinkArgs {
    /// Base URL of the events API
    #[arg(long = "ironic-url", env = "BMNOTIFY_IRONIC_URL")]
    url: Option<String>,
    #[arg(long = "auth-token", env = "BMNOTIFY_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long = "api-version", env = "BMNOTIFY_IRONIC_API_VERSION", default_value = DEFAULT_API_VERSION)]
    api_version: String,
    #[arg(long = "request-timeout-secs", env = "BMNOTIFY_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
}

impl SinkArgs {
    fn http_config(&self) -> Result<HttpSinkConfig> {
        let url = self.url.clone().context("--ironic-url (or BMNOTIFY_IRONIC_URL) is required unless --dry-run")?;
        let mut cfg = HttpSinkConfig::new(url);
        cfg.auth_token = self.token.clone();
        cfg.api_version = self.api_version.clone();
        cfg.request_timeout_secs = self.request_timeout_secs;
        Ok(cfg)
    }
}

/// Upper bound on how long the final flush waits for a timer flush to finish.
const FINAL_FLUSH_WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let env = std::env::var("BMNOTIFY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries classify rows and dry-run batches
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

/// Parse `BMNOTIFY_METRICS_ADDR`. Unset or blank disables the exporter.
fn metrics_addr(raw: Option<&str>) -> Result<Option<SocketAddr>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(addr) => addr
            .parse::<SocketAddr>()
            .map(Some)
            .with_context(|| format!("invalid BMNOTIFY_METRICS_ADDR {:?}; expected host:port", addr)),
    }
}

fn describe_metrics() {
    describe_counter!("bmnotify_events_classified_total", "Port transitions that produced an event, by kind");
    describe_counter!("bmnotify_events_ignored_total", "Port callbacks that produced no event, by reason");
    describe_counter!("bmnotify_malformed_total", "Callbacks rejected as malformed");
    describe_counter!("bmnotify_queue_enqueued_total", "Events added to the batch queue");
    describe_gauge!("bmnotify_queue_depth", "Events waiting for the next flush");
    describe_counter!("bmnotify_flush_total", "Batches the sink accepted");
    describe_counter!("bmnotify_flush_failures_total", "Batches dropped after a failed submit");
    describe_counter!("bmnotify_flush_skipped_total", "Ticks skipped because a flush was in flight");
    describe_histogram!("bmnotify_batch_size", "Events per submitted batch");
    describe_histogram!("bmnotify_flush_ms", "Wall time of one submit in milliseconds");
    describe_counter!("bmnotify_http_errors_total", "Events API request failures, by kind");
}

fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("installing metrics exporter on {}", addr))?;
    describe_metrics();
    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

type InputLines = Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>;

async fn open_input(path: Option<&Path>) -> Result<InputLines> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = match path {
        Some(p) => Box::new(tokio::fs::File::open(p).await.with_context(|| format!("opening {}", p.display()))?),
        None => Box::new(tokio::io::stdin()),
    };
    Ok(BufReader::new(reader).lines())
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
fn parse_line(line: &str) -> Option<serde_json::Result<PortEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(trimmed))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RunStats {
    lines: u64,
    queued: u64,
    ignored: u64,
    rejected: u64,
}

fn feed_line(handler: &dyn PortEventHandler, line: &str, stats: &mut RunStats) {
    let Some(parsed) = parse_line(line) else { return };
    stats.lines += 1;
    let ev = match parsed {
        Ok(ev) => ev,
        Err(e) => {
            stats.rejected += 1;
            counter!("bmnotify_malformed_total", 1);
            warn!(line = stats.lines, error = %e, "skipping unparsable callback");
            return;
        }
    };
    match ev.dispatch(handler) {
        Ok(Some(kind)) => {
            stats.queued += 1;
            debug!(line = stats.lines, kind = %kind, "callback queued");
        }
        Ok(None) => stats.ignored += 1,
        // already logged by the handler
        Err(_) => stats.rejected += 1,
    }
}

async fn run(cli_vnic: String, input: Option<PathBuf>, interval_secs: f64, dry_run: bool, sink_args: SinkArgs) -> Result<()> {
    let interval = Duration::try_from_secs_f64(interval_secs)
        .with_context(|| format!("invalid --interval-secs {}", interval_secs))?;
    let sink: Arc<dyn Sink> = if dry_run {
        Arc::new(LogSink::stdout())
    } else {
        let sink = HttpSink::new(sink_args.http_config()?).context("building HTTP sink")?;
        info!(url = %sink.url(), api_version = %sink_args.api_version, "posting events over HTTP");
        Arc::new(sink)
    };
    let notifier = Notifier::start(NotifierConfig { send_events_interval: interval, vnic_type: cli_vnic }, sink);

    let mut lines = open_input(input.as_deref()).await?;
    let mut stats = RunStats::default();
    loop {
        tokio::select! {
            next = lines.next_line() => {
                match next.context("reading input")? {
                    Some(line) => feed_line(&notifier, &line, &mut stats),
                    None => {
                        info!("input closed; shutting down");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                break;
            }
        }
    }

    let mut last = notifier.shutdown().await;
    if last == FlushOutcome::Busy {
        info!(pending = notifier.pending(), "waiting for the in-flight flush before the final one");
        last = notifier.flush_pending(FINAL_FLUSH_WAIT).await;
    }
    info!(lines = stats.lines, queued = stats.queued, ignored = stats.ignored, rejected = stats.rejected, last_flush = ?last, "run finished");
    Ok(())
}

async fn classify(vnic: String, input: Option<PathBuf>, output: Output) -> Result<()> {
    let filter = TransitionFilter::new(vnic);
    debug!(vnic_type = filter.vnic_type(), "classifying callbacks");
    let mut lines = open_input(input.as_deref()).await?;
    let mut n = 0u64;
    while let Some(line) = lines.next_line().await.context("reading input")? {
        let Some(parsed) = parse_line(&line) else { continue };
        n += 1;
        let result = parsed
            .map_err(anyhow::Error::from)
            .and_then(|ev| classify_raw(&filter, ev.resource, ev.event, ev.original_port.as_ref(), ev.port.as_ref()).map_err(anyhow::Error::from));
        match (result, output) {
            (Ok(Some(c)), Output::Human) => {
                let p = c.record.payload();
                println!("{:<4} {:<7} {} {} {}", n, c.kind, c.record.identifier(), p.port_id(), p.status());
            }
            (Ok(None), Output::Human) => println!("{:<4} -", n),
            (Ok(c), Output::Json) => {
                #[derive(serde::Serialize)]
                struct Row<'a> { line: u64, kind: Option<bmnotify_core::EventKind>, event: Option<&'a bmnotify_core::EventRecord> }
                let row = Row { line: n, kind: c.as_ref().map(|c| c.kind), event: c.as_ref().map(|c| &c.record) };
                println!("{}", serde_json::to_string(&row)?);
            }
            (Err(e), _) => eprintln!("{}: error: {:#}", n, e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics(metrics_addr(std::env::var("BMNOTIFY_METRICS_ADDR").ok().as_deref())?)?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { input, interval_secs, dry_run, sink } => {
            info!(vnic_type = %cli.vnic_type, interval_secs, dry_run, "run invoked");
            run(cli.vnic_type, input, interval_secs, dry_run, sink).await?;
        }
        Commands::Classify { input } => {
            info!(vnic_type = %cli.vnic_type, "classify invoked");
            classify(cli.vnic_type, input, cli.output).await?;
        }
    }

    Ok(())
}
