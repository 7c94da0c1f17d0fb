//! modem-test server binary: load configuration, take the pid-file,
//! wire up the pool, and drive one full test run.

use anyhow::{Context, Result, bail};
use clap::Parser;
use modem_test::cdr::{CdrLookup, SqlCdrCorrelator, SqlVoipCdrCorrelator, VoipCdrLookup};
use modem_test::config::{Config, expand_destination_specs};
use modem_test::coordinator::PhoneCoordinator;
use modem_test::directory::{HttpDirectoryClient, resolve_destinations};
use modem_test::domain::availability::call_schedule;
use modem_test::domain::destination::Destination;
use modem_test::domain_types::PhoneNumber;
use modem_test::error::StartupError;
use modem_test::handshake::EmsiHandshaker;
use modem_test::operator_cache::{OperatorCache, OperatorCacheConfig, run_sweeper};
use modem_test::orchestrator::Orchestrator;
use modem_test::pidfile::PidFile;
use modem_test::pool::{ModemPool, PoolDeps};
use modem_test::scheduler::OperatorMap;
use modem_test::serial::SerialModemFactory;
use modem_test::sinks::{CsvSink, HttpSink, ResultSink, SinkSet, SqlBackend, SqlSink};
use modem_test::time_provider::real_time_provider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "modem-test", version, about = "Multi-modem PSTN connectivity tester")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "modem-test.toml")]
    config: PathBuf,

    /// Comma-separated destination override (numbers or A-B ranges);
    /// replaces the configured destination set.
    #[arg(short, long)]
    destinations: Option<String>,

    /// Resolve and print the destination set with call schedules,
    /// then exit without dialing.
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modem_test=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let destinations = resolve_destination_set(&config, cli.destinations.as_deref()).await?;
    if destinations.is_empty() {
        bail!("destination set is empty");
    }

    if cli.list {
        print_destination_list(&destinations);
        return Ok(());
    }

    let _pid_file = PidFile::acquire(&config.pid_file)?;

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    let cache = Arc::new(if config.test.operator_cache_enabled {
        let cache_config = OperatorCacheConfig {
            path: config.test.operator_cache_path.clone(),
            ttl: Duration::from_secs(config.test.operator_cache_ttl_days * 24 * 3600),
            ..OperatorCacheConfig::default()
        };
        OperatorCache::open(&cache_config).await?
    } else {
        OperatorCache::disabled()
    });
    let sweeper = tokio::spawn(run_sweeper(
        cache.clone(),
        OperatorCacheConfig::default().sweep_interval,
        token.clone(),
    ));

    let cdr: Option<Arc<dyn CdrLookup>> = match &config.cdr {
        Some(source) => Some(Arc::new(
            SqlCdrCorrelator::connect(source)
                .await
                .context("connecting switch CDR source")?,
        )),
        None => None,
    };
    let voip_cdr: Option<Arc<dyn VoipCdrLookup>> = match &config.voip_cdr {
        Some(source) => Some(Arc::new(
            SqlVoipCdrCorrelator::connect(source)
                .await
                .context("connecting voip gateway CDR source")?,
        )),
        None => None,
    };

    let sinks = Arc::new(build_sinks(&config).await?);
    if sinks.is_empty() {
        warn!("no result sinks enabled, results will only reach the log");
    } else {
        info!(sinks = ?sinks.names(), "result sinks enabled");
    }

    let time = real_time_provider();
    let deps = PoolDeps {
        factory: Arc::new(SerialModemFactory),
        handshaker: Arc::new(EmsiHandshaker::new(config.emsi.clone())),
        cdr,
        voip_cdr,
        cache: cache.clone(),
        coordinator: Arc::new(PhoneCoordinator::new()),
        time: time.clone(),
    };
    let pool = ModemPool::build(&config, deps, &token).await?;

    let operator_map = Arc::new(OperatorMap::from_config(&config.test));
    let orchestrator = Orchestrator::new(
        pool,
        sinks,
        operator_map,
        time,
        token.clone(),
        config.test.inter_test_delay(),
    );

    let report = orchestrator.run(destinations).await;

    token.cancel();
    let _ = sweeper.await;
    cache.close().await;

    println!("{}", report.stats);
    if report.cancelled {
        info!("run cancelled, partial results recorded");
    }
    Ok(())
}

/// Destination set: CLI override, else configured literals/ranges,
/// plus the directory API when configured.
async fn resolve_destination_set(
    config: &Config,
    cli_override: Option<&str>,
) -> Result<Vec<Destination>, StartupError> {
    let mut destinations = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let specs: Vec<String> = match cli_override {
        Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
        None => config.test.destinations.clone(),
    };
    for phone in expand_destination_specs(&specs)? {
        let phone = PhoneNumber::try_new(phone.clone()).map_err(|e| {
            StartupError::BadDestination {
                spec: phone,
                reason: e.to_string(),
            }
        })?;
        if seen.insert(phone.clone()) {
            destinations.push(Destination::bare(phone));
        }
    }

    if cli_override.is_none() {
        if let Some(directory) = &config.directory {
            let client = HttpDirectoryClient::new(directory.url.clone())?;
            for dest in resolve_destinations(&client, directory).await? {
                if seen.insert(dest.phone.clone()) {
                    destinations.push(dest);
                }
            }
        }
    }

    Ok(destinations)
}

fn print_destination_list(destinations: &[Destination]) {
    let now = chrono::Utc::now();
    println!("{} destinations:", destinations.len());
    for dest in destinations {
        let schedule = call_schedule(dest.availability.as_ref(), now);
        let status = if schedule.callable_now {
            "callable now".to_string()
        } else {
            schedule.reason.clone()
        };
        println!("  {:<28} {status}", dest.label());
    }
}

async fn build_sinks(config: &Config) -> Result<SinkSet, StartupError> {
    let mut sinks: Vec<Box<dyn ResultSink>> = Vec::new();
    if let Some(path) = &config.sinks.csv_path {
        sinks.push(Box::new(CsvSink::open(std::path::Path::new(path)).await?));
    }
    if let Some(dsn) = &config.sinks.postgres_dsn {
        sinks.push(Box::new(SqlSink::connect(SqlBackend::Postgres, dsn).await?));
    }
    if let Some(dsn) = &config.sinks.mysql_dsn {
        sinks.push(Box::new(SqlSink::connect(SqlBackend::Mysql, dsn).await?));
    }
    if let Some(path) = &config.sinks.sqlite_path {
        sinks.push(Box::new(SqlSink::connect(SqlBackend::Sqlite, path).await?));
    }
    if let Some(url) = &config.sinks.api_url {
        sinks.push(Box::new(HttpSink::new(
            url.clone(),
            config.sinks.api_token.clone(),
        )?));
    }
    Ok(SinkSet::new(sinks))
}

/// SIGINT/SIGTERM cancel the run; workers stop after their in-flight
/// job and the orchestrator prints a partial summary.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}
