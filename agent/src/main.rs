use std::panic;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use agent::config::duration::{self, parse_duration};
use agent::config::Config;
use agent::discover::{StaticDiscovery, TargetSets};
use agent::scrape::{Manager, Options};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pull-based metrics scrape agent", long_about = None)]
struct Args {
    /// Scrape configuration file
    #[arg(long = "config.file", default_value = "agent.yml")]
    config_file: PathBuf,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long = "log.level", default_value = "info")]
    log_level: LevelFilter,

    /// How often armed reloads are applied to the scrape pools
    #[arg(long = "reload.interval", default_value = "5s", value_parser = parse_positive_duration)]
    reload_interval: Duration,
}

fn parse_positive_duration(s: &str) -> anyhow::Result<Duration> {
    let d = parse_duration(s)?;
    anyhow::ensure!(!d.is_zero(), "duration must be greater than zero");
    Ok(d)
}

fn init_logging(level: LevelFilter) -> anyhow::Result<()> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l}):5} {t} - {m}{n}",
        )))
        .build();
    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))
        .context("building logger config")?;
    log4rs::init_config(config).context("installing logger")?;

    panic::set_hook(Box::new(|panic_info| {
        error!("{}", panic_info);
        let backtrace = std::backtrace::Backtrace::capture();
        error!("backtrace: {:#?}", backtrace);
    }));
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = init_logging(args.log_level) {
        eprintln!("{:#}", err);
        return ExitCode::FAILURE;
    }

    let cfg = match Config::load_file(&args.config_file) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("error loading config from {}: {}", args.config_file.display(), err);
            return ExitCode::from(2);
        }
    };

    match run(&args, cfg).await {
        Ok(()) => {
            info!("agent stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, cfg: Config) -> anyhow::Result<()> {
    let manager = Arc::new(Manager::new(Options {
        reload_interval: args.reload_interval,
        ..Default::default()
    }));
    manager.apply_config(&cfg);

    let (tsets_tx, tsets_rx) = mpsc::channel::<TargetSets>(1);
    tsets_tx
        .send(StaticDiscovery::new(&cfg).refresh())
        .await
        .context("sending initial target sets")?;
    let runner = tokio::spawn(manager.clone().run(tsets_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    info!(
        "agent started with {} scrape jobs, reload interval {}",
        cfg.scrape_configs.len(),
        duration::Display(args.reload_interval)
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => reload_config(&args.config_file, &manager, &tsets_tx).await,
        }
    }

    manager.stop().await;
    runner.await.context("joining scrape manager")??;
    Ok(())
}

async fn reload_config(path: &Path, manager: &Manager, tsets_tx: &mpsc::Sender<TargetSets>) {
    info!("reloading config from {}", path.display());
    let cfg = match Config::load_file(path) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("error reloading config, keeping the current one: {}", err);
            manager.metrics().reload_errors.inc();
            return;
        }
    };
    manager.apply_config(&cfg);
    if tsets_tx.send(StaticDiscovery::new(&cfg).refresh()).await.is_err() {
        error!("scrape manager is no longer receiving target sets");
    }
}
