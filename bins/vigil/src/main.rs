use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use vigil::executor::{Executor, ExecutorConfig};
use vigil::module::{Module, ModuleCtx};
use vigil::plugin::PluginRegistry;
use vigil::scheduler::{ActivityDirectory, Scheduler};
use vigil_core::activity::Activity;
use vigil_core::cfg::{self, AppId};
use vigil_core::logx;
use vigil_core::store::{self, OfflineStore, Store};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Host monitoring agent")]
struct Cli {
    /// Config file (defaults to the per-app config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Serve the read-only status API on this address
    #[cfg(feature = "web-api")]
    #[arg(long)]
    status_addr: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (cfg, cfg_path) = match &cli.config {
        Some(path) => (cfg::load_from(path)?, path.clone()),
        None => (cfg::load_or_init(&APP)?, cfg::default_path(&APP)?),
    };
    logx::init(logx::level_for(&cfg.log_level, cli.verbose));
    cfg.validate().with_context(|| format!("invalid config {}", cfg_path.display()))?;

    info!("{} boot", APP.application);
    info!("cfg path={} activities={}", cfg_path.display(), cfg.activities.len());

    let data_dir = match &cfg.data_dir {
        Some(dir) => dir.clone(),
        None => cfg::data_dir(&APP)?.join("outbox"),
    };
    let store: Arc<dyn Store> = Arc::new(OfflineStore::new(store::open_default(&data_dir)?));
    info!("offline queue at {}", data_dir.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (activities_tx, activities_rx) = watch::channel(cfg.activities.clone());
    let ctx = ModuleCtx {
        shutdown: shutdown_rx,
        store,
        config: Arc::new(cfg.clone()),
        activities: activities_rx,
    };

    let executor = Arc::new(Executor::new(ExecutorConfig::from_config(&cfg), ctx.shutdown.clone()));
    let scheduler = Scheduler::new(&cfg, ctx.store.clone(), executor, PluginRegistry::builtin(), ctx.shutdown.clone())?;
    let directory = scheduler.directory();

    #[allow(unused_mut)]
    let mut modules: Vec<Box<dyn Module>> = vec![Box::new(scheduler)];
    #[cfg(feature = "web-api")]
    if let Some(addr) = cli.status_addr {
        modules.push(Box::new(vigil::status::StatusServer::new(addr, directory.clone())));
    }

    let handles: Vec<_> = modules
        .into_iter()
        .map(|m| {
            info!("starting module {}", m.name());
            (m.name(), m.spawn(ctx.clone()))
        })
        .collect();

    wait_for_signals(&cfg_path, &activities_tx, &directory).await?;
    let _ = shutdown_tx.send(true);

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => info!("module {} stopped", name),
            Ok(Err(e)) => error!("module {} failed: {:#}", name, e),
            Err(e) => error!("module {} panicked: {}", name, e),
        }
    }
    info!("{} shutting down", APP.application);
    Ok(())
}

/// Block until SIGINT/SIGTERM; SIGHUP reloads the activity list.
async fn wait_for_signals(
    cfg_path: &Path,
    activities: &watch::Sender<Vec<Activity>>,
    directory: &ActivityDirectory,
) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => { info!("received SIGTERM"); return Ok(()); }
            _ = sigint.recv() => { info!("received SIGINT"); return Ok(()); }
            _ = sighup.recv() => {
                info!("received SIGHUP; reloading {} ({} activities tracked)", cfg_path.display(), directory.len());
                match cfg::load_from(cfg_path).and_then(|c| c.validate().map(|_| c).map_err(Into::into)) {
                    Ok(new_cfg) => { activities.send_replace(new_cfg.activities); }
                    Err(e) => warn!("reload failed, keeping current activities: {:#}", e),
                }
            }
        }
    }
}
