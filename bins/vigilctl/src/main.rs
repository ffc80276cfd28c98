use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info};

use vigil::executor::{Executor, ExecutorConfig};
use vigil::plugin::PluginRegistry;
use vigil_core::activity::ActivityKind;
use vigil_core::cfg::{self, AppId, Config};
use vigil_core::job::Job;
use vigil_core::store::{self, OfflineStore, Store};
use vigil_core::{logx, now_ms};

/// Config and data dirs are shared with the agent.
const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: "vigil",
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Vigil agent operator tool")]
struct Cli {
    /// Config file (defaults to the agent's config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration
    Check,
    /// Show activities and their whitelist verdicts
    List,
    /// Execute one activity now and print its record
    Run { id: String },
    /// Show queued offline records
    Outbox {
        /// Purge records of activities that are no longer configured
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logx::init(logx::level_for("warn", cli.verbose));

    let cfg = match &cli.config {
        Some(path) => cfg::load_from(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    cfg.validate().context("invalid configuration")?;

    match cli.cmd {
        Command::Check => {
            println!("ok: {} activities, {} whitelist patterns", cfg.activities.len(), cfg.whitelist.len());
        }
        Command::List => list(&cfg)?,
        Command::Run { id } => run(&cfg, &id).await?,
        Command::Outbox { clear } => outbox(&cfg, clear)?,
    }
    Ok(())
}

fn kind_name(kind: ActivityKind) -> &'static str {
    match kind {
        ActivityKind::Command => "command",
        ActivityKind::Plugin => "plugin",
    }
}

fn list(cfg: &Config) -> Result<()> {
    let whitelist = cfg.whitelist()?;
    let plugins = PluginRegistry::builtin();
    for a in &cfg.activities {
        let verdict = match a.kind {
            ActivityKind::Plugin if plugins.resolve(&a.command).is_none() => "unknown-plugin",
            _ if whitelist.allows(a) => "allowed",
            _ => "blocked",
        };
        println!("{}\t{}\t{}s\t{}\t{}", a.id, kind_name(a.kind), a.interval, verdict, a.command);
    }
    Ok(())
}

async fn run(cfg: &Config, id: &str) -> Result<()> {
    let Some(activity) = cfg.activities.iter().find(|a| a.id == id) else {
        bail!("no activity with id {id}");
    };
    let allowed = cfg.whitelist()?.allows(activity);
    let plugin = match activity.kind {
        ActivityKind::Plugin => PluginRegistry::builtin().resolve(&activity.command),
        ActivityKind::Command => None,
    };

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let exec = Executor::new(ExecutorConfig::from_config(cfg), shutdown_rx);
    let key = exec.submit(Job::new(activity, allowed, now_ms()), plugin).await;
    info!("submitted {} as {}", activity.id, key);

    let mut job = wait_for(&exec, key).await;
    exec.stop().await;

    match job.finalize() {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => bail!("activity {} produced no record", activity.id),
    }
    Ok(())
}

/// Reap until `key` leaves the registry; the engine's timeout bounds the wait.
async fn wait_for(exec: &Executor, key: u64) -> Job {
    let none = HashMap::new();
    loop {
        let mut done = exec.reap(&none).await;
        if let Some(pos) = done.iter().position(|j| j.started_at() == key) {
            return done.swap_remove(pos);
        }
        debug!("waiting for {}", key);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn outbox(cfg: &Config, clear: bool) -> Result<()> {
    let dir = match &cfg.data_dir {
        Some(dir) => dir.clone(),
        None => cfg::data_dir(&APP)?.join("outbox"),
    };
    let store = OfflineStore::new(store::open_default(&dir)?);

    if clear {
        let before = store.pending()?.len();
        let ids: Vec<String> = cfg.activities.iter().map(|a| a.id.clone()).collect();
        store.clear_offline_data(&ids)?;
        let after = store.pending()?.len();
        println!("removed {} of {} queued records", before.saturating_sub(after), before);
        return Ok(());
    }

    let pending = store.pending()?;
    for rec in &pending {
        let mut data = rec.data_json.clone();
        if data.len() > 60 {
            let mut cut = 60;
            while !data.is_char_boundary(cut) {
                cut -= 1;
            }
            data.truncate(cut);
            data.push_str("...");
        }
        println!("{}\t{}\t{}\t{}", rec.activity_id, rec.timestamp, rec.return_code, data);
    }
    println!("{} queued records", pending.len());
    Ok(())
}
