use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use vigil_core::activity::{Activity, ActivityKind, Whitelist};
use vigil_core::cfg::Config;
use vigil_core::job::Job;
use vigil_core::now_ms;
use vigil_core::store::Store;

use crate::executor::Executor;
use crate::module::{shutdown_requested, Module, ModuleCtx};
use crate::plugin::{Plugin, PluginRegistry};
use crate::pool::WorkerPool;

/// Scheduling state of one tracked activity.
#[derive(Clone)]
struct ActivityState {
    activity: Activity,
    is_whitelisted: bool,
    next_exec_ms: u64,
    plugin: Option<Arc<dyn Plugin>>,
}

/// Read-only view of a tracked activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityView {
    /// Current activity definition.
    pub activity: Activity,
    /// Whitelist verdict.
    pub is_whitelisted: bool,
    /// When the next Job is due (ms since epoch).
    pub next_exec_ms: u64,
}

/// Shared handle answering "is activity X tracked" without reaching into
/// the scheduler.
#[derive(Clone, Default)]
pub struct ActivityDirectory {
    inner: Arc<Mutex<BTreeMap<String, ActivityState>>>,
}

impl ActivityDirectory {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ActivityState>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// View of activity `id`, if tracked.
    pub fn describe(&self, id: &str) -> Option<ActivityView> {
        self.lock().get(id).map(|s| ActivityView {
            activity: s.activity.clone(),
            is_whitelisted: s.is_whitelisted,
            next_exec_ms: s.next_exec_ms,
        })
    }

    /// Number of tracked activities.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Counts from one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Newly tracked activities.
    pub started: usize,
    /// Activities whose command, interval or kind changed.
    pub updated: usize,
    /// Activities no longer tracked.
    pub stopped: usize,
}

/// Worker count for `activities`: one for all commands, one per plugin, capped.
pub fn desired_workers(activities: &[Activity], max_workers: usize) -> usize {
    let plugins = activities.iter().filter(|a| a.kind == ActivityKind::Plugin).count();
    let commands = activities.len() - plugins;
    (usize::from(commands > 0) + plugins).min(max_workers)
}

/// Turns the activity list into due Jobs and feeds them to the worker pool.
pub struct Scheduler {
    activities: ActivityDirectory,
    whitelist: Whitelist,
    plugins: PluginRegistry,
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    pool: WorkerPool,
    tick: Duration,
    max_workers: usize,
    /// Activity id -> cutoff (ms); Jobs started before it are cancelled.
    cancelled: HashMap<String, u64>,
}

impl Scheduler {
    /// Build from the agent config. Whitelist errors are returned.
    pub fn new(
        cfg: &Config,
        store: Arc<dyn Store>,
        executor: Arc<Executor>,
        plugins: PluginRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        Ok(Self {
            activities: ActivityDirectory::default(),
            whitelist: cfg.whitelist()?,
            plugins,
            store,
            pool: WorkerPool::new(executor.clone(), shutdown),
            executor,
            tick: cfg.tick(),
            max_workers: cfg.max_workers,
            cancelled: HashMap::new(),
        })
    }

    /// Handle for concurrent lookups.
    pub fn directory(&self) -> ActivityDirectory {
        self.activities.clone()
    }

    /// Current worker pool size.
    pub fn workers(&self) -> usize {
        self.pool.size()
    }

    /// Reconcile tracked activities against `list` (a full replacement).
    pub fn apply_activities(&mut self, list: &[Activity]) -> Reconciled {
        self.apply_at(list, now_ms())
    }

    /// [`Self::apply_activities`] with an explicit clock.
    pub fn apply_at(&mut self, list: &[Activity], now: u64) -> Reconciled {
        let mut counts = Reconciled::default();
        let active_ids: Vec<String> = list.iter().map(|a| a.id.clone()).collect();

        {
            let mut map = self.activities.lock();
            for activity in list {
                match map.get_mut(&activity.id) {
                    Some(state) => {
                        let kind_changed = state.activity.kind != activity.kind;
                        if kind_changed
                            || state.activity.interval != activity.interval
                            || state.activity.command != activity.command
                        {
                            if kind_changed {
                                self.cancelled.insert(activity.id.clone(), now_ms());
                            }
                            state.activity = activity.clone();
                            state.is_whitelisted = self.whitelist.allows(activity);
                            state.plugin = resolve(&self.plugins, activity);
                            state.next_exec_ms = now;
                            info!("updating activity {}", activity.id);
                            counts.updated += 1;
                        }
                    }
                    None => {
                        map.insert(
                            activity.id.clone(),
                            ActivityState {
                                activity: activity.clone(),
                                is_whitelisted: self.whitelist.allows(activity),
                                next_exec_ms: now,
                                plugin: resolve(&self.plugins, activity),
                            },
                        );
                        info!("starting activity {}", activity.id);
                        counts.started += 1;
                    }
                }
            }

            let keep: HashSet<&str> = active_ids.iter().map(String::as_str).collect();
            let removed: Vec<String> = map.keys().filter(|id| !keep.contains(id.as_str())).cloned().collect();
            for id in removed {
                map.remove(&id);
                info!("stopping activity {}", id);
                self.cancelled.insert(id, now_ms());
                counts.stopped += 1;
            }
        }

        if let Err(e) = self.store.clear_offline_data(&active_ids) {
            warn!("clear offline data: {:#}", e);
        }

        self.pool.resize(desired_workers(list, self.max_workers));

        if counts.started + counts.updated > 0 {
            self.schedule_at(now);
        }

        info!("{} started; {} updated; {} stopped", counts.started, counts.updated, counts.stopped);
        counts
    }

    /// Queue a Job for every activity due within one tick from now.
    pub fn scheduling_pass(&mut self) -> usize {
        self.schedule_at(now_ms())
    }

    /// [`Self::scheduling_pass`] with an explicit clock.
    pub fn schedule_at(&mut self, now: u64) -> usize {
        let horizon = now.saturating_add(self.tick.as_millis() as u64);
        let mut jobs = Vec::new();
        {
            let mut map = self.activities.lock();
            for state in map.values_mut() {
                if state.next_exec_ms <= horizon {
                    jobs.push((Job::new(&state.activity, state.is_whitelisted, state.next_exec_ms), state.plugin.clone()));
                    state.next_exec_ms += state.activity.interval_ms();
                }
            }
        }

        jobs.sort_by_key(|(job, _)| job.scheduled_at());
        let count = jobs.len();
        if count > 0 {
            debug!("scheduling {} activities", count);
        }
        for (job, plugin) in jobs {
            self.pool.enqueue(job, plugin);
        }
        count
    }

    /// Kill overdue or cancelled Jobs and deliver every finished one.
    pub async fn reap(&mut self) -> usize {
        let cancel = std::mem::take(&mut self.cancelled);
        let done = self.executor.reap(&cancel).await;
        deliver(self.store.as_ref(), done)
    }

    /// One scheduler tick: schedule, then reap.
    pub async fn on_tick(&mut self) {
        self.scheduling_pass();
        self.reap().await;
    }

    /// Drain the pool, stop the engine and finalize whatever it still holds.
    pub async fn shutdown(&mut self) {
        self.pool.drain().await;
        self.reap().await;
        self.executor.stop().await;
        let left = self.executor.drain().await;
        if !left.is_empty() {
            info!("finalizing {} in-flight jobs", left.len());
        }
        deliver(self.store.as_ref(), left);
    }

    async fn run(mut self, mut ctx: ModuleCtx) -> Result<()> {
        let initial = ctx.activities.borrow_and_update().clone();
        self.apply_activities(&initial);

        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut listening = true;

        loop {
            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                changed = ctx.activities.changed(), if listening => {
                    if changed.is_ok() {
                        let list = ctx.activities.borrow_and_update().clone();
                        self.apply_activities(&list);
                    } else {
                        listening = false;
                    }
                }
                _ = shutdown_requested(&mut ctx.shutdown) => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }
}

impl Module for Scheduler {
    fn name(&self) -> &'static str { "scheduler" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn((*self).run(ctx))
    }
}

fn resolve(plugins: &PluginRegistry, activity: &Activity) -> Option<Arc<dyn Plugin>> {
    if activity.kind != ActivityKind::Plugin {
        return None;
    }
    let plugin = plugins.resolve(&activity.command);
    if plugin.is_none() {
        warn!("activity {} names unknown plugin {}", activity.id, activity.command);
    }
    plugin
}

/// Finalize `jobs` and push their records. Returns how many were pushed.
pub fn deliver(store: &dyn Store, jobs: Vec<Job>) -> usize {
    let mut pushed = 0;
    for mut job in jobs {
        let Some(record) = job.finalize() else { continue };
        debug!("pushing activity ({} @ {})", job.activity_id(), record.timestamp);
        match store.push(job.activity_id(), record) {
            Ok(()) => pushed += 1,
            Err(e) => warn!("push activity {}: {:#}", job.activity_id(), e),
        }
    }
    pushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use vigil_core::store::MemoryStore;

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<MemoryStore>,
        _shutdown: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn fixture(whitelist: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            temp_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let (tx, rx) = watch::channel(false);
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(Executor::new(ExecutorConfig::from_config(&cfg), rx.clone()));
        let scheduler = Scheduler::new(&cfg, store.clone(), executor, PluginRegistry::builtin(), rx).unwrap();
        Fixture { scheduler, store, _shutdown: tx, _dir: dir }
    }

    fn cmd(id: &str, command: &str, interval: u64) -> Activity {
        Activity { id: id.into(), command: command.into(), interval, kind: ActivityKind::Command }
    }

    fn plugin(id: &str, name: &str) -> Activity {
        Activity { id: id.into(), command: name.into(), interval: 30, kind: ActivityKind::Plugin }
    }

    #[test]
    fn worker_policy_caps_at_max() {
        assert_eq!(desired_workers(&[], 8), 0);
        assert_eq!(desired_workers(&[cmd("a", "x", 1), cmd("b", "y", 1)], 8), 1);
        let mut list = vec![cmd("a", "x", 1)];
        list.extend((0..10).map(|i| plugin(&format!("p{i}"), "uptime")));
        assert_eq!(desired_workers(&list, 8), 8);
        assert_eq!(desired_workers(&list[..3], 8), 3);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let mut f = fixture(&[]);
        let list = vec![cmd("a1", "echo hi", 60), plugin("p1", "loadavg")];
        assert_eq!(f.scheduler.apply_at(&list, 1_000), Reconciled { started: 2, updated: 0, stopped: 0 });
        assert_eq!(f.scheduler.apply_at(&list, 2_000), Reconciled::default());
        assert_eq!(f.scheduler.workers(), 2);
    }

    #[tokio::test]
    async fn shrinking_list_stops_and_clears_offline_data() {
        let mut f = fixture(&[]);
        f.scheduler.apply_at(&[cmd("a1", "echo hi", 60), cmd("a2", "date", 60)], 1_000);
        let counts = f.scheduler.apply_at(&[cmd("a1", "echo hi", 60)], 2_000);
        assert_eq!(counts, Reconciled { started: 0, updated: 0, stopped: 1 });
        assert_eq!(f.store.cleared().last().unwrap(), &vec!["a1".to_string()]);
        assert!(f.scheduler.directory().describe("a2").is_none());
        assert!(f.scheduler.cancelled.contains_key("a2"));
    }

    #[tokio::test]
    async fn update_resets_next_exec() {
        let mut f = fixture(&[]);
        f.scheduler.apply_at(&[cmd("a1", "echo hi", 60)], 1_000);
        let before = f.scheduler.directory().describe("a1").unwrap();
        assert_eq!(before.next_exec_ms, 61_000);

        let counts = f.scheduler.apply_at(&[cmd("a1", "echo hi", 120)], 5_000);
        assert_eq!(counts.updated, 1);
        // Rescheduled immediately, then advanced by the new interval.
        assert_eq!(f.scheduler.directory().describe("a1").unwrap().next_exec_ms, 125_000);
    }

    #[tokio::test]
    async fn fixed_cadence_ignores_dispatch_delay() {
        let mut f = fixture(&[]);
        f.scheduler.apply_at(&[cmd("a1", "echo hi", 60)], 0);
        let dir = f.scheduler.directory();
        let mut seen = vec![dir.describe("a1").unwrap().next_exec_ms];
        // Ticks arrive late and irregularly; the cadence stays fixed.
        for now in [57_000, 121_300, 179_999, 242_500] {
            assert_eq!(f.scheduler.schedule_at(now), 1);
            seen.push(dir.describe("a1").unwrap().next_exec_ms);
        }
        assert!(seen.windows(2).all(|w| w[1] - w[0] == 60_000));
    }

    #[tokio::test]
    async fn kind_change_is_an_update_and_cancels_in_flight_jobs() {
        let mut f = fixture(&[]);
        f.scheduler.apply_at(&[cmd("a1", "uptime", 60)], 1_000);
        let counts = f.scheduler.apply_at(&[plugin("a1", "uptime")], 2_000);
        assert_eq!(counts, Reconciled { started: 0, updated: 1, stopped: 0 });
        let view = f.scheduler.directory().describe("a1").unwrap();
        assert_eq!(view.activity.kind, ActivityKind::Plugin);
        assert!(f.scheduler.cancelled.contains_key("a1"));
        assert_eq!(f.scheduler.workers(), 1);
    }

    #[tokio::test]
    async fn only_due_activities_are_scheduled() {
        let mut f = fixture(&[]);
        f.scheduler.apply_at(&[cmd("a1", "echo hi", 60)], 0);
        // Next run at 60s; a tick at 10s with a 5s lookahead does nothing.
        assert_eq!(f.scheduler.schedule_at(10_000), 0);
        assert_eq!(f.scheduler.schedule_at(55_000), 1);
    }

    #[tokio::test]
    async fn whitelist_verdict_is_recorded() {
        let mut f = fixture(&["^echo"]);
        f.scheduler.apply_at(&[cmd("ok", "echo hi", 60), cmd("no", "rm -rf /", 60), plugin("p", "uptime")], 0);
        let dir = f.scheduler.directory();
        assert!(dir.describe("ok").unwrap().is_whitelisted);
        assert!(!dir.describe("no").unwrap().is_whitelisted);
        assert!(dir.describe("p").unwrap().is_whitelisted);
    }

    #[test]
    fn deliver_skips_jobs_without_records() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let a = cmd("a1", "echo hi", 60);
        let mut blocked = Job::new(&a, false, 0);
        blocked.prepare(dir.path());
        let pending = Job::new(&a, true, 0);
        assert_eq!(deliver(&store, vec![blocked, pending]), 1);
        assert_eq!(store.records()[0].0, "a1");
    }
}
