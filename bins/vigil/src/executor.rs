use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use vigil_core::activity::ActivityKind;
use vigil_core::cfg::Config;
use vigil_core::job::{Job, JobStatus, JobUpdate};
use vigil_core::now_ms;

use crate::module::shutdown_requested;
use crate::plugin::Plugin;
use crate::protocol::{format_request, parse_response};

/// Bash program implementing the helper side of the line protocol.
pub const HELPER_SCRIPT: &str = include_str!("../assets/execute.sh");

/// Settings for an [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long a Job may stay running before the reap sweep kills it.
    pub timeout: Duration,
    /// Directory receiving command output files.
    pub temp_dir: PathBuf,
    /// Extra environment for the helper and its commands.
    pub env: BTreeMap<String, String>,
    /// Shell used to run the helper script.
    pub shell: PathBuf,
}

impl ExecutorConfig {
    /// Settings derived from the agent config.
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: cfg.command_timeout(),
            temp_dir: cfg.temp_dir(),
            env: cfg.env.clone(),
            shell: PathBuf::from("bash"),
        }
    }
}

/// Active Jobs keyed by start time (ms).
#[derive(Default)]
struct Registry {
    jobs: HashMap<u64, Job>,
    last_key: u64,
}

struct Helper {
    child: Child,
    stdin: ChildStdin,
}

/// Runs Jobs: commands through one persistent helper shell, plugins in-process.
pub struct Executor {
    config: ExecutorConfig,
    registry: Arc<Mutex<Registry>>,
    helper: Mutex<Option<Helper>>,
    stopped: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl Executor {
    /// New engine; the helper is spawned on first use.
    pub fn new(config: ExecutorConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
            helper: Mutex::new(None),
            stopped: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Configured command timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Prepare `job`, register it and dispatch it. Returns the registry key.
    /// Faults while dispatching are recorded on the Job, never returned.
    pub async fn submit(&self, mut job: Job, plugin: Option<Arc<dyn Plugin>>) -> u64 {
        let (key, running, output, command, kind) = {
            let mut reg = self.registry.lock().await;
            // Keys are start times; wait out the millisecond of the previous Job.
            let mut now = now_ms();
            if now == reg.last_key {
                sleep(Duration::from_millis(1)).await;
                now = now_ms();
            }
            let key = job.prepare_at(&self.config.temp_dir, spaced_key(now, reg.last_key));
            reg.last_key = key;
            let running = job.status() == JobStatus::Running;
            let output = job.output_path().map(|p| p.to_path_buf());
            let command = job.command().to_string();
            let kind = job.kind();
            reg.jobs.insert(key, job);
            (key, running, output, command, kind)
        };

        if !running {
            return key;
        }

        match kind {
            ActivityKind::Command => {
                let result = match output {
                    Some(path) => self.write(&format_request(key, &path, &command)).await,
                    None => Err(anyhow!("no output file for command")),
                };
                if let Err(e) = result {
                    warn!("dispatch of job {} failed: {:#}", key, e);
                    self.apply(key, JobUpdate::fault(format!("{e:#}"))).await;
                }
            }
            ActivityKind::Plugin => {
                let update = run_plugin(plugin, &command).await;
                self.apply(key, update).await;
            }
        }
        key
    }

    async fn apply(&self, key: u64, update: JobUpdate) {
        let mut reg = self.registry.lock().await;
        match reg.jobs.get_mut(&key) {
            Some(job) => job.update(update),
            None => trace!("no active job {}", key),
        }
    }

    /// Status of the registered Job `key`.
    pub async fn status_of(&self, key: u64) -> Option<JobStatus> {
        self.registry.lock().await.jobs.get(&key).map(Job::status)
    }

    /// Number of registered Jobs.
    pub async fn active(&self) -> usize {
        self.registry.lock().await.jobs.len()
    }

    /// Pid of the helper shell, if one is running.
    pub async fn helper_pid(&self) -> Option<u32> {
        self.helper.lock().await.as_ref().and_then(|h| h.child.id())
    }

    /// Sweep the registry. Jobs started before their activity's cutoff in
    /// `cancel` are killed, released and dropped; running Jobs past the
    /// timeout are killed. Every Job no longer running is removed and
    /// returned, oldest first.
    pub async fn reap(&self, cancel: &HashMap<String, u64>) -> Vec<Job> {
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let mut reg = self.registry.lock().await;
        let now = now_ms();
        let keys: Vec<u64> = reg.jobs.keys().copied().collect();
        let mut done = Vec::new();

        for key in keys {
            let Some(job) = reg.jobs.get_mut(&key) else { continue };

            if cancel.get(job.activity_id()).is_some_and(|&cutoff| job.started_at() < cutoff) {
                if job.status() == JobStatus::Running {
                    job.kill();
                }
                job.release();
                info!("cancelled activity ({} @ {})", job.activity_id(), key);
                reg.jobs.remove(&key);
                continue;
            }

            if job.status() == JobStatus::Running && now.saturating_sub(job.started_at()) > timeout_ms {
                if job.kill() {
                    info!("killed activity ({} @ {}) as it exceeded timeout", job.activity_id(), key);
                } else {
                    info!("activity ({} @ {}) exceeded timeout with no process to kill", job.activity_id(), key);
                }
            }

            if job.status() != JobStatus::Running {
                if let Some(job) = reg.jobs.remove(&key) {
                    done.push(job);
                }
            }
        }

        done.sort_by_key(Job::started_at);
        done
    }

    /// Remove and return every registered Job.
    pub async fn drain(&self) -> Vec<Job> {
        let mut reg = self.registry.lock().await;
        let mut jobs: Vec<Job> = reg.jobs.drain().map(|(_, job)| job).collect();
        jobs.sort_by_key(Job::started_at);
        jobs
    }

    /// Stop accepting commands, kill the helper with its process group and
    /// wait for it.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut slot = self.helper.lock().await;
        let Some(helper) = slot.take() else { return };
        let Helper { mut child, stdin } = helper;
        drop(stdin);

        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("killpg helper {}: {}", pid, e);
            }
        }
        if let Err(e) = child.start_kill() {
            debug!("kill helper: {}", e);
        }
        match child.wait().await {
            Ok(status) => info!("helper exited with {}", status),
            Err(e) => warn!("wait for helper: {}", e),
        }
    }

    async fn write(&self, line: &str) -> Result<()> {
        let mut slot = self.helper.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            bail!("engine stopped");
        }

        let alive = match slot.as_mut() {
            Some(helper) => matches!(helper.child.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            if slot.take().is_some() {
                info!("helper exited; respawning");
            }
            *slot = Some(self.spawn_helper()?);
        }

        let helper = slot.as_mut().ok_or_else(|| anyhow!("helper unavailable"))?;
        helper.stdin.write_all(line.as_bytes()).await.context("write to helper")?;
        helper.stdin.flush().await.context("flush helper stdin")?;
        Ok(())
    }

    fn spawn_helper(&self) -> Result<Helper> {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(HELPER_SCRIPT)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn helper via {}", self.config.shell.display()))?;
        let stdin = child.stdin.take().context("helper stdin")?;
        let stdout = child.stdout.take().context("helper stdout")?;
        info!("helper started pid={:?}", child.id());

        tokio::spawn(read_responses(stdout, self.registry.clone(), self.shutdown.clone()));
        Ok(Helper { child, stdin })
    }
}

/// Next registry key: the clock, or one past the last key when the clock
/// has not moved forward.
fn spaced_key(now: u64, last_key: u64) -> u64 {
    now.max(last_key + 1)
}

/// Apply helper responses to the registry until EOF or shutdown.
async fn read_responses(stdout: ChildStdout, registry: Arc<Mutex<Registry>>, mut shutdown: watch::Receiver<bool>) {
    let mut lines = BufReader::new(stdout).split(b'\n');
    loop {
        let segment = tokio::select! {
            seg = lines.next_segment() => seg,
            _ = shutdown_requested(&mut shutdown) => break,
        };
        let bytes = match segment {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("helper output closed");
                break;
            }
            Err(e) => {
                debug!("read from helper: {}", e);
                break;
            }
        };
        let line = String::from_utf8_lossy(&bytes);
        match parse_response(&line) {
            Ok(resp) => {
                let mut reg = registry.lock().await;
                match reg.jobs.get_mut(&resp.key) {
                    Some(job) => job.update(resp.update),
                    None => trace!("no active job for {:?}", line),
                }
            }
            Err(e) => trace!("dropping helper line {:?}: {}", line, e),
        }
    }
    debug!("helper reader stopped");
}

async fn run_plugin(plugin: Option<Arc<dyn Plugin>>, name: &str) -> JobUpdate {
    let Some(plugin) = plugin else {
        return JobUpdate::fault(format!("unknown plugin {name}"));
    };
    match tokio::task::spawn_blocking(move || plugin.get_data()).await {
        Ok(Ok(value)) => JobUpdate::completed(0, value),
        Ok(Err(e)) => JobUpdate::fault(format!("{e:#}")),
        Err(e) => JobUpdate::fault(format!("plugin {name} failed: {e}")),
    }
}
