use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Read;
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityKind};

/// Largest amount of captured output delivered for one Job.
pub const MAX_OUTPUT_BYTES: u64 = 256 * 1024;

/// Advisory text for a Job still running whose pid never arrived.
pub const MSG_NO_STATUS: &str = "Failed to retrieve execution status.";
/// Advisory text for a Job refused by the whitelist.
pub const MSG_BLOCKED: &str = "Command blocked by whitelist.";
/// Advisory text for a Job killed by the reap sweep.
pub const MSG_TIMED_OUT: &str = "Command exceeded timeout.";
/// Data sent when a finished Job produced nothing.
pub const MSG_NO_OUTPUT: &str = "No output produced";

/// Job lifecycle. `Blocked`, `TimedOut` and `Finished` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created by the scheduler, not yet dispatched.
    Initialized,
    /// Refused by the whitelist.
    Blocked,
    /// Dispatched and awaiting a return code.
    Running,
    /// Killed after exceeding the timeout or cancelled.
    TimedOut,
    /// Return code observed.
    Finished,
}

impl JobStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Blocked | JobStatus::TimedOut | JobStatus::Finished)
    }
}

/// User-visible result of one Job, handed to the Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    /// Actual start time of the Job (ms since epoch).
    pub timestamp: u64,
    /// Exit code, or 0 for advisory records.
    pub return_code: i32,
    /// Captured output, plugin value, or advisory text.
    pub data: Value,
}

/// Partial field update merged into a Job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    /// Process id of the forked command.
    pub pid: Option<i32>,
    /// Exit code; its presence finishes the Job.
    pub return_code: Option<i32>,
    /// Output value replacing the Job's sink.
    pub output: Option<Value>,
    /// Fields with no meaning to the Job, kept as-is.
    pub extra: Vec<(String, String)>,
}

impl JobUpdate {
    /// Update carrying only a pid.
    pub fn pid(pid: i32) -> Self {
        Self { pid: Some(pid), ..Self::default() }
    }

    /// Update carrying only a return code.
    pub fn return_code(code: i32) -> Self {
        Self { return_code: Some(code), ..Self::default() }
    }

    /// Completed in-process execution.
    pub fn completed(code: i32, output: Value) -> Self {
        Self { return_code: Some(code), output: Some(output), ..Self::default() }
    }

    /// Dispatch fault: `returnCode=1` with the fault text as output.
    pub fn fault(err: impl Display) -> Self {
        Self::completed(1, Value::String(err.to_string()))
    }

    /// Build from a `<field> <value>` pair read off the helper protocol.
    /// Returns `None` when a known field carries an unparsable value.
    pub fn from_field(name: &str, value: &str) -> Option<Self> {
        match name {
            "pid" => value.parse().ok().map(Self::pid),
            "return_code" => value.parse().ok().map(Self::return_code),
            _ => Some(Self { extra: vec![(name.to_string(), value.to_string())], ..Self::default() }),
        }
    }
}

/// Where a Job's output lives.
#[derive(Debug)]
enum Output {
    Empty,
    File(NamedTempFile),
    Value(Value),
}

/// One scheduled execution of one activity.
#[derive(Debug)]
pub struct Job {
    activity_id: String,
    command: String,
    kind: ActivityKind,
    is_whitelisted: bool,
    scheduled_at: u64,
    started_at: u64,
    pid: i32,
    return_code: i32,
    output: Output,
    status: JobStatus,
    extra: BTreeMap<String, String>,
}

impl Job {
    /// New Job for `activity`, due at `scheduled_at` (ms since epoch).
    pub fn new(activity: &Activity, is_whitelisted: bool, scheduled_at: u64) -> Self {
        Self {
            activity_id: activity.id.clone(),
            command: activity.command.clone(),
            kind: activity.kind,
            is_whitelisted,
            scheduled_at,
            started_at: 0,
            pid: -1,
            return_code: 0,
            output: Output::Empty,
            status: JobStatus::Initialized,
            extra: BTreeMap::new(),
        }
    }

    /// Activity this Job belongs to.
    pub fn activity_id(&self) -> &str { &self.activity_id }
    /// Command line or plugin name.
    pub fn command(&self) -> &str { &self.command }
    /// Execution kind.
    pub fn kind(&self) -> ActivityKind { self.kind }
    /// Whitelist verdict captured at scheduling time.
    pub fn is_whitelisted(&self) -> bool { self.is_whitelisted }
    /// Intended fire time (ms).
    pub fn scheduled_at(&self) -> u64 { self.scheduled_at }
    /// Actual dispatch time (ms), 0 before `prepare`.
    pub fn started_at(&self) -> u64 { self.started_at }
    /// Forked process id, -1 until known.
    pub fn pid(&self) -> i32 { self.pid }
    /// Last observed return code.
    pub fn return_code(&self) -> i32 { self.return_code }
    /// Current state.
    pub fn status(&self) -> JobStatus { self.status }
    /// Value of a field the Job does not interpret.
    pub fn extra(&self, name: &str) -> Option<&str> { self.extra.get(name).map(String::as_str) }

    /// Path of the output file for a running Command Job.
    pub fn output_path(&self) -> Option<&Path> {
        match &self.output {
            Output::File(f) => Some(f.path()),
            _ => None,
        }
    }

    /// Record the start time and leave `Initialized`. Whitelisted Command
    /// Jobs get a temp output file in `temp_dir`; if it cannot be created
    /// the Job still runs and `output_path` stays `None`.
    pub fn prepare(&mut self, temp_dir: &Path) -> u64 {
        self.prepare_at(temp_dir, crate::now_ms())
    }

    /// [`Self::prepare`] with an explicit start time.
    pub fn prepare_at(&mut self, temp_dir: &Path, t: u64) -> u64 {
        self.started_at = t;

        if !self.is_whitelisted {
            info!("activity {} is blocked by whitelist", self.activity_id);
            self.status = JobStatus::Blocked;
            return t;
        }

        debug!("executing activity ({} @ {})", self.activity_id, t);
        if self.kind == ActivityKind::Command {
            match NamedTempFile::new_in(temp_dir) {
                Ok(f) => self.output = Output::File(f),
                Err(e) => warn!("activity ({} @ {}) output file in {}: {}", self.activity_id, t, temp_dir.display(), e),
            }
        }
        self.status = JobStatus::Running;
        t
    }

    /// Merge `update` into the Job. A return code finishes a running Job.
    pub fn update(&mut self, update: JobUpdate) {
        if let Some(pid) = update.pid {
            self.pid = pid;
        }
        if let Some(output) = update.output {
            self.output = Output::Value(output);
        }
        self.extra.extend(update.extra);
        if let Some(code) = update.return_code {
            self.return_code = code;
            if self.status == JobStatus::Running {
                self.status = JobStatus::Finished;
            }
        }
    }

    /// Mark the Job timed out and SIGTERM its process if the pid is known.
    /// Returns whether a signal was delivered.
    pub fn kill(&mut self) -> bool {
        self.status = JobStatus::TimedOut;
        if self.pid <= 0 {
            return false;
        }
        kill(Pid::from_raw(self.pid), Signal::SIGTERM).is_ok()
    }

    /// Drop the output sink, removing any temp file.
    pub fn release(&mut self) {
        if let Output::File(f) = std::mem::replace(&mut self.output, Output::Empty) {
            let path = f.path().to_path_buf();
            if let Err(e) = f.close() {
                debug!("remove {}: {}", path.display(), e);
            }
        }
    }

    /// Map the Job's state to a delivery record and release its sink.
    /// `None` when the state has nothing to report yet.
    pub fn finalize(&mut self) -> Option<DeliveryRecord> {
        let outcome = match self.status {
            JobStatus::Running if self.pid == -1 => Some((0, Value::from(MSG_NO_STATUS))),
            JobStatus::Blocked => Some((0, Value::from(MSG_BLOCKED))),
            JobStatus::TimedOut => Some((0, Value::from(MSG_TIMED_OUT))),
            JobStatus::Finished => Some((self.return_code, self.read_output())),
            JobStatus::Running | JobStatus::Initialized => None,
        };
        self.release();
        outcome.map(|(return_code, data)| DeliveryRecord { timestamp: self.started_at, return_code, data })
    }

    fn read_output(&self) -> Value {
        let data = match &self.output {
            Output::File(f) => {
                let mut buf = Vec::new();
                let read = f
                    .reopen()
                    .and_then(|file| file.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf));
                if let Err(e) = read {
                    warn!("read output of activity ({} @ {}): {}", self.activity_id, self.started_at, e);
                }
                output_value(buf)
            }
            Output::Value(v) => v.clone(),
            Output::Empty => Value::Null,
        };
        match &data {
            Value::Null => Value::from(MSG_NO_OUTPUT),
            Value::String(s) if s.is_empty() => {
                debug!("no output for activity ({} @ {})", self.activity_id, self.started_at);
                Value::from(MSG_NO_OUTPUT)
            }
            _ => data,
        }
    }
}

/// Text when `buf` is UTF-8, dropping a character split by the cap;
/// the raw bytes otherwise.
fn output_value(buf: Vec<u8>) -> Value {
    match String::from_utf8(buf) {
        Ok(s) => Value::String(s),
        Err(e) if e.utf8_error().error_len().is_none() => {
            let valid = e.utf8_error().valid_up_to();
            let mut bytes = e.into_bytes();
            bytes.truncate(valid);
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        Err(e) => Value::from(e.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;

    fn activity(kind: ActivityKind) -> Activity {
        Activity { id: "a1".into(), command: "echo hi".into(), interval: 60, kind }
    }

    #[test]
    fn whitelisted_command_runs_with_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        let t = job.prepare(dir.path());
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.started_at(), t);
        assert!(job.output_path().unwrap().starts_with(dir.path()));
    }

    #[test]
    fn non_whitelisted_job_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), false, 0);
        let t = job.prepare(dir.path());
        assert_eq!(job.status(), JobStatus::Blocked);
        assert!(job.output_path().is_none());
        let rec = job.finalize().unwrap();
        assert_eq!(rec, DeliveryRecord { timestamp: t, return_code: 0, data: Value::from(MSG_BLOCKED) });
    }

    #[test]
    fn return_code_finishes_and_output_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        let path = job.output_path().unwrap().to_path_buf();
        fs::write(&path, "hi\n").unwrap();

        job.update(JobUpdate::pid(4242));
        assert_eq!(job.status(), JobStatus::Running);
        job.update(JobUpdate::return_code(0));
        assert_eq!(job.status(), JobStatus::Finished);

        let rec = job.finalize().unwrap();
        assert_eq!(rec.return_code, 0);
        assert_eq!(rec.data, Value::from("hi\n"));
        assert!(!path.exists());
    }

    #[test]
    fn empty_output_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        job.update(JobUpdate::return_code(3));
        let rec = job.finalize().unwrap();
        assert_eq!(rec.return_code, 3);
        assert_eq!(rec.data, Value::from(MSG_NO_OUTPUT));
    }

    #[test]
    fn output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        fs::write(job.output_path().unwrap(), vec![b'x'; 300 * 1024]).unwrap();
        job.update(JobUpdate::return_code(0));
        let rec = job.finalize().unwrap();
        assert_eq!(rec.data.as_str().unwrap().len(), MAX_OUTPUT_BYTES as usize);
    }

    #[test]
    fn cap_never_splits_a_character() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        let text = format!("x{}", "\u{e9}".repeat(140_000));
        fs::write(job.output_path().unwrap(), text).unwrap();
        job.update(JobUpdate::return_code(0));
        let rec = job.finalize().unwrap();
        let data = rec.data.as_str().unwrap();
        assert_eq!(data.len(), MAX_OUTPUT_BYTES as usize - 1);
        assert!(data.ends_with('\u{e9}'));
    }

    #[test]
    fn binary_output_is_delivered_as_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        fs::write(job.output_path().unwrap(), [0xff, 0xfe, b'a']).unwrap();
        job.update(JobUpdate::return_code(0));
        let rec = job.finalize().unwrap();
        assert_eq!(rec.data, serde_json::json!([255, 254, 97]));
    }

    #[test]
    fn prepare_at_uses_given_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        assert_eq!(job.prepare_at(dir.path(), 42), 42);
        assert_eq!(job.started_at(), 42);
    }

    #[test]
    fn kill_without_pid_times_out_silently() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        let path = job.output_path().unwrap().to_path_buf();
        assert!(!job.kill());
        assert_eq!(job.status(), JobStatus::TimedOut);
        let rec = job.finalize().unwrap();
        assert_eq!(rec.data, Value::from(MSG_TIMED_OUT));
        assert!(!path.exists());
    }

    #[test]
    fn kill_signals_known_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        job.update(JobUpdate::pid(child.id() as i32));
        assert!(job.kill());
        let status = child.wait().unwrap();
        assert!(!status.success());
        // A late return code does not revive a killed job.
        job.update(JobUpdate::return_code(143));
        assert_eq!(job.status(), JobStatus::TimedOut);
    }

    #[test]
    fn running_without_pid_reports_missing_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        let rec = job.finalize().unwrap();
        assert_eq!(rec.data, Value::from(MSG_NO_STATUS));

        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.prepare(dir.path());
        job.update(JobUpdate::pid(1234));
        assert!(job.finalize().is_none());
    }

    #[test]
    fn plugin_job_keeps_value_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(&activity(ActivityKind::Plugin), true, 0);
        job.prepare(dir.path());
        assert!(job.output_path().is_none());
        job.update(JobUpdate::completed(0, serde_json::json!({"load1": 0.5})));
        let rec = job.finalize().unwrap();
        assert_eq!(rec.data["load1"], 0.5);
    }

    #[test]
    fn unknown_fields_are_stored() {
        let mut job = Job::new(&activity(ActivityKind::Command), true, 0);
        job.update(JobUpdate::from_field("signal", "TERM").unwrap());
        assert_eq!(job.extra("signal"), Some("TERM"));
        assert_eq!(job.status(), JobStatus::Initialized);
        assert!(JobUpdate::from_field("pid", "abc").is_none());
    }
}
