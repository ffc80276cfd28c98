use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

/// In-process data source backing a plugin activity.
pub trait Plugin: Send + Sync + 'static {
    /// Collect one sample. An error is reported as the Job's output.
    fn get_data(&self) -> Result<Value>;
}

/// Plugins addressable by an activity's `command`.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the procfs plugins shipped with the agent.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register("loadavg", ProcLoadAvg);
        reg.register("uptime", ProcUptime);
        reg.register("meminfo", ProcMemInfo);
        reg
    }

    /// Add or replace `name`.
    pub fn register<P: Plugin>(&mut self, name: &str, plugin: P) {
        self.plugins.insert(name.to_string(), Arc::new(plugin));
    }

    /// Plugin registered under `name`.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name.trim()).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }
}

fn read_proc(path: &str) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {path}"))
}

/// `/proc/loadavg`: 1, 5 and 15 minute load averages.
pub struct ProcLoadAvg;

impl Plugin for ProcLoadAvg {
    fn get_data(&self) -> Result<Value> {
        parse_loadavg(&read_proc("/proc/loadavg")?)
    }
}

fn parse_loadavg(text: &str) -> Result<Value> {
    let fields: Vec<f64> = text
        .split_whitespace()
        .take(3)
        .map(|f| f.parse::<f64>().with_context(|| format!("load value {f:?}")))
        .collect::<Result<_>>()?;
    let [load1, load5, load15] = fields.as_slice() else {
        bail!("short loadavg line {:?}", text.trim());
    };
    Ok(json!({ "load1": load1, "load5": load5, "load15": load15 }))
}

/// `/proc/uptime`: seconds since boot and idle seconds.
pub struct ProcUptime;

impl Plugin for ProcUptime {
    fn get_data(&self) -> Result<Value> {
        parse_uptime(&read_proc("/proc/uptime")?)
    }
}

fn parse_uptime(text: &str) -> Result<Value> {
    let mut it = text.split_whitespace();
    let up: f64 = it.next().context("empty uptime")?.parse().context("uptime seconds")?;
    let idle: f64 = it.next().context("missing idle time")?.parse().context("idle seconds")?;
    Ok(json!({ "uptime": up, "idle": idle }))
}

/// `/proc/meminfo`: every counter, in kB.
pub struct ProcMemInfo;

impl Plugin for ProcMemInfo {
    fn get_data(&self) -> Result<Value> {
        parse_meminfo(&read_proc("/proc/meminfo")?)
    }
}

fn parse_meminfo(text: &str) -> Result<Value> {
    let mut out = Map::new();
    for line in text.lines() {
        let Some((name, rest)) = line.split_once(':') else { continue };
        let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        out.insert(name.trim().to_string(), Value::from(value));
    }
    if out.is_empty() {
        bail!("no counters in meminfo");
    }
    Ok(Value::Object(out))
}
