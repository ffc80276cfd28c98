use regex::Regex;
use serde::{Deserialize, Serialize};

/// How an activity is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Shell command line run through the helper subprocess.
    #[default]
    Command,
    /// In-process plugin; `command` names the plugin.
    Plugin,
}

/// A configured, recurring unit of monitoring work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Opaque activity id.
    pub id: String,
    /// Shell command line, or plugin name for [`ActivityKind::Plugin`].
    pub command: String,
    /// Seconds between executions (> 0).
    pub interval: u64,
    /// Execution kind.
    #[serde(default)]
    pub kind: ActivityKind,
}

impl Activity {
    /// Interval in milliseconds.
    pub fn interval_ms(&self) -> u64 {
        self.interval.saturating_mul(1000)
    }

    /// Whether this activity runs in-process.
    pub fn is_plugin(&self) -> bool {
        self.kind == ActivityKind::Plugin
    }
}

/// Ordered set of command patterns. An empty whitelist allows everything.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    patterns: Vec<Regex>,
}

impl Whitelist {
    /// Compile `patterns` in order.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Number of configured patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// True when no pattern is configured (allow all).
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// A pattern matches when it matches at the start of `command`.
    pub fn allows_command(&self, command: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns
            .iter()
            .any(|re| re.find(command).is_some_and(|m| m.start() == 0))
    }

    /// Plugins are always allowed; commands are checked against the patterns.
    pub fn allows(&self, activity: &Activity) -> bool {
        activity.is_plugin() || self.allows_command(&activity.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(command: &str) -> Activity {
        Activity { id: "a".into(), command: command.into(), interval: 10, kind: ActivityKind::Command }
    }

    #[test]
    fn empty_whitelist_allows_all() {
        let wl = Whitelist::default();
        assert!(wl.allows(&cmd("rm -rf /tmp/x")));
    }

    #[test]
    fn patterns_are_anchored_at_start() {
        let wl = Whitelist::new(&["echo", "df( -h)?$"]).unwrap();
        assert!(wl.allows(&cmd("echo hi")));
        assert!(wl.allows(&cmd("df -h")));
        assert!(!wl.allows(&cmd("sudo echo hi")));
        assert!(!wl.allows(&cmd("df -i")));
    }

    #[test]
    fn plugins_bypass_whitelist() {
        let wl = Whitelist::new(&["^uptime$"]).unwrap();
        let mut a = cmd("loadavg");
        assert!(!wl.allows(&a));
        a.kind = ActivityKind::Plugin;
        assert!(wl.allows(&a));
    }

    #[test]
    fn kind_defaults_to_command() {
        let a: Activity = toml::from_str("id = \"x\"\ncommand = \"true\"\ninterval = 5\n").unwrap();
        assert_eq!(a.kind, ActivityKind::Command);
    }
}
