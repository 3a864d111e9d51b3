//! Unit manager seam and its `systemctl` implementation

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployError;
use crate::process::{combined_output, run_captured};

/// Properties read for status, backups, and verification
pub const PROPERTIES: &[&str] = &[
    "LoadState",
    "ActiveState",
    "SubState",
    "MainPID",
    "MemoryCurrent",
    "CPUUsageNSec",
    "NRestarts",
    "Result",
    "StartTimestamp",
];

/// Parsed `systemctl show` output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitProperties {
    pub load_state: String,
    pub active_state: String,
    pub main_pid: u32,
    pub memory_current: Option<u64>,
    pub cpu_usage_nsec: Option<u64>,
    pub n_restarts: u32,
    pub result: String,
    pub start_timestamp: Option<DateTime<Utc>>,

    /// Every property as reported
    pub raw: BTreeMap<String, String>,
}

impl UnitProperties {
    /// Parse `Key=Value` lines
    pub fn parse(output: &str) -> Self {
        let raw: BTreeMap<String, String> = output
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        let text = |key: &str| raw.get(key).cloned().unwrap_or_default();
        let number = |key: &str| raw.get(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            load_state: text("LoadState"),
            active_state: text("ActiveState"),
            main_pid: number("MainPID").unwrap_or(0) as u32,
            memory_current: number("MemoryCurrent"),
            cpu_usage_nsec: number("CPUUsageNSec"),
            n_restarts: number("NRestarts").unwrap_or(0) as u32,
            result: text("Result"),
            start_timestamp: raw.get("StartTimestamp").and_then(|v| parse_timestamp(v)),
            raw,
        }
    }

    /// Whether the unit has no running processes
    pub fn is_stopped(&self) -> bool {
        matches!(self.active_state.as_str(), "inactive" | "failed")
            || self.load_state == "not-found"
    }
}

/// Parse a systemd timestamp: `@<unix seconds>` or `Thu 2024-01-04 10:00:00 UTC`
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() || value == "n/a" {
        return None;
    }
    if let Some(secs) = value.strip_prefix('@') {
        return secs
            .parse::<i64>()
            .ok()
            .and_then(|s| DateTime::from_timestamp(s, 0));
    }

    let parts: Vec<&str> = value.split_whitespace().collect();
    let (date, time, zone) = match parts.as_slice() {
        [_weekday, date, time, zone] => (*date, *time, Some(*zone)),
        [_weekday, date, time] => (*date, *time, None),
        _ => return None,
    };
    let stamp = format!("{} {}", date, time);
    let naive = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S").ok()?;
    match zone {
        Some("UTC") | Some("GMT") => Some(Utc.from_utc_datetime(&naive)),
        _ => Local
            .from_local_datetime(&naive)
            .single()
            .map(|t| t.with_timezone(&Utc)),
    }
}

/// Unit lifecycle operations.
///
/// Implementations report a unit systemd does not know as
/// [`DeployError::NotFound`].
#[async_trait]
pub trait UnitManager: Send + Sync {
    /// Make a unit file outside the search path visible to systemd
    async fn link(&self, unit_file: &Path) -> Result<(), DeployError>;

    async fn enable(&self, unit: &str) -> Result<(), DeployError>;

    async fn reload(&self) -> Result<(), DeployError>;

    async fn start(&self, unit: &str) -> Result<(), DeployError>;

    /// Stop the unit and wait for the job to finish
    async fn stop(&self, unit: &str) -> Result<(), DeployError>;

    /// Send a signal (e.g. `SIGKILL`) to every process of the unit
    async fn kill(&self, unit: &str, signal: &str) -> Result<(), DeployError>;

    async fn disable(&self, unit: &str) -> Result<(), DeployError>;

    async fn properties(&self, unit: &str) -> Result<UnitProperties, DeployError>;
}

/// [`UnitManager`] driving the `systemctl` binary
#[derive(Debug, Clone)]
pub struct Systemctl {
    bin: PathBuf,
}

impl Default for Systemctl {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("systemctl"),
        }
    }
}

impl Systemctl {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    /// Fails when systemd cannot be reached
    pub async fn probe(&self) -> Result<(), DeployError> {
        self.run(&["is-system-running"]).await.or_else(|e| match e {
            // degraded and friends exit non-zero but prove systemd is there
            DeployError::Backend(ref msg)
                if !msg.contains("Failed to connect") && !msg.contains("not been booted") =>
            {
                Ok(String::new())
            }
            other => Err(other),
        })?;
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<String, DeployError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        debug!("systemctl {}", args.join(" "));

        let output = run_captured(cmd, "systemctl").await?;
        let text = combined_output(&output);
        if output.status.success() {
            return Ok(text);
        }

        let message = format!("systemctl {} failed: {}", args.join(" "), text.trim_end());
        if is_missing_unit(&text) {
            Err(DeployError::NotFound(message))
        } else {
            Err(DeployError::Backend(message))
        }
    }
}

fn is_missing_unit(output: &str) -> bool {
    output.contains("not loaded")
        || output.contains("not found")
        || output.contains("does not exist")
}

#[async_trait]
impl UnitManager for Systemctl {
    async fn link(&self, unit_file: &Path) -> Result<(), DeployError> {
        let path = unit_file.to_string_lossy();
        self.run(&["link", path.as_ref()]).await.map(|_| ())
    }

    async fn enable(&self, unit: &str) -> Result<(), DeployError> {
        self.run(&["enable", unit]).await.map(|_| ())
    }

    async fn reload(&self) -> Result<(), DeployError> {
        self.run(&["daemon-reload"]).await.map(|_| ())
    }

    async fn start(&self, unit: &str) -> Result<(), DeployError> {
        self.run(&["start", unit]).await.map(|_| ())
    }

    async fn stop(&self, unit: &str) -> Result<(), DeployError> {
        self.run(&["stop", unit]).await.map(|_| ())
    }

    async fn kill(&self, unit: &str, signal: &str) -> Result<(), DeployError> {
        let signal = format!("--signal={}", signal);
        self.run(&["kill", signal.as_str(), unit]).await.map(|_| ())
    }

    async fn disable(&self, unit: &str) -> Result<(), DeployError> {
        self.run(&["disable", unit]).await.map(|_| ())
    }

    async fn properties(&self, unit: &str) -> Result<UnitProperties, DeployError> {
        let property = format!("--property={}", PROPERTIES.join(","));
        let output = self.run(&["show", unit, property.as_str()]).await?;
        Ok(UnitProperties::parse(&output))
    }
}
