//! systemd unit file rendering

use std::collections::HashMap;
use std::fmt::Write;
use std::path::Path;

use crate::runtime::ResourceLimits;

/// Unit file name for a build
pub fn unit_name(build_id: &str) -> String {
    format!("ajime-{}.service", build_id)
}

/// Config keys mapped to systemd resource-control directives, in output order
const LIMIT_KEYS: &[(&str, &str, &str)] = &[
    ("cpu.limit", "CPUQuota", "%"),
    ("cpu.shares", "CPUShares", ""),
    ("memory.limit", "MemoryLimit", ""),
    ("memory.swap", "MemorySwapMax", ""),
    ("tasks.max", "TasksMax", ""),
    ("io.weight", "IOWeight", ""),
];

/// Used when neither the config nor the runtime hints set a limit
pub const DEFAULT_LIMITS: &[&str] = &["CPUQuota=100%", "MemoryLimit=512M", "TasksMax=32"];

/// Resource-control directives for a unit.
///
/// Explicit config keys win; runtime resource hints fill in CPU and memory
/// when their keys are absent.
pub fn resource_limits(
    config: &HashMap<String, String>,
    resources: &ResourceLimits,
) -> Vec<String> {
    let mut limits = Vec::new();
    for (key, directive, suffix) in LIMIT_KEYS {
        if let Some(value) = config.get(*key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            let value = if suffix.is_empty() { value } else { value.trim_end_matches(suffix) };
            limits.push(format!("{}={}{}", directive, value, suffix));
        }
    }

    if !config.contains_key("cpu.limit") && resources.cpu_millis > 0 {
        limits.push(format!("CPUQuota={}%", resources.cpu_millis / 10));
    }
    if !config.contains_key("memory.limit") && resources.memory_bytes > 0 {
        limits.push(format!("MemoryLimit={}", resources.memory_bytes));
    }

    if limits.is_empty() {
        limits = DEFAULT_LIMITS.iter().map(|l| l.to_string()).collect();
    }
    limits
}

/// Everything that goes into a rendered unit
#[derive(Debug, Clone)]
pub struct UnitTemplate<'a> {
    pub build_id: &'a str,
    pub exec_start: &'a Path,
    pub working_dir: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub limits: Vec<String>,
    pub auto_restart: bool,
}

/// Quote a value for an `Environment=` assignment
fn quote_env(key: &str, value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%");
    format!("\"{}={}\"", key, escaped)
}

impl UnitTemplate<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[Unit]");
        let _ = writeln!(out, "Description=Ajime deployment {}", self.build_id);
        let _ = writeln!(out, "Documentation=https://ajime.io/docs");
        let _ = writeln!(out, "After=network.target");
        let _ = writeln!(out);

        let _ = writeln!(out, "[Service]");
        let _ = writeln!(out, "Type=simple");
        let _ = writeln!(out, "ExecStart={}", self.exec_start.display());
        let _ = writeln!(out, "WorkingDirectory={}", self.working_dir.display());

        let mut env: Vec<_> = self.env.iter().collect();
        env.sort();
        for (key, value) in env {
            let _ = writeln!(out, "Environment={}", quote_env(key, value));
        }

        let restart = if self.auto_restart { "always" } else { "on-failure" };
        let _ = writeln!(out, "Restart={}", restart);
        let _ = writeln!(out, "RestartSec=10");
        let _ = writeln!(out, "TimeoutStartSec=30");
        let _ = writeln!(out, "TimeoutStopSec=30");
        let _ = writeln!(out);

        let _ = writeln!(out, "# Resource limits");
        for limit in &self.limits {
            let _ = writeln!(out, "{}", limit);
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "# Sandboxing");
        for directive in [
            "NoNewPrivileges=yes",
            "ProtectSystem=full",
            "ProtectHome=read-only",
            "PrivateTmp=yes",
            "PrivateDevices=yes",
            "ProtectKernelTunables=yes",
            "ProtectKernelModules=yes",
            "ProtectControlGroups=yes",
            "RestrictAddressFamilies=AF_INET AF_INET6 AF_UNIX",
            "RestrictNamespaces=yes",
        ] {
            let _ = writeln!(out, "{}", directive);
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "StandardOutput=journal");
        let _ = writeln!(out, "StandardError=journal");
        let _ = writeln!(out, "SyslogIdentifier=ajime-{}", self.build_id);
        let _ = writeln!(out);

        let _ = writeln!(out, "[Install]");
        let _ = writeln!(out, "WantedBy=multi-user.target");
        out
    }
}
