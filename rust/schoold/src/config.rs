//! Process-level configuration, read once at startup.
//!
//! Env:
//! - SCHOOLD_WORKSPACE: open this workspace before the first request.
//! - SCHOOLD_FIXED_NOW: pin the clock (RFC 3339 timestamp or YYYY-MM-DD,
//!   taken as midnight UTC). Unset means the system clock.
//! - RUST_LOG: log filter for stderr output (default "info").
//!
//! Per-workspace settings live in the `settings` table instead (see the
//! `setup.*` IPC methods).

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::PathBuf;

pub const ENV_WORKSPACE: &str = "SCHOOLD_WORKSPACE";
pub const ENV_FIXED_NOW: &str = "SCHOOLD_FIXED_NOW";

#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub workspace: Option<PathBuf>,
    pub fixed_now: Option<DateTime<Utc>>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let workspace = get(ENV_WORKSPACE)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let fixed_now = match get(ENV_FIXED_NOW).map(|s| s.trim().to_string()) {
            Some(s) if !s.is_empty() => Some(
                parse_instant(&s).with_context(|| format!("invalid {}", ENV_FIXED_NOW))?,
            ),
            _ => None,
        };
        Ok(Self {
            workspace,
            fixed_now,
        })
    }
}

pub fn parse_instant(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let d = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| anyhow!("expected RFC 3339 timestamp or YYYY-MM-DD, got {:?}", s))?;
    d.and_hms_opt(0, 0, 0)
        .map(|n| n.and_utc())
        .ok_or_else(|| anyhow!("invalid date {:?}", s))
}
