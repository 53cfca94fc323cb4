use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

/// Timing constants of the synchronization engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Realtime is presumed degraded once no event arrived for this long.
    pub realtime_stale_after: Duration,
    pub poll_floor: Duration,
    pub poll_ceiling: Duration,
    pub poll_backoff: f64,
    pub scheduler_tick: Duration,
    /// Per-send window after which a still-pending send forces a refetch.
    pub send_fallback: Duration,
    pub match_window: Duration,
    pub typing_throttle: Duration,
    pub typing_idle_stop: Duration,
    pub typing_ttl: Duration,
    pub typing_sweep: Duration,
    pub event_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            realtime_stale_after: Duration::from_secs(10),
            poll_floor: Duration::from_secs(5),
            poll_ceiling: Duration::from_secs(15),
            poll_backoff: 1.5,
            scheduler_tick: Duration::from_secs(1),
            send_fallback: Duration::from_secs(3),
            match_window: Duration::from_secs(10),
            typing_throttle: Duration::from_secs(1),
            typing_idle_stop: Duration::from_secs(2),
            typing_ttl: Duration::from_secs(3),
            typing_sweep: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    realtime_stale_after_ms: Option<u64>,
    poll_floor_ms: Option<u64>,
    poll_ceiling_ms: Option<u64>,
    poll_backoff: Option<f64>,
    scheduler_tick_ms: Option<u64>,
    send_fallback_ms: Option<u64>,
    match_window_ms: Option<u64>,
    typing_throttle_ms: Option<u64>,
    typing_idle_stop_ms: Option<u64>,
    typing_ttl_ms: Option<u64>,
    typing_sweep_ms: Option<u64>,
    event_capacity: Option<usize>,
}

/// Defaults, then the optional TOML file, then `APP__*` environment
/// variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<SyncSettings> {
    let mut settings = SyncSettings::default();

    if let Some(path) = path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read sync settings '{}'", path.display()))?;
        let file_cfg: SettingsFile = toml::from_str(&raw)
            .with_context(|| format!("invalid sync settings '{}'", path.display()))?;
        apply_file(&mut settings, file_cfg);
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings.normalize();
    Ok(settings)
}

fn apply_file(settings: &mut SyncSettings, file_cfg: SettingsFile) {
    let millis = Duration::from_millis;
    if let Some(v) = file_cfg.realtime_stale_after_ms {
        settings.realtime_stale_after = millis(v);
    }
    if let Some(v) = file_cfg.poll_floor_ms {
        settings.poll_floor = millis(v);
    }
    if let Some(v) = file_cfg.poll_ceiling_ms {
        settings.poll_ceiling = millis(v);
    }
    if let Some(v) = file_cfg.poll_backoff {
        settings.poll_backoff = v;
    }
    if let Some(v) = file_cfg.scheduler_tick_ms {
        settings.scheduler_tick = millis(v);
    }
    if let Some(v) = file_cfg.send_fallback_ms {
        settings.send_fallback = millis(v);
    }
    if let Some(v) = file_cfg.match_window_ms {
        settings.match_window = millis(v);
    }
    if let Some(v) = file_cfg.typing_throttle_ms {
        settings.typing_throttle = millis(v);
    }
    if let Some(v) = file_cfg.typing_idle_stop_ms {
        settings.typing_idle_stop = millis(v);
    }
    if let Some(v) = file_cfg.typing_ttl_ms {
        settings.typing_ttl = millis(v);
    }
    if let Some(v) = file_cfg.typing_sweep_ms {
        settings.typing_sweep = millis(v);
    }
    if let Some(v) = file_cfg.event_capacity {
        settings.event_capacity = v;
    }
}

fn apply_env(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let millis = |key: &str| {
        lookup(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    };

    if let Some(v) = millis("APP__REALTIME_STALE_AFTER_MS") {
        settings.realtime_stale_after = v;
    }
    if let Some(v) = millis("APP__POLL_FLOOR_MS") {
        settings.poll_floor = v;
    }
    if let Some(v) = millis("APP__POLL_CEILING_MS") {
        settings.poll_ceiling = v;
    }
    if let Some(v) = lookup("APP__POLL_BACKOFF").and_then(|v| v.trim().parse::<f64>().ok()) {
        settings.poll_backoff = v;
    }
    if let Some(v) = millis("APP__SEND_FALLBACK_MS") {
        settings.send_fallback = v;
    }
    if let Some(v) = millis("APP__TYPING_TTL_MS") {
        settings.typing_ttl = v;
    }
}

impl SyncSettings {
    /// Clamps values a hand-edited file could get wrong.
    fn normalize(&mut self) {
        let defaults = Self::default();
        if self.poll_floor.is_zero() {
            self.poll_floor = defaults.poll_floor;
        }
        if self.poll_ceiling < self.poll_floor {
            self.poll_ceiling = self.poll_floor;
        }
        if !self.poll_backoff.is_finite() || self.poll_backoff < 1.0 {
            self.poll_backoff = 1.0;
        }
        if self.scheduler_tick.is_zero() {
            self.scheduler_tick = defaults.scheduler_tick;
        }
        if self.typing_sweep.is_zero() {
            self.typing_sweep = defaults.typing_sweep;
        }
        self.event_capacity = self.event_capacity.max(16);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
