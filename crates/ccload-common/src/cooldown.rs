use std::time::Duration;

/// Cooldown policy constants. Read once at startup; each value can be
/// replaced through a `CCLOAD_COOLDOWN_*_SEC` environment variable holding a
/// positive integer number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownSettings {
    /// Initial cooldown for 401/402/403.
    pub auth: Duration,
    /// Initial cooldown for first-byte timeouts and SSE error events
    /// (internal statuses 597/598).
    pub timeout: Duration,
    /// Initial cooldown for genuine upstream 5xx.
    pub server: Duration,
    /// Initial cooldown for everything else, 429 included.
    pub rate_limit: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            auth: Duration::from_secs(300),
            timeout: Duration::from_secs(60),
            server: Duration::from_secs(120),
            rate_limit: Duration::from_secs(60),
            min: Duration::from_secs(10),
            max: Duration::from_secs(1800),
        }
    }
}

impl CooldownSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |name: &str, fallback: Duration| -> Duration {
            lookup(name)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        Self {
            auth: read("CCLOAD_COOLDOWN_AUTH_SEC", defaults.auth),
            timeout: read("CCLOAD_COOLDOWN_TIMEOUT_SEC", defaults.timeout),
            server: read("CCLOAD_COOLDOWN_SERVER_SEC", defaults.server),
            rate_limit: read("CCLOAD_COOLDOWN_RATE_LIMIT_SEC", defaults.rate_limit),
            min: read("CCLOAD_COOLDOWN_MIN_SEC", defaults.min),
            max: read("CCLOAD_COOLDOWN_MAX_SEC", defaults.max),
        }
    }
}

/// Computes the next cooldown duration for a key or channel.
///
/// A previous duration or a still-active `until` doubles the larger of the
/// two, clamped to `[min, max]`. A first occurrence picks an initial
/// duration from the status class.
pub fn next_cooldown(
    prev: Duration,
    until: i64,
    now: i64,
    status: u16,
    settings: &CooldownSettings,
) -> Duration {
    if prev > Duration::ZERO || until > now {
        let remaining = Duration::from_secs(until.saturating_sub(now).max(0) as u64);
        let base = prev.max(remaining);
        return (base * 2).clamp(settings.min, settings.max);
    }

    match status {
        401 | 402 | 403 => settings.auth,
        597 | 598 => settings.timeout,
        596 | 599 => settings.rate_limit,
        500..=599 => settings.server,
        _ => settings.rate_limit,
    }
}
