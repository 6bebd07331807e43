//! Process-wide runtime settings from the environment (a `.env` file is honored).

use std::str::FromStr;

pub const DEFAULT_LIMIT: u64 = 20;

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Page size used when the payload has no `limit`.
    pub default_limit: u64,
    pub history_ttl_days: i64,
    pub trash_ttl_days: i64,
    /// Schema holding `history_logs` / `trash_logs` for the relational sink.
    pub audit_schema: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            default_limit: DEFAULT_LIMIT,
            history_ttl_days: 90,
            trash_ttl_days: 30,
            audit_schema: "public".into(),
        }
    }
}

impl Settings {
    /// Read `RECORD_DEFAULT_LIMIT`, `RECORD_HISTORY_TTL_DAYS`, `RECORD_TRASH_TTL_DAYS`,
    /// `RECORD_AUDIT_SCHEMA`. Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Settings::default();
        Settings {
            default_limit: env_or("RECORD_DEFAULT_LIMIT", defaults.default_limit),
            history_ttl_days: env_or("RECORD_HISTORY_TTL_DAYS", defaults.history_ttl_days),
            trash_ttl_days: env_or("RECORD_TRASH_TTL_DAYS", defaults.trash_ttl_days),
            audit_schema: std::env::var("RECORD_AUDIT_SCHEMA").unwrap_or(defaults.audit_schema),
        }
    }

    pub fn history_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.history_ttl_days)
    }

    pub fn trash_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.trash_ttl_days)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{} has invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
