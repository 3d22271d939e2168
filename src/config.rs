use std::env;
use std::time::Duration;

use dotenv::dotenv;

use crate::db::RetryPolicy;
use crate::errors::{Error, Result};

/**
 * Runtime settings, read from the environment (and `.env` when present)
 */
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub listen_addr: String,
    pub max_connections: u32,
    pub admin_ids: Vec<i64>,
    pub retry: RetryPolicy,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /**
     * Build the settings from an arbitrary key lookup, which keeps the parsing testable without
     * touching the process environment
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config("DATABASE_URL must be set".to_string()))?;

        let listen_addr = lookup("LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8000".to_string());
        let max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?;
        let admin_ids = parse_id_list(lookup("ADMIN_IDS").as_deref())?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            attempts: parse_or(&lookup, "STORAGE_RETRY_ATTEMPTS", defaults.attempts)?.max(1),
            base_delay: Duration::from_millis(parse_or(
                &lookup,
                "STORAGE_RETRY_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
        };

        Ok(Settings {
            database_url,
            listen_addr,
            max_connections,
            admin_ids,
            retry,
        })
    }

    /**
     * Capability check for the administrative operations
     */
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", key, raw))),
        _ => Ok(default),
    }
}

fn parse_id_list(raw: Option<&str>) -> Result<Vec<i64>> {
    let raw = match raw {
        Some(raw) => raw,
        None => return Ok(vec![]),
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| Error::Config(format!("ADMIN_IDS contains a non-numeric id: {:?}", s)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let settings = Settings::from_lookup(lookup(&[("DATABASE_URL", "sqlite::memory:")]))
            .expect("settings");
        assert_eq!(settings.listen_addr, "127.0.0.1:8000");
        assert_eq!(settings.max_connections, 5);
        assert!(settings.admin_ids.is_empty());
        assert_eq!(settings.retry.attempts, 3);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn database_url_is_required() {
        let result = Settings::from_lookup(lookup(&[]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn admin_ids_are_parsed() {
        let settings = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("ADMIN_IDS", "5533566321, 42,"),
        ]))
        .expect("settings");
        assert_eq!(settings.admin_ids, vec![5533566321, 42]);
        assert!(settings.is_admin(42));
        assert!(!settings.is_admin(7));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let bad_ids = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("ADMIN_IDS", "1,two"),
        ]));
        assert!(matches!(bad_ids, Err(Error::Config(_))));

        let bad_pool = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("DATABASE_MAX_CONNECTIONS", "lots"),
        ]));
        assert!(matches!(bad_pool, Err(Error::Config(_))));
    }

    #[test]
    fn retry_attempts_never_drop_below_one() {
        let settings = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("STORAGE_RETRY_ATTEMPTS", "0"),
            ("STORAGE_RETRY_DELAY_MS", "5"),
        ]))
        .expect("settings");
        assert_eq!(settings.retry.attempts, 1);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(5));
    }
}
