// src/config/mod.rs
// All runtime configuration comes from the environment (.env supported).

use once_cell::sync::Lazy;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct StrataConfig {
    // ── Database Configuration
    pub database_url: String,

    // ── Server Configuration
    pub host: String,
    pub port: u16,

    // ── User scoping
    pub default_user_id: String,

    // ── Resolution cache
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,

    // ── Batch execution
    pub batch_max_parallel: usize,
    pub batch_op_timeout_secs: u64,

    // ── Logging
    pub log_level: String,
}

/// Read an env var, tolerating inline comments and whitespace; fall back to
/// the default when unset or unparsable.
fn env_var_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(val) => {
            let clean_val = val.split('#').next().unwrap_or("").trim();
            match clean_val.parse::<T>() {
                Ok(parsed) => parsed,
                Err(_) => default,
            }
        }
        Err(_) => default,
    }
}

pub static CONFIG: Lazy<StrataConfig> = Lazy::new(|| {
    dotenvy::dotenv().ok();

    StrataConfig {
        database_url: env_var_or(
            "STRATA_DATABASE_URL",
            "sqlite://strata.db?mode=rwc".to_string(),
        ),
        host: env_var_or("STRATA_HOST", "127.0.0.1".to_string()),
        port: env_var_or("STRATA_PORT", 8585),
        default_user_id: env_var_or("STRATA_DEFAULT_USER", "local".to_string()),
        cache_capacity: env_var_or("STRATA_CACHE_CAPACITY", 4096),
        cache_ttl_secs: env_var_or("STRATA_CACHE_TTL_SECS", 3600),
        batch_max_parallel: env_var_or("STRATA_BATCH_MAX_PARALLEL", 8),
        batch_op_timeout_secs: env_var_or("STRATA_BATCH_OP_TIMEOUT_SECS", 30),
        log_level: env_var_or("STRATA_LOG_LEVEL", "info".to_string()),
    }
});
