pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl FederatorConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does
    /// not exist, built-in defaults are used so the gateway starts with
    /// zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: FederatorConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            FederatorConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("loaded federator configuration");
        Ok(config)
    }

    /// Environment variable overrides for connection/infra settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SEISFED_ROUTING_URL") {
            self.routing.url = v;
        }
        if let Ok(v) = std::env::var("SEISFED_REDIS_URL") {
            self.redis.url = v;
        }
        if let Ok(v) = std::env::var("SEISFED_ALIMIT_URL") {
            self.limit.alimit_url = Some(v);
        }
        if let Ok(v) = std::env::var("SEISFED_TMPDIR") {
            self.tmpdir = Some(v.into());
        }
        if let Ok(v) = std::env::var("SEISFED_MAX_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                self.pool.max_workers = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.routing.url.is_empty() {
            anyhow::bail!("routing.url cannot be empty");
        }
        if self.redis.url.is_empty() {
            anyhow::bail!("redis.url cannot be empty");
        }
        if self.pool.max_workers == 0 {
            anyhow::bail!("pool.max_workers must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.retry_budget_client) {
            anyhow::bail!(
                "retry_budget_client must be within [0, 100], got {}",
                self.retry_budget_client
            );
        }
        if self.endpoint.timeout_secs == 0 {
            anyhow::bail!("endpoint.timeout_secs must be positive");
        }
        Ok(())
    }

    /// Effective scratch directory for response spooling.
    pub fn tmpdir(&self) -> std::path::PathBuf {
        self.tmpdir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
