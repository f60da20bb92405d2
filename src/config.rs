//! Configuration
//!
//! Everything the pipeline needs from the environment is read once, at startup.
//! Missing required variables are collected and reported together.

use crate::error::{Result, SqllyError};
use std::time::Duration;

pub const DEFAULT_AGENT_NAME: &str = "wt-sqlly-sql-converter";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Retry/backoff policy for the agent client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempt` (1-based) before trying again.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub base_url: String,
    pub api_key: String,
    pub agent_name: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub service_key: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub agent: AgentConfig,
    pub store: StoreConfig,
    pub bind_addr: String,
}

impl Config {
    /// Load from the process environment (after `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut missing = Vec::new();
        let mut require = |key: &str, value: Option<String>| {
            if value.is_none() {
                missing.push(key.to_string());
            }
            value.unwrap_or_default()
        };

        let base_url = require("AGENT_BASE_URL", get("AGENT_BASE_URL"));
        let api_key = require(
            "AGENT_API_KEY",
            get("AGENT_API_KEY").or_else(|| get("OPENAI_API_KEY")),
        );
        let store_url = require("SUPABASE_URL", get("SUPABASE_URL"));
        let service_key = require("SUPABASE_SERVICE_ROLE_KEY", get("SUPABASE_SERVICE_ROLE_KEY"));

        if !missing.is_empty() {
            return Err(SqllyError::ConfigurationMissing(missing));
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_number(&get, "AGENT_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            base_delay: Duration::from_millis(parse_number(
                &get,
                "AGENT_BACKOFF_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_number(
                &get,
                "AGENT_MAX_BACKOFF_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
        };

        Ok(Self {
            agent: AgentConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
                agent_name: get("AGENT_NAME").unwrap_or_else(|| DEFAULT_AGENT_NAME.to_string()),
                retry,
            },
            store: StoreConfig {
                url: store_url.trim_end_matches('/').to_string(),
                service_key,
            },
            bind_addr: get("SQLLY_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        })
    }
}

fn parse_number<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            SqllyError::ConfigurationInvalid(format!("{} must be a non-negative integer, got '{}'", key, raw))
        }),
    }
}
