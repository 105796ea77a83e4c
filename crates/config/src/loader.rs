use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::env_parsing::{parse_bool, parse_csv};
use super::AppConfig;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

/// Loads the TOML config, then applies the environment overrides. Deployment
/// environments configure through these variables alone on top of a stock
/// config file.
pub fn load_from_env_or_default(default_path: &Path) -> Result<(AppConfig, PathBuf)> {
    let configured = env::var("ORACLE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_path.to_path_buf());
    let mut config = if configured.exists() {
        load_from_path(&configured)?
    } else {
        AppConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok((config, configured))
}

pub(crate) fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(value) = env::var("ORACLE_ENV") {
        if !value.trim().is_empty() {
            config.system.env = value.trim().to_string();
        }
    }
    if let Some(value) = env::var("MAINTENANCE").ok().and_then(|v| parse_bool(&v)) {
        config.system.maintenance = value;
    }

    if let Ok(value) = env::var("HELIUS_API_KEY") {
        if !value.trim().is_empty() {
            config.helius.api_key = value.trim().to_string();
        }
    }
    if let Ok(value) = env::var("HELIUS_WEBHOOK_SECRET") {
        if !value.trim().is_empty() {
            config.helius.webhook_secret = value.trim().to_string();
        }
    }

    if let Ok(value) = env::var("TOKEN_MINT") {
        if !value.trim().is_empty() {
            config.token.mint = value.trim().to_string();
        }
    }
    if let Ok(value) = env::var("TOKEN_SYMBOL") {
        if !value.trim().is_empty() {
            config.token.symbol = value.trim().to_string();
        }
    }
    if let Some(value) = env::var("TOKEN_DECIMALS")
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
    {
        config.token.decimals = value;
    }
    if let Some(value) = env::var("TOKEN_LAUNCH_TS")
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        config.token.launch_ts = value;
    }
    if let Some(value) = env::var("OG_EARLY_WINDOW")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
    {
        config.token.og_early_window_days = value;
    }
    if let Some(value) = env::var("OG_HOLD_THRESHOLD")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
    {
        config.token.og_hold_threshold_days = value;
    }
    if let Some(value) = env::var("MIN_BALANCE")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        config.token.min_balance = value;
    }

    if let Some(value) = env::var("PORT")
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
    {
        config.gateway.port = value;
    }
    if let Ok(value) = env::var("CORS_ORIGINS") {
        let origins = parse_csv(&value);
        if !origins.is_empty() {
            config.gateway.cors_origins = origins;
        }
    }
    if let Ok(value) = env::var("ADMIN_KEY") {
        if !value.trim().is_empty() {
            config.gateway.admin_key = value.trim().to_string();
        }
    }

    if let Some(value) = env::var("K_GLOBAL_GATED")
        .ok()
        .and_then(|v| parse_bool(&v))
    {
        config.gating.k_global_gated = value;
    }
    if let Some(value) = env::var("K_GLOBAL_MIN_BALANCE")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        config.gating.k_global_min_balance = value;
    }
    if let Some(value) = env::var("K_GLOBAL_FAIL_CLOSED")
        .ok()
        .and_then(|v| parse_bool(&v))
    {
        config.gating.k_global_fail_closed = value;
    }
}

/// Startup validation. Misconfiguration is fatal; production additionally
/// requires the inbound webhook secret so the push path can refuse
/// unauthenticated traffic.
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.token.mint.trim().is_empty() {
        return Err(anyhow!("token.mint is required (set TOKEN_MINT)"));
    }
    if config.gateway.port == 0 {
        return Err(anyhow!("gateway.port must be nonzero"));
    }
    if config.scoring.wallet_workers == 0 || config.scoring.token_workers == 0 {
        return Err(anyhow!("scoring worker pools must be nonempty"));
    }
    if config.system.is_production() {
        let secret = config.helius.webhook_secret.trim();
        if secret.is_empty() || secret.contains("REPLACE_ME") {
            return Err(anyhow!(
                "helius.webhook_secret is required in production (set HELIUS_WEBHOOK_SECRET)"
            ));
        }
    }
    Ok(())
}
