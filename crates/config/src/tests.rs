use super::loader::apply_env_overrides;
use super::*;
use std::env;
use std::sync::Mutex;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const OVERRIDE_VARS: &[&str] = &[
    "ORACLE_ENV",
    "MAINTENANCE",
    "HELIUS_API_KEY",
    "HELIUS_WEBHOOK_SECRET",
    "TOKEN_MINT",
    "TOKEN_SYMBOL",
    "TOKEN_DECIMALS",
    "TOKEN_LAUNCH_TS",
    "OG_EARLY_WINDOW",
    "OG_HOLD_THRESHOLD",
    "MIN_BALANCE",
    "PORT",
    "CORS_ORIGINS",
    "ADMIN_KEY",
    "K_GLOBAL_GATED",
    "K_GLOBAL_MIN_BALANCE",
    "K_GLOBAL_FAIL_CLOSED",
];

fn with_clean_env<F: FnOnce()>(body: F) {
    let _guard = ENV_LOCK.lock().expect("env lock");
    for var in OVERRIDE_VARS {
        env::remove_var(var);
    }
    body();
    for var in OVERRIDE_VARS {
        env::remove_var(var);
    }
}

#[test]
fn defaults_match_documented_values() {
    let config = AppConfig::default();
    assert_eq!(config.ingest.poll_interval_seconds, 300);
    assert_eq!(config.scoring.wallet_workers, 3);
    assert_eq!(config.scoring.wallet_lease_seconds, 300);
    assert_eq!(config.scoring.token_lease_seconds, 600);
    assert_eq!(config.scoring.token_top_holders, 50);
    assert_eq!(config.scoring.token_fetch_concurrency, 5);
    assert_eq!(config.fanout.delivery_period_seconds, 30);
    assert_eq!(config.fanout.ws_max_connections_per_key, 5);
    assert_eq!(config.gateway.body_limit_bytes, 1024 * 1024);
    assert_eq!(config.sqlite.backup_retain, 5);
    assert!(config.gating.k_global_fail_closed);
}

#[test]
fn toml_sections_deserialize_with_partial_content() {
    let raw = r#"
        [token]
        mint = "OracleMintbonk"
        symbol = "ORC"

        [gateway]
        port = 9000
    "#;
    let config: AppConfig = toml::from_str(raw).expect("parse toml");
    assert_eq!(config.token.mint, "OracleMintbonk");
    assert_eq!(config.gateway.port, 9000);
    assert_eq!(config.ingest.poll_interval_seconds, 300);
}

#[test]
fn env_overrides_take_precedence() {
    with_clean_env(|| {
        env::set_var("TOKEN_MINT", "EnvMintbonk");
        env::set_var("PORT", "7777");
        env::set_var("CORS_ORIGINS", "https://a.example,https://b.example");
        env::set_var("K_GLOBAL_FAIL_CLOSED", "false");
        env::set_var("MIN_BALANCE", "123456");
        env::set_var("MAINTENANCE", "true");

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config);

        assert_eq!(config.token.mint, "EnvMintbonk");
        assert_eq!(config.gateway.port, 7777);
        assert_eq!(config.gateway.cors_origins.len(), 2);
        assert!(!config.gating.k_global_fail_closed);
        assert_eq!(config.token.min_balance, 123_456);
        assert!(config.system.maintenance);
    });
}

#[test]
fn malformed_numeric_env_values_are_ignored() {
    with_clean_env(|| {
        env::set_var("PORT", "not-a-port");
        env::set_var("TOKEN_DECIMALS", "9.5");

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config);

        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.token.decimals, 9);
    });
}

#[test]
fn validate_requires_mint() {
    with_clean_env(|| {
        let config = AppConfig::default();
        let error = validate(&config).expect_err("missing mint must fail");
        assert!(error.to_string().contains("token.mint"));
    });
}

#[test]
fn validate_requires_webhook_secret_in_production() {
    with_clean_env(|| {
        let mut config = AppConfig::default();
        config.token.mint = "Mintbonk".to_string();
        config.system.env = "production".to_string();
        let error = validate(&config).expect_err("production without secret must fail");
        assert!(error.to_string().contains("webhook_secret"));

        config.helius.webhook_secret = "shh".to_string();
        validate(&config).expect("production with secret passes");
    });
}
