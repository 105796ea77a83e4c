mod env_parsing;
mod loader;
mod schema;

#[cfg(test)]
mod tests;

pub use loader::{load_from_env_or_default, load_from_path, validate};
pub use schema::{
    AppConfig, FanoutConfig, GatewayConfig, GatingConfig, HeliusConfig, IngestConfig,
    ScoringConfig, SqliteConfig, SystemConfig, TokenConfig,
};
