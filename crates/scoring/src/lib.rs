mod calculator;
mod token_scorer;
mod wallet_scorer;

pub use calculator::{KCalculator, KMetrics};
pub use token_scorer::{aggregate_token_k, mint_in_ecosystem, TokenKAggregate};
pub use wallet_scorer::{compute_wallet_score, WalletScore, WALLET_PRIORITY_STALE, WALLET_PRIORITY_TX};
