use chrono::{DateTime, Utc};
use oracle_chain::TokenPosition;
use oracle_core_types::retention;
use oracle_storage::WalletRow;
use std::collections::HashMap;

/// Queue priority for transaction-triggered rescoring; staleness refreshes
/// run at the low priority and are preempted by these.
pub const WALLET_PRIORITY_TX: i64 = 10;
pub const WALLET_PRIORITY_STALE: i64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct WalletScore {
    pub k_wallet: u32,
    pub tokens_analyzed: u32,
    /// Slot at which this score is valid (the ingest watermark when it was
    /// computed).
    pub slot: u64,
    pub computed_at: DateTime<Utc>,
}

/// Cross-token conviction for one wallet: the share of its ecosystem
/// positions holding at or above their first buy. The primary mint's
/// retention defers to the store row when one exists, since ingest has the
/// authoritative cost basis there.
pub fn compute_wallet_score(
    positions: &HashMap<String, TokenPosition>,
    ecosystem_suffixes: &[String],
    primary_mint: &str,
    primary_row: Option<&WalletRow>,
    watermark_slot: u64,
    now: DateTime<Utc>,
) -> WalletScore {
    let mut total = 0u32;
    let mut convicted = 0u32;

    for (mint, position) in positions {
        if !mint_matches_ecosystem(mint, ecosystem_suffixes) {
            continue;
        }
        let position_retention = if mint == primary_mint {
            match primary_row {
                Some(row) => retention(row.current_balance, row.first_buy_amount),
                None => position_retention_of(position),
            }
        } else {
            position_retention_of(position)
        };

        total += 1;
        if position_retention >= 1.0 {
            convicted += 1;
        }
    }

    // A primary-token holder with no visible history still counts as one
    // position; ingest knows more than the history walk does.
    if total == 0 {
        if let Some(row) = primary_row {
            if row.current_balance > 0 {
                total = 1;
                if retention(row.current_balance, row.first_buy_amount) >= 1.0 {
                    convicted = 1;
                }
            }
        }
    }

    let k_wallet = if total > 0 {
        ((100.0 * convicted as f64 / total as f64).round()) as u32
    } else {
        0
    };

    WalletScore {
        k_wallet,
        tokens_analyzed: total,
        slot: watermark_slot,
        computed_at: now,
    }
}

fn position_retention_of(position: &TokenPosition) -> f64 {
    let first_buy = if position.first_buy_amount > 0 {
        Some(position.first_buy_amount)
    } else {
        None
    };
    retention(position.current, first_buy)
}

pub(crate) fn mint_matches_ecosystem(mint: &str, suffixes: &[String]) -> bool {
    let lowered = mint.to_ascii_lowercase();
    suffixes
        .iter()
        .any(|suffix| lowered.ends_with(&suffix.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(first_buy: u128, current: u128) -> TokenPosition {
        TokenPosition {
            first_buy_amount: first_buy,
            total_bought: first_buy,
            total_sold: 0,
            current,
            tx_count: 1,
            last_tx_ts: None,
        }
    }

    fn suffixes() -> Vec<String> {
        vec!["bonk".to_string()]
    }

    #[test]
    fn score_counts_only_ecosystem_mints() {
        let mut positions = HashMap::new();
        positions.insert("AlphaBonk".to_string(), position(100, 150));
        positions.insert("BetaBONK".to_string(), position(100, 40));
        positions.insert("UnrelatedMint".to_string(), position(100, 0));

        let score = compute_wallet_score(&positions, &suffixes(), "Primarybonk", None, 7_000, Utc::now());
        assert_eq!(score.tokens_analyzed, 2);
        assert_eq!(score.k_wallet, 50);
        assert_eq!(score.slot, 7_000);
    }

    #[test]
    fn primary_mint_retention_defers_to_the_store() {
        let mut positions = HashMap::new();
        // History walk undercounts the primary position (sold per history),
        // the store says the wallet is whole.
        positions.insert("Primarybonk".to_string(), position(1_000, 100));

        let row = WalletRow {
            address: "W".to_string(),
            first_buy_ts: Some(Utc::now()),
            first_buy_amount: Some(1_000),
            total_received: 2_000,
            total_sent: 0,
            current_balance: 2_000,
            peak_balance: 2_000,
            last_slot: 10,
            last_tx_signature: None,
            k_wallet: None,
            k_wallet_tokens_analyzed: 0,
            k_wallet_updated_at: None,
            k_wallet_slot: None,
        };

        let score = compute_wallet_score(
            &positions,
            &suffixes(),
            "Primarybonk",
            Some(&row),
            10,
            Utc::now(),
        );
        assert_eq!(score.tokens_analyzed, 1);
        assert_eq!(score.k_wallet, 100);
    }

    #[test]
    fn empty_history_falls_back_to_the_primary_row() {
        let positions = HashMap::new();
        let row = WalletRow {
            address: "W".to_string(),
            first_buy_ts: None,
            first_buy_amount: Some(500),
            total_received: 500,
            total_sent: 300,
            current_balance: 200,
            peak_balance: 500,
            last_slot: 5,
            last_tx_signature: None,
            k_wallet: None,
            k_wallet_tokens_analyzed: 0,
            k_wallet_updated_at: None,
            k_wallet_slot: None,
        };
        let score =
            compute_wallet_score(&positions, &suffixes(), "Primarybonk", Some(&row), 5, Utc::now());
        assert_eq!(score.tokens_analyzed, 1);
        assert_eq!(score.k_wallet, 0);
    }

    #[test]
    fn suffix_matching_is_case_insensitive() {
        assert!(mint_matches_ecosystem("AbcBONK", &suffixes()));
        assert!(mint_matches_ecosystem("abcbonk", &suffixes()));
        assert!(!mint_matches_ecosystem("abcbonkx", &suffixes()));
    }
}
