use chrono::{DateTime, Utc};
use oracle_core_types::Classification;
use oracle_storage::TokenScoreRow;

use super::wallet_scorer::mint_matches_ecosystem;

/// Aggregated result of sampling a mint's top holders.
#[derive(Debug, Clone)]
pub struct TokenKAggregate {
    pub k: u32,
    pub holders_sampled: u64,
    pub accumulators: u64,
    pub maintained: u64,
    pub reducers: u64,
    pub extractors: u64,
}

impl TokenKAggregate {
    pub fn into_row(self, mint: &str, now: DateTime<Utc>) -> TokenScoreRow {
        TokenScoreRow {
            mint: mint.to_string(),
            k: self.k,
            holders_sampled: self.holders_sampled,
            accumulators_count: self.accumulators,
            maintained_count: self.maintained,
            reducers_count: self.reducers,
            extractors_count: self.extractors,
            last_sync: now,
        }
    }
}

/// Folds per-holder retentions into K for an arbitrary mint. Holders whose
/// history could not be reconstructed are skipped by the caller before this
/// point; a holder without a first buy counts as maintained (retention 1.0).
pub fn aggregate_token_k(retentions: &[f64]) -> TokenKAggregate {
    let mut aggregate = TokenKAggregate {
        k: 0,
        holders_sampled: retentions.len() as u64,
        accumulators: 0,
        maintained: 0,
        reducers: 0,
        extractors: 0,
    };

    for &value in retentions {
        match Classification::from_retention(value) {
            Classification::Accumulator => aggregate.accumulators += 1,
            Classification::Maintained => aggregate.maintained += 1,
            Classification::Reducer => aggregate.reducers += 1,
            Classification::Extractor => aggregate.extractors += 1,
        }
    }

    if aggregate.holders_sampled > 0 {
        let convicted = aggregate.accumulators + aggregate.maintained;
        aggregate.k =
            ((100.0 * convicted as f64 / aggregate.holders_sampled as f64).round()) as u32;
    }
    aggregate
}

/// Admission check used by the HTTP layer: only mints inside the configured
/// ecosystem suffix set may be scored on demand.
pub fn mint_in_ecosystem(mint: &str, suffixes: &[String]) -> bool {
    mint_matches_ecosystem(mint, suffixes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_follows_the_classification_table() {
        let aggregate = aggregate_token_k(&[1.8, 1.0, 0.7, 0.2, 2.5]);
        assert_eq!(aggregate.holders_sampled, 5);
        assert_eq!(aggregate.accumulators, 2);
        assert_eq!(aggregate.maintained, 1);
        assert_eq!(aggregate.reducers, 1);
        assert_eq!(aggregate.extractors, 1);
        assert_eq!(aggregate.k, 60);
        assert_eq!(
            aggregate.accumulators
                + aggregate.maintained
                + aggregate.reducers
                + aggregate.extractors,
            aggregate.holders_sampled
        );
    }

    #[test]
    fn empty_sample_scores_zero() {
        let aggregate = aggregate_token_k(&[]);
        assert_eq!(aggregate.k, 0);
        assert_eq!(aggregate.holders_sampled, 0);
    }

    #[test]
    fn ecosystem_admission_mirrors_suffix_rules() {
        let suffixes = vec!["bonk".to_string()];
        assert!(mint_in_ecosystem("SomeMintBonk", &suffixes));
        assert!(!mint_in_ecosystem("SomeMint", &suffixes));
    }
}
