use crate::error::ApiError;
use crate::middleware::RequestAuth;
use crate::state::SharedState;
use axum::http::HeaderMap;
use oracle_core_types::Tier;
use oracle_fanout::ct_eq;
use tracing::warn;

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Admin override: constant-time comparison against the configured key.
/// An unset admin key means no admin surface at all.
pub fn admin_key_matches(headers: &HeaderMap, configured: &str) -> bool {
    let configured = configured.trim();
    if configured.is_empty() {
        return false;
    }
    headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|presented| ct_eq(presented.trim().as_bytes(), configured.as_bytes()))
        .unwrap_or(false)
}

pub fn ensure_admin(state: &SharedState, headers: &HeaderMap) -> Result<(), ApiError> {
    if admin_key_matches(headers, &state.config.gateway.admin_key) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("admin key required"))
    }
}

/// One side of the holder verification: a balance, a definite miss, or a
/// failed lookup.
#[derive(Debug, Clone, Copy)]
pub enum HolderCheck {
    Balance(u128),
    Missing,
    Failed,
}

/// Pure gating decision over both verification channels. The store answer
/// wins when present; the RPC fallback covers wallets the store has never
/// seen. With both channels down the default policy fails closed.
pub fn holder_gate(
    store: HolderCheck,
    rpc: HolderCheck,
    min_balance: u128,
    fail_closed: bool,
) -> Result<(), &'static str> {
    match store {
        HolderCheck::Balance(balance) => {
            if balance >= min_balance {
                Ok(())
            } else if balance == 0 {
                Err("not_holder")
            } else {
                Err("insufficient_balance")
            }
        }
        HolderCheck::Missing | HolderCheck::Failed => match rpc {
            HolderCheck::Balance(balance) => {
                if balance >= min_balance {
                    Ok(())
                } else if balance == 0 {
                    Err("not_holder")
                } else {
                    Err("insufficient_balance")
                }
            }
            HolderCheck::Missing => Err("not_holder"),
            HolderCheck::Failed => {
                if fail_closed {
                    Err("verification_unavailable")
                } else {
                    Ok(())
                }
            }
        },
    }
}

/// Cross-token score gate: admin key, internal tier, or primary-token
/// holdings above the configured minimum.
pub async fn ensure_k_global_access(
    state: &SharedState,
    auth: &RequestAuth,
    headers: &HeaderMap,
    wallet: &str,
) -> Result<(), ApiError> {
    if !state.config.gating.k_global_gated {
        return Ok(());
    }
    if admin_key_matches(headers, &state.config.gateway.admin_key) {
        return Ok(());
    }
    if auth.tier >= Tier::Internal {
        return Ok(());
    }

    let lookup_wallet = wallet.to_string();
    let store_check = match state
        .read_db(move |store| store.get_wallet(&lookup_wallet))
        .await
    {
        Ok(Some(row)) => HolderCheck::Balance(row.current_balance),
        Ok(None) => HolderCheck::Missing,
        Err(error) => {
            warn!(error = %error.message, "holder gate store lookup failed");
            HolderCheck::Failed
        }
    };

    let rpc_check = match store_check {
        HolderCheck::Balance(_) => HolderCheck::Missing,
        _ => match state
            .adapter
            .wallet_token_balance(wallet, &state.config.token.mint)
            .await
        {
            Ok(0) => HolderCheck::Missing,
            Ok(balance) => HolderCheck::Balance(balance),
            Err(error) => {
                warn!(error = %error, "holder gate rpc fallback failed");
                HolderCheck::Failed
            }
        },
    };

    holder_gate(
        store_check,
        rpc_check,
        state.config.gating.k_global_min_balance as u128,
        state.config.gating.k_global_fail_closed,
    )
    .map_err(|reason| ApiError::forbidden(reason, "cross-token score access denied"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_balance_above_minimum_allows() {
        assert!(holder_gate(HolderCheck::Balance(100), HolderCheck::Failed, 50, true).is_ok());
    }

    #[test]
    fn store_balance_below_minimum_denies_without_fallback() {
        assert_eq!(
            holder_gate(HolderCheck::Balance(10), HolderCheck::Balance(1_000), 50, true),
            Err("insufficient_balance")
        );
    }

    #[test]
    fn missing_store_row_defers_to_rpc() {
        assert!(holder_gate(HolderCheck::Missing, HolderCheck::Balance(60), 50, true).is_ok());
        assert_eq!(
            holder_gate(HolderCheck::Missing, HolderCheck::Missing, 50, true),
            Err("not_holder")
        );
    }

    #[test]
    fn both_channels_failing_fails_closed_by_default() {
        assert_eq!(
            holder_gate(HolderCheck::Failed, HolderCheck::Failed, 50, true),
            Err("verification_unavailable")
        );
    }

    #[test]
    fn fail_open_is_opt_in() {
        assert!(holder_gate(HolderCheck::Failed, HolderCheck::Failed, 50, false).is_ok());
    }

    #[test]
    fn admin_key_compare_rejects_empty_configuration() {
        let headers = HeaderMap::new();
        assert!(!admin_key_matches(&headers, ""));

        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_KEY_HEADER, "secret".parse().expect("header"));
        assert!(admin_key_matches(&headers, "secret"));
        assert!(!admin_key_matches(&headers, "other"));
    }
}
