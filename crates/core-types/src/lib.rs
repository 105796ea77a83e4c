use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Width of a zero-padded u128 decimal rendering. Padding amounts to this
/// width makes lexicographic ordering on TEXT columns equal numeric ordering.
pub const AMOUNT_PAD_WIDTH: usize = 39;

pub fn pad_amount(amount: u128) -> String {
    format!("{:0>width$}", amount, width = AMOUNT_PAD_WIDTH)
}

pub fn parse_amount(raw: &str) -> Option<u128> {
    let trimmed = raw.trim_start_matches('0');
    if trimmed.is_empty() {
        return Some(0);
    }
    trimmed.parse::<u128>().ok()
}

pub fn parse_delta(raw: &str) -> Option<i128> {
    raw.trim().parse::<i128>().ok()
}

/// New balance after applying a signed delta, clamped at zero. Chain state
/// can momentarily disagree with our view (missed history); never underflow.
pub fn apply_delta(balance: u128, delta: i128) -> u128 {
    if delta >= 0 {
        balance.saturating_add(delta as u128)
    } else {
        balance.saturating_sub(delta.unsigned_abs())
    }
}

/// Serde helpers keeping amounts as decimal strings on the wire.
pub mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u128>().map_err(serde::de::Error::custom)
    }
}

pub mod delta_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<i128>().map_err(serde::de::Error::custom)
    }
}

/// One balance-changing transfer leg for one owner of the tracked mint.
/// `slot` is the chain's strictly increasing ordering token; a
/// `(signature, wallet)` pair is applied durably at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceChange {
    pub mint: String,
    pub wallet: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    #[serde(with = "delta_string")]
    pub amount: i128,
    pub signature: String,
}

/// Holder-state transition produced by applying a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderTransition {
    None,
    New,
    Exit,
}

/// Retention classification thresholds: 1.5 / 1.0 / 0.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Accumulator,
    Maintained,
    Reducer,
    Extractor,
}

impl Classification {
    pub fn from_retention(retention: f64) -> Self {
        if retention >= 1.5 {
            Self::Accumulator
        } else if retention >= 1.0 {
            Self::Maintained
        } else if retention >= 0.5 {
            Self::Reducer
        } else {
            Self::Extractor
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accumulator => "accumulator",
            Self::Maintained => "maintained",
            Self::Reducer => "reducer",
            Self::Extractor => "extractor",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accumulator" => Some(Self::Accumulator),
            "maintained" | "holder" => Some(Self::Maintained),
            "reducer" => Some(Self::Reducer),
            "extractor" => Some(Self::Extractor),
            _ => None,
        }
    }

    /// Counts toward K: retention at or above 1.0.
    pub fn is_convicted(self) -> bool {
        matches!(self, Self::Accumulator | Self::Maintained)
    }
}

pub fn retention(current_balance: u128, first_buy_amount: Option<u128>) -> f64 {
    match first_buy_amount {
        Some(first) if first > 0 => current_balance as f64 / first as f64,
        _ => 1.0,
    }
}

/// Access tier, ordered. Ordinal comparison backs both rate limiting and
/// tier-scoped WebSocket broadcasts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Public,
    Free,
    Standard,
    Premium,
    Internal,
}

impl Tier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Some(Self::Public),
            "free" => Some(Self::Free),
            "standard" => Some(Self::Standard),
            "premium" => Some(Self::Premium),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Internal => "internal",
        }
    }
}

/// Outbound webhook event types a subscription can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    KChange,
    HolderNew,
    HolderExit,
    ThresholdAlert,
}

impl WebhookEventKind {
    pub const ALL: [WebhookEventKind; 4] = [
        Self::KChange,
        Self::HolderNew,
        Self::HolderExit,
        Self::ThresholdAlert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::KChange => "k_change",
            Self::HolderNew => "holder_new",
            Self::HolderExit => "holder_exit",
            Self::ThresholdAlert => "threshold_alert",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "k_change" => Some(Self::KChange),
            "holder_new" => Some(Self::HolderNew),
            "holder_exit" => Some(Self::HolderExit),
            "threshold_alert" => Some(Self::ThresholdAlert),
            _ => None,
        }
    }
}

/// Server-to-client WebSocket message. `min_tier` never leaves the process;
/// it scopes delivery during fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct WsMessage {
    pub event: String,
    pub data: Value,
    pub ts: DateTime<Utc>,
    #[serde(skip)]
    pub min_tier: Tier,
}

impl WsMessage {
    pub fn broadcast(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ts: Utc::now(),
            min_tier: Tier::Public,
        }
    }

    pub fn for_tier(event: impl Into<String>, data: Value, min_tier: Tier) -> Self {
        Self {
            event: event.into(),
            data,
            ts: Utc::now(),
            min_tier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_amounts_order_lexicographically() {
        let small = pad_amount(9_999);
        let large = pad_amount(1_000_000_000_000_000_000_000_000);
        assert!(small < large);
        assert_eq!(parse_amount(&small), Some(9_999));
        assert_eq!(
            parse_amount(&large),
            Some(1_000_000_000_000_000_000_000_000)
        );
    }

    #[test]
    fn pad_amount_handles_zero_and_max() {
        assert_eq!(parse_amount(&pad_amount(0)), Some(0));
        assert_eq!(parse_amount(&pad_amount(u128::MAX)), Some(u128::MAX));
        assert_eq!(pad_amount(u128::MAX).len(), AMOUNT_PAD_WIDTH);
    }

    #[test]
    fn apply_delta_clamps_at_zero() {
        assert_eq!(apply_delta(100, -250), 0);
        assert_eq!(apply_delta(100, 250), 350);
        assert_eq!(apply_delta(0, -1), 0);
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(
            Classification::from_retention(1.5),
            Classification::Accumulator
        );
        assert_eq!(
            Classification::from_retention(1.0),
            Classification::Maintained
        );
        assert_eq!(
            Classification::from_retention(0.99),
            Classification::Reducer
        );
        assert_eq!(
            Classification::from_retention(0.49),
            Classification::Extractor
        );
        assert!(Classification::Maintained.is_convicted());
        assert!(!Classification::Reducer.is_convicted());
    }

    #[test]
    fn retention_defaults_to_one_without_first_buy() {
        assert_eq!(retention(500, None), 1.0);
        assert_eq!(retention(500, Some(0)), 1.0);
        assert_eq!(retention(3_000, Some(1_000)), 3.0);
    }

    #[test]
    fn tier_ordering_matches_table() {
        assert!(Tier::Public < Tier::Free);
        assert!(Tier::Free < Tier::Standard);
        assert!(Tier::Standard < Tier::Premium);
        assert!(Tier::Premium < Tier::Internal);
        assert_eq!(Tier::parse("PREMIUM"), Some(Tier::Premium));
    }

    #[test]
    fn balance_change_amount_round_trips_as_string() {
        let change = BalanceChange {
            mint: "mint".to_string(),
            wallet: "wallet".to_string(),
            slot: 42,
            block_time: None,
            amount: -170_141_183_460_469_231_731_687_303_715_884_105_727,
            signature: "sig".to_string(),
        };
        let json = serde_json::to_value(&change).expect("serialize");
        assert!(json.get("amount").and_then(Value::as_str).is_some());
        let back: BalanceChange = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.amount, change.amount);
    }
}
