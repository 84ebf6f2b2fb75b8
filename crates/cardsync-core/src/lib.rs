//! Core domain model for the card catalog + pricing sync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cardsync-core";

/// Token correlating every log entry written by one logical pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OperationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Top-level catalog partition (one trading-card game).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub name: String,
    /// Category identifier on the catalog upstream.
    pub category_id: Option<i64>,
    pub sets_count: i64,
    pub cards_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NotStarted => "not-started",
            SyncStatus::InProgress => "in-progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-started" => Ok(SyncStatus::NotStarted),
            "in-progress" => Ok(SyncStatus::InProgress),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// A named release under exactly one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardSet {
    pub id: String,
    pub game_id: String,
    pub name: String,
    /// Catalog group this set is linked to, once matched.
    pub external_group_id: Option<i64>,
    pub card_count: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
}

/// A catalogable item within a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub set_id: String,
    pub game_id: String,
    pub name: String,
    pub number: Option<String>,
    pub rarity: Option<String>,
    pub image_url: Option<String>,
    /// Catalog product identifier advertised by the pricing upstream, if any.
    pub external_product_id: Option<i64>,
    /// Upstream-specific fields kept verbatim.
    #[serde(default)]
    pub attributes: BTreeMap<String, JsonValue>,
}

/// One (printing x condition) pricing observation for a card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub card_id: String,
    pub printing: String,
    pub condition: String,
    pub currency: String,
    pub market: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub source: String,
}

impl PriceRecord {
    /// Natural key; newer observations with the same key supersede older ones.
    pub fn key(&self) -> (&str, &str, &str, &str) {
        (&self.card_id, &self.printing, &self.condition, &self.source)
    }
}

/// Catalog upstream grouping (roughly a set), staged verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogGroup {
    pub group_id: i64,
    pub category_id: i64,
    pub name: String,
    pub abbreviation: Option<String>,
    pub published_on: Option<String>,
    #[serde(default)]
    pub raw: JsonValue,
}

/// Catalog upstream item (roughly a card), staged verbatim plus normalized fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub product_id: i64,
    pub group_id: i64,
    pub category_id: i64,
    pub name: String,
    pub clean_name: Option<String>,
    /// Card number parsed from extended data or from the product name.
    pub number: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub raw: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMethod {
    ExactId,
    NumberMatch,
    NameSimilarity,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::ExactId => "exact-id",
            MatchMethod::NumberMatch => "number-match",
            MatchMethod::NameSimilarity => "name-similarity",
        }
    }

    /// Lower rank wins when candidates from different methods compete.
    pub fn precedence(&self) -> u8 {
        match self {
            MatchMethod::ExactId => 0,
            MatchMethod::NumberMatch => 1,
            MatchMethod::NameSimilarity => 2,
        }
    }
}

impl FromStr for MatchMethod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact-id" => Ok(MatchMethod::ExactId),
            "number-match" => Ok(MatchMethod::NumberMatch),
            "name-similarity" => Ok(MatchMethod::NameSimilarity),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Proposed or applied association between a card and a catalog product.
///
/// The relation is weak: removing a match record never touches the card or
/// the product it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub operation_id: OperationId,
    pub card_id: String,
    pub product_id: i64,
    pub group_id: i64,
    pub confidence: f64,
    pub method: MatchMethod,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Started,
    Success,
    Error,
    Warning,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Started => "started",
            LogStatus::Success => "success",
            LogStatus::Error => "error",
            LogStatus::Warning => "warning",
        }
    }
}

impl FromStr for LogStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(LogStatus::Started),
            "success" => Ok(LogStatus::Success),
            "error" => Ok(LogStatus::Error),
            "warning" => Ok(LogStatus::Warning),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Append-only audit event. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub operation_id: OperationId,
    pub operation_type: String,
    pub status: LogStatus,
    pub details: JsonValue,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_wire_names_round_trip_through_serde() {
        assert_eq!(
            serde_json::to_string(&SyncStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
        assert_eq!(
            serde_json::to_string(&MatchMethod::ExactId).unwrap(),
            "\"exact-id\""
        );
        assert_eq!("number-match".parse::<MatchMethod>().unwrap(), MatchMethod::NumberMatch);
        assert_eq!("warning".parse::<LogStatus>().unwrap(), LogStatus::Warning);
        assert!("bogus".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn match_method_precedence_prefers_identifiers() {
        let mut methods = vec![
            MatchMethod::NameSimilarity,
            MatchMethod::ExactId,
            MatchMethod::NumberMatch,
        ];
        methods.sort_by_key(MatchMethod::precedence);
        assert_eq!(
            methods,
            vec![MatchMethod::ExactId, MatchMethod::NumberMatch, MatchMethod::NameSimilarity]
        );
    }

    #[test]
    fn operation_id_parses_its_own_display() {
        let id = OperationId::new();
        let parsed: OperationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
