//! Upstream contracts for the two card data sources plus the shape
//! normalization shared by both.

pub mod catalog;
pub mod csv_stream;
pub mod normalize;
pub mod pricing;

use async_trait::async_trait;
use cardsync_storage::FetchError;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use catalog::{CatalogApiClient, ImportBatch};
pub use csv_stream::{read_rows, CsvError, CsvRow, CsvStreamParser};
pub use normalize::{
    extract_card_number, parse_bool_like, resolve_collection, ExactHeaderResolver, FuzzyHeaderResolver,
    HeaderResolver, NormalizedCard, PageMeta, Resolved, RowOutcome,
};
pub use pricing::{CardIdentifiers, CardQuery, CardSearch, PricingApiClient, SetCardsSource};

pub const CRATE_NAME: &str = "cardsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{upstream}: unrecognized response shape: {detail}")]
    UnrecognizedShape { upstream: String, detail: String },
    #[error(transparent)]
    Csv(#[from] CsvError),
}

/// One page of raw upstream items with whatever pagination metadata the
/// response carried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PageMeta,
}

/// An offset/limit endpoint the paginator can drive.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Clone + Send;

    /// Stable identity used to deduplicate items across pages.
    fn item_id(&self, item: &Self::Item) -> Option<String>;

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Page<Self::Item>, AdapterError>;
}

/// Page of JSON items from a payload, or a shape error naming the upstream.
pub fn page_from_payload(upstream: &str, payload: &JsonValue, aliases: &[&str]) -> Result<Page<JsonValue>, AdapterError> {
    match resolve_collection(payload, aliases) {
        Resolved::Found { items, meta, .. } => Ok(Page { items, meta }),
        Resolved::NotFound => Err(AdapterError::UnrecognizedShape {
            upstream: upstream.to_string(),
            detail: describe_payload(payload),
        }),
    }
}

fn describe_payload(payload: &JsonValue) -> String {
    match payload {
        JsonValue::Object(map) if map.is_empty() => "empty object".to_string(),
        JsonValue::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).take(8).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
        JsonValue::Null => "null".to_string(),
        other => format!("scalar {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_envelopes_are_shape_errors() {
        let err = page_from_payload("catalog", &json!({"error": "bad key"}), &["groups"]).unwrap_err();
        match err {
            AdapterError::UnrecognizedShape { upstream, detail } => {
                assert_eq!(upstream, "catalog");
                assert!(detail.contains("error"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrapped_pages_keep_their_metadata() {
        let page = page_from_payload("pricing", &json!({"data": [{"id": "a"}], "meta": {"hasMore": false}}), &[]).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.meta.has_more, Some(false));
    }
}
