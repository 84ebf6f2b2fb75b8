//! Client for the product catalog API: groups and products per category,
//! as JSON or as CSV exports.

use std::collections::BTreeMap;
use std::sync::Arc;

use cardsync_core::{CatalogGroup, CatalogProduct};
use cardsync_storage::{OutboundRequest, RateLimitedFetcher};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::csv_stream::read_rows;
use crate::normalize::{
    normalize_group_json, normalize_group_row, normalize_product_json, normalize_product_row, ColumnSpec,
    FuzzyHeaderResolver, HeaderResolver, ResolvedColumns, RowOutcome, GROUP_COLUMNS, PRODUCT_COLUMNS,
};
use crate::{page_from_payload, AdapterError, CsvRow};

const GROUP_ALIASES: &[&str] = &["groups"];
const PRODUCT_ALIASES: &[&str] = &["products"];

/// Normalized records plus the rows that were skipped on the way.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportBatch<T> {
    pub records: Vec<T>,
    pub skipped: usize,
    /// Skip reason to occurrence count.
    pub skip_reasons: BTreeMap<String, usize>,
}

impl<T> Default for ImportBatch<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            skipped: 0,
            skip_reasons: BTreeMap::new(),
        }
    }
}

impl<T> ImportBatch<T> {
    fn push(&mut self, outcome: RowOutcome<T>) {
        match outcome {
            RowOutcome::Parsed(record) => self.records.push(record),
            RowOutcome::Skipped { reason } => self.skip(reason),
        }
    }

    fn skip(&mut self, reason: String) {
        self.skipped += 1;
        *self.skip_reasons.entry(reason).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone)]
pub struct CatalogApiClient {
    fetcher: Arc<RateLimitedFetcher>,
    base_url: String,
    api_key: Option<String>,
}

impl CatalogApiClient {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn fetcher(&self) -> &Arc<RateLimitedFetcher> {
        &self.fetcher
    }

    fn request(&self, path: &str) -> OutboundRequest {
        let request = OutboundRequest::get(format!("{}/{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.header("x-api-key", key.clone()),
            None => request,
        }
    }

    async fn fetch_items(&self, path: &str, aliases: &[&str]) -> Result<Vec<JsonValue>, AdapterError> {
        let payload: JsonValue = self.fetcher.fetch_json(self.request(path)).await?;
        Ok(page_from_payload(self.fetcher.upstream(), &payload, aliases)?.items)
    }

    pub async fn list_groups(&self, category_id: i64) -> Result<ImportBatch<CatalogGroup>, AdapterError> {
        let items = self.fetch_items(&format!("{category_id}/groups"), GROUP_ALIASES).await?;
        let mut batch = ImportBatch::default();
        for item in &items {
            batch.push(normalize_group_json(item, category_id));
        }
        debug!(category_id, groups = batch.records.len(), skipped = batch.skipped, "catalog groups listed");
        Ok(batch)
    }

    pub async fn list_products(&self, category_id: i64, group_id: i64) -> Result<ImportBatch<CatalogProduct>, AdapterError> {
        let items = self
            .fetch_items(&format!("{category_id}/{group_id}/products"), PRODUCT_ALIASES)
            .await?;
        let mut batch = ImportBatch::default();
        for item in &items {
            batch.push(normalize_product_json(item, category_id, group_id));
        }
        debug!(category_id, group_id, products = batch.records.len(), skipped = batch.skipped, "catalog products listed");
        Ok(batch)
    }

    /// Streams `groups.csv` through the incremental parser.
    pub async fn groups_csv(&self, category_id: i64) -> Result<ImportBatch<CatalogGroup>, AdapterError> {
        self.import_csv(&format!("{category_id}/groups.csv"), GROUP_COLUMNS, |row, columns| {
            normalize_group_row(row, columns, category_id)
        })
        .await
    }

    pub async fn products_csv(&self, category_id: i64, group_id: i64) -> Result<ImportBatch<CatalogProduct>, AdapterError> {
        self.import_csv(
            &format!("{category_id}/{group_id}/products.csv"),
            PRODUCT_COLUMNS,
            |row, columns| normalize_product_row(row, columns, category_id),
        )
        .await
    }

    async fn import_csv<T, F>(&self, path: &str, specs: &[ColumnSpec], normalize: F) -> Result<ImportBatch<T>, AdapterError>
    where
        F: Fn(&CsvRow, &ResolvedColumns) -> RowOutcome<T>,
    {
        let response = self.fetcher.fetch_stream(self.request(path)).await?;
        let resolver = FuzzyHeaderResolver;
        let mut columns: Option<ResolvedColumns> = None;
        let mut batch = ImportBatch::default();

        read_rows(response.body, b',', |headers, row| {
            let columns = columns.get_or_insert_with(|| resolve_and_report(headers, specs, &resolver));
            if columns.missing_required().is_empty() {
                batch.push(normalize(&row, columns));
            } else {
                batch.skip(format!("missing required column(s): {}", columns.missing_required().join(", ")));
            }
        })
        .await?;

        debug!(path, records = batch.records.len(), skipped = batch.skipped, "catalog csv imported");
        Ok(batch)
    }
}

fn resolve_and_report(headers: &[String], specs: &[ColumnSpec], resolver: &dyn HeaderResolver) -> ResolvedColumns {
    let columns = ResolvedColumns::resolve(headers, specs, resolver);
    if !columns.missing_required().is_empty() {
        warn!(?headers, missing = ?columns.missing_required(), "csv export lacks required columns");
    }
    columns
}
