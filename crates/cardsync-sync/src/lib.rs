//! Pipeline orchestration: set harvests, catalog staging, reconciliation
//! and the durable sync log.

pub mod config;
pub mod log;
pub mod matcher;
pub mod paginate;
pub mod persist;
pub mod pg;
pub mod store;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use cardsync_adapters::normalize::normalize_pricing_card;
use cardsync_adapters::{AdapterError, CatalogApiClient, ImportBatch, PricingApiClient, RowOutcome};
use cardsync_core::{Card, CardSet, CatalogProduct, Game, OperationId, PriceRecord, SyncLogEntry, SyncStatus};
use cardsync_storage::{FetchError, FetcherStats, HttpTransport, InspectedResponse, RateLimitedFetcher, ReqwestTransport};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};

pub use config::{MatchConfig, ScheduledGame, SyncConfig, UpstreamConfig, UpstreamRegistry};
pub use log::SyncLogger;
pub use matcher::{
    stored_group_links, GroupLink, GroupMatchSummary, MatchType, Matcher, ProductMatchSummary, SimilarityScorer, StrsimScorer,
};
pub use paginate::{harvest, Harvest, PaginationConfig, StopReason};
pub use persist::{collapse_by_key, upsert_in_batches, BatchAbort, BatchPolicy, BatchReport};
pub use pg::PgStore;
pub use store::{CardStore, MemoryStore, StoreError};

pub const CRATE_NAME: &str = "cardsync-sync";

const MAX_PAGE_SIZE: u64 = 1_000;
const DEFAULT_PAGE_SIZE: u64 = 100;
const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1_000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("no data: {0}")]
    NoData(String),
    #[error(transparent)]
    Upstream(#[from] FetchError),
    #[error("{upstream}: unrecognized response shape: {detail}")]
    Shape { upstream: String, detail: String },
    #[error(transparent)]
    Persistence(#[from] BatchAbort),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// HTTP-equivalent status for the caller.
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Validation(_) => 400,
            PipelineError::NotFound(_) | PipelineError::NoData(_) => 404,
            PipelineError::Upstream(err) => match err.status() {
                status @ (429 | 500..=599) => status,
                _ => 502,
            },
            PipelineError::Shape { .. } => 502,
            PipelineError::Store(StoreError::NotFound(_)) => 404,
            PipelineError::Persistence(_) | PipelineError::Store(_) | PipelineError::Internal(_) => 500,
        }
    }

    fn log_details(&self) -> JsonValue {
        let mut details = json!({ "error": self.to_string(), "status": self.status() });
        match self {
            PipelineError::Upstream(err) => {
                details["upstream_status"] = json!(err.status());
                details["snippet"] = json!(err.snippet());
            }
            PipelineError::Persistence(abort) => {
                details["entity"] = json!(abort.entity);
                details["committed"] = json!(abort.committed);
                details["total"] = json!(abort.total);
            }
            _ => {}
        }
        details
    }
}

impl From<AdapterError> for PipelineError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Validation(msg) => PipelineError::Validation(msg),
            AdapterError::Fetch(err) => PipelineError::Upstream(err),
            AdapterError::UnrecognizedShape { upstream, detail } => PipelineError::Shape { upstream, detail },
            AdapterError::Csv(err) => PipelineError::Shape {
                upstream: config::CATALOG_UPSTREAM.to_string(),
                detail: err.to_string(),
            },
        }
    }
}

/// Uniform result envelope of every entry point.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome<T> {
    pub success: bool,
    pub operation_id: OperationId,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl<T> OperationOutcome<T> {
    pub fn ok(operation_id: OperationId, data: T, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            operation_id,
            status: 200,
            data: Some(data),
            error: None,
            warnings,
        }
    }

    /// Work continues in the background; poll the log by `operation_id`.
    pub fn accepted(operation_id: OperationId) -> Self {
        Self {
            success: true,
            operation_id,
            status: 202,
            data: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn failed(operation_id: OperationId, err: &PipelineError) -> Self {
        Self {
            success: false,
            operation_id,
            status: err.status(),
            data: None,
            error: Some(err.to_string()),
            warnings: Vec::new(),
        }
    }
}

/// Successful result plus what goes into the terminal log entry.
struct Completed<T> {
    data: T,
    warnings: Vec<String>,
    details: JsonValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestRequest {
    #[serde(default, alias = "gameId")]
    pub game_id: String,
    #[serde(default, alias = "setId")]
    pub set_id: String,
    #[serde(default, alias = "pageSize")]
    pub page_size: Option<u64>,
    #[serde(default, alias = "orderBy")]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestResult {
    pub cards: Vec<Card>,
    pub total_pages: u32,
    pub total_cards: usize,
    pub expected_total: Option<u64>,
    pub harvested_at: DateTime<Utc>,
    pub partial: bool,
    pub stop_reason: StopReason,
    pub prices_upserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSyncRequest {
    #[serde(default, alias = "gameId")]
    pub game_id: String,
    #[serde(default, alias = "categoryId")]
    pub category_id: Option<i64>,
    #[serde(default, alias = "wipeBefore")]
    pub wipe_before: bool,
    #[serde(default)]
    pub background: bool,
    /// Load from the CSV exports instead of the JSON endpoints.
    #[serde(default, alias = "useCsv")]
    pub use_csv: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogSyncResult {
    pub category_id: i64,
    pub wiped: u64,
    pub groups_upserted: usize,
    pub products_upserted: usize,
    pub groups_failed: usize,
    pub skipped_rows: usize,
    pub skip_reasons: BTreeMap<String, usize>,
}

impl CatalogSyncResult {
    fn absorb_skips<T>(&mut self, batch: &ImportBatch<T>) {
        self.skipped_rows += batch.skipped;
        for (reason, count) in &batch.skip_reasons {
            *self.skip_reasons.entry(reason.clone()).or_insert(0) += count;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRequest {
    #[serde(default, alias = "gameId")]
    pub game_id: String,
    #[serde(default, alias = "dryRun")]
    pub dry_run: bool,
    #[serde(default, alias = "onlyUnmapped")]
    pub only_unmapped: bool,
    #[serde(default, alias = "matchType")]
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchOutcome {
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_matching: Option<GroupMatchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_matching: Option<ProductMatchSummary>,
    pub sets_linked: usize,
    pub records_written: usize,
    pub cards_updated: usize,
}

fn price_key(price: &PriceRecord) -> (String, String, String, String) {
    let (card, printing, condition, source) = price.key();
    (card.to_string(), printing.to_string(), condition.to_string(), source.to_string())
}

fn require(field: &str, value: &str) -> Result<String, PipelineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<SyncConfig>,
    registry: Arc<UpstreamRegistry>,
    store: Arc<dyn CardStore>,
    pricing: PricingApiClient,
    catalog: CatalogApiClient,
}

impl Pipeline {
    /// Builds both upstream clients over one shared transport. Each upstream
    /// gets its own fetcher, so limiter state is per upstream.
    pub fn with_transport(
        config: SyncConfig,
        registry: UpstreamRegistry,
        store: Arc<dyn CardStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let pricing_fetcher = Arc::new(RateLimitedFetcher::new(
            config::PRICING_UPSTREAM,
            transport.clone(),
            config.effective_policy(&registry.pricing),
        ));
        let catalog_fetcher = Arc::new(RateLimitedFetcher::new(
            config::CATALOG_UPSTREAM,
            transport,
            config.effective_policy(&registry.catalog),
        ));
        let pricing = PricingApiClient::new(
            pricing_fetcher,
            registry.pricing.base_url.clone(),
            config.pricing_api_key.clone(),
        );
        let catalog = CatalogApiClient::new(
            catalog_fetcher,
            registry.catalog.base_url.clone(),
            config.catalog_api_key.clone(),
        );
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            store,
            pricing,
            catalog,
        }
    }

    /// Real HTTP against the upstreams named in the registry file.
    pub fn from_config(config: SyncConfig, store: Arc<dyn CardStore>) -> Result<Self> {
        let registry = UpstreamRegistry::load(&config.upstreams_path)?;
        let transport = ReqwestTransport::new(Some(&config.user_agent)).context("building http transport")?;
        Ok(Self::with_transport(config, registry, store, Arc::new(transport)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &UpstreamRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn CardStore> {
        &self.store
    }

    pub fn fetcher_stats(&self) -> Vec<FetcherStats> {
        vec![self.pricing.fetcher().stats(), self.catalog.fetcher().stats()]
    }

    /// Most recent upstream responses across both fetchers, newest first.
    pub fn recent_responses(&self, limit: usize) -> Vec<InspectedResponse> {
        let mut merged = self.pricing.fetcher().inspector().recent(limit);
        merged.extend(self.catalog.fetcher().inspector().recent(limit));
        merged.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        merged.truncate(limit);
        merged
    }

    fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy::with_batch_size(self.config.batch_size)
    }

    async fn conclude<T>(logger: &SyncLogger, result: Result<Completed<T>, PipelineError>) -> OperationOutcome<T> {
        let operation_id = logger.operation_id();
        match result {
            Ok(done) => {
                if !done.warnings.is_empty() {
                    logger.warning(json!({ "warnings": done.warnings })).await;
                }
                logger.success(done.details).await;
                OperationOutcome::ok(operation_id, done.data, done.warnings)
            }
            Err(err) => {
                warn!(%operation_id, status = err.status(), error = %err, "operation failed");
                logger.error(err.log_details()).await;
                OperationOutcome::failed(operation_id, &err)
            }
        }
    }

    pub async fn harvest_full_set(&self, request: HarvestRequest) -> OperationOutcome<HarvestResult> {
        let operation_id = OperationId::new();
        let logger = SyncLogger::new(self.store.clone(), operation_id, "harvest");
        let span = info_span!("harvest", %operation_id, game = %request.game_id, set = %request.set_id);
        let result = self.run_harvest(&logger, request).instrument(span).await;
        Self::conclude(&logger, result).await
    }

    async fn run_harvest(&self, logger: &SyncLogger, request: HarvestRequest) -> Result<Completed<HarvestResult>, PipelineError> {
        let game_id = require("game_id", &request.game_id)?;
        let set_id = require("set_id", &request.set_id)?;
        let page_size = request.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(PipelineError::Validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        logger
            .started(json!({ "game_id": game_id, "set_id": set_id, "page_size": page_size }))
            .await;
        self.ensure_set(&game_id, &set_id).await?;
        self.store
            .update_set_sync_status(&set_id, SyncStatus::InProgress, None, None)
            .await?;

        match self.harvest_into_store(&game_id, &set_id, page_size, &request).await {
            Ok(done) => Ok(done),
            Err(err) => {
                if let Err(status_err) = self
                    .store
                    .update_set_sync_status(&set_id, SyncStatus::Failed, None, None)
                    .await
                {
                    warn!(%set_id, error = %status_err, "could not mark set as failed");
                }
                Err(err)
            }
        }
    }

    /// Placeholder parents so harvested cards always have a game and set.
    async fn ensure_set(&self, game_id: &str, set_id: &str) -> Result<(), PipelineError> {
        if self.store.get_game(game_id).await?.is_none() {
            self.store
                .upsert_games(&[Game {
                    id: game_id.to_string(),
                    name: game_id.to_string(),
                    category_id: None,
                    sets_count: 0,
                    cards_count: 0,
                }])
                .await?;
        }
        match self.store.get_set(set_id).await? {
            Some(existing) if existing.game_id != game_id => Err(PipelineError::Validation(format!(
                "set {set_id} belongs to game {}, not {game_id}",
                existing.game_id
            ))),
            Some(_) => Ok(()),
            None => {
                self.store
                    .upsert_sets(&[CardSet {
                        id: set_id.to_string(),
                        game_id: game_id.to_string(),
                        name: set_id.to_string(),
                        external_group_id: None,
                        card_count: 0,
                        last_synced_at: None,
                        sync_status: SyncStatus::NotStarted,
                    }])
                    .await?;
                Ok(())
            }
        }
    }

    async fn harvest_into_store(
        &self,
        game_id: &str,
        set_id: &str,
        page_size: u64,
        request: &HarvestRequest,
    ) -> Result<Completed<HarvestResult>, PipelineError> {
        let source = self
            .pricing
            .set_cards(game_id, set_id, request.order_by.clone(), request.order.clone());
        let pagination = PaginationConfig {
            page_size,
            max_pages: self.config.max_pages,
            page_delay: self.config.page_delay(),
        };
        let harvested = harvest(&source, &pagination).await?;
        let mut warnings = harvested.warnings.clone();

        let harvested_at = Utc::now();
        let source_tag = self.pricing.fetcher().upstream().to_string();
        let mut cards: Vec<Card> = Vec::with_capacity(harvested.items.len());
        let mut prices: Vec<PriceRecord> = Vec::new();
        let mut skipped = 0usize;
        for item in &harvested.items {
            match normalize_pricing_card(item, game_id, set_id, &source_tag, harvested_at) {
                RowOutcome::Parsed(normalized) => {
                    prices.extend(normalized.prices);
                    cards.push(normalized.card);
                }
                RowOutcome::Skipped { reason } => {
                    skipped += 1;
                    warn!(%reason, "skipping card entry");
                }
            }
        }
        if skipped > 0 {
            warnings.push(format!("{skipped} card entr(ies) could not be normalized"));
        }
        if cards.is_empty() {
            warnings.push(format!("upstream returned no cards for {game_id}/{set_id}"));
        }
        let (cards, _) = collapse_by_key(cards, |c| c.id.clone(), |_, _| true);
        let (prices, repeated_prices) = collapse_by_key(prices, price_key, |kept, incoming| {
            incoming.observed_at >= kept.observed_at
        });
        if repeated_prices > 0 {
            debug!(repeated_prices, "collapsed price observations sharing a key");
        }

        let store: &dyn CardStore = self.store.as_ref();
        let policy = self.batch_policy();
        upsert_in_batches("cards", &cards, policy, move |chunk| store.upsert_cards(chunk)).await?;
        let price_report = upsert_in_batches("prices", &prices, policy, move |chunk| store.upsert_prices(chunk)).await?;

        let card_count = store.list_cards_for_set(set_id).await?.len() as i64;
        store
            .update_set_sync_status(set_id, SyncStatus::Completed, Some(card_count), Some(harvested_at))
            .await?;
        store.refresh_game_counts(game_id).await?;

        info!(
            cards = cards.len(),
            prices = price_report.committed,
            pages = harvested.pages_fetched,
            partial = harvested.partial,
            "set harvested"
        );
        let details = json!({
            "game_id": game_id,
            "set_id": set_id,
            "total_pages": harvested.pages_fetched,
            "total_cards": cards.len(),
            "expected_total": harvested.expected_total,
            "prices": price_report.committed,
            "partial": harvested.partial,
            "stop_reason": harvested.stop_reason,
        });
        Ok(Completed {
            data: HarvestResult {
                total_cards: cards.len(),
                cards,
                total_pages: harvested.pages_fetched,
                expected_total: harvested.expected_total,
                harvested_at,
                partial: harvested.partial,
                stop_reason: harvested.stop_reason,
                prices_upserted: price_report.committed,
                skipped,
            },
            warnings,
            details,
        })
    }

    pub async fn sync_catalog_for_game(&self, request: CatalogSyncRequest) -> OperationOutcome<CatalogSyncResult> {
        let operation_id = OperationId::new();
        let logger = SyncLogger::new(self.store.clone(), operation_id, "catalog_sync");

        let (game_id, category_id) = match self.resolve_category(&request).await {
            Ok(resolved) => resolved,
            Err(err) => return Self::conclude(&logger, Err(err)).await,
        };

        if request.background {
            let pipeline = self.clone();
            let span = info_span!("catalog_sync", %operation_id, game = %game_id, category_id, background = true);
            tokio::spawn(
                async move {
                    let result = pipeline.run_catalog_sync(&logger, &game_id, category_id, &request).await;
                    let outcome = Self::conclude(&logger, result).await;
                    info!(success = outcome.success, status = outcome.status, "background catalog sync finished");
                }
                .instrument(span),
            );
            return OperationOutcome::accepted(operation_id);
        }

        let span = info_span!("catalog_sync", %operation_id, game = %game_id, category_id);
        let result = self
            .run_catalog_sync(&logger, &game_id, category_id, &request)
            .instrument(span)
            .await;
        Self::conclude(&logger, result).await
    }

    /// Game id plus the catalog category to pull, recording a category given
    /// in the request on the game.
    async fn resolve_category(&self, request: &CatalogSyncRequest) -> Result<(String, i64), PipelineError> {
        let game_id = require("game_id", &request.game_id)?;
        let existing = self.store.get_game(&game_id).await?;
        let category_id = match (request.category_id, existing.as_ref().and_then(|g| g.category_id)) {
            (Some(requested), _) => requested,
            (None, Some(known)) => known,
            (None, None) if existing.is_none() => return Err(PipelineError::NotFound(format!("game {game_id}"))),
            (None, None) => {
                return Err(PipelineError::Validation(format!(
                    "game {game_id} has no catalog category; pass category_id"
                )))
            }
        };
        if existing.as_ref().and_then(|g| g.category_id) != Some(category_id) {
            let game = existing.map_or_else(
                || Game {
                    id: game_id.clone(),
                    name: game_id.clone(),
                    category_id: Some(category_id),
                    sets_count: 0,
                    cards_count: 0,
                },
                |g| Game {
                    category_id: Some(category_id),
                    ..g
                },
            );
            self.store.upsert_games(&[game]).await?;
        }
        Ok((game_id, category_id))
    }

    async fn run_catalog_sync(
        &self,
        logger: &SyncLogger,
        game_id: &str,
        category_id: i64,
        request: &CatalogSyncRequest,
    ) -> Result<Completed<CatalogSyncResult>, PipelineError> {
        logger
            .started(json!({
                "game_id": game_id,
                "category_id": category_id,
                "wipe_before": request.wipe_before,
                "use_csv": request.use_csv,
            }))
            .await;

        let mut result = CatalogSyncResult {
            category_id,
            ..CatalogSyncResult::default()
        };
        let mut warnings = Vec::new();

        if request.wipe_before {
            result.wiped = self.store.wipe_catalog(category_id).await?;
            info!(category_id, wiped = result.wiped, "staged catalog wiped");
        }

        let groups = if request.use_csv {
            self.catalog.groups_csv(category_id).await?
        } else {
            self.catalog.list_groups(category_id).await?
        };
        result.absorb_skips(&groups);
        if groups.records.is_empty() {
            warnings.push(format!("catalog returned no groups for category {category_id}"));
        }
        let (groups, _) = collapse_by_key(groups.records, |g| g.group_id, |_, _| true);

        let store: &dyn CardStore = self.store.as_ref();
        let policy = self.batch_policy();
        let report = upsert_in_batches("catalog_groups", &groups, policy, move |chunk| {
            store.upsert_catalog_groups(chunk)
        })
        .await?;
        result.groups_upserted = report.committed;

        let use_csv = request.use_csv;
        let group_ids: Vec<i64> = groups.iter().map(|g| g.group_id).collect();
        let catalog = self.catalog.clone();
        let fetched: Vec<(i64, Result<ImportBatch<CatalogProduct>, AdapterError>)> = stream::iter(group_ids)
            .map(move |group_id| {
                let catalog = catalog.clone();
                async move {
                    let batch = if use_csv {
                        catalog.products_csv(category_id, group_id).await
                    } else {
                        catalog.list_products(category_id, group_id).await
                    };
                    (group_id, batch)
                }
            })
            .buffer_unordered(self.config.product_fanout.max(1))
            .collect()
            .await;

        let mut products = Vec::new();
        for (group_id, batch) in fetched {
            match batch {
                Ok(batch) => {
                    result.absorb_skips(&batch);
                    products.extend(batch.records);
                }
                Err(err) => {
                    result.groups_failed += 1;
                    warn!(group_id, error = %err, "product fetch failed for group");
                    warnings.push(format!("products for group {group_id} failed: {err}"));
                }
            }
        }
        if result.skipped_rows > 0 {
            warnings.push(format!("{} catalog row(s) skipped", result.skipped_rows));
        }
        let (products, repeated) = collapse_by_key(products, |p| p.product_id, |_, _| true);
        if repeated > 0 {
            debug!(repeated, "product ids listed under more than one group");
        }

        let report = upsert_in_batches("catalog_products", &products, policy, move |chunk| {
            store.upsert_catalog_products(chunk)
        })
        .await?;
        result.products_upserted = report.committed;

        info!(
            groups = result.groups_upserted,
            products = result.products_upserted,
            failed_groups = result.groups_failed,
            "catalog staged"
        );
        let details = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
        Ok(Completed {
            data: result,
            warnings,
            details,
        })
    }

    /// Catalog sync for every game listed in the registry, one after another.
    pub async fn run_scheduled_sync(&self) -> Vec<OperationOutcome<CatalogSyncResult>> {
        let mut outcomes = Vec::with_capacity(self.registry.scheduled_games.len());
        for game in &self.registry.scheduled_games {
            let outcome = self
                .sync_catalog_for_game(CatalogSyncRequest {
                    game_id: game.game_id.clone(),
                    category_id: game.category_id,
                    wipe_before: game.wipe_before,
                    background: false,
                    use_csv: false,
                })
                .await;
            if !outcome.success {
                warn!(game_id = %game.game_id, error = ?outcome.error, "scheduled catalog sync failed");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        if self.registry.scheduled_games.is_empty() {
            warn!("scheduler enabled but no scheduled_games configured");
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let outcomes = pipeline.run_scheduled_sync().await;
                let failed = outcomes.iter().filter(|o| !o.success).count();
                info!(games = outcomes.len(), failed, "scheduled catalog sync finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    pub async fn run_match(&self, request: MatchRequest) -> OperationOutcome<MatchOutcome> {
        let operation_id = OperationId::new();
        let logger = SyncLogger::new(self.store.clone(), operation_id, "match");
        let span = info_span!("match", %operation_id, game = %request.game_id, dry_run = request.dry_run);
        let result = self.run_match_inner(&logger, request).instrument(span).await;
        Self::conclude(&logger, result).await
    }

    async fn run_match_inner(&self, logger: &SyncLogger, request: MatchRequest) -> Result<Completed<MatchOutcome>, PipelineError> {
        let game_id = require("game_id", &request.game_id)?;
        let game = self
            .store
            .get_game(&game_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("game {game_id}")))?;
        let category_id = game.category_id.ok_or_else(|| {
            PipelineError::Validation(format!("game {game_id} has no catalog category to match against"))
        })?;

        logger
            .started(json!({
                "game_id": game_id,
                "dry_run": request.dry_run,
                "only_unmapped": request.only_unmapped,
                "match_type": request.match_type,
            }))
            .await;

        let groups = self.store.list_catalog_groups(category_id).await?;
        if groups.is_empty() {
            return Err(PipelineError::NoData(format!(
                "no staged catalog groups for category {category_id}; run a catalog sync first"
            )));
        }
        let sets = self.store.list_sets(&game_id).await?;

        let scorer = StrsimScorer;
        let matcher = Matcher::new(self.config.matching, &scorer);
        let mut outcome = MatchOutcome {
            dry_run: request.dry_run,
            ..MatchOutcome::default()
        };
        let mut warnings = Vec::new();

        let links: Vec<GroupLink> = if request.match_type.includes_groups() {
            let group_summary = matcher.match_groups(&sets, &groups);
            if group_summary.ambiguous > 0 {
                warnings.push(format!("{} set(s) matched several groups equally well", group_summary.ambiguous));
            }
            if !request.dry_run {
                for link in &group_summary.links {
                    let current = sets.iter().find(|s| s.id == link.set_id).and_then(|s| s.external_group_id);
                    if current != Some(link.group_id) {
                        self.store.set_group_link(&link.set_id, link.group_id).await?;
                        outcome.sets_linked += 1;
                    }
                }
            }
            let links = group_summary.links.clone();
            outcome.group_matching = Some(group_summary);
            links
        } else {
            stored_group_links(&sets, &groups)
        };

        if request.match_type.includes_products() {
            let products = self.store.list_catalog_products(category_id, &[]).await?;
            let cards = self.store.list_cards_for_game(&game_id).await?;
            let mapped: HashSet<String> = if request.only_unmapped {
                self.store.applied_match_card_ids(&game_id).await?
            } else {
                HashSet::new()
            };

            let mut summary = matcher.match_products(logger.operation_id(), &cards, &products, &links, &mapped);
            if summary.ambiguous > 0 {
                warnings.push(format!("{} card(s) had several equally good candidates", summary.ambiguous));
            }
            if summary.errors > 0 {
                warnings.push(format!("{} card(s) could not be scored", summary.errors));
            }

            if !request.dry_run {
                for record in &mut summary.candidates {
                    record.applied = true;
                }
                // card mappings and their applied records commit together per chunk
                let store: &dyn CardStore = self.store.as_ref();
                let report = upsert_in_batches("match_records", &summary.candidates, self.batch_policy(), move |chunk| {
                    store.apply_matches(chunk)
                })
                .await?;
                outcome.records_written = report.committed;
                outcome.cards_updated = report.committed;
            }
            outcome.product_matching = Some(summary);
        }

        let details = json!({
            "dry_run": outcome.dry_run,
            "sets_linked": outcome.sets_linked,
            "records_written": outcome.records_written,
            "groups": outcome.group_matching.as_ref().map(|g| json!({
                "by_method": g.by_method,
                "no_match": g.no_match,
                "ambiguous": g.ambiguous,
                "errors": g.errors,
            })),
            "products": outcome.product_matching.as_ref().map(|p| json!({
                "by_method": p.by_method,
                "no_match": p.no_match,
                "no_group": p.no_group,
                "ambiguous": p.ambiguous,
                "errors": p.errors,
                "skipped_mapped": p.skipped_mapped,
            })),
        });
        Ok(Completed {
            data: outcome,
            warnings,
            details,
        })
    }

    /// Newest first. An unknown operation id is an empty success.
    pub async fn query_sync_logs(
        &self,
        operation_id: Option<OperationId>,
        limit: Option<usize>,
    ) -> OperationOutcome<Vec<SyncLogEntry>> {
        let query_id = operation_id.unwrap_or_default();
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
        match self.store.list_logs(operation_id, limit).await {
            Ok(entries) => OperationOutcome::ok(query_id, entries, Vec::new()),
            Err(err) => OperationOutcome::failed(query_id, &PipelineError::Store(err)),
        }
    }
}
