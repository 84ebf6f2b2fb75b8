//! Postgres-backed [`CardStore`].

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cardsync_core::{
    Card, CardSet, CatalogGroup, CatalogProduct, Game, MatchRecord, OperationId, PriceRecord, SyncLogEntry,
    SyncStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::store::{CardStore, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected, too_many_connections
                Some("40001") | Some("40P01") | Some("53300") => StoreError::Transient(err.to_string()),
                _ => StoreError::Permanent(err.to_string()),
            },
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

fn decode<T: FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Permanent(format!("column {column}: {e}")))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // never put the DSN in a span, it may carry credentials
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(options)
            .await?;
        info!("connected to db");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }
}

fn game_from_row(row: &PgRow) -> Result<Game, StoreError> {
    Ok(Game {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category_id: row.try_get("category_id")?,
        sets_count: row.try_get("sets_count")?,
        cards_count: row.try_get("cards_count")?,
    })
}

fn set_from_row(row: &PgRow) -> Result<CardSet, StoreError> {
    Ok(CardSet {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        name: row.try_get("name")?,
        external_group_id: row.try_get("external_group_id")?,
        card_count: row.try_get("card_count")?,
        last_synced_at: row.try_get("last_synced_at")?,
        sync_status: decode(row, "sync_status")?,
    })
}

fn card_from_row(row: &PgRow) -> Result<Card, StoreError> {
    let Json(attributes): Json<BTreeMap<String, JsonValue>> = row.try_get("attributes")?;
    Ok(Card {
        id: row.try_get("id")?,
        set_id: row.try_get("set_id")?,
        game_id: row.try_get("game_id")?,
        name: row.try_get("name")?,
        number: row.try_get("number")?,
        rarity: row.try_get("rarity")?,
        image_url: row.try_get("image_url")?,
        external_product_id: row.try_get("external_product_id")?,
        attributes,
    })
}

fn price_from_row(row: &PgRow) -> Result<PriceRecord, StoreError> {
    Ok(PriceRecord {
        card_id: row.try_get("card_id")?,
        printing: row.try_get("printing")?,
        condition: row.try_get("condition")?,
        currency: row.try_get("currency")?,
        market: row.try_get("market")?,
        low: row.try_get("low")?,
        high: row.try_get("high")?,
        observed_at: row.try_get("observed_at")?,
        source: row.try_get("source")?,
    })
}

fn group_from_row(row: &PgRow) -> Result<CatalogGroup, StoreError> {
    let Json(raw): Json<JsonValue> = row.try_get("raw")?;
    Ok(CatalogGroup {
        group_id: row.try_get("group_id")?,
        category_id: row.try_get("category_id")?,
        name: row.try_get("name")?,
        abbreviation: row.try_get("abbreviation")?,
        published_on: row.try_get("published_on")?,
        raw,
    })
}

fn product_from_row(row: &PgRow) -> Result<CatalogProduct, StoreError> {
    let Json(raw): Json<JsonValue> = row.try_get("raw")?;
    Ok(CatalogProduct {
        product_id: row.try_get("product_id")?,
        group_id: row.try_get("group_id")?,
        category_id: row.try_get("category_id")?,
        name: row.try_get("name")?,
        clean_name: row.try_get("clean_name")?,
        number: row.try_get("number")?,
        image_url: row.try_get("image_url")?,
        raw,
    })
}

fn match_from_row(row: &PgRow) -> Result<MatchRecord, StoreError> {
    let operation_id: Uuid = row.try_get("operation_id")?;
    Ok(MatchRecord {
        operation_id: operation_id.into(),
        card_id: row.try_get("card_id")?,
        product_id: row.try_get("product_id")?,
        group_id: row.try_get("group_id")?,
        confidence: row.try_get("confidence")?,
        method: decode(row, "method")?,
        applied: row.try_get("applied")?,
        created_at: row.try_get("created_at")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<SyncLogEntry, StoreError> {
    let operation_id: Uuid = row.try_get("operation_id")?;
    let Json(details): Json<JsonValue> = row.try_get("details")?;
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        operation_id: operation_id.into(),
        operation_type: row.try_get("operation_type")?,
        status: decode(row, "status")?,
        details,
        duration_ms: row.try_get("duration_ms")?,
        created_at: row.try_get("created_at")?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> Result<T, StoreError>) -> Result<Vec<T>, StoreError> {
    rows.iter().map(map).collect()
}

#[async_trait]
impl CardStore for PgStore {
    #[instrument(skip(self, games), fields(rows = games.len()))]
    async fn upsert_games(&self, games: &[Game]) -> Result<u64, StoreError> {
        if games.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> =
            QueryBuilder::new("INSERT INTO games (id, name, category_id, sets_count, cards_count) ");
        qb.push_values(games, |mut b, g| {
            b.push_bind(&g.id)
                .push_bind(&g.name)
                .push_bind(g.category_id)
                .push_bind(g.sets_count)
                .push_bind(g.cards_count);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name,
              category_id = COALESCE(EXCLUDED.category_id, games.category_id),
              updated_at = now()",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, sets), fields(rows = sets.len()))]
    async fn upsert_sets(&self, sets: &[CardSet]) -> Result<u64, StoreError> {
        if sets.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO sets (id, game_id, name, external_group_id, card_count, last_synced_at, sync_status) ",
        );
        qb.push_values(sets, |mut b, s| {
            b.push_bind(&s.id)
                .push_bind(&s.game_id)
                .push_bind(&s.name)
                .push_bind(s.external_group_id)
                .push_bind(s.card_count)
                .push_bind(s.last_synced_at)
                .push_bind(s.sync_status.as_str());
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name,
              external_group_id = COALESCE(EXCLUDED.external_group_id, sets.external_group_id)",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, cards), fields(rows = cards.len()))]
    async fn upsert_cards(&self, cards: &[Card]) -> Result<u64, StoreError> {
        if cards.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO cards (id, set_id, game_id, name, number, rarity, image_url, external_product_id, attributes) ",
        );
        qb.push_values(cards, |mut b, c| {
            b.push_bind(&c.id)
                .push_bind(&c.set_id)
                .push_bind(&c.game_id)
                .push_bind(&c.name)
                .push_bind(&c.number)
                .push_bind(&c.rarity)
                .push_bind(&c.image_url)
                .push_bind(c.external_product_id)
                .push_bind(Json(&c.attributes));
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name,
              number = EXCLUDED.number,
              rarity = EXCLUDED.rarity,
              image_url = EXCLUDED.image_url,
              external_product_id = COALESCE(EXCLUDED.external_product_id, cards.external_product_id),
              attributes = EXCLUDED.attributes,
              updated_at = now()",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, prices), fields(rows = prices.len()))]
    async fn upsert_prices(&self, prices: &[PriceRecord]) -> Result<u64, StoreError> {
        if prices.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO card_prices (card_id, printing, condition, currency, market, low, high, observed_at, source) ",
        );
        qb.push_values(prices, |mut b, p| {
            b.push_bind(&p.card_id)
                .push_bind(&p.printing)
                .push_bind(&p.condition)
                .push_bind(&p.currency)
                .push_bind(p.market)
                .push_bind(p.low)
                .push_bind(p.high)
                .push_bind(p.observed_at)
                .push_bind(&p.source);
        });
        qb.push(
            " ON CONFLICT (card_id, printing, condition, source) DO UPDATE SET
              currency = EXCLUDED.currency,
              market = EXCLUDED.market,
              low = EXCLUDED.low,
              high = EXCLUDED.high,
              observed_at = EXCLUDED.observed_at
              WHERE card_prices.observed_at <= EXCLUDED.observed_at",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, groups), fields(rows = groups.len()))]
    async fn upsert_catalog_groups(&self, groups: &[CatalogGroup]) -> Result<u64, StoreError> {
        if groups.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO catalog_groups (group_id, category_id, name, abbreviation, published_on, raw) ",
        );
        qb.push_values(groups, |mut b, g| {
            b.push_bind(g.group_id)
                .push_bind(g.category_id)
                .push_bind(&g.name)
                .push_bind(&g.abbreviation)
                .push_bind(&g.published_on)
                .push_bind(Json(&g.raw));
        });
        qb.push(
            " ON CONFLICT (group_id) DO UPDATE SET category_id = EXCLUDED.category_id,
              name = EXCLUDED.name,
              abbreviation = EXCLUDED.abbreviation,
              published_on = EXCLUDED.published_on,
              raw = EXCLUDED.raw,
              fetched_at = now()",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, products), fields(rows = products.len()))]
    async fn upsert_catalog_products(&self, products: &[CatalogProduct]) -> Result<u64, StoreError> {
        if products.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO catalog_products (product_id, group_id, category_id, name, clean_name, number, image_url, raw) ",
        );
        qb.push_values(products, |mut b, p| {
            b.push_bind(p.product_id)
                .push_bind(p.group_id)
                .push_bind(p.category_id)
                .push_bind(&p.name)
                .push_bind(&p.clean_name)
                .push_bind(&p.number)
                .push_bind(&p.image_url)
                .push_bind(Json(&p.raw));
        });
        qb.push(
            " ON CONFLICT (product_id) DO UPDATE SET group_id = EXCLUDED.group_id,
              category_id = EXCLUDED.category_id,
              name = EXCLUDED.name,
              clean_name = EXCLUDED.clean_name,
              number = EXCLUDED.number,
              image_url = EXCLUDED.image_url,
              raw = EXCLUDED.raw,
              fetched_at = now()",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, records), fields(rows = records.len()))]
    async fn apply_matches(&self, records: &[MatchRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let mut update: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "UPDATE cards SET external_product_id = v.product_id, updated_at = now() FROM (",
        );
        update.push_values(records, |mut b, m| {
            b.push_bind(&m.card_id).push_bind(m.product_id);
        });
        update.push(") AS v(card_id, product_id) WHERE cards.id = v.card_id");
        let mapped = update.build().execute(&mut *tx).await?.rows_affected();
        let cards: HashSet<&str> = records.iter().map(|m| m.card_id.as_str()).collect();
        if mapped != cards.len() as u64 {
            // dropping the transaction rolls the mappings back
            return Err(StoreError::NotFound(format!(
                "{} of {} matched card(s)",
                cards.len() as u64 - mapped,
                cards.len()
            )));
        }

        let mut insert: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO match_records (operation_id, card_id, product_id, group_id, confidence, method, applied, created_at) ",
        );
        insert.push_values(records, |mut b, m| {
            b.push_bind(m.operation_id.as_uuid())
                .push_bind(&m.card_id)
                .push_bind(m.product_id)
                .push_bind(m.group_id)
                .push_bind(m.confidence)
                .push_bind(m.method.as_str())
                .push_bind(m.applied)
                .push_bind(m.created_at);
        });
        insert.push(
            " ON CONFLICT (operation_id, card_id, product_id) DO UPDATE SET
              confidence = EXCLUDED.confidence,
              method = EXCLUDED.method,
              applied = EXCLUDED.applied,
              created_at = EXCLUDED.created_at",
        );
        let written = insert.build().execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;
        Ok(written)
    }

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_logs (id, operation_id, operation_type, status, details, duration_ms, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id)
        .bind(entry.operation_id.as_uuid())
        .bind(&entry.operation_type)
        .bind(entry.status.as_str())
        .bind(Json(&entry.details))
        .bind(entry.duration_ms)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, operation_id: Option<OperationId>, limit: usize) -> Result<Vec<SyncLogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, operation_id, operation_type, status, details, duration_ms, created_at
             FROM sync_logs
             WHERE ($1::uuid IS NULL OR operation_id = $1)
             ORDER BY created_at DESC, seq DESC
             LIMIT $2",
        )
        .bind(operation_id.map(|op| op.as_uuid()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, log_from_row)
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>, StoreError> {
        let row = sqlx::query("SELECT id, name, category_id, sets_count, cards_count FROM games WHERE id = $1")
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(game_from_row).transpose()
    }

    async fn get_set(&self, set_id: &str) -> Result<Option<CardSet>, StoreError> {
        let row = sqlx::query(
            "SELECT id, game_id, name, external_group_id, card_count, last_synced_at, sync_status
             FROM sets WHERE id = $1",
        )
        .bind(set_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(set_from_row).transpose()
    }

    async fn list_sets(&self, game_id: &str) -> Result<Vec<CardSet>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, game_id, name, external_group_id, card_count, last_synced_at, sync_status
             FROM sets WHERE game_id = $1 ORDER BY name",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, set_from_row)
    }

    async fn list_cards_for_set(&self, set_id: &str) -> Result<Vec<Card>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, set_id, game_id, name, number, rarity, image_url, external_product_id, attributes
             FROM cards WHERE set_id = $1 ORDER BY id",
        )
        .bind(set_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, card_from_row)
    }

    async fn list_cards_for_game(&self, game_id: &str) -> Result<Vec<Card>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, set_id, game_id, name, number, rarity, image_url, external_product_id, attributes
             FROM cards WHERE game_id = $1 ORDER BY id",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, card_from_row)
    }

    async fn list_prices_for_card(&self, card_id: &str) -> Result<Vec<PriceRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT card_id, printing, condition, currency, market, low, high, observed_at, source
             FROM card_prices WHERE card_id = $1 ORDER BY printing, condition",
        )
        .bind(card_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, price_from_row)
    }

    async fn list_catalog_groups(&self, category_id: i64) -> Result<Vec<CatalogGroup>, StoreError> {
        let rows = sqlx::query(
            "SELECT group_id, category_id, name, abbreviation, published_on, raw
             FROM catalog_groups WHERE category_id = $1 ORDER BY group_id",
        )
        .bind(category_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, group_from_row)
    }

    async fn list_catalog_products(&self, category_id: i64, group_ids: &[i64]) -> Result<Vec<CatalogProduct>, StoreError> {
        let rows = sqlx::query(
            "SELECT product_id, group_id, category_id, name, clean_name, number, image_url, raw
             FROM catalog_products
             WHERE category_id = $1 AND (cardinality($2::bigint[]) = 0 OR group_id = ANY($2))
             ORDER BY product_id",
        )
        .bind(category_id)
        .bind(group_ids)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, product_from_row)
    }

    async fn list_match_records(&self, operation_id: OperationId) -> Result<Vec<MatchRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT operation_id, card_id, product_id, group_id, confidence, method, applied, created_at
             FROM match_records WHERE operation_id = $1 ORDER BY card_id",
        )
        .bind(operation_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        collect(rows, match_from_row)
    }

    async fn applied_match_card_ids(&self, game_id: &str) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT m.card_id
             FROM match_records m JOIN cards c ON c.id = m.card_id
             WHERE m.applied AND c.game_id = $1",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("card_id").map_err(StoreError::from))
            .collect()
    }

    async fn set_group_link(&self, set_id: &str, group_id: i64) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE sets SET external_group_id = $2 WHERE id = $1")
            .bind(set_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("set {set_id}")));
        }
        Ok(())
    }

    async fn wipe_catalog(&self, category_id: i64) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let products = sqlx::query("DELETE FROM catalog_products WHERE category_id = $1")
            .bind(category_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let groups = sqlx::query("DELETE FROM catalog_groups WHERE category_id = $1")
            .bind(category_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(products + groups)
    }

    async fn update_set_sync_status(
        &self,
        set_id: &str,
        status: SyncStatus,
        card_count: Option<i64>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE sets SET sync_status = $2,
                card_count = COALESCE($3, card_count),
                last_synced_at = COALESCE($4, last_synced_at)
             WHERE id = $1",
        )
        .bind(set_id)
        .bind(status.as_str())
        .bind(card_count)
        .bind(synced_at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("set {set_id}")));
        }
        Ok(())
    }

    async fn refresh_game_counts(&self, game_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE games SET
                sets_count = (SELECT count(*) FROM sets WHERE game_id = $1),
                cards_count = (SELECT count(*) FROM cards WHERE game_id = $1),
                updated_at = now()
             WHERE id = $1",
        )
        .bind(game_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
