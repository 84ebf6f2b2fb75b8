//! Storage seam for the pipeline plus an in-process implementation.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Mutex;

use async_trait::async_trait;
use cardsync_core::{
    Card, CardSet, CatalogGroup, CatalogProduct, Game, MatchRecord, OperationId, PriceRecord, SyncLogEntry,
    SyncStatus,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),
    #[error("storage rejected the operation: {0}")]
    Permanent(String),
    #[error("{0} not found")]
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Everything the pipeline reads from or writes to durable storage.
///
/// Upserts are idempotent by natural key and return the number of records
/// written.
#[async_trait]
pub trait CardStore: Send + Sync {
    async fn upsert_games(&self, games: &[Game]) -> Result<u64, StoreError>;
    async fn upsert_sets(&self, sets: &[CardSet]) -> Result<u64, StoreError>;
    async fn upsert_cards(&self, cards: &[Card]) -> Result<u64, StoreError>;
    async fn upsert_prices(&self, prices: &[PriceRecord]) -> Result<u64, StoreError>;
    async fn upsert_catalog_groups(&self, groups: &[CatalogGroup]) -> Result<u64, StoreError>;
    async fn upsert_catalog_products(&self, products: &[CatalogProduct]) -> Result<u64, StoreError>;
    /// Points each record's card at its product and stores the record, all
    /// in one unit: either every mapping and record of the call lands or none.
    async fn apply_matches(&self, records: &[MatchRecord]) -> Result<u64, StoreError>;

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<(), StoreError>;
    /// Newest first.
    async fn list_logs(&self, operation_id: Option<OperationId>, limit: usize) -> Result<Vec<SyncLogEntry>, StoreError>;

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>, StoreError>;
    async fn get_set(&self, set_id: &str) -> Result<Option<CardSet>, StoreError>;
    async fn list_sets(&self, game_id: &str) -> Result<Vec<CardSet>, StoreError>;
    async fn list_cards_for_set(&self, set_id: &str) -> Result<Vec<Card>, StoreError>;
    async fn list_cards_for_game(&self, game_id: &str) -> Result<Vec<Card>, StoreError>;
    async fn list_prices_for_card(&self, card_id: &str) -> Result<Vec<PriceRecord>, StoreError>;
    async fn list_catalog_groups(&self, category_id: i64) -> Result<Vec<CatalogGroup>, StoreError>;
    /// Products of the category, limited to `group_ids` unless it is empty.
    async fn list_catalog_products(&self, category_id: i64, group_ids: &[i64]) -> Result<Vec<CatalogProduct>, StoreError>;
    async fn list_match_records(&self, operation_id: OperationId) -> Result<Vec<MatchRecord>, StoreError>;

    /// Cards of the game that already carry an applied match record.
    async fn applied_match_card_ids(&self, game_id: &str) -> Result<HashSet<String>, StoreError>;
    async fn set_group_link(&self, set_id: &str, group_id: i64) -> Result<(), StoreError>;
    /// Deletes staged catalog groups and products for a category.
    async fn wipe_catalog(&self, category_id: i64) -> Result<u64, StoreError>;
    async fn update_set_sync_status(
        &self,
        set_id: &str,
        status: SyncStatus,
        card_count: Option<i64>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    /// Recomputes a game's set and card aggregates.
    async fn refresh_game_counts(&self, game_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    games: BTreeMap<String, Game>,
    sets: BTreeMap<String, CardSet>,
    cards: BTreeMap<String, Card>,
    prices: BTreeMap<(String, String, String, String), PriceRecord>,
    groups: BTreeMap<i64, CatalogGroup>,
    products: BTreeMap<i64, CatalogProduct>,
    matches: BTreeMap<(OperationId, String, i64), MatchRecord>,
    logs: Vec<SyncLogEntry>,
    /// Successful `apply_matches` calls left before the next one fails.
    apply_budget: Option<usize>,
}

/// A single statement cannot touch the same row twice, so neither can one call.
fn reject_repeated_keys<T, K: Hash + Eq + Debug>(
    entity: &str,
    items: &[T],
    key: impl Fn(&T) -> K,
) -> Result<(), StoreError> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        let key = key(item);
        if seen.contains(&key) {
            return Err(StoreError::Permanent(format!("{entity} batch repeats key {key:?}")));
        }
        seen.insert(key);
    }
    Ok(())
}

/// Process-local store used by tests and dry local runs. Mirrors the
/// relational constraints of the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn match_record_count(&self) -> usize {
        self.lock().matches.len()
    }

    pub fn card(&self, card_id: &str) -> Option<Card> {
        self.lock().cards.get(card_id).cloned()
    }

    /// Lets `calls` more `apply_matches` calls succeed, then fails every later
    /// one without writing anything. `None` clears it.
    pub fn fail_applies_after(&self, calls: Option<usize>) {
        self.lock().apply_budget = calls;
    }
}

#[async_trait]
impl CardStore for MemoryStore {
    async fn upsert_games(&self, games: &[Game]) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        for game in games {
            inner.games.insert(game.id.clone(), game.clone());
        }
        Ok(games.len() as u64)
    }

    async fn upsert_sets(&self, sets: &[CardSet]) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        if let Some(orphan) = sets.iter().find(|s| !inner.games.contains_key(&s.game_id)) {
            return Err(StoreError::Permanent(format!(
                "set {} references unknown game {}",
                orphan.id, orphan.game_id
            )));
        }
        for set in sets {
            inner.sets.insert(set.id.clone(), set.clone());
        }
        Ok(sets.len() as u64)
    }

    async fn upsert_cards(&self, cards: &[Card]) -> Result<u64, StoreError> {
        reject_repeated_keys("cards", cards, |c| c.id.clone())?;
        let mut inner = self.lock();
        if let Some(orphan) = cards.iter().find(|c| !inner.sets.contains_key(&c.set_id)) {
            return Err(StoreError::Permanent(format!(
                "card {} references unknown set {}",
                orphan.id, orphan.set_id
            )));
        }
        for card in cards {
            inner.cards.insert(card.id.clone(), card.clone());
        }
        Ok(cards.len() as u64)
    }

    async fn upsert_prices(&self, prices: &[PriceRecord]) -> Result<u64, StoreError> {
        reject_repeated_keys("prices", prices, |p| {
            let (card, printing, condition, source) = p.key();
            (card.to_string(), printing.to_string(), condition.to_string(), source.to_string())
        })?;
        let mut inner = self.lock();
        if let Some(orphan) = prices.iter().find(|p| !inner.cards.contains_key(&p.card_id)) {
            return Err(StoreError::Permanent(format!("price for unknown card {}", orphan.card_id)));
        }
        for price in prices {
            let (card, printing, condition, source) = price.key();
            let key = (card.to_string(), printing.to_string(), condition.to_string(), source.to_string());
            match inner.prices.get(&key) {
                Some(existing) if existing.observed_at > price.observed_at => {}
                _ => {
                    inner.prices.insert(key, price.clone());
                }
            }
        }
        Ok(prices.len() as u64)
    }

    async fn upsert_catalog_groups(&self, groups: &[CatalogGroup]) -> Result<u64, StoreError> {
        reject_repeated_keys("catalog_groups", groups, |g| g.group_id)?;
        let mut inner = self.lock();
        for group in groups {
            inner.groups.insert(group.group_id, group.clone());
        }
        Ok(groups.len() as u64)
    }

    async fn upsert_catalog_products(&self, products: &[CatalogProduct]) -> Result<u64, StoreError> {
        reject_repeated_keys("catalog_products", products, |p| p.product_id)?;
        let mut inner = self.lock();
        for product in products {
            inner.products.insert(product.product_id, product.clone());
        }
        Ok(products.len() as u64)
    }

    async fn apply_matches(&self, records: &[MatchRecord]) -> Result<u64, StoreError> {
        reject_repeated_keys("match_records", records, |r| (r.operation_id, r.card_id.clone(), r.product_id))?;
        let mut inner = self.lock();
        if let Some(missing) = records.iter().find(|r| !inner.cards.contains_key(&r.card_id)) {
            return Err(StoreError::NotFound(format!("card {}", missing.card_id)));
        }
        match inner.apply_budget {
            Some(0) => return Err(StoreError::Permanent("match apply rejected".into())),
            Some(left) => inner.apply_budget = Some(left - 1),
            None => {}
        }
        for record in records {
            if let Some(card) = inner.cards.get_mut(&record.card_id) {
                card.external_product_id = Some(record.product_id);
            }
            let key = (record.operation_id, record.card_id.clone(), record.product_id);
            inner.matches.insert(key, record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn append_log(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        self.lock().logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, operation_id: Option<OperationId>, limit: usize) -> Result<Vec<SyncLogEntry>, StoreError> {
        let inner = self.lock();
        let mut logs: Vec<SyncLogEntry> = inner
            .logs
            .iter()
            .filter(|e| operation_id.map_or(true, |op| e.operation_id == op))
            .cloned()
            .collect();
        // stable sort keeps append order for equal timestamps, so reverse first
        logs.reverse();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>, StoreError> {
        Ok(self.lock().games.get(game_id).cloned())
    }

    async fn get_set(&self, set_id: &str) -> Result<Option<CardSet>, StoreError> {
        Ok(self.lock().sets.get(set_id).cloned())
    }

    async fn list_sets(&self, game_id: &str) -> Result<Vec<CardSet>, StoreError> {
        Ok(self
            .lock()
            .sets
            .values()
            .filter(|s| s.game_id == game_id)
            .cloned()
            .collect())
    }

    async fn list_cards_for_set(&self, set_id: &str) -> Result<Vec<Card>, StoreError> {
        Ok(self
            .lock()
            .cards
            .values()
            .filter(|c| c.set_id == set_id)
            .cloned()
            .collect())
    }

    async fn list_cards_for_game(&self, game_id: &str) -> Result<Vec<Card>, StoreError> {
        Ok(self
            .lock()
            .cards
            .values()
            .filter(|c| c.game_id == game_id)
            .cloned()
            .collect())
    }

    async fn list_prices_for_card(&self, card_id: &str) -> Result<Vec<PriceRecord>, StoreError> {
        Ok(self
            .lock()
            .prices
            .values()
            .filter(|p| p.card_id == card_id)
            .cloned()
            .collect())
    }

    async fn list_catalog_groups(&self, category_id: i64) -> Result<Vec<CatalogGroup>, StoreError> {
        Ok(self
            .lock()
            .groups
            .values()
            .filter(|g| g.category_id == category_id)
            .cloned()
            .collect())
    }

    async fn list_catalog_products(&self, category_id: i64, group_ids: &[i64]) -> Result<Vec<CatalogProduct>, StoreError> {
        Ok(self
            .lock()
            .products
            .values()
            .filter(|p| p.category_id == category_id)
            .filter(|p| group_ids.is_empty() || group_ids.contains(&p.group_id))
            .cloned()
            .collect())
    }

    async fn list_match_records(&self, operation_id: OperationId) -> Result<Vec<MatchRecord>, StoreError> {
        Ok(self
            .lock()
            .matches
            .values()
            .filter(|m| m.operation_id == operation_id)
            .cloned()
            .collect())
    }

    async fn applied_match_card_ids(&self, game_id: &str) -> Result<HashSet<String>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .matches
            .values()
            .filter(|m| m.applied)
            .filter(|m| inner.cards.get(&m.card_id).is_some_and(|c| c.game_id == game_id))
            .map(|m| m.card_id.clone())
            .collect())
    }

    async fn set_group_link(&self, set_id: &str, group_id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let set = inner
            .sets
            .get_mut(set_id)
            .ok_or_else(|| StoreError::NotFound(format!("set {set_id}")))?;
        set.external_group_id = Some(group_id);
        Ok(())
    }

    async fn wipe_catalog(&self, category_id: i64) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.groups.len() + inner.products.len();
        inner.groups.retain(|_, g| g.category_id != category_id);
        inner.products.retain(|_, p| p.category_id != category_id);
        Ok((before - inner.groups.len() - inner.products.len()) as u64)
    }

    async fn update_set_sync_status(
        &self,
        set_id: &str,
        status: SyncStatus,
        card_count: Option<i64>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let set = inner
            .sets
            .get_mut(set_id)
            .ok_or_else(|| StoreError::NotFound(format!("set {set_id}")))?;
        set.sync_status = status;
        if let Some(count) = card_count {
            set.card_count = count;
        }
        if synced_at.is_some() {
            set.last_synced_at = synced_at;
        }
        Ok(())
    }

    async fn refresh_game_counts(&self, game_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let sets_count = inner.sets.values().filter(|s| s.game_id == game_id).count() as i64;
        let cards_count = inner.cards.values().filter(|c| c.game_id == game_id).count() as i64;
        let game = inner
            .games
            .get_mut(game_id)
            .ok_or_else(|| StoreError::NotFound(format!("game {game_id}")))?;
        game.sets_count = sets_count;
        game.cards_count = cards_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn game() -> Game {
        Game {
            id: "pokemon".into(),
            name: "Pokemon".into(),
            category_id: Some(3),
            sets_count: 0,
            cards_count: 0,
        }
    }

    fn set() -> CardSet {
        CardSet {
            id: "base-set".into(),
            game_id: "pokemon".into(),
            name: "Base Set".into(),
            external_group_id: None,
            card_count: 0,
            last_synced_at: None,
            sync_status: SyncStatus::NotStarted,
        }
    }

    fn card(id: &str) -> Card {
        Card {
            id: id.into(),
            set_id: "base-set".into(),
            game_id: "pokemon".into(),
            name: id.into(),
            number: None,
            rarity: None,
            image_url: None,
            external_product_id: None,
            attributes: Default::default(),
        }
    }

    fn price(market: f64, observed_at: DateTime<Utc>) -> PriceRecord {
        PriceRecord {
            card_id: "charizard".into(),
            printing: "Holofoil".into(),
            condition: "Near Mint".into(),
            currency: "USD".into(),
            market: Some(market),
            low: None,
            high: None,
            observed_at,
            source: "pricing".into(),
        }
    }

    #[tokio::test]
    async fn children_require_their_parents() {
        let store = MemoryStore::new();
        assert!(store.upsert_sets(&[set()]).await.is_err());
        store.upsert_games(&[game()]).await.unwrap();
        store.upsert_sets(&[set()]).await.unwrap();
        store.upsert_cards(&[card("charizard"), card("blastoise")]).await.unwrap();
        store.refresh_game_counts("pokemon").await.unwrap();
        let game = store.get_game("pokemon").await.unwrap().unwrap();
        assert_eq!((game.sets_count, game.cards_count), (1, 2));
    }

    #[tokio::test]
    async fn older_price_observations_do_not_overwrite_newer_ones() {
        let store = MemoryStore::new();
        store.upsert_games(&[game()]).await.unwrap();
        store.upsert_sets(&[set()]).await.unwrap();
        store.upsert_cards(&[card("charizard")]).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).single().unwrap();
        store.upsert_prices(&[price(400.0, now)]).await.unwrap();
        store.upsert_prices(&[price(350.0, now - Duration::days(1))]).await.unwrap();
        let prices = store.list_prices_for_card("charizard").await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].market, Some(400.0));
    }

    #[tokio::test]
    async fn one_call_may_not_repeat_a_key() {
        let store = MemoryStore::new();
        store.upsert_games(&[game()]).await.unwrap();
        store.upsert_sets(&[set()]).await.unwrap();
        store.upsert_cards(&[card("charizard")]).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).single().unwrap();
        let err = store
            .upsert_prices(&[price(400.0, now), price(410.0, now)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Permanent(_)));
        assert!(store.list_prices_for_card("charizard").await.unwrap().is_empty());
        assert!(store.upsert_cards(&[card("pikachu"), card("pikachu")]).await.is_err());
    }

    #[tokio::test]
    async fn applying_matches_maps_cards_with_their_records() {
        let store = MemoryStore::new();
        store.upsert_games(&[game()]).await.unwrap();
        store.upsert_sets(&[set()]).await.unwrap();
        store.upsert_cards(&[card("charizard"), card("blastoise")]).await.unwrap();

        let op = OperationId::new();
        let record = |card_id: &str, product_id| MatchRecord {
            operation_id: op,
            card_id: card_id.into(),
            product_id,
            group_id: 604,
            confidence: 1.0,
            method: cardsync_core::MatchMethod::ExactId,
            applied: true,
            created_at: Utc::now(),
        };

        assert_eq!(store.apply_matches(&[record("charizard", 42382)]).await.unwrap(), 1);
        assert_eq!(store.card("charizard").unwrap().external_product_id, Some(42382));

        let err = store
            .apply_matches(&[record("blastoise", 42383), record("mewtwo", 42384)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.card("blastoise").unwrap().external_product_id, None);

        store.fail_applies_after(Some(0));
        assert!(store.apply_matches(&[record("blastoise", 42383)]).await.is_err());
        assert_eq!(store.card("blastoise").unwrap().external_product_id, None);
        assert_eq!(store.match_record_count(), 1);
    }

    #[tokio::test]
    async fn wipe_only_touches_one_category() {
        let store = MemoryStore::new();
        let group = |group_id, category_id| CatalogGroup {
            group_id,
            category_id,
            name: format!("g{group_id}"),
            abbreviation: None,
            published_on: None,
            raw: json!({}),
        };
        store
            .upsert_catalog_groups(&[group(1, 3), group(2, 3), group(3, 68)])
            .await
            .unwrap();
        assert_eq!(store.wipe_catalog(3).await.unwrap(), 2);
        assert_eq!(store.list_catalog_groups(68).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn logs_come_back_newest_first() {
        let store = MemoryStore::new();
        let op = OperationId::new();
        let at = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap();
        for (i, status) in ["started", "warning", "success"].iter().enumerate() {
            store
                .append_log(&SyncLogEntry {
                    id: uuid::Uuid::new_v4(),
                    operation_id: op,
                    operation_type: "harvest".into(),
                    status: status.parse().unwrap(),
                    details: json!({}),
                    duration_ms: None,
                    created_at: at + Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }
        let logs = store.list_logs(Some(op), 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status.as_str(), "success");
        assert!(store.list_logs(Some(OperationId::new()), 10).await.unwrap().is_empty());
    }
}
