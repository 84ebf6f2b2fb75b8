//! Client for the card pricing API (`GET /cards`).

use std::sync::Arc;

use async_trait::async_trait;
use cardsync_storage::{OutboundRequest, RateLimitedFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{page_from_payload, AdapterError, Page, PageSource};

const CARD_ALIASES: &[&str] = &["cards"];

/// Direct lookups. When more than one is set the strongest wins:
/// `cardId`, then `tcgplayerId`, then `variantId`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIdentifiers {
    pub card_id: Option<String>,
    pub tcgplayer_id: Option<String>,
    pub variant_id: Option<String>,
}

impl CardIdentifiers {
    pub fn strongest(&self) -> Option<(&'static str, &str)> {
        [
            ("cardId", &self.card_id),
            ("tcgplayerId", &self.tcgplayer_id),
            ("variantId", &self.variant_id),
        ]
        .into_iter()
        .find_map(|(param, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (param, v))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSearch {
    pub game: Option<String>,
    pub set: Option<String>,
    pub name: Option<String>,
    pub order_by: Option<String>,
    pub order: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardQuery {
    #[serde(default)]
    pub ids: CardIdentifiers,
    #[serde(default)]
    pub search: CardSearch,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl CardQuery {
    pub fn by_card_id(card_id: impl Into<String>) -> Self {
        Self {
            ids: CardIdentifiers {
                card_id: Some(card_id.into()),
                ..CardIdentifiers::default()
            },
            ..Self::default()
        }
    }

    pub fn for_set(game: impl Into<String>, set: impl Into<String>) -> Self {
        Self {
            search: CardSearch {
                game: Some(game.into()),
                set: Some(set.into()),
                ..CardSearch::default()
            },
            ..Self::default()
        }
    }

    /// Query parameters in a fixed order. An identifier suppresses every
    /// search parameter. Fails without touching the network when neither an
    /// identifier nor a game plus set or name is present.
    pub fn params(&self) -> Result<Vec<(&'static str, String)>, AdapterError> {
        if let Some((param, value)) = self.ids.strongest() {
            return Ok(vec![(param, value.to_string())]);
        }

        let search = &self.search;
        let Some(game) = non_blank(&search.game) else {
            return Err(AdapterError::Validation(
                "either cardId, tcgplayerId, variantId or game is required".to_string(),
            ));
        };
        let set = non_blank(&search.set);
        let name = non_blank(&search.name);
        if set.is_none() && name.is_none() {
            return Err(AdapterError::Validation(format!(
                "game {game} needs a set or a name to search"
            )));
        }

        let mut params = vec![("game", game.to_string())];
        params.extend(set.map(|v| ("set", v.to_string())));
        params.extend(name.map(|v| ("name", v.to_string())));
        params.extend(non_blank(&search.order_by).map(|v| ("orderBy", v.to_string())));
        params.extend(non_blank(&search.order).map(|v| ("order", v.to_string())));
        params.extend(search.limit.map(|v| ("limit", v.to_string())));
        params.extend(search.offset.map(|v| ("offset", v.to_string())));
        Ok(params)
    }
}

#[derive(Debug, Clone)]
pub struct PricingApiClient {
    fetcher: Arc<RateLimitedFetcher>,
    base_url: String,
    api_key: Option<String>,
}

impl PricingApiClient {
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

    pub fn cards_request(&self, query: &CardQuery) -> Result<OutboundRequest, AdapterError> {
        let mut request = OutboundRequest::get(format!("{}/cards", self.base_url));
        for (key, value) in query.params()? {
            request = request.query(key, value);
        }
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key.clone());
        }
        Ok(request)
    }

    pub async fn get_cards(&self, query: &CardQuery) -> Result<Page<JsonValue>, AdapterError> {
        let request = self.cards_request(query)?;
        let payload: JsonValue = self.fetcher.fetch_json(request).await?;
        let page = page_from_payload(self.fetcher.upstream(), &payload, CARD_ALIASES)?;
        debug!(items = page.items.len(), total = ?page.meta.total, "pricing page received");
        Ok(page)
    }

    /// Every card of one set, as a source for the paginator.
    pub fn set_cards(&self, game: &str, set: &str, order_by: Option<String>, order: Option<String>) -> SetCardsSource {
        SetCardsSource {
            client: self.clone(),
            game: game.to_string(),
            set: set.to_string(),
            order_by,
            order,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetCardsSource {
    client: PricingApiClient,
    game: String,
    set: String,
    order_by: Option<String>,
    order: Option<String>,
}

#[async_trait]
impl PageSource for SetCardsSource {
    type Item = JsonValue;

    fn item_id(&self, item: &JsonValue) -> Option<String> {
        let obj = item.as_object()?;
        ["id", "cardId"].iter().find_map(|key| match obj.get(*key)? {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Page<JsonValue>, AdapterError> {
        let query = CardQuery {
            ids: CardIdentifiers::default(),
            search: CardSearch {
                game: Some(self.game.clone()),
                set: Some(self.set.clone()),
                name: None,
                order_by: self.order_by.clone(),
                order: self.order.clone(),
                limit: Some(limit),
                offset: Some(offset),
            },
        };
        self.client.get_cards(&query).await
    }
}
