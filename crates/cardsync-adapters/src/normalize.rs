//! Maps heterogeneous upstream payloads onto the internal record shapes.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use cardsync_core::{Card, CatalogGroup, CatalogProduct, PriceRecord};
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::csv_stream::{normalize_header, CsvRow};

/// Wrapper keys checked, in order, before any entity-specific alias.
pub const DEFAULT_WRAPPER_KEYS: [&str; 3] = ["data", "results", "items"];

const META_CONTAINERS: [&str; 3] = ["meta", "_metadata", "pagination"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub has_more: Option<bool>,
    pub total: Option<u64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl PageMeta {
    fn fill_from(&mut self, map: &JsonMap<String, JsonValue>) {
        if self.has_more.is_none() {
            self.has_more = first_present(map, &["hasMore", "has_more"]).and_then(json_bool);
        }
        if self.total.is_none() {
            self.total = first_present(map, &["total", "totalCount", "total_count", "totalResults"])
                .and_then(json_u64);
        }
        if self.limit.is_none() {
            self.limit = first_present(map, &["limit", "pageSize", "page_size"]).and_then(json_u64);
        }
        if self.offset.is_none() {
            self.offset = first_present(map, &["offset", "skip"]).and_then(json_u64);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum CollectionSource {
    TopLevelArray,
    Wrapper(String),
    SingleObject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Found {
        items: Vec<JsonValue>,
        meta: PageMeta,
        source: CollectionSource,
    },
    NotFound,
}

/// Locates the array of interest inside an upstream payload.
///
/// A top-level array wins outright. Otherwise the wrapper keys
/// ([`DEFAULT_WRAPPER_KEYS`] then `aliases`) are tried in order and the first
/// one holding an array is used. A remaining non-empty object that is not an
/// error envelope is treated as a single-element result.
pub fn resolve_collection(payload: &JsonValue, aliases: &[&str]) -> Resolved {
    match payload {
        JsonValue::Array(items) => Resolved::Found {
            items: items.clone(),
            meta: PageMeta::default(),
            source: CollectionSource::TopLevelArray,
        },
        JsonValue::Object(map) => {
            for key in DEFAULT_WRAPPER_KEYS.iter().chain(aliases.iter()) {
                if let Some(JsonValue::Array(items)) = map.get(*key) {
                    return Resolved::Found {
                        items: items.clone(),
                        meta: extract_meta(map),
                        source: CollectionSource::Wrapper((*key).to_string()),
                    };
                }
            }
            if map.is_empty() || map.contains_key("error") || map.contains_key("errors") {
                return Resolved::NotFound;
            }
            Resolved::Found {
                items: vec![payload.clone()],
                meta: PageMeta::default(),
                source: CollectionSource::SingleObject,
            }
        }
        _ => Resolved::NotFound,
    }
}

/// Pagination metadata from `meta`, `_metadata` or `pagination`, then from
/// fields sitting next to the collection itself.
pub fn extract_meta(map: &JsonMap<String, JsonValue>) -> PageMeta {
    let mut meta = PageMeta::default();
    for key in META_CONTAINERS {
        if let Some(JsonValue::Object(inner)) = map.get(key) {
            meta.fill_from(inner);
        }
    }
    meta.fill_from(map);
    meta
}

fn first_present<'a>(map: &'a JsonMap<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

fn json_u64(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_start_matches('$').parse().ok(),
        _ => None,
    }
}

fn json_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        JsonValue::String(s) => parse_bool_like(s),
        _ => None,
    }
}

fn json_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_field(obj: &JsonMap<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(json_string)
}

fn i64_field(obj: &JsonMap<String, JsonValue>, keys: &[&str]) -> Option<i64> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(json_i64)
}

fn f64_field(obj: &JsonMap<String, JsonValue>, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(json_f64)
}

/// `true`/`1`/`yes`/`y` and `false`/`0`/`no`/`n`, case-insensitive.
/// Anything else is unknown.
pub fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Picks the header that stands for a logical column.
pub trait HeaderResolver: Send + Sync {
    fn resolve<'h>(&self, headers: &'h [String], candidates: &[&str]) -> Option<&'h str>;
}

/// Header must equal a normalized candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactHeaderResolver;

impl HeaderResolver for ExactHeaderResolver {
    fn resolve<'h>(&self, headers: &'h [String], candidates: &[&str]) -> Option<&'h str> {
        candidates.iter().find_map(|candidate| {
            let wanted = normalize_header(candidate);
            headers.iter().find(|h| **h == wanted).map(String::as_str)
        })
    }
}

/// Exact match first, then substring containment on alphanumerics only, so
/// `group_id`, `groupId` and `tcg_group_id` all answer to `groupid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzyHeaderResolver;

fn compact(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl HeaderResolver for FuzzyHeaderResolver {
    fn resolve<'h>(&self, headers: &'h [String], candidates: &[&str]) -> Option<&'h str> {
        if let Some(hit) = ExactHeaderResolver.resolve(headers, candidates) {
            return Some(hit);
        }
        candidates.iter().find_map(|candidate| {
            let needle = compact(candidate);
            if needle.is_empty() {
                return None;
            }
            headers
                .iter()
                .find(|h| compact(h).contains(&needle))
                .map(String::as_str)
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub field: &'static str,
    pub candidates: &'static [&'static str],
    pub required: bool,
}

pub const GROUP_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { field: "group_id", candidates: &["group_id", "groupid"], required: true },
    ColumnSpec { field: "name", candidates: &["name", "group_name"], required: true },
    ColumnSpec { field: "abbreviation", candidates: &["abbreviation", "abbr", "code"], required: false },
    ColumnSpec { field: "published_on", candidates: &["published_on", "release_date", "published"], required: false },
];

pub const PRODUCT_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { field: "product_id", candidates: &["product_id", "productid"], required: true },
    ColumnSpec { field: "name", candidates: &["name", "product_name"], required: true },
    ColumnSpec { field: "group_id", candidates: &["group_id", "groupid"], required: true },
    ColumnSpec { field: "clean_name", candidates: &["clean_name", "cleanname"], required: false },
    ColumnSpec { field: "number", candidates: &["ext_number", "number", "card_number"], required: false },
    ColumnSpec { field: "image_url", candidates: &["image_url", "imageurl", "image"], required: false },
];

/// Logical field name to the concrete header it resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedColumns {
    columns: BTreeMap<&'static str, String>,
    missing_required: Vec<&'static str>,
}

impl ResolvedColumns {
    pub fn resolve(headers: &[String], specs: &[ColumnSpec], resolver: &dyn HeaderResolver) -> Self {
        let mut out = Self::default();
        for spec in specs {
            match resolver.resolve(headers, spec.candidates) {
                Some(header) => {
                    out.columns.insert(spec.field, header.to_string());
                }
                None if spec.required => out.missing_required.push(spec.field),
                None => {}
            }
        }
        out
    }

    pub fn header_for(&self, field: &str) -> Option<&str> {
        self.columns.get(field).map(String::as_str)
    }

    pub fn missing_required(&self) -> &[&'static str] {
        &self.missing_required
    }

    pub fn cell<'r>(&self, row: &'r CsvRow, field: &str) -> Option<&'r str> {
        let header = self.columns.get(field)?;
        row.get(header)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Per-row normalization result; skipped rows are counted, not failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome<T> {
    Parsed(T),
    Skipped { reason: String },
}

impl<T> RowOutcome<T> {
    fn skipped(reason: impl Into<String>) -> Self {
        RowOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn parsed(self) -> Option<T> {
        match self {
            RowOutcome::Parsed(value) => Some(value),
            RowOutcome::Skipped { .. } => None,
        }
    }
}

fn row_to_json(row: &CsvRow) -> JsonValue {
    JsonValue::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect(),
    )
}

pub fn normalize_group_row(row: &CsvRow, columns: &ResolvedColumns, category_id: i64) -> RowOutcome<CatalogGroup> {
    let Some(group_id) = columns.cell(row, "group_id").and_then(|v| v.parse::<i64>().ok()) else {
        return RowOutcome::skipped("missing or non-numeric group id");
    };
    let Some(name) = columns.cell(row, "name") else {
        return RowOutcome::skipped(format!("group {group_id} has no name"));
    };
    RowOutcome::Parsed(CatalogGroup {
        group_id,
        category_id,
        name: name.to_string(),
        abbreviation: columns.cell(row, "abbreviation").map(ToString::to_string),
        published_on: columns.cell(row, "published_on").map(ToString::to_string),
        raw: row_to_json(row),
    })
}

pub fn normalize_product_row(row: &CsvRow, columns: &ResolvedColumns, category_id: i64) -> RowOutcome<CatalogProduct> {
    let Some(product_id) = columns.cell(row, "product_id").and_then(|v| v.parse::<i64>().ok()) else {
        return RowOutcome::skipped("missing or non-numeric product id");
    };
    let Some(group_id) = columns.cell(row, "group_id").and_then(|v| v.parse::<i64>().ok()) else {
        return RowOutcome::skipped(format!("product {product_id} has no group id"));
    };
    let Some(name) = columns.cell(row, "name") else {
        return RowOutcome::skipped(format!("product {product_id} has no name"));
    };
    let number = columns
        .cell(row, "number")
        .map(ToString::to_string)
        .or_else(|| extract_card_number(name));
    RowOutcome::Parsed(CatalogProduct {
        product_id,
        group_id,
        category_id,
        name: name.to_string(),
        clean_name: columns.cell(row, "clean_name").map(ToString::to_string),
        number,
        image_url: columns.cell(row, "image_url").map(ToString::to_string),
        raw: row_to_json(row),
    })
}

pub fn normalize_group_json(value: &JsonValue, category_id: i64) -> RowOutcome<CatalogGroup> {
    let Some(obj) = value.as_object() else {
        return RowOutcome::skipped("group entry is not an object");
    };
    let Some(group_id) = i64_field(obj, &["groupId", "group_id", "id"]) else {
        return RowOutcome::skipped("group entry has no id");
    };
    let Some(name) = str_field(obj, &["name", "groupName"]) else {
        return RowOutcome::skipped(format!("group {group_id} has no name"));
    };
    RowOutcome::Parsed(CatalogGroup {
        group_id,
        category_id: i64_field(obj, &["categoryId", "category_id"]).unwrap_or(category_id),
        name,
        abbreviation: str_field(obj, &["abbreviation", "abbr"]),
        published_on: str_field(obj, &["publishedOn", "published_on"]),
        raw: value.clone(),
    })
}

fn extended_data_number(obj: &JsonMap<String, JsonValue>) -> Option<String> {
    let entries = obj
        .get("extendedData")
        .or_else(|| obj.get("extended_data"))?
        .as_array()?;
    entries.iter().find_map(|entry| {
        let entry = entry.as_object()?;
        let name = str_field(entry, &["name", "displayName"])?;
        if name.eq_ignore_ascii_case("number") {
            str_field(entry, &["value"])
        } else {
            None
        }
    })
}

/// Chooses the image URL for a catalog product: an explicit URL first, then
/// the largest entry of an `images` object.
fn select_image_url(obj: &JsonMap<String, JsonValue>) -> Option<String> {
    str_field(obj, &["imageUrl", "image_url", "image"]).or_else(|| {
        let images = obj.get("images")?.as_object()?;
        str_field(images, &["large", "medium", "small"])
    })
}

pub fn normalize_product_json(value: &JsonValue, category_id: i64, group_id: i64) -> RowOutcome<CatalogProduct> {
    let Some(obj) = value.as_object() else {
        return RowOutcome::skipped("product entry is not an object");
    };
    let Some(product_id) = i64_field(obj, &["productId", "product_id", "id"]) else {
        return RowOutcome::skipped("product entry has no id");
    };
    let Some(name) = str_field(obj, &["name", "productName"]) else {
        return RowOutcome::skipped(format!("product {product_id} has no name"));
    };
    let number = extended_data_number(obj)
        .or_else(|| str_field(obj, &["number", "cardNumber"]))
        .or_else(|| extract_card_number(&name));
    RowOutcome::Parsed(CatalogProduct {
        product_id,
        group_id: i64_field(obj, &["groupId", "group_id"]).unwrap_or(group_id),
        category_id: i64_field(obj, &["categoryId", "category_id"]).unwrap_or(category_id),
        clean_name: str_field(obj, &["cleanName", "clean_name"]),
        image_url: select_image_url(obj),
        number,
        name,
        raw: value.clone(),
    })
}

struct NumberRule {
    regex: Regex,
    whole_match: bool,
}

fn number_rules() -> &'static [NumberRule] {
    static RULES: OnceLock<Vec<NumberRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            // collector fraction: 4/102, TG05/TG30
            (r"(?i)\b([a-z]{0,4}\d+[a-z]?)\s*/\s*([a-z]{0,4}\d+)\b", true),
            // letter-prefixed code: SWSH050, SV-045
            (r"\b([A-Z]{1,5}-?\d{1,4}[a-z]?)\b", false),
            // hash-prefixed: #25
            (r"#\s*([A-Za-z]{0,4}\d+[a-z]?)\b", false),
            // bare trailing number: "Pikachu - 58"
            (r"(?:^|[\s\-(])(\d{1,4}[a-z]?)\)?\s*$", false),
        ]
        .into_iter()
        .map(|(pattern, whole_match)| NumberRule {
            regex: Regex::new(pattern).expect("card number pattern compiles"),
            whole_match,
        })
        .collect()
    })
}

/// Pulls a collector number out of a free-text product name. Rules are
/// tried in order and the first hit wins.
pub fn extract_card_number(name: &str) -> Option<String> {
    number_rules().iter().find_map(|rule| {
        let caps = rule.regex.captures(name)?;
        if rule.whole_match {
            let left = caps.get(1)?.as_str();
            let right = caps.get(2)?.as_str();
            Some(format!("{left}/{right}"))
        } else {
            caps.get(1).map(|m| m.as_str().to_string())
        }
    })
}

/// Canonical form for number equality: left side of a fraction, lower-case,
/// separators dropped, leading zeros of the numeric part removed.
pub fn comparable_number(number: &str) -> Option<String> {
    let left = number.split('/').next()?.trim().trim_start_matches('#');
    let cleaned: String = left
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let prefix_len = cleaned.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    let (prefix, rest) = cleaned.split_at(prefix_len);
    let digits_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let (digits, suffix) = rest.split_at(digits_len);
    let digits = digits.trim_start_matches('0');
    let digits = if digits.is_empty() && digits_len > 0 { "0" } else { digits };
    Some(format!("{prefix}{digits}{suffix}"))
}

/// A pricing-upstream card mapped onto the internal shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCard {
    pub card: Card,
    pub prices: Vec<PriceRecord>,
}

const KNOWN_CARD_KEYS: &[&str] = &[
    "id", "cardId", "name", "number", "cardNumber", "rarity", "tcgplayerId", "tcgplayer_id",
    "image", "imageUrl", "image_url", "variants", "set", "game",
];

fn parse_observed_at(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    match value? {
        JsonValue::Number(n) => {
            let secs = n.as_i64()?;
            // millisecond epochs show up on some endpoints
            let secs = if secs > 10_000_000_000 { secs / 1000 } else { secs };
            Utc.timestamp_opt(secs, 0).single()
        }
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

fn price_from(
    card_id: &str,
    printing: &str,
    obj: &JsonMap<String, JsonValue>,
    source: &str,
    fallback_at: DateTime<Utc>,
) -> Option<PriceRecord> {
    let condition = str_field(obj, &["condition", "conditionName"])?;
    let market = f64_field(obj, &["market", "price", "marketPrice"]);
    let low = f64_field(obj, &["low", "lowPrice"]);
    let high = f64_field(obj, &["high", "highPrice"]);
    if market.is_none() && low.is_none() && high.is_none() {
        return None;
    }
    Some(PriceRecord {
        card_id: card_id.to_string(),
        printing: printing.to_string(),
        condition,
        currency: str_field(obj, &["currency"]).unwrap_or_else(|| "USD".to_string()),
        market,
        low,
        high,
        observed_at: parse_observed_at(obj.get("lastUpdated").or_else(|| obj.get("updatedAt")))
            .unwrap_or(fallback_at),
        source: source.to_string(),
    })
}

/// Prices from either nested `variants[].conditions[]` or flat
/// `variants[]` entries that carry their own condition.
fn extract_prices(card_id: &str, obj: &JsonMap<String, JsonValue>, source: &str, observed_at: DateTime<Utc>) -> Vec<PriceRecord> {
    let Some(variants) = obj.get("variants").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for variant in variants.iter().filter_map(JsonValue::as_object) {
        let printing = str_field(variant, &["printing", "printingName"]).unwrap_or_else(|| "Normal".to_string());
        match variant.get("conditions").and_then(JsonValue::as_array) {
            Some(conditions) => found.extend(
                conditions
                    .iter()
                    .filter_map(JsonValue::as_object)
                    .filter_map(|c| price_from(card_id, &printing, c, source, observed_at)),
            ),
            None => found.extend(price_from(card_id, &printing, variant, source, observed_at)),
        }
    }

    // variants differing only in language share a printing and condition
    let mut out: Vec<PriceRecord> = Vec::with_capacity(found.len());
    for price in found {
        match out
            .iter_mut()
            .find(|kept| kept.printing == price.printing && kept.condition == price.condition)
        {
            Some(kept) if price.observed_at >= kept.observed_at => *kept = price,
            Some(_) => {}
            None => out.push(price),
        }
    }
    out
}

pub fn normalize_pricing_card(
    value: &JsonValue,
    game_id: &str,
    set_id: &str,
    source: &str,
    observed_at: DateTime<Utc>,
) -> RowOutcome<NormalizedCard> {
    let Some(obj) = value.as_object() else {
        return RowOutcome::skipped("card entry is not an object");
    };
    let Some(id) = str_field(obj, &["id", "cardId"]) else {
        return RowOutcome::skipped("card entry has no id");
    };
    let Some(name) = str_field(obj, &["name"]) else {
        return RowOutcome::skipped(format!("card {id} has no name"));
    };
    let number = str_field(obj, &["number", "cardNumber"]).or_else(|| extract_card_number(&name));
    let attributes = obj
        .iter()
        .filter(|(k, _)| !KNOWN_CARD_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let prices = extract_prices(&id, obj, source, observed_at);

    RowOutcome::Parsed(NormalizedCard {
        card: Card {
            set_id: set_id.to_string(),
            game_id: game_id.to_string(),
            rarity: str_field(obj, &["rarity"]),
            image_url: str_field(obj, &["image", "imageUrl", "image_url"]),
            external_product_id: i64_field(obj, &["tcgplayerId", "tcgplayer_id"]),
            id,
            name,
            number,
            attributes,
        },
        prices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items_of(resolved: Resolved) -> (Vec<JsonValue>, PageMeta, CollectionSource) {
        match resolved {
            Resolved::Found { items, meta, source } => (items, meta, source),
            Resolved::NotFound => panic!("expected a collection"),
        }
    }

    #[test]
    fn resolves_wrapped_arrays_in_priority_order() {
        let payload = json!({
            "results": [{"id": 2}],
            "data": [{"id": 1}],
            "meta": {"total": 250, "hasMore": true, "limit": 100, "offset": 0}
        });
        let (items, meta, source) = items_of(resolve_collection(&payload, &["groups"]));
        assert_eq!(items, vec![json!({"id": 1})]);
        assert_eq!(source, CollectionSource::Wrapper("data".into()));
        assert_eq!(
            meta,
            PageMeta { has_more: Some(true), total: Some(250), limit: Some(100), offset: Some(0) }
        );
    }

    #[test]
    fn entity_aliases_and_bare_arrays_resolve() {
        let (items, _, source) = items_of(resolve_collection(&json!({"groups": [1, 2]}), &["groups"]));
        assert_eq!(items.len(), 2);
        assert_eq!(source, CollectionSource::Wrapper("groups".into()));

        let (items, meta, source) = items_of(resolve_collection(&json!([1, 2, 3]), &[]));
        assert_eq!(items.len(), 3);
        assert_eq!(meta, PageMeta::default());
        assert_eq!(source, CollectionSource::TopLevelArray);
    }

    #[test]
    fn bare_object_becomes_single_item_and_errors_are_not_found() {
        let (items, _, source) = items_of(resolve_collection(&json!({"id": "abc"}), &[]));
        assert_eq!(items, vec![json!({"id": "abc"})]);
        assert_eq!(source, CollectionSource::SingleObject);

        assert_eq!(resolve_collection(&json!({"error": "nope"}), &[]), Resolved::NotFound);
        assert_eq!(resolve_collection(&json!({}), &[]), Resolved::NotFound);
        assert_eq!(resolve_collection(&json!("text"), &[]), Resolved::NotFound);
    }

    #[test]
    fn metadata_is_found_in_alternate_locations() {
        let payload = json!({"products": [], "_metadata": {"total_count": "40"}, "has_more": "no"});
        let (_, meta, _) = items_of(resolve_collection(&payload, &["products"]));
        assert_eq!(meta.total, Some(40));
        assert_eq!(meta.has_more, Some(false));
    }

    #[test]
    fn boolean_coercion_uses_allow_lists() {
        for raw in ["true", "1", "YES", "y"] {
            assert_eq!(parse_bool_like(raw), Some(true), "{raw}");
        }
        for raw in ["False", "0", "no", "N"] {
            assert_eq!(parse_bool_like(raw), Some(false), "{raw}");
        }
        for raw in ["", "maybe", "2", "t"] {
            assert_eq!(parse_bool_like(raw), None, "{raw}");
        }
    }

    #[test]
    fn exact_and_fuzzy_resolvers_differ_on_decorated_headers() {
        let headers = vec!["tcg_group_id".to_string(), "name".to_string()];
        assert_eq!(ExactHeaderResolver.resolve(&headers, &["group_id"]), None);
        assert_eq!(FuzzyHeaderResolver.resolve(&headers, &["group_id"]), Some("tcg_group_id"));
        assert_eq!(ExactHeaderResolver.resolve(&headers, &["Name"]), Some("name"));
    }

    #[test]
    fn rows_missing_required_columns_are_skipped() {
        let headers = vec!["group_id".to_string(), "name".to_string()];
        let columns = ResolvedColumns::resolve(&headers, GROUP_COLUMNS, &FuzzyHeaderResolver);
        assert!(columns.missing_required().is_empty());

        let good: CsvRow = [("group_id", "604"), ("name", "Base Set")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let group = normalize_group_row(&good, &columns, 3).parsed().unwrap();
        assert_eq!(group.group_id, 604);
        assert_eq!(group.name, "Base Set");

        let short: CsvRow = [("group_id", "605")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(matches!(normalize_group_row(&short, &columns, 3), RowOutcome::Skipped { .. }));
    }

    #[test]
    fn card_number_rules_apply_in_order() {
        assert_eq!(extract_card_number("Charizard - 4/102").as_deref(), Some("4/102"));
        assert_eq!(extract_card_number("Umbreon VMAX - TG23 / TG30").as_deref(), Some("TG23/TG30"));
        assert_eq!(extract_card_number("Pikachu (SWSH020)").as_deref(), Some("SWSH020"));
        assert_eq!(extract_card_number("Mew #151").as_deref(), Some("151"));
        assert_eq!(extract_card_number("Dark Magician 58").as_deref(), Some("58"));
        assert_eq!(extract_card_number("Booster Box"), None);
    }

    #[test]
    fn comparable_numbers_ignore_padding_and_totals() {
        assert_eq!(comparable_number("004/102").as_deref(), Some("4"));
        assert_eq!(comparable_number("TG05").as_deref(), Some("tg5"));
        assert_eq!(comparable_number("#000").as_deref(), Some("0"));
        assert_eq!(comparable_number("SV-045").as_deref(), Some("sv45"));
        assert_eq!(comparable_number("/"), None);
    }

    #[test]
    fn product_json_prefers_extended_number_then_name() {
        let with_ext = json!({
            "productId": 42, "name": "Charizard", "groupId": 604,
            "extendedData": [{"name": "Number", "value": "4/102"}],
            "imageUrl": "https://img/42.jpg"
        });
        let product = normalize_product_json(&with_ext, 3, 0).parsed().unwrap();
        assert_eq!(product.number.as_deref(), Some("4/102"));
        assert_eq!(product.group_id, 604);
        assert_eq!(product.image_url.as_deref(), Some("https://img/42.jpg"));

        let from_name = json!({"productId": 43, "name": "Blastoise - 2/102"});
        let product = normalize_product_json(&from_name, 3, 604).parsed().unwrap();
        assert_eq!(product.number.as_deref(), Some("2/102"));
        assert_eq!(product.group_id, 604);
    }

    #[test]
    fn pricing_cards_accept_nested_and_flat_variants() {
        let at = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap();
        let nested = json!({
            "id": "pokemon-base-set-charizard", "name": "Charizard", "number": "4/102",
            "tcgplayerId": "42", "rarity": "Holo Rare", "artist": "Mitsuhiro Arita",
            "variants": [{"printing": "Holofoil", "conditions": [
                {"condition": "Near Mint", "price": 420.5},
                {"condition": "Damaged"}
            ]}]
        });
        let card = normalize_pricing_card(&nested, "pokemon", "base-set", "pricing", at)
            .parsed()
            .unwrap();
        assert_eq!(card.card.external_product_id, Some(42));
        assert_eq!(card.card.attributes.get("artist"), Some(&json!("Mitsuhiro Arita")));
        assert_eq!(card.prices.len(), 1);
        assert_eq!(card.prices[0].market, Some(420.5));
        assert_eq!(card.prices[0].observed_at, at);

        let flat = json!({
            "id": "c2", "name": "Pikachu",
            "variants": [
                {"id": "v1", "printing": "Normal", "condition": "Near Mint", "price": 1.5, "lastUpdated": 1790000000},
                {"id": "v2", "printing": "Normal", "condition": "Lightly Played", "price": "1.10"}
            ]
        });
        let card = normalize_pricing_card(&flat, "pokemon", "base-set", "pricing", at)
            .parsed()
            .unwrap();
        assert_eq!(card.prices.len(), 2);
        assert_eq!(card.prices[1].market, Some(1.1));
        assert_ne!(card.prices[0].observed_at, at);

        assert!(matches!(
            normalize_pricing_card(&json!({"name": "x"}), "g", "s", "pricing", at),
            RowOutcome::Skipped { .. }
        ));
    }

    #[test]
    fn language_variants_collapse_to_the_newest_price() {
        let at = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap();
        let card = json!({
            "id": "c3", "name": "Chansey",
            "variants": [
                {"language": "English", "printing": "Normal", "condition": "Near Mint", "price": 1.0, "lastUpdated": 1790000000},
                {"language": "Japanese", "printing": "Normal", "condition": "Near Mint", "price": 2.0, "lastUpdated": 1790000500},
                {"language": "German", "printing": "Normal", "condition": "Near Mint", "price": 3.0, "lastUpdated": 1789000000},
                {"language": "English", "printing": "Holofoil", "condition": "Near Mint", "price": 9.0}
            ]
        });
        let card = normalize_pricing_card(&card, "pokemon", "base-set", "pricing", at)
            .parsed()
            .unwrap();
        assert_eq!(card.prices.len(), 2);
        assert_eq!(card.prices[0].printing, "Normal");
        assert_eq!(card.prices[0].market, Some(2.0));
        assert_eq!(card.prices[1].printing, "Holofoil");
    }
}
