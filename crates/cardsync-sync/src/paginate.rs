//! Offset/limit harvesting with identifier dedup and boundary detection.

use std::time::Duration;

use cardsync_adapters::{AdapterError, PageSource};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationConfig {
    pub page_size: u64,
    /// Safety cap on page requests for one harvest.
    pub max_pages: u32,
    pub page_delay: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 200,
            page_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    EmptyPage,
    NoMorePages,
    ShortPage,
    ReachedExpectedTotal,
    PageCapReached,
    FetchFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Harvest<T> {
    /// Unique items in first-seen order; later duplicates replace the value.
    pub items: Vec<T>,
    pub pages_fetched: u32,
    pub expected_total: Option<u64>,
    pub stop_reason: StopReason,
    /// Set when a later page failed and earlier pages were kept.
    pub partial: bool,
    pub warnings: Vec<String>,
}

/// Pulls every page of `source` in increasing offset order.
///
/// A failure on the very first page is returned as an error. A failure on a
/// later page ends the harvest with `partial` set and the pages collected so
/// far.
pub async fn harvest<S>(source: &S, config: &PaginationConfig) -> Result<Harvest<S::Item>, AdapterError>
where
    S: PageSource + ?Sized,
{
    let limit = config.page_size.max(1);
    let mut offset = 0u64;
    let mut pages_fetched = 0u32;
    let mut anonymous = 0usize;
    let mut expected_total: Option<u64> = None;
    let mut warnings = Vec::new();
    let mut partial = false;
    let mut seen: IndexMap<String, S::Item> = IndexMap::new();

    let stop_reason = loop {
        if pages_fetched >= config.max_pages {
            let msg = format!(
                "page cap of {} reached with {} item(s) collected; collection may be incomplete",
                config.max_pages,
                seen.len()
            );
            warn!(max_pages = config.max_pages, items = seen.len(), "pagination safety cap hit");
            warnings.push(msg);
            break StopReason::PageCapReached;
        }
        if pages_fetched > 0 && !config.page_delay.is_zero() {
            tokio::time::sleep(config.page_delay).await;
        }

        let page = match source.fetch_page(offset, limit).await {
            Ok(page) => page,
            Err(err) if pages_fetched == 0 => return Err(err),
            Err(err) => {
                warn!(offset, pages_fetched, error = %err, "page fetch failed; keeping earlier pages");
                warnings.push(format!(
                    "page at offset {offset} failed after {pages_fetched} successful page(s): {err}"
                ));
                partial = true;
                break StopReason::FetchFailed;
            }
        };
        pages_fetched += 1;
        if pages_fetched == 1 {
            expected_total = page.meta.total;
        }

        let received = page.items.len() as u64;
        debug!(offset, limit, received, has_more = ?page.meta.has_more, "page received");
        if received == 0 {
            break StopReason::EmptyPage;
        }
        for item in page.items {
            let key = match source.item_id(&item) {
                Some(id) => id,
                None => {
                    anonymous += 1;
                    format!("\u{0}anonymous-{anonymous}")
                }
            };
            seen.insert(key, item);
        }

        if page.meta.has_more == Some(false) {
            break StopReason::NoMorePages;
        }
        if received < limit {
            break StopReason::ShortPage;
        }
        if expected_total.is_some_and(|total| seen.len() as u64 >= total) {
            break StopReason::ReachedExpectedTotal;
        }
        offset += limit;
    };

    if anonymous > 0 {
        warnings.push(format!("{anonymous} item(s) had no identifier and were not deduplicated"));
    }
    if let Some(total) = expected_total {
        if total != seen.len() as u64 {
            warn!(expected = total, harvested = seen.len(), "harvested count differs from reported total");
            warnings.push(format!(
                "upstream reported {total} item(s) but {} were harvested",
                seen.len()
            ));
        }
    }
    info!(pages_fetched, items = seen.len(), ?stop_reason, partial, "harvest finished");

    Ok(Harvest {
        items: seen.into_values().collect(),
        pages_fetched,
        expected_total,
        stop_reason,
        partial,
        warnings,
    })
}
