//! Card to catalog reconciliation: sets to groups first, then cards to
//! products inside the matched group.

use std::collections::{BTreeMap, HashMap, HashSet};

use cardsync_adapters::normalize::comparable_number;
use cardsync_core::{Card, CardSet, CatalogGroup, CatalogProduct, MatchMethod, MatchRecord, OperationId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use strsim::{jaro_winkler, normalized_levenshtein};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MatchConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ScoreError {
    #[error("nothing comparable left in {0:?} after normalization")]
    EmptyInput(String),
    #[error("similarity score {0} is not within [0, 1]")]
    OutOfRange(f64),
}

pub trait SimilarityScorer: Send + Sync {
    /// Similarity of two display names in `[0, 1]`.
    fn score(&self, a: &str, b: &str) -> Result<f64, ScoreError>;
}

/// Blend of Jaro-Winkler and normalized Levenshtein over normalized names.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrsimScorer;

impl SimilarityScorer for StrsimScorer {
    fn score(&self, a: &str, b: &str) -> Result<f64, ScoreError> {
        let na = normalize_name(a);
        let nb = normalize_name(b);
        if na.is_empty() {
            return Err(ScoreError::EmptyInput(a.to_string()));
        }
        if nb.is_empty() {
            return Err(ScoreError::EmptyInput(b.to_string()));
        }
        let score = jaro_winkler(&na, &nb) * 0.6 + normalized_levenshtein(&na, &nb) * 0.4;
        if !(0.0..=1.0).contains(&score) {
            return Err(ScoreError::OutOfRange(score));
        }
        Ok(score)
    }
}

pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .replace('&', " and ")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Groups,
    Products,
    #[default]
    Both,
}

impl MatchType {
    pub fn includes_groups(&self) -> bool {
        matches!(self, MatchType::Groups | MatchType::Both)
    }

    pub fn includes_products(&self) -> bool {
        matches!(self, MatchType::Products | MatchType::Both)
    }
}

impl std::str::FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groups" => Ok(MatchType::Groups),
            "products" => Ok(MatchType::Products),
            "both" => Ok(MatchType::Both),
            other => Err(format!("unknown match type `{other}` (expected groups, products or both)")),
        }
    }
}

fn stored_link(set: &CardSet, groups: &HashMap<i64, &CatalogGroup>) -> Option<GroupLink> {
    let group = set.external_group_id.and_then(|id| groups.get(&id))?;
    Some(GroupLink {
        set_id: set.id.clone(),
        group_id: group.group_id,
        confidence: 1.0,
        method: MatchMethod::ExactId,
    })
}

/// Links already recorded on the sets, without scoring anything.
pub fn stored_group_links(sets: &[CardSet], groups: &[CatalogGroup]) -> Vec<GroupLink> {
    let by_id: HashMap<i64, &CatalogGroup> = groups.iter().map(|g| (g.group_id, g)).collect();
    sets.iter().filter_map(|set| stored_link(set, &by_id)).collect()
}

/// A set linked to a catalog group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupLink {
    pub set_id: String,
    pub group_id: i64,
    pub confidence: f64,
    pub method: MatchMethod,
}

/// Candidates that could not be separated by method, score or group
/// confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbiguousMatch {
    pub subject_id: String,
    pub candidate_ids: Vec<i64>,
    pub method: MatchMethod,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupMatchSummary {
    pub sets_considered: usize,
    pub by_method: BTreeMap<MatchMethod, usize>,
    pub no_match: usize,
    pub ambiguous: usize,
    pub errors: usize,
    pub links: Vec<GroupLink>,
    pub ambiguous_sets: Vec<AmbiguousMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductMatchSummary {
    pub cards_considered: usize,
    /// Cards left out because they already carry an applied match.
    pub skipped_mapped: usize,
    pub by_method: BTreeMap<MatchMethod, usize>,
    pub no_match: usize,
    /// Cards whose set is not linked to any catalog group.
    pub no_group: usize,
    pub ambiguous: usize,
    pub errors: usize,
    pub candidates: Vec<MatchRecord>,
    pub ambiguous_cards: Vec<AmbiguousMatch>,
}

impl ProductMatchSummary {
    pub fn matched(&self) -> usize {
        self.by_method.values().sum()
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    id: i64,
    group_id: i64,
    method: MatchMethod,
    score: f64,
    group_confidence: f64,
}

enum Pick {
    One(Candidate),
    Ambiguous(Vec<Candidate>),
    None,
}

pub struct Matcher<'a> {
    config: MatchConfig,
    scorer: &'a dyn SimilarityScorer,
}

impl<'a> Matcher<'a> {
    pub fn new(config: MatchConfig, scorer: &'a dyn SimilarityScorer) -> Self {
        Self { config, scorer }
    }

    /// Ranks by method precedence, then score, then the confidence of the
    /// candidate's group. Anything still level with the leader is ambiguous.
    fn pick(&self, mut candidates: Vec<Candidate>) -> Pick {
        if candidates.is_empty() {
            return Pick::None;
        }
        let eps = self.config.tie_epsilon;
        candidates.sort_by(|a, b| {
            a.method
                .precedence()
                .cmp(&b.method.precedence())
                .then(b.score.total_cmp(&a.score))
                .then(b.group_confidence.total_cmp(&a.group_confidence))
        });
        let best = candidates[0].clone();
        let tied: Vec<Candidate> = candidates
            .into_iter()
            .take_while(|c| {
                c.method == best.method
                    && (c.score - best.score).abs() <= eps
                    && (c.group_confidence - best.group_confidence).abs() <= eps
            })
            .collect();
        if tied.len() > 1 {
            Pick::Ambiguous(tied)
        } else {
            Pick::One(best)
        }
    }

    pub fn match_groups(&self, sets: &[CardSet], groups: &[CatalogGroup]) -> GroupMatchSummary {
        let by_id: HashMap<i64, &CatalogGroup> = groups.iter().map(|g| (g.group_id, g)).collect();
        let mut summary = GroupMatchSummary {
            sets_considered: sets.len(),
            ..GroupMatchSummary::default()
        };

        for set in sets {
            if let Some(link) = stored_link(set, &by_id) {
                summary.links.push(link);
                *summary.by_method.entry(MatchMethod::ExactId).or_insert(0) += 1;
                continue;
            }

            let mut errored = false;
            let mut candidates = Vec::new();
            for group in groups {
                match self.scorer.score(&set.name, &group.name) {
                    Ok(score) if score >= self.config.group_min_score => candidates.push(Candidate {
                        id: group.group_id,
                        group_id: group.group_id,
                        method: MatchMethod::NameSimilarity,
                        score,
                        group_confidence: score,
                    }),
                    Ok(_) => {}
                    Err(err) => {
                        errored = true;
                        warn!(set_id = %set.id, group_id = group.group_id, error = %err, "group similarity failed");
                    }
                }
            }

            match self.pick(candidates) {
                Pick::One(best) => {
                    *summary.by_method.entry(best.method).or_insert(0) += 1;
                    summary.links.push(GroupLink {
                        set_id: set.id.clone(),
                        group_id: best.group_id,
                        confidence: best.score,
                        method: best.method,
                    });
                }
                Pick::Ambiguous(tied) => {
                    summary.ambiguous += 1;
                    summary.ambiguous_sets.push(ambiguity(&set.id, &tied));
                }
                Pick::None if errored => summary.errors += 1,
                Pick::None => summary.no_match += 1,
            }
        }
        debug!(sets = sets.len(), links = summary.links.len(), ambiguous = summary.ambiguous, "group matching done");
        summary
    }

    /// Matches each card to at most one product. Identifier matches look at
    /// the whole category; number and name matches only at the group linked
    /// to the card's set.
    pub fn match_products(
        &self,
        operation_id: OperationId,
        cards: &[Card],
        products: &[CatalogProduct],
        links: &[GroupLink],
        already_mapped: &HashSet<String>,
    ) -> ProductMatchSummary {
        let by_id: HashMap<i64, &CatalogProduct> = products.iter().map(|p| (p.product_id, p)).collect();
        let mut by_group: HashMap<i64, Vec<&CatalogProduct>> = HashMap::new();
        for product in products {
            by_group.entry(product.group_id).or_default().push(product);
        }
        let link_for: HashMap<&str, &GroupLink> = links.iter().map(|l| (l.set_id.as_str(), l)).collect();
        let group_confidence: HashMap<i64, f64> = links.iter().map(|l| (l.group_id, l.confidence)).collect();

        let mut summary = ProductMatchSummary::default();
        let created_at = Utc::now();

        for card in cards {
            if already_mapped.contains(&card.id) {
                summary.skipped_mapped += 1;
                continue;
            }
            summary.cards_considered += 1;

            if let Some(product) = card.external_product_id.and_then(|id| by_id.get(&id)) {
                let candidate = Candidate {
                    id: product.product_id,
                    group_id: product.group_id,
                    method: MatchMethod::ExactId,
                    score: 1.0,
                    group_confidence: group_confidence.get(&product.group_id).copied().unwrap_or(0.0),
                };
                summary.record(operation_id, card, candidate, created_at);
                continue;
            }

            let Some(link) = link_for.get(card.set_id.as_str()) else {
                summary.no_group += 1;
                summary.no_match += 1;
                continue;
            };
            let pool = by_group.get(&link.group_id).map(Vec::as_slice).unwrap_or_default();
            let (candidates, errored) = self.score_pool(card, pool, link.confidence);

            match self.pick(candidates) {
                Pick::One(best) => summary.record(operation_id, card, best, created_at),
                Pick::Ambiguous(tied) => {
                    summary.ambiguous += 1;
                    summary.ambiguous_cards.push(ambiguity(&card.id, &tied));
                }
                Pick::None if errored => summary.errors += 1,
                Pick::None => summary.no_match += 1,
            }
        }
        debug!(
            cards = summary.cards_considered,
            matched = summary.matched(),
            ambiguous = summary.ambiguous,
            errors = summary.errors,
            "product matching done"
        );
        summary
    }

    /// Number matches when the card has a usable number and any product
    /// shares it; name matches otherwise. Returns whether any pair failed to
    /// score.
    fn score_pool(&self, card: &Card, pool: &[&CatalogProduct], group_confidence: f64) -> (Vec<Candidate>, bool) {
        let mut errored = false;
        let mut name_score = |product: &CatalogProduct| -> Option<f64> {
            let mut best: Option<f64> = None;
            for name in std::iter::once(product.name.as_str()).chain(product.clean_name.as_deref()) {
                match self.scorer.score(&card.name, name) {
                    Ok(score) => best = Some(best.map_or(score, |b| b.max(score))),
                    Err(err) => {
                        errored = true;
                        warn!(card_id = %card.id, product_id = product.product_id, error = %err, "name similarity failed");
                    }
                }
            }
            best
        };

        let card_number = card.number.as_deref().and_then(comparable_number);
        let numbered: Vec<&CatalogProduct> = match &card_number {
            Some(number) => pool
                .iter()
                .copied()
                .filter(|p| p.number.as_deref().and_then(comparable_number).as_ref() == Some(number))
                .collect(),
            None => Vec::new(),
        };

        let mut candidates = Vec::new();
        if !numbered.is_empty() {
            for product in numbered {
                let similarity = name_score(product).unwrap_or(0.0);
                let score = (self.config.number_base_confidence + self.config.name_bonus_weight * similarity).min(1.0);
                candidates.push(Candidate {
                    id: product.product_id,
                    group_id: product.group_id,
                    method: MatchMethod::NumberMatch,
                    score,
                    group_confidence,
                });
            }
        } else {
            for product in pool {
                if let Some(score) = name_score(product).filter(|s| *s >= self.config.name_min_score) {
                    candidates.push(Candidate {
                        id: product.product_id,
                        group_id: product.group_id,
                        method: MatchMethod::NameSimilarity,
                        score,
                        group_confidence,
                    });
                }
            }
        }
        (candidates, errored)
    }
}

impl ProductMatchSummary {
    fn record(&mut self, operation_id: OperationId, card: &Card, candidate: Candidate, created_at: chrono::DateTime<Utc>) {
        *self.by_method.entry(candidate.method).or_insert(0) += 1;
        self.candidates.push(MatchRecord {
            operation_id,
            card_id: card.id.clone(),
            product_id: candidate.id,
            group_id: candidate.group_id,
            confidence: candidate.score.clamp(0.0, 1.0),
            method: candidate.method,
            applied: false,
            created_at,
        });
    }
}

fn ambiguity(subject_id: &str, tied: &[Candidate]) -> AmbiguousMatch {
    AmbiguousMatch {
        subject_id: subject_id.to_string(),
        candidate_ids: tied.iter().map(|c| c.id).collect(),
        method: tied[0].method,
        score: tied[0].score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_core::SyncStatus;
    use serde_json::json;

    fn set(id: &str, name: &str, group: Option<i64>) -> CardSet {
        CardSet {
            id: id.into(),
            game_id: "pokemon".into(),
            name: name.into(),
            external_group_id: group,
            card_count: 0,
            last_synced_at: None,
            sync_status: SyncStatus::Completed,
        }
    }

    fn group(id: i64, name: &str) -> CatalogGroup {
        CatalogGroup {
            group_id: id,
            category_id: 3,
            name: name.into(),
            abbreviation: None,
            published_on: None,
            raw: json!({}),
        }
    }

    fn card(id: &str, name: &str, number: Option<&str>, product: Option<i64>) -> Card {
        Card {
            id: id.into(),
            set_id: "base-set".into(),
            game_id: "pokemon".into(),
            name: name.into(),
            number: number.map(str::to_string),
            rarity: None,
            image_url: None,
            external_product_id: product,
            attributes: Default::default(),
        }
    }

    fn product(id: i64, group_id: i64, name: &str, number: Option<&str>) -> CatalogProduct {
        CatalogProduct {
            product_id: id,
            group_id,
            category_id: 3,
            name: name.into(),
            clean_name: None,
            number: number.map(str::to_string),
            image_url: None,
            raw: json!({}),
        }
    }

    fn link(group_id: i64) -> Vec<GroupLink> {
        vec![GroupLink {
            set_id: "base-set".into(),
            group_id,
            confidence: 0.9,
            method: MatchMethod::NameSimilarity,
        }]
    }

    struct FailingScorer;

    impl SimilarityScorer for FailingScorer {
        fn score(&self, a: &str, _b: &str) -> Result<f64, ScoreError> {
            Err(ScoreError::EmptyInput(a.to_string()))
        }
    }

    #[test]
    fn names_normalize_punctuation_and_case() {
        assert_eq!(normalize_name("  Pokémon: Base-Set (1st Ed.) "), "pokémon base set 1st ed");
        assert_eq!(normalize_name("Sword & Shield"), "sword and shield");
        assert!(StrsimScorer.score("???", "Base Set").is_err());
        let same = StrsimScorer.score("Base Set", "base set").unwrap();
        assert!((same - 1.0).abs() < 1e-12);
    }

    #[test]
    fn groups_match_by_link_then_by_name() {
        let scorer = StrsimScorer;
        let matcher = Matcher::new(MatchConfig::default(), &scorer);
        let sets = vec![
            set("base-set", "Base Set", None),
            set("jungle", "Jungle", Some(605)),
            set("promo", "Totally Unrelated Promo Thing", None),
        ];
        let groups = vec![group(604, "Base Set"), group(605, "Jungle"), group(630, "Fossil")];
        let summary = matcher.match_groups(&sets, &groups);
        assert_eq!(summary.by_method.get(&MatchMethod::ExactId), Some(&1));
        assert_eq!(summary.by_method.get(&MatchMethod::NameSimilarity), Some(&1));
        assert_eq!(summary.no_match, 1);
        let base = summary.links.iter().find(|l| l.set_id == "base-set").unwrap();
        assert_eq!(base.group_id, 604);
    }

    #[test]
    fn identical_group_names_are_flagged_not_picked() {
        let scorer = StrsimScorer;
        let matcher = Matcher::new(MatchConfig::default(), &scorer);
        let groups = vec![group(1, "Base Set"), group(2, "Base Set")];
        let summary = matcher.match_groups(&[set("base-set", "Base Set", None)], &groups);
        assert_eq!(summary.ambiguous, 1);
        assert!(summary.links.is_empty());
        assert_eq!(summary.ambiguous_sets[0].candidate_ids, vec![1, 2]);
    }

    #[test]
    fn exact_identifier_beats_a_better_name_candidate() {
        let scorer = StrsimScorer;
        let matcher = Matcher::new(MatchConfig::default(), &scorer);
        let cards = vec![card("charizard", "Charizard", Some("4/102"), Some(900))];
        let products = vec![
            product(900, 604, "Charizard (Shadowless)", Some("004/102")),
            product(901, 604, "Charizard", None),
        ];
        let summary = matcher.match_products(OperationId::new(), &cards, &products, &link(604), &HashSet::new());
        assert_eq!(summary.candidates.len(), 1);
        assert_eq!(summary.candidates[0].product_id, 900);
        assert_eq!(summary.candidates[0].method, MatchMethod::ExactId);
        assert_eq!(summary.candidates[0].confidence, 1.0);
    }

    #[test]
    fn number_match_adds_a_name_bonus() {
        let scorer = StrsimScorer;
        let matcher = Matcher::new(MatchConfig::default(), &scorer);
        let cards = vec![card("blastoise", "Blastoise", Some("2/102"), None)];
        let products = vec![
            product(10, 604, "Blastoise", Some("002/102")),
            product(11, 604, "Blastoise", Some("3/102")),
        ];
        let summary = matcher.match_products(OperationId::new(), &cards, &products, &link(604), &HashSet::new());
        let record = &summary.candidates[0];
        assert_eq!(record.product_id, 10);
        assert_eq!(record.method, MatchMethod::NumberMatch);
        assert!((record.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn name_matches_stay_inside_the_linked_group() {
        let scorer = StrsimScorer;
        let matcher = Matcher::new(MatchConfig::default(), &scorer);
        let cards = vec![card("pikachu", "Pikachu", None, None)];
        let products = vec![product(20, 999, "Pikachu", None), product(21, 604, "Pikachu", None)];
        let summary = matcher.match_products(OperationId::new(), &cards, &products, &link(604), &HashSet::new());
        assert_eq!(summary.candidates[0].product_id, 21);
        assert_eq!(summary.candidates[0].method, MatchMethod::NameSimilarity);

        let unlinked = matcher.match_products(OperationId::new(), &cards, &products, &[], &HashSet::new());
        assert_eq!(unlinked.no_group, 1);
        assert_eq!(unlinked.no_match, 1);
    }

    #[test]
    fn identical_candidates_are_ambiguous() {
        let scorer = StrsimScorer;
        let matcher = Matcher::new(MatchConfig::default(), &scorer);
        let cards = vec![card("energy", "Fire Energy", None, None)];
        let products = vec![product(30, 604, "Fire Energy", None), product(31, 604, "Fire Energy", None)];
        let summary = matcher.match_products(OperationId::new(), &cards, &products, &link(604), &HashSet::new());
        assert!(summary.candidates.is_empty());
        assert_eq!(summary.ambiguous, 1);
        assert_eq!(summary.ambiguous_cards[0].candidate_ids, vec![30, 31]);
    }

    #[test]
    fn scoring_failures_are_tallied_apart_from_no_match() {
        let scorer = FailingScorer;
        let matcher = Matcher::new(MatchConfig::default(), &scorer);
        let cards = vec![
            card("a", "Alakazam", None, None),
            card("b", "Beedrill", Some("17/102"), None),
        ];
        let products = vec![product(40, 604, "Alakazam", None), product(41, 604, "Beedrill", Some("17/102"))];
        let summary = matcher.match_products(OperationId::new(), &cards, &products, &link(604), &HashSet::new());
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.no_match, 0);
        // number equality still qualifies without a name bonus
        assert_eq!(summary.candidates.len(), 1);
        assert!((summary.candidates[0].confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn already_mapped_cards_are_skipped() {
        let scorer = StrsimScorer;
        let matcher = Matcher::new(MatchConfig::default(), &scorer);
        let cards = vec![card("a", "Alakazam", None, None)];
        let mapped: HashSet<String> = ["a".to_string()].into_iter().collect();
        let summary = matcher.match_products(OperationId::new(), &cards, &[], &[], &mapped);
        assert_eq!(summary.skipped_mapped, 1);
        assert_eq!(summary.cards_considered, 0);
    }

    #[test]
    fn match_type_parses_from_user_input() {
        assert_eq!("Products".parse::<MatchType>().unwrap(), MatchType::Products);
        assert!("everything".parse::<MatchType>().is_err());
        assert!(MatchType::Both.includes_groups() && MatchType::Both.includes_products());
    }
}
