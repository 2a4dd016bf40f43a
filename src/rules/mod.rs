//! Read and write access to the two keyword rule tables: the shared global table and each user's
//! own overrides.
//!
//! Lookups return the first match, user rules before global rules. Within one table, when more
//! than one keyword is contained in the description, the longest keyword wins and equal lengths
//! fall back to lexicographic keyword order, so the outcome never depends on how the store happens
//! to iterate.

use crate::auth::AdminCapability;
use crate::error::Res;
use crate::model::{
    normalize_text, CategoryLabel, KeywordRule, ResolutionSource, RuleScope, L0,
};
use crate::store::{decode, encode, paths, scan_all, DocumentStore, WriteBatch};
use anyhow::Context;
use serde::Deserialize;
use std::cmp::Reverse;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SEED_CSV: &str = include_str!("global_rules.csv");
const PAGE_SIZE: usize = 400;

/// A rule that matched a description, and which table it came from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RuleMatch {
    pub rule: KeywordRule,
    /// `UserRule` or `GlobalRule`.
    pub source: ResolutionSource,
}

impl RuleMatch {
    pub fn label(&self) -> &CategoryLabel {
        &self.rule.label
    }
}

/// A point-in-time copy of the rules that apply to one user. A sync or repair run loads this once
/// and reuses it for every record.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    user: Vec<KeywordRule>,
    global: Vec<KeywordRule>,
}

impl RuleSet {
    pub fn new(mut user: Vec<KeywordRule>, mut global: Vec<KeywordRule>) -> Self {
        sort_for_matching(&mut user);
        sort_for_matching(&mut global);
        Self { user, global }
    }

    pub fn lookup(&self, description: &str) -> Option<RuleMatch> {
        let normalized = normalize_text(description);
        if normalized.is_empty() {
            return None;
        }
        let first = |rules: &[KeywordRule], source| {
            rules
                .iter()
                .find(|rule| rule.matches(&normalized))
                .map(|rule| RuleMatch {
                    rule: rule.clone(),
                    source,
                })
        };
        first(&self.user, ResolutionSource::UserRule)
            .or_else(|| first(&self.global, ResolutionSource::GlobalRule))
    }

    pub fn len(&self) -> usize {
        self.user.len() + self.global.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort_for_matching(rules: &mut [KeywordRule]) {
    rules.sort_by(|a, b| {
        Reverse(a.keyword.len())
            .cmp(&Reverse(b.keyword.len()))
            .then_with(|| a.keyword.cmp(&b.keyword))
    });
}

/// The rule store adapter.
#[derive(Clone)]
pub struct RuleStore {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
}

impl RuleStore {
    /// `batch_size` bounds the writes committed together when seeding or publishing.
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        let batch_size = batch_size.clamp(1, store.max_batch_ops());
        Self { store, batch_size }
    }

    /// Finds the rule that applies to `description` for `user_id`, reading both tables.
    pub async fn lookup(&self, description: &str, user_id: &str) -> Res<Option<RuleMatch>> {
        Ok(self.snapshot(user_id).await?.lookup(description))
    }

    pub async fn snapshot(&self, user_id: &str) -> Res<RuleSet> {
        let user = self.user_rules(user_id).await?;
        let global = self.global_rules().await?;
        debug!(
            "Loaded {} user rules and {} global rules for {user_id}",
            user.len(),
            global.len()
        );
        Ok(RuleSet::new(user, global))
    }

    pub async fn user_rules(&self, user_id: &str) -> Res<Vec<KeywordRule>> {
        self.load(&paths::rules(user_id)).await
    }

    pub async fn global_rules(&self) -> Res<Vec<KeywordRule>> {
        self.load(paths::GLOBAL_RULES).await
    }

    async fn load(&self, collection: &str) -> Res<Vec<KeywordRule>> {
        let rows = scan_all(self.store.as_ref(), collection, None, PAGE_SIZE)
            .await
            .with_context(|| format!("Unable to read rules from {collection}"))?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            match decode::<KeywordRule>(row.doc) {
                Ok(rule) if !rule.keyword.is_empty() => rules.push(rule),
                Ok(_) => warn!("Ignoring rule {collection}/{} with an empty keyword", row.id),
                Err(e) => warn!("Ignoring malformed rule {collection}/{}: {e:#}", row.id),
            }
        }
        Ok(rules)
    }

    /// Stores a user-scope rule, usually learned from a manual correction. Saving the same keyword
    /// again replaces the earlier rule.
    pub async fn save_user_rule(
        &self,
        user_id: &str,
        keyword: &str,
        label: CategoryLabel,
    ) -> Res<KeywordRule> {
        let rule = KeywordRule::new(keyword, RuleScope::User(user_id.to_string()), label)?;
        let mut batch = WriteBatch::new();
        batch.set(paths::rules(user_id), rule.key()?, encode(&rule)?);
        self.store
            .commit(batch)
            .await
            .with_context(|| format!("Unable to save rule '{}' for {user_id}", rule.keyword))?;
        Ok(rule)
    }

    /// Merge-upserts `rules` into the global table. Returns the number of rules written.
    pub async fn seed_global(&self, cap: &AdminCapability, rules: &[KeywordRule]) -> Res<usize> {
        info!("{} is seeding {} global rules", cap.actor(), rules.len());
        self.write_global(rules).await
    }

    /// Copies every rule of `user_id` into the global table under the same deterministic key the
    /// seed loader uses. Publishing twice writes the same keys twice and creates nothing new.
    pub async fn publish(&self, user_id: &str, cap: &AdminCapability) -> Res<usize> {
        let rules = self.user_rules(user_id).await?;
        info!(
            "{} is publishing {} rules from {user_id} to the global table",
            cap.actor(),
            rules.len()
        );
        self.write_global(&rules).await
    }

    async fn write_global(&self, rules: &[KeywordRule]) -> Res<usize> {
        let mut written = 0;
        for chunk in rules.chunks(self.batch_size) {
            let mut batch = WriteBatch::new();
            for rule in chunk {
                let global = KeywordRule {
                    owner: crate::model::GLOBAL_OWNER.to_string(),
                    ..rule.clone()
                };
                batch.merge(paths::GLOBAL_RULES, global.key()?, encode(&global)?);
            }
            let n = batch.len();
            self.store
                .commit(batch)
                .await
                .context("Unable to write to the global rule table")?;
            written += n;
        }
        Ok(written)
    }
}

#[derive(Debug, Deserialize)]
struct SeedRow {
    keyword: String,
    l0: String,
    l1: String,
    #[serde(default)]
    l2: String,
    #[serde(default)]
    l3: String,
}

/// Parses the static global rule table compiled into the binary.
pub fn seed_rules() -> Res<Vec<KeywordRule>> {
    parse_seed(SEED_CSV)
}

fn parse_seed(data: &str) -> Res<Vec<KeywordRule>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(data.as_bytes());
    let mut rules = Vec::new();
    for (i, row) in reader.deserialize::<SeedRow>().enumerate() {
        let row = row.with_context(|| format!("Malformed seed rule on row {}", i + 1))?;
        let l0 = L0::from_str(&row.l0)
            .map_err(|e| anyhow::anyhow!("Seed rule '{}' has l0 '{}': {e}", row.keyword, row.l0))?;
        rules.push(KeywordRule::new(
            &row.keyword,
            RuleScope::Global,
            CategoryLabel::new(l0, row.l1, row.l2, row.l3),
        )?);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authorizer;
    use crate::store::MemoryStore;
    use std::collections::BTreeSet;

    fn label(l2: &str) -> CategoryLabel {
        CategoryLabel::new(L0::OperatingExpense, "Operating Expenses", l2, "")
    }

    fn rules_store() -> (Arc<MemoryStore>, RuleStore) {
        let store = Arc::new(MemoryStore::new());
        let rules = RuleStore::new(store.clone(), 3);
        (store, rules)
    }

    #[tokio::test]
    async fn test_user_rule_beats_global_rule() {
        let (_, rules) = rules_store();
        let cap = Authorizer::grant("admin");
        let global = KeywordRule::new("ACE HARDWARE", RuleScope::Global, label("Supplies")).unwrap();
        rules.seed_global(&cap, &[global]).await.unwrap();
        rules
            .save_user_rule("u1", "ace hardware", label("Repairs"))
            .await
            .unwrap();

        let found = rules.lookup("ACE HARDWARE #88", "u1").await.unwrap().unwrap();
        assert_eq!(found.source, ResolutionSource::UserRule);
        assert_eq!(found.label().l2, "Repairs");

        let other = rules.lookup("ace hardware #88", "u2").await.unwrap().unwrap();
        assert_eq!(other.source, ResolutionSource::GlobalRule);
        assert_eq!(other.label().l2, "Supplies");

        assert!(rules.lookup("SOMETHING ELSE", "u1").await.unwrap().is_none());
    }

    #[test]
    fn test_longest_keyword_wins_regardless_of_insertion_order() {
        let short = KeywordRule::new("DEPOT", RuleScope::Global, label("Short")).unwrap();
        let long = KeywordRule::new("HOME DEPOT", RuleScope::Global, label("Long")).unwrap();
        let same_len = KeywordRule::new("HOME DEPOX", RuleScope::Global, label("Other")).unwrap();
        for global in [
            vec![short.clone(), long.clone(), same_len.clone()],
            vec![same_len.clone(), long.clone(), short.clone()],
        ] {
            let set = RuleSet::new(vec![], global);
            let found = set.lookup("THE HOME DEPOT 42").unwrap();
            assert_eq!(found.label().l2, "Long");
        }
        let set = RuleSet::new(vec![], vec![short, long]);
        assert_eq!(set.lookup("DEPOT OUTLET").unwrap().label().l2, "Short");
    }

    #[tokio::test]
    async fn test_publish_twice_writes_same_keys() {
        let (store, rules) = rules_store();
        for i in 0..10 {
            rules
                .save_user_rule("u1", &format!("vendor {i}"), label("Repairs"))
                .await
                .unwrap();
        }
        let cap = Authorizer::grant("admin");

        assert_eq!(rules.publish("u1", &cap).await.unwrap(), 10);
        assert_eq!(store.count(paths::GLOBAL_RULES).unwrap(), 10);
        assert_eq!(rules.publish("u1", &cap).await.unwrap(), 10);
        assert_eq!(store.count(paths::GLOBAL_RULES).unwrap(), 10);

        let global = rules.global_rules().await.unwrap();
        let keys: BTreeSet<_> = global.iter().map(|r| r.key().unwrap()).collect();
        assert_eq!(keys.len(), 10);
        assert!(global.iter().all(|r| r.scope() == RuleScope::Global));
    }

    #[tokio::test]
    async fn test_writes_are_bounded_by_batch_size() {
        let (store, rules) = rules_store();
        let cap = Authorizer::grant("admin");
        let seed = seed_rules().unwrap();
        let before = store.commits();
        let written = rules.seed_global(&cap, &seed).await.unwrap();
        assert_eq!(written, seed.len());
        let expected_commits = seed.len().div_ceil(3) as u64;
        assert_eq!(store.commits() - before, expected_commits);
    }

    #[tokio::test]
    async fn test_malformed_rule_documents_are_skipped() {
        let (store, rules) = rules_store();
        store
            .set(
                paths::GLOBAL_RULES,
                "BROKEN",
                encode(&serde_json::json!({"owner": "global"})).unwrap(),
                crate::store::SetMode::Replace,
            )
            .await
            .unwrap();
        assert!(rules.global_rules().await.unwrap().is_empty());
    }

    #[test]
    fn test_seed_table_parses() {
        let seed = seed_rules().unwrap();
        assert!(seed.len() > 10);
        assert!(seed.iter().all(|r| r.label.is_canonical()));
        let keys: BTreeSet<_> = seed.iter().map(|r| r.key().unwrap()).collect();
        assert_eq!(keys.len(), seed.len());
        assert!(parse_seed("keyword,l0,l1,l2,l3\nX,NOPE,a,b,c\n").is_err());
    }
}
