//! Tag Index - Identity and inverted indexes over metric tags
//!
//! Two lookups are maintained side by side:
//!
//! ```text
//! identity:  {host=a}            → m1          (exact query-tag set)
//! postings:  (host, a)           → {m1}
//!            (env, prod)         → {m1, m2}
//! ```
//!
//! Partial-match queries intersect the posting sets of every requested pair.
//! A metric's postings always include its query tags, so it stays reachable
//! by them after its tags are overwritten.

use crate::storage::types::{MetricId, Tags};
use std::collections::{BTreeSet, HashMap};

/// Index from tag-sets to metric identifiers
#[derive(Debug, Default)]
pub struct TagIndex {
    /// Exact query-tag set → metric
    identity: HashMap<Tags, MetricId>,
    /// (key, value) → metrics carrying that pair
    postings: HashMap<(String, String), BTreeSet<MetricId>>,
    /// Pairs currently posted for each metric
    posted: HashMap<MetricId, Tags>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metric registered under exactly this query-tag set
    pub fn lookup(&self, query_tags: &Tags) -> Option<MetricId> {
        self.identity.get(query_tags).copied()
    }

    /// Register a new metric
    pub fn insert(&mut self, id: MetricId, query_tags: &Tags, tags: &Tags) {
        self.identity.insert(query_tags.clone(), id);
        self.reindex(id, query_tags, tags);
    }

    /// Replace the posted pairs of a metric with `query_tags ∪ tags`
    pub fn reindex(&mut self, id: MetricId, query_tags: &Tags, tags: &Tags) {
        if let Some(old) = self.posted.remove(&id) {
            for pair in old {
                if let Some(ids) = self.postings.get_mut(&pair) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.postings.remove(&pair);
                    }
                }
            }
        }

        let mut pairs = tags.clone();
        pairs.extend(query_tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        for (key, value) in &pairs {
            self.postings
                .entry((key.clone(), value.clone()))
                .or_default()
                .insert(id);
        }
        self.posted.insert(id, pairs);
    }

    /// Metrics carrying every pair in `query` (intersection)
    ///
    /// An empty query matches all metrics.
    pub fn find_all(&self, query: &Tags) -> Vec<MetricId> {
        if query.is_empty() {
            let mut all: Vec<MetricId> = self.posted.keys().copied().collect();
            all.sort_unstable();
            return all;
        }

        let mut result: Option<BTreeSet<MetricId>> = None;

        for (key, value) in query {
            let ids = match self.postings.get(&(key.clone(), value.clone())) {
                Some(ids) => ids,
                None => return Vec::new(),
            };

            result = Some(match result {
                Some(existing) => existing.intersection(ids).copied().collect(),
                None => ids.clone(),
            });
        }

        result.map(|s| s.into_iter().collect()).unwrap_or_default()
    }

    /// Number of indexed metrics
    pub fn len(&self) -> usize {
        self.posted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posted.is_empty()
    }
}
