//! REQ filters (NIP-01) and the matching contract used to test them against
//! events, both for relay-side semantics we must anticipate and for
//! cache-side local matching.

use crate::types::{Event, EventId, PubKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A subscription filter. `None` fields are unconstrained; `Some(vec![])`
/// fields match nothing (an explicit empty set, not "don't care").
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EventId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PubKey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    /// Single-letter tag filters, e.g. `#e` -> event ids, `#p` -> pubkeys.
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<EventId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<PubKey>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u32>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn tag(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", name.into()), values);
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `until < since` is a degenerate, always-empty range.
    pub fn is_empty_range(&self) -> bool {
        matches!((self.since, self.until), (Some(s), Some(u)) if u < s)
    }

    /// Whether `event` satisfies every constraint this filter sets. Does not
    /// account for `limit`, which bounds a result set rather than a single
    /// event, or `search`, which requires relay-side full text indexing.
    pub fn matches(&self, event: &Event) -> bool {
        if self.is_empty_range() {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let Some(letter) = key.strip_prefix('#') else {
                continue;
            };
            if values.is_empty() {
                return false;
            }
            let has_match = event
                .tags
                .iter()
                .any(|t| t.first().map(String::as_str) == Some(letter) && t.get(1).is_some_and(|v| values.contains(v)));
            if !has_match {
                return false;
            }
        }
        true
    }

    /// Whether this filter carries no constraints at all (matches every event).
    pub fn is_unconstrained(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none()
            && self.search.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::sample_event;

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::new();
        assert!(f.matches(&sample_event(1)));
    }

    #[test]
    fn empty_id_list_matches_nothing() {
        let f = Filter::new().ids(vec![]);
        assert!(!f.matches(&sample_event(1)));
    }

    #[test]
    fn until_before_since_matches_nothing() {
        let f = Filter::new().since(100).until(50);
        assert!(!f.matches(&sample_event(1)));
    }

    #[test]
    fn kind_filter_excludes_other_kinds() {
        let f = Filter::new().kinds(vec![1]);
        assert!(f.matches(&sample_event(1)));
        assert!(!f.matches(&sample_event(2)));
    }

    #[test]
    fn tag_filter_requires_matching_value() {
        let mut e = sample_event(1);
        e.tags.push(vec!["e".into(), "abc".into()]);
        let f = Filter::new().tag("e", vec!["abc".into()]);
        assert!(f.matches(&e));
        let f = Filter::new().tag("e", vec!["xyz".into()]);
        assert!(!f.matches(&e));
    }
}
