// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::sync::Arc;

/// The slice of a raw platform update that filters may inspect.
///
/// Adapters build this cheaply before mapping the update into the canonical
/// model; rejected updates never enter the canonical pipeline.
#[derive(Debug, Clone, Default)]
pub struct UpdateContext {
    /// Platform author id, when the update has an identifiable author.
    pub author_id: Option<String>,
}

/// Predicate over a raw inbound update.
pub trait InboundFilter: Send + Sync {
    fn name(&self) -> &str;
    fn admit(&self, update: &UpdateContext) -> bool;
}

/// Admits updates from a fixed set of author ids.
///
/// An empty set permits everything.  Updates without an identifiable author
/// (system events) are always admitted.
pub struct AllowedUsersFilter {
    allowed: HashSet<String>,
}

impl AllowedUsersFilter {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: ids.into_iter().collect(),
        }
    }
}

impl InboundFilter for AllowedUsersFilter {
    fn name(&self) -> &str {
        "allowed_users"
    }

    fn admit(&self, update: &UpdateContext) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        match &update.author_id {
            Some(id) => self.allowed.contains(id),
            None => true,
        }
    }
}

/// AND-composition of filters.  An empty chain admits everything.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn InboundFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl InboundFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn admit(&self, update: &UpdateContext) -> bool {
        self.filters.iter().all(|f| f.admit(update))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(author: Option<&str>) -> UpdateContext {
        UpdateContext {
            author_id: author.map(str::to_string),
        }
    }

    #[test]
    fn empty_allowlist_permits_all() {
        let f = AllowedUsersFilter::new([]);
        assert!(f.admit(&ctx(Some("42"))));
        assert!(f.admit(&ctx(None)));
    }

    #[test]
    fn allowlist_admits_listed_authors_only() {
        let f = AllowedUsersFilter::new(["42".to_string()]);
        assert!(f.admit(&ctx(Some("42"))));
        assert!(!f.admit(&ctx(Some("7"))));
    }

    #[test]
    fn allowlist_admits_authorless_updates() {
        let f = AllowedUsersFilter::new(["42".to_string()]);
        assert!(f.admit(&ctx(None)));
    }

    #[test]
    fn chain_is_and_composed() {
        struct Never;
        impl InboundFilter for Never {
            fn name(&self) -> &str {
                "never"
            }
            fn admit(&self, _: &UpdateContext) -> bool {
                false
            }
        }

        let chain = FilterChain::new()
            .with(AllowedUsersFilter::new([]))
            .with(Never);
        assert!(!chain.admit(&ctx(Some("42"))));
    }

    #[test]
    fn empty_chain_admits() {
        assert!(FilterChain::new().admit(&ctx(None)));
    }
}
