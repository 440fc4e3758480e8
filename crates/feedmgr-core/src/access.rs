//! Feed operations access control.
//!
//! Records which principals may view a feed's operational data. Entries are
//! independent of feed lifecycle: granting on a feed id does not require the
//! feed to exist, and deleting a feed does not clear its entry.

use std::collections::BTreeSet;

use crate::authz::CallerContext;
use crate::error::Result;
use crate::store::{MetadataAccess, ReadTxExt, WriteTxExt};
use crate::types::{FeedId, Principal};

const ALL_FEEDS_KEY: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessScope {
    Feed(FeedId),
    AllFeeds,
}

impl AccessScope {
    pub(crate) fn key(&self) -> String {
        match self {
            AccessScope::Feed(id) => id.as_str().to_string(),
            AccessScope::AllFeeds => ALL_FEEDS_KEY.to_string(),
        }
    }

    pub(crate) fn from_key(key: &str) -> Self {
        if key == ALL_FEEDS_KEY {
            AccessScope::AllFeeds
        } else {
            AccessScope::Feed(FeedId::new(key))
        }
    }
}

impl std::fmt::Display for AccessScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessScope::Feed(id) => write!(f, "feed {id}"),
            AccessScope::AllFeeds => write!(f, "all feeds"),
        }
    }
}

pub struct AccessControlRegistry<'a, M> {
    store: &'a M,
}

impl<'a, M: MetadataAccess> AccessControlRegistry<'a, M> {
    pub fn new(store: &'a M) -> Self {
        Self { store }
    }

    /// Add principals to a feed's visible set.
    pub fn grant_access(&self, feed_id: &FeedId, principals: &BTreeSet<Principal>) -> Result<()> {
        self.grant(&AccessScope::Feed(feed_id.clone()), principals)
    }

    /// Replace a feed's visible set with exactly `principals`.
    ///
    /// The old set is read and the new one written inside one write
    /// transaction, so readers see either the old set or the new one.
    pub fn grant_access_only(
        &self,
        feed_id: &FeedId,
        principals: &BTreeSet<Principal>,
    ) -> Result<()> {
        let scope = AccessScope::Feed(feed_id.clone());
        self.store.write(|tx| {
            let previous = tx.principals(&scope)?;
            if previous != *principals {
                tracing::debug!(
                    "replacing {} principals on {scope} with {}",
                    previous.len(),
                    principals.len()
                );
            }
            tx.put_principals(&scope, principals)
        })
    }

    pub fn revoke_access(&self, feed_id: &FeedId, principals: &BTreeSet<Principal>) -> Result<()> {
        self.revoke(&AccessScope::Feed(feed_id.clone()), principals)
    }

    /// Remove `principals` from every scope, including the all-feeds scope.
    pub fn revoke_all_access(&self, principals: &BTreeSet<Principal>) -> Result<()> {
        if principals.is_empty() {
            return Ok(());
        }
        self.store.write(|tx| {
            for (scope, mut set) in tx.acl_entries()? {
                let before = set.len();
                set.retain(|p| !principals.contains(p));
                if set.len() != before {
                    tx.put_principals(&scope, &set)?;
                }
            }
            Ok(())
        })
    }

    /// Clear a feed's visible set.
    pub fn revoke_all_feed_access(&self, feed_id: &FeedId) -> Result<()> {
        let scope = AccessScope::Feed(feed_id.clone());
        self.store
            .write(|tx| tx.put_principals(&scope, &BTreeSet::new()))
    }

    /// The feed's visible set; empty when nothing was ever granted.
    pub fn get_principals(&self, feed_id: &FeedId) -> Result<BTreeSet<Principal>> {
        let scope = AccessScope::Feed(feed_id.clone());
        self.store.read(|tx| tx.principals(&scope))
    }

    pub fn grant_all_feeds(&self, principals: &BTreeSet<Principal>) -> Result<()> {
        self.grant(&AccessScope::AllFeeds, principals)
    }

    pub fn revoke_all_feeds(&self, principals: &BTreeSet<Principal>) -> Result<()> {
        self.revoke(&AccessScope::AllFeeds, principals)
    }

    pub fn all_feeds_principals(&self) -> Result<BTreeSet<Principal>> {
        self.store.read(|tx| tx.principals(&AccessScope::AllFeeds))
    }

    /// True if any of the caller's principals was granted on the feed or on
    /// all feeds.
    pub fn can_view(&self, caller: &CallerContext, feed_id: &FeedId) -> Result<bool> {
        let scope = AccessScope::Feed(feed_id.clone());
        self.store.read(|tx| {
            let feed = tx.principals(&scope)?;
            let global = tx.principals(&AccessScope::AllFeeds)?;
            Ok(caller
                .principals()
                .any(|p| feed.contains(p) || global.contains(p)))
        })
    }

    fn grant(&self, scope: &AccessScope, principals: &BTreeSet<Principal>) -> Result<()> {
        if principals.is_empty() {
            return Ok(());
        }
        self.store.write(|tx| {
            let mut set = tx.principals(scope)?;
            let before = set.len();
            set.extend(principals.iter().cloned());
            if set.len() != before {
                tx.put_principals(scope, &set)?;
            }
            Ok(())
        })
    }

    fn revoke(&self, scope: &AccessScope, principals: &BTreeSet<Principal>) -> Result<()> {
        if principals.is_empty() {
            return Ok(());
        }
        self.store.write(|tx| {
            let mut set = tx.principals(scope)?;
            let before = set.len();
            set.retain(|p| !principals.contains(p));
            if set.len() != before {
                tx.put_principals(scope, &set)?;
            }
            Ok(())
        })
    }
}
