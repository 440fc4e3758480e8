//! Transactional metadata store.
//!
//! Feeds, templates and access-control entries live in three redb tables,
//! keyed by string and holding JSON-encoded records:
//!
//! ```text
//! feeds      feed id            -> Feed
//! templates  template id        -> Template
//! feed_acl   feed id | "*"      -> BTreeSet<Principal>
//! ```
//!
//! Callers never touch redb directly. They hand a closure to
//! [`MetadataAccess::read`] or [`MetadataAccess::write`]; a write commits only
//! when its closure returns `Ok`.

use std::collections::BTreeSet;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::access::AccessScope;
use crate::error::{FeedMgrError, Result};
use crate::types::{Feed, FeedId, Principal, Template};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const FEEDS: TableDefinition<&str, &[u8]> = TableDefinition::new("feeds");
const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");
const FEED_ACL: TableDefinition<&str, &[u8]> = TableDefinition::new("feed_acl");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Feeds,
    Templates,
    FeedAcl,
}

impl Table {
    const ALL: [Table; 3] = [Table::Feeds, Table::Templates, Table::FeedAcl];

    fn def(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Table::Feeds => FEEDS,
            Table::Templates => TEMPLATES,
            Table::FeedAcl => FEED_ACL,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction traits
// ---------------------------------------------------------------------------

/// Snapshot view available inside a read transaction.
pub trait ReadTx {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>>;
    fn scan(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Mutable view available inside a write transaction.
pub trait WriteTx: ReadTx {
    fn put(&mut self, table: Table, key: &str, value: &[u8]) -> Result<()>;
    /// Returns true if the key existed.
    fn remove(&mut self, table: Table, key: &str) -> Result<bool>;
}

pub trait MetadataAccess {
    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T>;

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T>;
}

// ---------------------------------------------------------------------------
// Typed record access
// ---------------------------------------------------------------------------

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(FeedMgrError::storage)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(FeedMgrError::storage)
}

pub trait ReadTxExt: ReadTx {
    fn feed(&self, id: &FeedId) -> Result<Option<Feed>> {
        self.get(Table::Feeds, id.as_str())?
            .map(|b| decode(&b))
            .transpose()
    }

    fn feeds(&self) -> Result<Vec<Feed>> {
        let mut feeds = self
            .scan(Table::Feeds)?
            .into_iter()
            .map(|(_, b)| decode::<Feed>(&b))
            .collect::<Result<Vec<_>>>()?;
        feeds.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
        Ok(feeds)
    }

    fn find_feed(&self, category: &str, name: &str) -> Result<Option<Feed>> {
        Ok(self
            .feeds()?
            .into_iter()
            .find(|f| f.category == category && f.name == name))
    }

    fn template(&self, id: &str) -> Result<Option<Template>> {
        self.get(Table::Templates, id)?
            .map(|b| decode(&b))
            .transpose()
    }

    fn templates(&self) -> Result<Vec<Template>> {
        let mut templates = self
            .scan(Table::Templates)?
            .into_iter()
            .map(|(_, b)| decode::<Template>(&b))
            .collect::<Result<Vec<_>>>()?;
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    fn find_template_by_name(&self, name: &str) -> Result<Option<Template>> {
        Ok(self.templates()?.into_iter().find(|t| t.name == name))
    }

    fn principals(&self, scope: &AccessScope) -> Result<BTreeSet<Principal>> {
        Ok(self
            .get(Table::FeedAcl, &scope.key())?
            .map(|b| decode(&b))
            .transpose()?
            .unwrap_or_default())
    }

    fn acl_entries(&self) -> Result<Vec<(AccessScope, BTreeSet<Principal>)>> {
        self.scan(Table::FeedAcl)?
            .into_iter()
            .map(|(k, b)| Ok((AccessScope::from_key(&k), decode(&b)?)))
            .collect()
    }
}

impl<T: ReadTx + ?Sized> ReadTxExt for T {}

pub trait WriteTxExt: WriteTx {
    fn put_feed(&mut self, feed: &Feed) -> Result<()> {
        self.put(Table::Feeds, feed.id.as_str(), &encode(feed)?)
    }

    fn put_template(&mut self, template: &Template) -> Result<()> {
        self.put(Table::Templates, &template.id, &encode(template)?)
    }

    /// Store a principal set; an empty set removes the entry instead.
    fn put_principals(&mut self, scope: &AccessScope, set: &BTreeSet<Principal>) -> Result<()> {
        if set.is_empty() {
            self.remove(Table::FeedAcl, &scope.key())?;
            Ok(())
        } else {
            self.put(Table::FeedAcl, &scope.key(), &encode(set)?)
        }
    }
}

impl<T: WriteTx + ?Sized> WriteTxExt for T {}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

/// [`MetadataAccess`] backed by a redb database file.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table up front
    /// so read transactions never see a missing table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(FeedMgrError::storage)?;
        let wt = db.begin_write().map_err(FeedMgrError::storage)?;
        for table in Table::ALL {
            wt.open_table(table.def()).map_err(FeedMgrError::storage)?;
        }
        wt.commit().map_err(FeedMgrError::storage)?;
        Ok(Self { db })
    }
}

struct RedbRead {
    txn: redb::ReadTransaction,
}

impl ReadTx for RedbRead {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let t = self
            .txn
            .open_table(table.def())
            .map_err(FeedMgrError::storage)?;
        let value = t.get(key).map_err(FeedMgrError::storage)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn scan(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>> {
        let t = self
            .txn
            .open_table(table.def())
            .map_err(FeedMgrError::storage)?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(FeedMgrError::storage)? {
            let (k, v) = entry.map_err(FeedMgrError::storage)?;
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(out)
    }
}

struct RedbWrite<'a> {
    txn: &'a redb::WriteTransaction,
}

impl ReadTx for RedbWrite<'_> {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let t = self
            .txn
            .open_table(table.def())
            .map_err(FeedMgrError::storage)?;
        let value = t.get(key).map_err(FeedMgrError::storage)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn scan(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>> {
        let t = self
            .txn
            .open_table(table.def())
            .map_err(FeedMgrError::storage)?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(FeedMgrError::storage)? {
            let (k, v) = entry.map_err(FeedMgrError::storage)?;
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(out)
    }
}

impl WriteTx for RedbWrite<'_> {
    fn put(&mut self, table: Table, key: &str, value: &[u8]) -> Result<()> {
        let mut t = self
            .txn
            .open_table(table.def())
            .map_err(FeedMgrError::storage)?;
        t.insert(key, value).map_err(FeedMgrError::storage)?;
        Ok(())
    }

    fn remove(&mut self, table: Table, key: &str) -> Result<bool> {
        let mut t = self
            .txn
            .open_table(table.def())
            .map_err(FeedMgrError::storage)?;
        let existed = t.remove(key).map_err(FeedMgrError::storage)?.is_some();
        Ok(existed)
    }
}

impl MetadataAccess for RedbStore {
    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T>,
    {
        let txn = self.db.begin_read().map_err(FeedMgrError::storage)?;
        f(&RedbRead { txn })
    }

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T>,
    {
        let wt = self.db.begin_write().map_err(FeedMgrError::storage)?;
        let result = {
            let mut tx = RedbWrite { txn: &wt };
            f(&mut tx)
        };
        match result {
            Ok(value) => {
                wt.commit().map_err(FeedMgrError::storage)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = wt.abort() {
                    tracing::warn!("failed to abort metadata transaction: {abort_err}");
                }
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedState, Property};
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("meta.db")).unwrap();
        (dir, store)
    }

    fn feed(category: &str, name: &str) -> Feed {
        let now = Utc::now();
        Feed {
            id: FeedId::generate(),
            category: category.into(),
            name: name.into(),
            description: None,
            state: FeedState::New,
            properties: vec![Property::new("p1", "GetFile", "dir", Some("/in"))],
            template_id: "t1".into(),
            template_name: "ingest".into(),
            graph: None,
            reusable: false,
            input_processor_type: None,
            schedule: None,
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn committed_write_is_visible_to_later_reads() {
        let (_dir, store) = open_tmp();
        let f = feed("sales", "orders");
        store.write(|tx| tx.put_feed(&f)).unwrap();

        let loaded = store.read(|tx| tx.feed(&f.id)).unwrap().unwrap();
        assert_eq!(loaded.name, "orders");
        let found = store.read(|tx| tx.find_feed("sales", "orders")).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn failed_write_closure_aborts_transaction() {
        let (_dir, store) = open_tmp();
        let f = feed("sales", "orders");
        let result: Result<()> = store.write(|tx| {
            tx.put_feed(&f)?;
            Err(FeedMgrError::Persist("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.read(|tx| tx.feed(&f.id)).unwrap().is_none());
    }

    #[test]
    fn empty_principal_set_removes_entry() {
        let (_dir, store) = open_tmp();
        let scope = AccessScope::Feed(FeedId::new("f1"));
        let set: BTreeSet<Principal> = [Principal::new("alice")].into();
        store.write(|tx| tx.put_principals(&scope, &set)).unwrap();
        assert_eq!(store.read(|tx| tx.acl_entries()).unwrap().len(), 1);

        store
            .write(|tx| tx.put_principals(&scope, &BTreeSet::new()))
            .unwrap();
        assert!(store.read(|tx| tx.acl_entries()).unwrap().is_empty());
    }

    #[test]
    fn empty_store_reads_return_nothing() {
        let (_dir, store) = open_tmp();
        assert!(store.read(|tx| tx.feeds()).unwrap().is_empty());
        assert!(store.read(|tx| tx.template("missing")).unwrap().is_none());
    }
}
