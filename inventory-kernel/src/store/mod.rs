/**
 * INVENTORY STORE - embedded persistence for mirrored resources
 *
 * ROLE:
 * One redb file holds every deployment. Each deployment is an isolated
 * namespace ("bucket"); inside it every resource kind gets its own table
 * plus one table per secondary index.
 *
 * LAYOUT:
 * - `{namespace}/{kind}`          primary key -> JSON record
 * - `{namespace}/{kind}#{field}`  `{value}\0{primary key}` -> primary key
 *
 * A namespace exists as long as one of its tables exists, so listing
 * namespaces is a scan of table names and dropping one deletes every
 * table under its prefix.
 */

mod bucket;

pub use bucket::Bucket;

use redb::{Database, TableHandle};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("field {field} is not indexed for {kind}")]
    NotIndexed { kind: &'static str, field: String },
    #[error("database error: {0}")]
    Database(#[from] redb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

macro_rules! redb_error {
    ($($ty:ty),*) => {
        $(impl From<$ty> for StoreError {
            fn from(e: $ty) -> Self {
                StoreError::Database(e.into())
            }
        })*
    };
}

redb_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Schema tag of anything the store can hold.
///
/// `KIND` names the table, `primary_key` is unique inside a namespace and
/// every field listed in `INDEXES` must be answerable by `index_value`.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: &'static str;
    const INDEXES: &'static [&'static str];

    fn primary_key(&self) -> String;

    fn index_value(&self, field: &str) -> Option<&str>;
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub path: String,
    pub file_size_bytes: u64,
    pub namespaces: Vec<String>,
}

/// Handle on the store file. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    path: PathBuf,
}

impl Store {
    /// Opens the store, creating the file if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Database(redb::Error::Io(e))
                })?;
            }
        }
        let db = Database::create(&path)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(Self { db: Arc::new(db), path })
    }

    /// Namespace for one deployment. Nothing is created until the first write.
    pub fn bucket(&self, namespace: &str) -> Bucket {
        Bucket::new(self.db.clone(), namespace)
    }

    /// Names of every namespace holding at least one table.
    pub fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read()?;
        let names: BTreeSet<String> = txn
            .list_tables()?
            .filter_map(|handle| namespace_of(handle.name()).map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Deletes every table of a namespace. Returns the number of tables removed.
    pub fn drop_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let txn = self.db.begin_write()?;
        let handles: Vec<_> = txn
            .list_tables()?
            .filter(|handle| namespace_of(handle.name()) == Some(namespace))
            .collect();
        let mut dropped = 0;
        for handle in handles {
            if txn.delete_table(handle)? {
                dropped += 1;
            }
        }
        txn.commit()?;
        Ok(dropped)
    }

    pub fn stats(&self) -> StoreStats {
        let file_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let namespaces = self.namespaces().unwrap_or_else(|e| {
            tracing::error!(error = %e, "unable to list namespaces");
            Vec::new()
        });
        StoreStats {
            path: self.path.display().to_string(),
            file_size_bytes,
            namespaces,
        }
    }
}

pub(crate) fn data_table(namespace: &str, kind: &str) -> String {
    format!("{namespace}/{kind}")
}

pub(crate) fn index_table(namespace: &str, kind: &str, field: &str) -> String {
    format!("{namespace}/{kind}#{field}")
}

/// `lab-1a/instances#host_id` -> `lab-1a`
fn namespace_of(table: &str) -> Option<&str> {
    table.rsplit_once('/').map(|(namespace, _)| namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Host {
        id: String,
        name: String,
        rack: String,
    }

    impl Record for Host {
        const KIND: &'static str = "hosts";
        const INDEXES: &'static [&'static str] = &["name", "rack"];

        fn primary_key(&self) -> String {
            self.id.clone()
        }

        fn index_value(&self, field: &str) -> Option<&str> {
            match field {
                "name" => Some(&self.name),
                "rack" => Some(&self.rack),
                _ => None,
            }
        }
    }

    fn host(id: &str, name: &str, rack: &str) -> Host {
        Host { id: id.into(), name: name.into(), rack: rack.into() }
    }

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_namespace_of() {
        assert_eq!(namespace_of("lab-1a/instances"), Some("lab-1a"));
        assert_eq!(namespace_of("lab-1a/instances#host_id"), Some("lab-1a"));
        assert_eq!(namespace_of("odd/name/instances"), Some("odd/name"));
        assert_eq!(namespace_of("orphan"), None);
    }

    #[test]
    fn test_upsert_overwrites_and_moves_index() {
        let (_dir, store) = temp_store();
        let bucket = store.bucket("lab");

        bucket.upsert(&host("1", "alpha", "r1")).unwrap();
        bucket.upsert(&host("1", "alpha", "r2")).unwrap();

        let all: Vec<Host> = bucket.all().unwrap();
        assert_eq!(all, vec![host("1", "alpha", "r2")]);
        assert!(bucket.find::<Host>("rack", "r1").unwrap().is_empty());
        assert_eq!(bucket.find::<Host>("rack", "r2").unwrap().len(), 1);
    }

    #[test]
    fn test_index_lookups() {
        let (_dir, store) = temp_store();
        let bucket = store.bucket("lab");
        bucket
            .upsert_all(&[host("1", "alpha", "r1"), host("2", "beta", "r1"), host("3", "alpha-2", "r2")])
            .unwrap();

        let one: Host = bucket.one("name", "alpha").unwrap();
        assert_eq!(one.id, "1");

        let mut rack: Vec<String> = bucket
            .find::<Host>("rack", "r1")
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        rack.sort();
        assert_eq!(rack, vec!["1", "2"]);

        let missing = bucket.one::<Host>("name", "gamma").unwrap_err();
        assert!(missing.is_not_found());
        assert!(matches!(
            bucket.find::<Host>("colour", "red").unwrap_err(),
            StoreError::NotIndexed { .. }
        ));
    }

    #[test]
    fn test_index_prefix_does_not_leak() {
        let (_dir, store) = temp_store();
        let bucket = store.bucket("lab");
        bucket.upsert(&host("1", "alpha", "r1")).unwrap();
        bucket.upsert(&host("2", "alpha-2", "r1")).unwrap();

        let found = bucket.find::<Host>("name", "alpha").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "1");
    }

    #[test]
    fn test_undecodable_record_is_skipped_by_lookups() {
        let (_dir, store) = temp_store();
        let bucket = store.bucket("lab");
        bucket
            .upsert_all(&[host("1", "alpha", "r1"), host("2", "beta", "r1")])
            .unwrap();

        let txn = store.db.begin_write().unwrap();
        {
            let name = data_table("lab", Host::KIND);
            let mut data = txn
                .open_table(redb::TableDefinition::<&str, &[u8]>::new(&name))
                .unwrap();
            data.insert("2", b"{not json".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        let rack = bucket.find::<Host>("rack", "r1").unwrap();
        assert_eq!(rack, vec![host("1", "alpha", "r1")]);
        assert_eq!(bucket.all::<Host>().unwrap().len(), 1);
        assert!(bucket.one::<Host>("name", "beta").unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_removes_record_and_index() {
        let (_dir, store) = temp_store();
        let bucket = store.bucket("lab");
        let h = host("1", "alpha", "r1");
        bucket.upsert(&h).unwrap();
        bucket.delete(&h).unwrap();

        assert!(bucket.all::<Host>().unwrap().is_empty());
        assert!(bucket.get::<Host>("1").unwrap_err().is_not_found());
        assert!(bucket.find::<Host>("name", "alpha").unwrap().is_empty());
    }

    #[test]
    fn test_missing_tables_read_as_empty() {
        let (_dir, store) = temp_store();
        let bucket = store.bucket("never-written");
        assert!(bucket.all::<Host>().unwrap().is_empty());
        assert!(bucket.find::<Host>("name", "x").unwrap().is_empty());
        assert!(bucket.get::<Host>("x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_namespaces_are_isolated_and_droppable() {
        let (_dir, store) = temp_store();
        store.bucket("dep-a").upsert(&host("1", "alpha", "r1")).unwrap();
        store.bucket("dep-b").upsert(&host("1", "other", "r9")).unwrap();

        assert_eq!(store.namespaces().unwrap(), vec!["dep-a", "dep-b"]);
        let a: Host = store.bucket("dep-a").get("1").unwrap();
        assert_eq!(a.name, "alpha");

        assert!(store.drop_namespace("dep-b").unwrap() > 0);
        assert_eq!(store.namespaces().unwrap(), vec!["dep-a"]);
        assert!(store.bucket("dep-b").all::<Host>().unwrap().is_empty());
    }
}
