use redb::{
    Database, Key, ReadOnlyTable, ReadTransaction, ReadableTable, Table, TableDefinition,
    TableError, Value, WriteTransaction,
};
use std::sync::Arc;

use super::{data_table, index_table, Record, StoreError};

/// One namespace of the store. All writes of a call share one transaction.
#[derive(Clone)]
pub struct Bucket {
    db: Arc<Database>,
    namespace: String,
}

impl Bucket {
    pub(super) fn new(db: Arc<Database>, namespace: &str) -> Self {
        Self {
            db,
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn upsert<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        self.upsert_all(std::slice::from_ref(record))
    }

    /// Full overwrite of every record, index entries moved accordingly.
    pub fn upsert_all<R: Record>(&self, records: &[R]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let (mut data, mut indexes) = self.open_for_write::<R>(&txn)?;
            for record in records {
                let pk = record.primary_key();
                if let Some(previous) = load::<R>(&data, &pk) {
                    unindex(&mut indexes, &previous, &pk)?;
                }
                let bytes = serde_json::to_vec(record)?;
                data.insert(pk.as_str(), bytes.as_slice())?;
                for (field, table) in R::INDEXES.iter().zip(indexes.iter_mut()) {
                    if let Some(value) = record.index_value(field) {
                        table.insert(index_key(value, &pk).as_str(), pk.as_str())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn delete<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        self.delete_all(std::slice::from_ref(record))
    }

    /// Removes records by primary key. Unknown keys are ignored.
    pub fn delete_all<R: Record>(&self, records: &[R]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let (mut data, mut indexes) = self.open_for_write::<R>(&txn)?;
            for record in records {
                let pk = record.primary_key();
                let stored = load::<R>(&data, &pk);
                unindex(&mut indexes, stored.as_ref().unwrap_or(record), &pk)?;
                data.remove(pk.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Full scan of a kind. A kind never written reads as empty.
    pub fn all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let txn = self.db.begin_read()?;
        let Some(data) = self.open_data::<R>(&txn)? else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for entry in data.iter()? {
            let (key, value) = entry?;
            match serde_json::from_slice(value.value()) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    namespace = %self.namespace,
                    kind = R::KIND,
                    key = key.value(),
                    error = %e,
                    "skipping undecodable record"
                ),
            }
        }
        Ok(records)
    }

    /// Lookup by primary key.
    pub fn get<R: Record>(&self, pk: &str) -> Result<R, StoreError> {
        let txn = self.db.begin_read()?;
        let Some(data) = self.open_data::<R>(&txn)? else {
            return Err(StoreError::NotFound);
        };
        let guard = data.get(pk)?.ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_slice(guard.value())?)
    }

    /// First record whose indexed `field` equals `value`.
    pub fn one<R: Record>(&self, field: &str, value: &str) -> Result<R, StoreError> {
        self.find(field, value)?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    /// Every record whose indexed `field` equals `value`.
    pub fn find<R: Record>(&self, field: &str, value: &str) -> Result<Vec<R>, StoreError> {
        if !R::INDEXES.contains(&field) {
            return Err(StoreError::NotIndexed {
                kind: R::KIND,
                field: field.to_string(),
            });
        }
        let txn = self.db.begin_read()?;
        let index_name = index_table(&self.namespace, R::KIND, field);
        let Some(index) = open_optional::<&str, &str>(&txn, &index_name)? else {
            return Ok(Vec::new());
        };
        let Some(data) = self.open_data::<R>(&txn)? else {
            return Ok(Vec::new());
        };

        let prefix = index_prefix(value);
        let mut records = Vec::new();
        for entry in index.range(prefix.as_str()..)? {
            let (key, pk) = entry?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            let Some(guard) = data.get(pk.value())? else {
                continue;
            };
            let record: R = match serde_json::from_slice(guard.value()) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        namespace = %self.namespace,
                        kind = R::KIND,
                        key = pk.value(),
                        error = %e,
                        "skipping undecodable record"
                    );
                    continue;
                }
            };
            // stale entries left behind by an undecodable previous version
            if record.index_value(field) == Some(value) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn open_data<R: Record>(
        &self,
        txn: &ReadTransaction,
    ) -> Result<Option<ReadOnlyTable<&'static str, &'static [u8]>>, StoreError> {
        open_optional(txn, &data_table(&self.namespace, R::KIND))
    }

    #[allow(clippy::type_complexity)]
    fn open_for_write<'txn, R: Record>(
        &self,
        txn: &'txn WriteTransaction,
    ) -> Result<
        (
            Table<'txn, &'static str, &'static [u8]>,
            Vec<Table<'txn, &'static str, &'static str>>,
        ),
        StoreError,
    > {
        let data_name = data_table(&self.namespace, R::KIND);
        let data = txn.open_table(TableDefinition::<&str, &[u8]>::new(&data_name))?;
        let mut indexes = Vec::with_capacity(R::INDEXES.len());
        for field in R::INDEXES {
            let name = index_table(&self.namespace, R::KIND, field);
            indexes.push(txn.open_table(TableDefinition::<&str, &str>::new(&name))?);
        }
        Ok((data, indexes))
    }
}

fn open_optional<K: Key + 'static, V: Value + 'static>(
    txn: &ReadTransaction,
    name: &str,
) -> Result<Option<ReadOnlyTable<K, V>>, StoreError> {
    match txn.open_table(TableDefinition::<K, V>::new(name)) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load<R: Record>(data: &Table<&'static str, &'static [u8]>, pk: &str) -> Option<R> {
    let guard = data.get(pk).ok()??;
    serde_json::from_slice(guard.value()).ok()
}

fn unindex<R: Record>(
    indexes: &mut [Table<&'static str, &'static str>],
    record: &R,
    pk: &str,
) -> Result<(), StoreError> {
    for (field, table) in R::INDEXES.iter().zip(indexes.iter_mut()) {
        if let Some(value) = record.index_value(field) {
            table.remove(index_key(value, pk).as_str())?;
        }
    }
    Ok(())
}

fn index_prefix(value: &str) -> String {
    format!("{value}\0")
}

fn index_key(value: &str, pk: &str) -> String {
    format!("{value}\0{pk}")
}
