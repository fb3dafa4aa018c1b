//! Structured local storage on top of sled.
//!
//! A store is one sled database holding named collections. Every collection is a
//! tree keyed by the record's id (read from `key_path`), and every secondary index
//! is a separate tree whose keys are `value \0 id`. Index trees are non-unique.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sled::transaction::{abort, ConflictableTransactionResult, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const META_TREE: &str = "__meta";
const VERSION_KEY: &[u8] = b"schema_version";
const INDEX_SEPARATOR: u8 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    OpenFailed(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("record {id} already exists in {collection}")]
    DuplicateKey { collection: String, id: String },

    #[error("store deletion blocked by another open handle")]
    ResetBlocked,
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::TransactionFailed(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::TransactionFailed(format!("serialization: {}", e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A named collection with its primary key field and secondary indexes.
#[derive(Debug, Clone, Copy)]
pub struct CollectionSchema {
    pub name: &'static str,
    pub key_path: &'static str,
    pub indexes: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub version: u32,
    pub collections: &'static [CollectionSchema],
}

impl Schema {
    fn collection(&self, name: &str) -> StoreResult<&CollectionSchema> {
        self.collections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| StoreError::TransactionFailed(format!("unknown collection: {}", name)))
    }
}

fn index_tree_name(collection: &str, index: &str) -> String {
    format!("{}/{}", collection, index)
}

fn index_entry(value: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + id.len() + 1);
    key.extend_from_slice(value.as_bytes());
    key.push(INDEX_SEPARATOR);
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_prefix(value: &str) -> Vec<u8> {
    let mut prefix = value.as_bytes().to_vec();
    prefix.push(INDEX_SEPARATOR);
    prefix
}

/// Extracts the indexable form of a field. Missing, null and structured values are not indexed.
fn index_value(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn record_key(record: &Value, schema: &CollectionSchema) -> StoreResult<String> {
    match record.get(schema.key_path) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(StoreError::TransactionFailed(format!(
            "record for {} has no string `{}` key",
            schema.name, schema.key_path
        ))),
    }
}

/// Sled reports a held database file lock as an I/O error.
fn is_lock_contention(e: &sled::Error) -> bool {
    match e {
        sled::Error::Io(io) => {
            io.kind() == std::io::ErrorKind::WouldBlock || io.to_string().contains("lock")
        }
        _ => false,
    }
}

pub struct StructuredStore {
    path: PathBuf,
    schema: Schema,
    handle: Mutex<Option<Db>>,
    reset_retry_delay: Duration,
}

impl StructuredStore {
    pub fn new(path: impl AsRef<Path>, schema: Schema) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            schema,
            handle: Mutex::new(None),
            reset_retry_delay: Duration::from_millis(1000),
        }
    }

    /// Delay before the single retry of a blocked `delete_database`.
    pub fn with_reset_retry_delay(mut self, delay: Duration) -> Self {
        self.reset_retry_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the database once and hands out the cached handle afterwards.
    ///
    /// A stored schema version older than ours triggers an additive upgrade:
    /// missing collections and index trees are created and new indexes are
    /// backfilled from existing records. Nothing is ever dropped.
    pub async fn open(&self) -> StoreResult<Db> {
        let mut handle = self.handle.lock().await;
        if let Some(db) = handle.as_ref() {
            return Ok(db.clone());
        }

        let path = self.path.clone();
        let schema = self.schema;
        let db = tokio::task::spawn_blocking(move || -> StoreResult<Db> {
            let db = sled::open(&path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
            migrate(&db, &schema)?;
            Ok(db)
        })
        .await
        .map_err(|e| StoreError::OpenFailed(format!("open task failed: {}", e)))??;

        info!(path = %self.path.display(), version = self.schema.version, "store opened");
        *handle = Some(db.clone());
        Ok(db)
    }

    pub async fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> StoreResult<Option<T>> {
        self.schema.collection(collection)?;
        let db = self.open().await?;
        let tree = db.open_tree(collection)?;
        match tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all<T: DeserializeOwned>(&self, collection: &str) -> StoreResult<Vec<T>> {
        self.schema.collection(collection)?;
        let db = self.open().await?;
        let tree = db.open_tree(collection)?;
        let mut records = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item?;
            records.push(serde_json::from_slice(&bytes)?);
        }
        Ok(records)
    }

    /// All records whose `index` field equals `value`, ordered by primary key.
    pub async fn get_all_by_index<T: DeserializeOwned>(
        &self,
        collection: &str,
        index: &str,
        value: &str,
    ) -> StoreResult<Vec<T>> {
        let schema = self.schema.collection(collection)?;
        if !schema.indexes.contains(&index) {
            return Err(StoreError::TransactionFailed(format!(
                "unknown index {} on {}",
                index, collection
            )));
        }

        let db = self.open().await?;
        let records = db.open_tree(collection)?;
        let index_tree = db.open_tree(index_tree_name(collection, index))?;
        let prefix = index_prefix(value);

        let mut found = Vec::new();
        for item in index_tree.scan_prefix(&prefix) {
            let (key, _) = item?;
            let id = &key[prefix.len()..];
            if let Some(bytes) = records.get(id)? {
                found.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(found)
    }

    /// Insert or replace by id.
    pub async fn put<T: Serialize>(&self, collection: &str, record: &T) -> StoreResult<()> {
        self.write(collection, record, false).await
    }

    /// Insert; fails with `DuplicateKey` when the id is already present.
    pub async fn add<T: Serialize>(&self, collection: &str, record: &T) -> StoreResult<()> {
        self.write(collection, record, true).await
    }

    async fn write<T: Serialize>(&self, collection: &str, record: &T, insert_only: bool) -> StoreResult<()> {
        let schema = *self.schema.collection(collection)?;
        let value = serde_json::to_value(record)?;
        if !value.is_object() {
            return Err(StoreError::TransactionFailed(format!(
                "records in {} must be objects",
                collection
            )));
        }
        let id = record_key(&value, &schema)?;
        let bytes = serde_json::to_vec(&value)?;

        let db = self.open().await?;
        let mut trees: Vec<Tree> = vec![db.open_tree(schema.name)?];
        for index in schema.indexes {
            trees.push(db.open_tree(index_tree_name(schema.name, index))?);
        }

        let result = trees.as_slice().transaction(|views: &Vec<TransactionalTree>| {
            write_record(views, &schema, &id, &value, &bytes, insert_only)
        });

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StoreError::TransactionFailed(e.to_string()),
        })?;

        db.flush_async().await?;
        debug!(collection, id = %id, "record written");
        Ok(())
    }

    /// Destroys the whole database. The cached handle is released first; when
    /// another handle still holds the database, one retry follows after the
    /// configured delay before `ResetBlocked` is reported.
    pub async fn delete_database(&self) -> StoreResult<()> {
        let mut handle = self.handle.lock().await;
        if let Some(db) = handle.take() {
            db.flush_async().await?;
        }

        if self.try_destroy().await? {
            info!(path = %self.path.display(), "store deleted");
            return Ok(());
        }

        warn!("store deletion blocked, retrying in {:?}", self.reset_retry_delay);
        tokio::time::sleep(self.reset_retry_delay).await;

        if self.try_destroy().await? {
            info!(path = %self.path.display(), "store deleted on retry");
            Ok(())
        } else {
            Err(StoreError::ResetBlocked)
        }
    }

    /// Returns false when the database is still locked by another handle.
    async fn try_destroy(&self) -> StoreResult<bool> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<bool> {
            if !path.exists() {
                return Ok(true);
            }
            match sled::Config::new().path(&path).open() {
                Ok(probe) => drop(probe),
                Err(e) if is_lock_contention(&e) => return Ok(false),
                Err(e) => return Err(StoreError::TransactionFailed(e.to_string())),
            }
            std::fs::remove_dir_all(&path)
                .map_err(|e| StoreError::TransactionFailed(format!("remove {}: {}", path.display(), e)))?;
            Ok(true)
        })
        .await
        .map_err(|e| StoreError::TransactionFailed(format!("delete task failed: {}", e)))?
    }
}

fn write_record(
    views: &[TransactionalTree],
    schema: &CollectionSchema,
    id: &str,
    value: &Value,
    bytes: &[u8],
    insert_only: bool,
) -> ConflictableTransactionResult<(), StoreError> {
    let records = &views[0];
    let previous = records.insert(id.as_bytes(), bytes)?;

    if let Some(previous) = previous {
        if insert_only {
            return abort(StoreError::DuplicateKey {
                collection: schema.name.to_string(),
                id: id.to_string(),
            });
        }
        let old: Value = match serde_json::from_slice(&previous) {
            Ok(old) => old,
            Err(e) => return abort(StoreError::from(e)),
        };
        for (pos, index) in schema.indexes.iter().enumerate() {
            if let Some(old_value) = index_value(&old, index) {
                views[pos + 1].remove(index_entry(&old_value, id))?;
            }
        }
    }

    for (pos, index) in schema.indexes.iter().enumerate() {
        if let Some(new_value) = index_value(value, index) {
            views[pos + 1].insert(index_entry(&new_value, id), &[] as &[u8])?;
        }
    }
    Ok(())
}

fn stored_version(meta: &Tree) -> StoreResult<Option<u32>> {
    match meta.get(VERSION_KEY)? {
        Some(bytes) => {
            let raw: [u8; 4] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::OpenFailed("corrupt schema version".to_string()))?;
            Ok(Some(u32::from_be_bytes(raw)))
        }
        None => Ok(None),
    }
}

fn migrate(db: &Db, schema: &Schema) -> StoreResult<()> {
    let open_err = |e: sled::Error| StoreError::OpenFailed(e.to_string());
    let meta = db.open_tree(META_TREE).map_err(open_err)?;
    let current = stored_version(&meta)?;

    match current {
        Some(v) if v > schema.version => {
            return Err(StoreError::OpenFailed(format!(
                "store version {} is newer than supported version {}",
                v, schema.version
            )))
        }
        Some(v) if v == schema.version => return Ok(()),
        _ => {}
    }

    info!(from = ?current, to = schema.version, "upgrading store schema");
    for collection in schema.collections {
        let records = db.open_tree(collection.name).map_err(open_err)?;
        for index in collection.indexes {
            let index_tree = db
                .open_tree(index_tree_name(collection.name, index))
                .map_err(open_err)?;
            if index_tree.is_empty() && !records.is_empty() {
                backfill_index(&records, &index_tree, index)?;
            }
        }
    }

    meta.insert(VERSION_KEY, schema.version.to_be_bytes().to_vec())
        .map_err(open_err)?;
    db.flush().map_err(open_err)?;
    Ok(())
}

fn backfill_index(records: &Tree, index_tree: &Tree, index: &str) -> StoreResult<()> {
    let mut count = 0usize;
    for item in records.iter() {
        let (key, bytes) = item.map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::OpenFailed(format!("corrupt record: {}", e)))?;
        let id = String::from_utf8_lossy(&key);
        if let Some(indexed) = index_value(&value, index) {
            index_tree
                .insert(index_entry(&indexed, &id), &[] as &[u8])
                .map_err(|e| StoreError::OpenFailed(e.to_string()))?;
            count += 1;
        }
    }
    debug!(index, count, "index backfilled");
    Ok(())
}
