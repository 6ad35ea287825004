// LMDB persistence for collection schemas and records
use anyhow::Result;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use vizdex_core::{CollectionSchema, NormalizedVector, Record};

const DB_COLLECTIONS: &str = "collections";
const DB_RECORDS: &str = "records";

/// Default LMDB map size (address space, not disk usage).
pub const DEFAULT_MAP_SIZE: usize = 100 * 1024 * 1024 * 1024;

/// On-disk record layout. Metadata is kept as JSON text since bincode
/// cannot round-trip self-describing values.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    vector: Vec<f32>,
    metadata: String,
}

fn record_key(collection: &str, key: &str) -> String {
    format!("{collection}\0{key}")
}

fn encode(record: &Record) -> Result<Vec<u8>> {
    let stored = StoredRecord {
        vector: record.vector.as_slice().to_vec(),
        metadata: serde_json::to_string(&record.metadata)?,
    };
    Ok(bincode::serialize(&stored)?)
}

fn decode(key: &str, data: &[u8]) -> Result<Record> {
    let stored: StoredRecord = bincode::deserialize(data)?;
    Ok(Record::new(
        key,
        NormalizedVector::from_stored(stored.vector),
        serde_json::from_str(&stored.metadata)?,
    ))
}

pub struct LmdbStorage {
    env: Arc<Env>,
    collections_db: Database<Str, Bytes>,
    records_db: Database<Str, Bytes>,
}

impl LmdbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_map_size(path, DEFAULT_MAP_SIZE)
    }

    pub fn with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(&path)?;

        let env = Arc::new(unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(4)
                .open(path)?
        });

        let mut wtxn = env.write_txn()?;
        let collections_db = env.create_database(&mut wtxn, Some(DB_COLLECTIONS))?;
        let records_db = env.create_database(&mut wtxn, Some(DB_RECORDS))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            collections_db,
            records_db,
        })
    }

    pub fn save_schema(&self, schema: &CollectionSchema) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.collections_db
            .put(&mut wtxn, &schema.name, &serde_json::to_vec(schema)?)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_schema(&self, name: &str) -> Result<Option<CollectionSchema>> {
        let rtxn = self.env.read_txn()?;
        match self.collections_db.get(&rtxn, name)? {
            Some(data) => Ok(Some(serde_json::from_slice(data)?)),
            None => Ok(None),
        }
    }

    /// Write `record`, replacing any previous value in the same transaction.
    /// Returns whether a record already existed under the key.
    pub fn put_record(&self, collection: &str, record: &Record) -> Result<bool> {
        let key = record_key(collection, &record.key);
        let data = encode(record)?;
        let mut wtxn = self.env.write_txn()?;
        let existed = self.records_db.get(&wtxn, &key)?.is_some();
        self.records_db.put(&mut wtxn, &key, &data)?;
        wtxn.commit()?;
        Ok(existed)
    }

    pub fn contains_record(&self, collection: &str, key: &str) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .records_db
            .get(&rtxn, &record_key(collection, key))?
            .is_some())
    }

    pub fn delete_record(&self, collection: &str, key: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.records_db.delete(&mut wtxn, &record_key(collection, key))?;
        wtxn.commit()?;
        Ok(existed)
    }

    /// All records of a collection, in key order.
    pub fn load_records(&self, collection: &str) -> Result<Vec<Record>> {
        let prefix = record_key(collection, "");
        let rtxn = self.env.read_txn()?;
        let mut records = Vec::new();
        for result in self.records_db.prefix_iter(&rtxn, &prefix)? {
            let (key, data) = result?;
            records.push(decode(&key[prefix.len()..], data)?);
        }
        Ok(records)
    }

    pub fn count_records(&self, collection: &str) -> Result<usize> {
        let prefix = record_key(collection, "");
        let rtxn = self.env.read_txn()?;
        let mut count = 0;
        for result in self.records_db.prefix_iter(&rtxn, &prefix)? {
            result?;
            count += 1;
        }
        Ok(count)
    }

    /// Force the memory map to disk.
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}
