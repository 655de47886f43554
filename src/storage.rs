use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

use crate::model::{ModelId, MODEL_ID_LEN};

/// Keyed collection of enrolled model blobs.
///
/// Blobs are stored exactly as handed in; decoding and integrity checks happen
/// before a blob reaches the store. Absent ids and duplicates are reported
/// through the return values, never as errors.
pub trait ModelStore: Send {
    /// Returns false when the id is already present.
    fn insert(&mut self, id: ModelId, blob: &[u8]) -> Result<bool>;

    /// Returns false when the id is unknown.
    fn remove(&mut self, id: &ModelId) -> Result<bool>;

    fn get(&self, id: &ModelId) -> Result<Option<Vec<u8>>>;

    /// Overwrite an existing blob in place. Returns false when the id is unknown.
    fn replace(&mut self, id: &ModelId, blob: &[u8]) -> Result<bool>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteModelStore {
    conn: Connection,
}

impl SqliteModelStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS palm_models (
              model_id BLOB PRIMARY KEY,
              payload BLOB NOT NULL,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl ModelStore for SqliteModelStore {
    fn insert(&mut self, id: ModelId, blob: &[u8]) -> Result<bool> {
        let now = crate::now_us();
        let changed = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO palm_models(model_id, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            "#,
            params![id.as_bytes().to_vec(), blob, now],
        )?;
        Ok(changed == 1)
    }

    fn remove(&mut self, id: &ModelId) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM palm_models WHERE model_id = ?1",
            params![id.as_bytes().to_vec()],
        )?;
        Ok(changed == 1)
    }

    fn get(&self, id: &ModelId) -> Result<Option<Vec<u8>>> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload FROM palm_models WHERE model_id = ?1",
                params![id.as_bytes().to_vec()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(payload)
    }

    fn replace(&mut self, id: &ModelId, blob: &[u8]) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE palm_models SET payload = ?2, updated_at = ?3 WHERE model_id = ?1",
            params![id.as_bytes().to_vec(), blob, crate::now_us()],
        )?;
        Ok(changed == 1)
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM palm_models", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|_| anyhow!("corrupt model store: negative count"))
    }
}

impl SqliteModelStore {
    /// Ids of every stored model, ascending.
    pub fn ids(&self) -> Result<Vec<ModelId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT model_id FROM palm_models ORDER BY model_id")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(0)?;
            let id: [u8; MODEL_ID_LEN] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("corrupt model store: model_id size"))?;
            out.push(ModelId::from_bytes(id));
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryModelStore {
    models: BTreeMap<ModelId, Vec<u8>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<ModelId> {
        self.models.keys().copied().collect()
    }
}

impl ModelStore for InMemoryModelStore {
    fn insert(&mut self, id: ModelId, blob: &[u8]) -> Result<bool> {
        if self.models.contains_key(&id) {
            return Ok(false);
        }
        self.models.insert(id, blob.to_vec());
        Ok(true)
    }

    fn remove(&mut self, id: &ModelId) -> Result<bool> {
        Ok(self.models.remove(id).is_some())
    }

    fn get(&self, id: &ModelId) -> Result<Option<Vec<u8>>> {
        Ok(self.models.get(id).cloned())
    }

    fn replace(&mut self, id: &ModelId, blob: &[u8]) -> Result<bool> {
        match self.models.get_mut(id) {
            Some(slot) => {
                *slot = blob.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn len(&self) -> Result<usize> {
        Ok(self.models.len())
    }
}
