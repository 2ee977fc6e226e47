//! SQLite persistence for chunks and their vectors

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection};

use super::error::SearchResult;
use super::types::{Chunk, ChunkOwner};
use crate::DocumentKind;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        parent_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        content TEXT NOT NULL,
        char_count INTEGER NOT NULL,
        location TEXT NOT NULL,
        parent TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks(kind, parent_id);

    CREATE TABLE IF NOT EXISTS embeddings (
        chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
        model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        vector BLOB NOT NULL
    );
";

const CHUNK_COLUMNS: &str =
    "id, kind, parent_id, ordinal, content, char_count, location, parent";

impl ToSql for DocumentKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DocumentKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        DocumentKind::parse(text).ok_or_else(|| FromSqlError::Other(format!("unknown kind {text}").into()))
    }
}

/// Durable chunk set, the source of truth the in-memory indexes are rebuilt from
#[derive(Clone)]
pub struct ChunkStore {
    conn: Arc<Mutex<Connection>>,
}

impl ChunkStore {
    pub fn open(path: &Path) -> SearchResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> SearchResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SearchResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Make `chunks` the complete chunk set of `owner`: stored chunks not in
    /// the new set are deleted, the rest upserted, and the vectors of
    /// `invalidated` ids dropped.
    pub fn replace_parent(
        &self,
        owner: &ChunkOwner,
        chunks: &[Chunk],
        invalidated: &[String],
    ) -> SearchResult<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let keep: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
                let existing = query_ids(
                    &tx,
                    "SELECT id FROM chunks WHERE kind = ?1 AND parent_id = ?2",
                    params![owner.kind, owner.parent_id],
                )?;
                for id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
                    tx.execute("DELETE FROM chunks WHERE id = ?1", params![id])?;
                }

                let mut upsert = tx.prepare(
                    "INSERT INTO chunks (id, kind, parent_id, ordinal, content, char_count, location, parent)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        kind = excluded.kind,
                        parent_id = excluded.parent_id,
                        ordinal = excluded.ordinal,
                        content = excluded.content,
                        char_count = excluded.char_count,
                        location = excluded.location,
                        parent = excluded.parent",
                )?;
                for chunk in chunks {
                    upsert.execute(params![
                        chunk.id,
                        chunk.kind,
                        chunk.parent_id,
                        chunk.ordinal as i64,
                        chunk.content,
                        chunk.char_count as i64,
                        serde_json::to_string(&chunk.location)?,
                        serde_json::to_string(&chunk.parent)?,
                    ])?;
                }

                for id in invalidated {
                    tx.execute("DELETE FROM embeddings WHERE chunk_id = ?1", params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Delete every chunk of one parent. Returns the deleted ids.
    pub fn delete_parent(&self, owner: &ChunkOwner) -> SearchResult<Vec<String>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ids = query_ids(
                &tx,
                "SELECT id FROM chunks WHERE kind = ?1 AND parent_id = ?2",
                params![owner.kind, owner.parent_id],
            )?;
            tx.execute(
                "DELETE FROM chunks WHERE kind = ?1 AND parent_id = ?2",
                params![owner.kind, owner.parent_id],
            )?;
            tx.commit()?;
            Ok(ids)
        })
    }

    /// Delete every chunk of a kind. Returns the deleted ids.
    pub fn delete_kind(&self, kind: DocumentKind) -> SearchResult<Vec<String>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ids = query_ids(&tx, "SELECT id FROM chunks WHERE kind = ?1", params![kind])?;
            tx.execute("DELETE FROM chunks WHERE kind = ?1", params![kind])?;
            tx.commit()?;
            Ok(ids)
        })
    }

    pub fn chunks_for_parent(&self, owner: &ChunkOwner) -> SearchResult<Vec<Chunk>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE kind = ?1 AND parent_id = ?2 ORDER BY ordinal, id"
            ))?;
            let chunks = stmt
                .query_map(params![owner.kind, owner.parent_id], row_to_chunk)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(chunks)
        })
    }

    pub fn all_chunks(&self) -> SearchResult<Vec<Chunk>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks ORDER BY kind, parent_id, ordinal, id"
            ))?;
            let chunks = stmt
                .query_map([], row_to_chunk)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(chunks)
        })
    }

    pub fn chunk_ids(&self) -> SearchResult<Vec<String>> {
        self.with_conn(|conn| query_ids(conn, "SELECT id FROM chunks ORDER BY id", []))
    }

    /// Fetch chunks by id; ids with no stored chunk are absent from the map
    pub fn get_many(&self, ids: &[String]) -> SearchResult<HashMap<String, Chunk>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"))?;
            let mut found = HashMap::with_capacity(ids.len());
            for id in ids {
                let mut rows = stmt.query_map(params![id], row_to_chunk)?;
                if let Some(chunk) = rows.next().transpose()? {
                    found.insert(chunk.id.clone(), chunk);
                }
            }
            Ok(found)
        })
    }

    pub fn count(&self) -> SearchResult<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Persist a vector. Returns false when the chunk no longer exists.
    pub fn put_embedding(&self, chunk_id: &str, model: &str, vector: &[f32]) -> SearchResult<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "INSERT OR REPLACE INTO embeddings (chunk_id, model, dims, vector)
                 SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM chunks WHERE id = ?1)",
                params![chunk_id, model, vector.len() as i64, encode_vector(vector)],
            )?;
            Ok(affected > 0)
        })
    }

    /// Vectors produced by the model with this fingerprint
    pub fn load_embeddings(&self, model: &str) -> SearchResult<Vec<(String, Vec<f32>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_id, vector FROM embeddings WHERE model = ?1 ORDER BY chunk_id",
            )?;
            let rows = stmt
                .query_map(params![model], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .map(|(id, blob)| (id, decode_vector(&blob)))
                .collect())
        })
    }

    /// Drop every stored vector. Returns how many were removed.
    pub fn clear_embeddings(&self) -> SearchResult<usize> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM embeddings", [])?))
    }

    pub fn embedding_count(&self) -> SearchResult<usize> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    fn with_conn<F, T>(&self, action: F) -> SearchResult<T>
    where
        F: FnOnce(&Connection) -> SearchResult<T>,
    {
        let conn = self.conn.lock();
        action(&conn)
    }
}

fn query_ids<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> SearchResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        kind: row.get(1)?,
        parent_id: row.get(2)?,
        ordinal: row.get::<_, i64>(3)? as usize,
        content: row.get(4)?,
        char_count: row.get::<_, i64>(5)? as usize,
        location: json_column(row, 6)?,
        parent: json_column(row, 7)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(index)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
