//! Chunk storage and lookup.
//!
//! The pipeline consumes the [`ChunkStore`] trait: dense (vector) and
//! sparse (lexical) candidate lookup, chunk fetch by id, and an index
//! rebuild hook invoked by document management. [`SqliteStore`] is the
//! shipped implementation — FTS5 for sparse search, little-endian f32
//! BLOBs scored with cosine similarity for dense search.
//!
//! # Consistency
//!
//! `rebuild_index` takes a write lock while every lookup takes a read
//! lock, so an in-flight query sees either the pre-rebuild or the
//! post-rebuild index, never a partially rebuilt one.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use crate::chunk::{self, content_hash};
use crate::config::EmbeddingConfig;
use crate::embedding;
use crate::models::Chunk;

/// A candidate returned by one retrieval channel: chunk id plus the
/// channel's raw (unnormalized) score, ranked best-first.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk_id: String,
    pub score: f64,
}

/// Dense + sparse lookup over stored chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Vector similarity lookup, top `k`. An empty result is not an error
    /// (empty store, or embeddings disabled).
    async fn dense_search(&self, query: &str, k: usize) -> Result<Vec<RankedChunk>>;

    /// Lexical lookup, top `k`.
    async fn sparse_search(&self, query: &str, k: usize) -> Result<Vec<RankedChunk>>;

    /// Fetch a chunk by id.
    async fn get(&self, id: &str) -> Result<Option<Chunk>>;

    /// Rebuild derived indexes after document mutation. Serialized against
    /// in-flight lookups.
    async fn rebuild_index(&self) -> Result<()>;
}

// ============ SQLite implementation ============

/// SQLite-backed chunk store (FTS5 + embedding BLOBs).
pub struct SqliteStore {
    pool: SqlitePool,
    embedding: EmbeddingConfig,
    index_lock: RwLock<()>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, embedding: EmbeddingConfig) -> Self {
        Self {
            pool,
            embedding,
            index_lock: RwLock::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a document, chunk it, embed chunks if enabled, and index.
    /// Returns `(document_id, chunk_count)`.
    pub async fn add_document(
        &self,
        title: &str,
        body: &str,
        max_chunk_tokens: usize,
    ) -> Result<(String, usize)> {
        let document_id = uuid::Uuid::new_v4().to_string();
        let chunks = chunk::chunk_text(&document_id, title, body, max_chunk_tokens);

        let embeddings = if self.embedding.is_enabled() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            Some(embedding::embed_texts(&self.embedding, &texts).await?)
        } else {
            None
        };

        let _guard = self.index_lock.write().await;

        sqlx::query(
            "INSERT INTO documents (id, title, body, content_hash, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&document_id)
        .bind(title)
        .bind(body)
        .bind(content_hash(body))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        for (i, c) in chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&c.id)
            .bind(&c.document_id)
            .bind(c.chunk_index)
            .bind(&c.text)
            .bind(content_hash(&c.text))
            .execute(&self.pool)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&c.id)
                .bind(&c.document_id)
                .bind(&c.text)
                .execute(&self.pool)
                .await?;

            if let Some(vectors) = &embeddings {
                let vec = &vectors[i];
                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, document_id, model, dims, embedding) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&c.id)
                .bind(&c.document_id)
                .bind(self.embedding.model.as_deref().unwrap_or_default())
                .bind(vec.len() as i64)
                .bind(embedding::vec_to_blob(vec))
                .execute(&self.pool)
                .await?;
            }
        }

        Ok((document_id, chunks.len()))
    }

    /// Delete a document and every derived row, then leave the index
    /// consistent. Past traces are not touched.
    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        let _guard = self.index_lock.write().await;

        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(anyhow!("document not found: {}", document_id));
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// List stored documents as `(id, title, chunk_count)`.
    pub async fn list_documents(&self) -> Result<Vec<(String, String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.title, COUNT(c.id) AS chunk_count
            FROM documents d
            LEFT JOIN chunks c ON c.document_id = d.id
            GROUP BY d.id
            ORDER BY d.created_at DESC, d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get("id"), r.get("title"), r.get("chunk_count")))
            .collect())
    }
}

/// Build an FTS5 MATCH expression from free-form question text.
/// Alphanumeric terms are quoted and OR-joined so punctuation in a
/// question can never produce a syntax error. Returns `None` when the
/// text has no searchable terms.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn dense_search(&self, query: &str, k: usize) -> Result<Vec<RankedChunk>> {
        if k == 0 || !self.embedding.is_enabled() {
            return Ok(Vec::new());
        }
        let query_vec = embedding::embed_query(&self.embedding, query).await?;

        let _guard = self.index_lock.read().await;
        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut ranked: Vec<RankedChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = embedding::blob_to_vec(&blob);
                RankedChunk {
                    chunk_id: row.get("chunk_id"),
                    score: embedding::cosine_similarity(&query_vec, &vec) as f64,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        ranked.truncate(k);
        Ok(ranked)
    }

    async fn sparse_search(&self, query: &str, k: usize) -> Result<Vec<RankedChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let Some(expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let _guard = self.index_lock.read().await;
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, rank FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(expr)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                RankedChunk {
                    chunk_id: row.get("chunk_id"),
                    // BM25 rank is lower-is-better; negate so higher = better
                    score: -rank,
                }
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.chunk_index, c.text, d.title
            FROM chunks c JOIN documents d ON d.id = c.document_id
            WHERE c.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Chunk {
            id: r.get("id"),
            document_id: r.get("document_id"),
            chunk_index: r.get("chunk_index"),
            title: r.get("title"),
            text: r.get("text"),
        }))
    }

    async fn rebuild_index(&self) -> Result<()> {
        let _guard = self.index_lock.write().await;

        sqlx::query("DELETE FROM chunks_fts")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO chunks_fts (chunk_id, document_id, text) SELECT id, document_id, text FROM chunks",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id NOT IN (SELECT id FROM chunks)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============ In-memory implementation ============

/// In-memory store with deterministic toy embeddings. Backs unit and
/// integration tests that need a dense channel without a live embedding
/// service.
pub struct MemoryStore {
    chunks: Vec<Chunk>,
}

impl MemoryStore {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    pub fn empty() -> Self {
        Self { chunks: Vec::new() }
    }

    /// Term-frequency hashing into a small fixed space: deterministic and
    /// cheap, good enough to make cosine ordering meaningful in tests.
    fn toy_embed(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 64];
        for term in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if term.is_empty() {
                continue;
            }
            let mut h: u64 = 1469598103934665603;
            for b in term.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            v[(h % 64) as usize] += 1.0;
        }
        v
    }

    fn term_overlap(query: &str, text: &str) -> f64 {
        let text_lower = text.to_lowercase();
        let hay: std::collections::HashSet<&str> = text_lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty() && hay.contains(t))
            .count() as f64
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn dense_search(&self, query: &str, k: usize) -> Result<Vec<RankedChunk>> {
        let qv = Self::toy_embed(query);
        let mut ranked: Vec<RankedChunk> = self
            .chunks
            .iter()
            .map(|c| RankedChunk {
                chunk_id: c.id.clone(),
                score: embedding::cosine_similarity(&qv, &Self::toy_embed(&c.text)) as f64,
            })
            .filter(|r| r.score > 0.0)
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        ranked.truncate(k);
        Ok(ranked)
    }

    async fn sparse_search(&self, query: &str, k: usize) -> Result<Vec<RankedChunk>> {
        let mut ranked: Vec<RankedChunk> = self
            .chunks
            .iter()
            .map(|c| RankedChunk {
                chunk_id: c.id.clone(),
                score: Self::term_overlap(query, &c.text),
            })
            .filter(|r| r.score > 0.0)
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        ranked.truncate(k);
        Ok(ranked)
    }

    async fn get(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.chunks.iter().find(|c| c.id == id).cloned())
    }

    async fn rebuild_index(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("rag.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (dir, SqliteStore::new(pool, EmbeddingConfig::default()))
    }

    #[test]
    fn test_fts_match_expr_strips_punctuation() {
        assert_eq!(
            fts_match_expr("What is RAG?").unwrap(),
            "\"What\" OR \"is\" OR \"RAG\""
        );
        assert!(fts_match_expr("?!,").is_none());
        assert!(fts_match_expr("").is_none());
    }

    #[tokio::test]
    async fn test_add_and_sparse_search() {
        let (_dir, store) = temp_store().await;
        store
            .add_document("Rust", "Rust has a borrow checker.\n\nCargo builds crates.", 200)
            .await
            .unwrap();
        store
            .add_document("Python", "Python uses significant whitespace.", 200)
            .await
            .unwrap();

        let hits = store.sparse_search("borrow checker", 10).await.unwrap();
        assert!(!hits.is_empty());
        let top = store.get(&hits[0].chunk_id).await.unwrap().unwrap();
        assert!(top.text.contains("borrow checker"));
        assert_eq!(top.title, "Rust");
    }

    #[tokio::test]
    async fn test_dense_search_empty_when_embeddings_disabled() {
        let (_dir, store) = temp_store().await;
        store.add_document("Doc", "Some body text.", 200).await.unwrap();
        let hits = store.dense_search("body", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_delete_document_removes_chunks_from_index() {
        let (_dir, store) = temp_store().await;
        let (doc_id, _) = store
            .add_document("Doc", "Unique zebra paragraph.", 200)
            .await
            .unwrap();
        assert!(!store.sparse_search("zebra", 5).await.unwrap().is_empty());

        store.delete_document(&doc_id).await.unwrap();
        assert!(store.sparse_search("zebra", 5).await.unwrap().is_empty());
        assert!(store.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_document_errors() {
        let (_dir, store) = temp_store().await;
        assert!(store.delete_document("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_rebuild_index_is_consistent() {
        let (_dir, store) = temp_store().await;
        store
            .add_document("Doc", "Indexed aardvark text.", 200)
            .await
            .unwrap();
        store.rebuild_index().await.unwrap();
        assert!(!store.sparse_search("aardvark", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_dense_prefers_matching_text() {
        let chunks = vec![
            Chunk {
                id: "c1".to_string(),
                document_id: "d1".to_string(),
                chunk_index: 0,
                title: "A".to_string(),
                text: "the solar panel inverter converts direct current".to_string(),
            },
            Chunk {
                id: "c2".to_string(),
                document_id: "d2".to_string(),
                chunk_index: 0,
                title: "B".to_string(),
                text: "medieval castles had thick stone walls".to_string(),
            },
        ];
        let store = MemoryStore::new(chunks);
        let hits = store.dense_search("solar inverter current", 2).await.unwrap();
        assert_eq!(hits[0].chunk_id, "c1");
    }
}
