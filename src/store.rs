//! SQLite-backed tier storage: durable rows, the hot-tier counter, the kv
//! cache with TTL, and the vector collections with their FTS5 mirrors.
//!
//! The kv table doubles as the lock backend: its conditional single-statement
//! INSERT/UPDATE/DELETE give set-if-absent, compare-and-extend and
//! compare-and-delete atomicity across every process sharing the database.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StrataError;
use crate::index::{bytes_to_embedding, embedding_to_bytes};

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

/// Lifecycle of a page. Transitions are strictly forward
/// (in_stm → in_mtm → in_ltm); the guarded UPDATEs below make a backward
/// move unrepresentable at the storage layer too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    InStm,
    InMtm,
    InLtm,
}

impl PageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PageStatus::InStm => "in_stm",
            PageStatus::InMtm => "in_mtm",
            PageStatus::InLtm => "in_ltm",
        }
    }

    fn parse(s: &str) -> Result<Self, StrataError> {
        match s {
            "in_stm" => Ok(PageStatus::InStm),
            "in_mtm" => Ok(PageStatus::InMtm),
            "in_ltm" => Ok(PageStatus::InLtm),
            other => Err(StrataError::Internal(format!("unknown page status '{other}'"))),
        }
    }
}

/// One user-input/agent-output exchange, the atomic unit moved between tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub user_id: i64,
    pub segment_id: Option<i64>,
    pub user_input: String,
    pub agent_output: String,
    pub status: PageStatus,
    pub created_at: i64,
}

/// A warm-tier cluster of correlated pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub user_id: i64,
    pub overview: String,
    pub visit: i64,
    pub last_visit: i64,
}

/// A distilled knowledge string. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermMemory {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
}

/// Knowledge pending archive; gets its row id inside the archive transaction.
#[derive(Debug, Clone)]
pub struct NewKnowledge {
    pub user_id: i64,
    pub content: String,
}

/// Best-matching segment for a piece of text (ephemeral, never persisted).
#[derive(Debug, Clone, Copy)]
pub struct Correlation {
    pub segment_id: i64,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct TierStats {
    pub stm_pages: i64,
    pub mtm_pages: i64,
    pub ltm_pages: i64,
    pub segments: i64,
    pub knowledge: i64,
}

/// The three vector collections and their FTS5 mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Segments,
    Pages,
    Knowledge,
}

impl Collection {
    fn table(self) -> &'static str {
        match self {
            Collection::Segments => "segment_vectors",
            Collection::Pages => "page_vectors",
            Collection::Knowledge => "knowledge_vectors",
        }
    }

    fn fts_table(self) -> &'static str {
        match self {
            Collection::Segments => "segment_fts",
            Collection::Pages => "page_fts",
            Collection::Knowledge => "knowledge_fts",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            Collection::Segments => "segment_id",
            Collection::Pages => "page_id",
            Collection::Knowledge => "ltm_id",
        }
    }
}

/// A stored vector with its source text, as loaded for dense scoring.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub ref_id: i64,
    pub content: String,
    pub embedding: Vec<f32>,
}

// FTS5 unicode61 splits on word boundaries, which butchers CJK text since
// there are no spaces. Appending character bigrams gives usable index terms.
pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}'
    )
}

fn append_cjk_bigrams(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut bigrams = Vec::new();
    for w in chars.windows(2) {
        if is_cjk(w[0]) && is_cjk(w[1]) {
            bigrams.push(format!("{}{}", w[0], w[1]));
        }
    }
    if bigrams.is_empty() {
        text.to_string()
    } else {
        format!("{} {}", text, bigrams.join(" "))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    segment_id INTEGER,
    user_input TEXT NOT NULL,
    agent_output TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'in_stm'
        CHECK (status IN ('in_stm','in_mtm','in_ltm')),
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pages_user_status ON pages(user_id, status);
CREATE INDEX IF NOT EXISTS idx_pages_segment ON pages(segment_id);

CREATE TABLE IF NOT EXISTS segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    overview TEXT NOT NULL,
    visit INTEGER NOT NULL DEFAULT 0,
    last_visit INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_segments_user ON segments(user_id);

CREATE TABLE IF NOT EXISTS long_term_memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    content TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ltm_user ON long_term_memories(user_id);

CREATE TABLE IF NOT EXISTS stm_counts (
    user_id INTEGER PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS segment_vectors (
    segment_id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_segvec_user ON segment_vectors(user_id);

CREATE TABLE IF NOT EXISTS page_vectors (
    page_id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pagevec_user ON page_vectors(user_id);

CREATE TABLE IF NOT EXISTS knowledge_vectors (
    ltm_id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_knowvec_user ON knowledge_vectors(user_id);
"#;

// Mirrors are managed manually so CJK text can be bigram-preprocessed
// before indexing.
const FTS_SCHEMA: [&str; 3] = [
    "CREATE VIRTUAL TABLE IF NOT EXISTS segment_fts USING fts5(\
     ref_id UNINDEXED, user_id UNINDEXED, content, tokenize='unicode61')",
    "CREATE VIRTUAL TABLE IF NOT EXISTS page_fts USING fts5(\
     ref_id UNINDEXED, user_id UNINDEXED, content, tokenize='unicode61')",
    "CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts USING fts5(\
     ref_id UNINDEXED, user_id UNINDEXED, content, tokenize='unicode61')",
];

pub struct TierStore {
    pool: Pool<SqliteConnectionManager>,
}

impl TierStore {
    fn conn(&self) -> PooledConn {
        self.pool.get().expect("db pool exhausted")
    }

    /// Open (or create) the database. Pool defaults to 8 connections
    /// (1 writer + readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, StrataError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each open gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| StrataError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| StrataError::Internal(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;
        for t in &FTS_SCHEMA {
            conn.execute(t, [])?;
        }
        drop(conn);
        Ok(Self { pool })
    }

    // ---- pages ----

    pub fn create_page(
        &self,
        user_id: i64,
        user_input: &str,
        agent_output: &str,
    ) -> Result<Page, StrataError> {
        let now = now_ms();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pages (user_id, user_input, agent_output, status, created_at) \
             VALUES (?1, ?2, ?3, 'in_stm', ?4)",
            params![user_id, user_input, agent_output, now],
        )?;
        Ok(Page {
            id: conn.last_insert_rowid(),
            user_id,
            segment_id: None,
            user_input: user_input.to_string(),
            agent_output: agent_output.to_string(),
            status: PageStatus::InStm,
            created_at: now,
        })
    }

    /// All of a user's hot-tier pages, oldest first.
    pub fn stm_pages(&self, user_id: i64) -> Result<Vec<Page>, StrataError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, segment_id, user_input, agent_output, status, created_at \
             FROM pages WHERE user_id = ?1 AND status = 'in_stm' \
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], row_to_page)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Hot-tier pages beyond capacity, oldest first (FIFO eviction order).
    pub fn stm_overflow_pages(
        &self,
        user_id: i64,
        capacity: usize,
    ) -> Result<Vec<Page>, StrataError> {
        let mut pages = self.stm_pages(user_id)?;
        if pages.len() <= capacity {
            return Ok(Vec::new());
        }
        pages.truncate(pages.len() - capacity);
        Ok(pages)
    }

    pub fn pages_by_ids(&self, ids: &[i64]) -> Result<Vec<Page>, StrataError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, user_id, segment_id, user_input, agent_output, status, created_at \
             FROM pages WHERE id IN ({placeholders})"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), row_to_page)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Move a hot page into a segment. The status guard makes this a no-op
    /// for pages that were already clustered (duplicate signal replay).
    pub fn append_page_to_segment(
        &self,
        page_id: i64,
        segment_id: i64,
    ) -> Result<bool, StrataError> {
        let n = self.conn().execute(
            "UPDATE pages SET segment_id = ?1, status = 'in_mtm' \
             WHERE id = ?2 AND status = 'in_stm'",
            params![segment_id, page_id],
        )?;
        Ok(n > 0)
    }

    pub fn pages_in_segment(&self, segment_id: i64) -> Result<Vec<Page>, StrataError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, segment_id, user_input, agent_output, status, created_at \
             FROM pages WHERE segment_id = ?1 AND status = 'in_mtm' \
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![segment_id], row_to_page)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- segments ----

    pub fn create_segment(&self, user_id: i64, overview: &str) -> Result<Segment, StrataError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO segments (user_id, overview, visit, last_visit) VALUES (?1, ?2, 0, 0)",
            params![user_id, overview],
        )?;
        Ok(Segment {
            id: conn.last_insert_rowid(),
            user_id,
            overview: overview.to_string(),
            visit: 0,
            last_visit: 0,
        })
    }

    pub fn segments_for_user(&self, user_id: i64) -> Result<Vec<Segment>, StrataError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, overview, visit, last_visit FROM segments WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id], row_to_segment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn segment_count(&self, user_id: i64) -> Result<i64, StrataError> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM segments WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Reading a segment warms it: visit only increases, last_visit only advances.
    pub fn bump_segment_visit(&self, segment_id: i64) -> Result<(), StrataError> {
        self.conn().execute(
            "UPDATE segments SET visit = visit + 1, last_visit = ?1 WHERE id = ?2",
            params![now_ms(), segment_id],
        )?;
        Ok(())
    }

    // ---- cold tier ----

    pub fn knowledge_for_user(&self, user_id: i64) -> Result<Vec<LongTermMemory>, StrataError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, content FROM long_term_memories WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id], |r| {
                Ok(LongTermMemory { id: r.get(0)?, user_id: r.get(1)?, content: r.get(2)? })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The archiving transaction: insert knowledge rows, advance page statuses,
    /// delete promoted segments, all or nothing. Vector-index mutations happen
    /// outside this transaction (best-effort, see orchestrate.rs).
    pub fn archive(
        &self,
        records: &[NewKnowledge],
        segment_ids: &[i64],
        page_ids: &[i64],
    ) -> Result<Vec<LongTermMemory>, StrataError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut archived = Vec::with_capacity(records.len());
        for r in records {
            tx.execute(
                "INSERT INTO long_term_memories (user_id, content) VALUES (?1, ?2)",
                params![r.user_id, r.content],
            )?;
            archived.push(LongTermMemory {
                id: tx.last_insert_rowid(),
                user_id: r.user_id,
                content: r.content.clone(),
            });
        }
        if !page_ids.is_empty() {
            let placeholders = vec!["?"; page_ids.len()].join(",");
            tx.execute(
                &format!(
                    "UPDATE pages SET status = 'in_ltm' \
                     WHERE id IN ({placeholders}) AND status = 'in_mtm'"
                ),
                params_from_iter(page_ids.iter()),
            )?;
        }
        if !segment_ids.is_empty() {
            let placeholders = vec!["?"; segment_ids.len()].join(",");
            tx.execute(
                &format!("DELETE FROM segments WHERE id IN ({placeholders})"),
                params_from_iter(segment_ids.iter()),
            )?;
        }
        tx.commit()?;
        Ok(archived)
    }

    // ---- hot-tier counter ----

    /// Current hot-tier count. A missing entry is recounted from the pages
    /// table and seeded, which is also how drift gets corrected.
    pub fn stm_count(&self, user_id: i64) -> Result<i64, StrataError> {
        let conn = self.conn();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT count FROM stm_counts WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .ok();
        if let Some(n) = existing {
            return Ok(n);
        }
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pages WHERE user_id = ?1 AND status = 'in_stm'",
            params![user_id],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO stm_counts (user_id, count) VALUES (?1, ?2)",
            params![user_id, n],
        )?;
        Ok(n)
    }

    /// Atomic counter adjustment, clamped at zero. Callers adjust after the
    /// page mutation commits, so when no counter row exists yet a fresh
    /// recount is already the right value and the delta is not applied twice.
    pub fn adjust_stm_count(&self, user_id: i64, delta: i64) -> Result<i64, StrataError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE stm_counts SET count = MAX(0, count + ?2) WHERE user_id = ?1",
            params![user_id, delta],
        )?;
        if updated == 0 {
            drop(conn);
            return self.stm_count(user_id);
        }
        let n = conn.query_row(
            "SELECT count FROM stm_counts WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // ---- kv cache + lock primitives ----

    /// Set only if the key is absent or expired. Returns whether this caller
    /// now owns the value: the SetNX of the lock protocol.
    pub fn kv_set_nx(&self, key: &str, value: &str, ttl_ms: i64) -> Result<bool, StrataError> {
        let now = now_ms();
        let n = self.conn().execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 expires_at = excluded.expires_at \
             WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?4",
            params![key, value, now + ttl_ms, now],
        )?;
        Ok(n > 0)
    }

    pub fn kv_put(&self, key: &str, value: &str, ttl_ms: i64) -> Result<(), StrataError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_ms() + ttl_ms],
        )?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, StrataError> {
        let v = self
            .conn()
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 \
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_ms()],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(v)
    }

    pub fn kv_delete(&self, key: &str) -> Result<(), StrataError> {
        self.conn().execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Delete only if the stored value still matches, so a holder can never
    /// release a lock it has already lost.
    pub fn kv_compare_delete(&self, key: &str, value: &str) -> Result<bool, StrataError> {
        let n = self.conn().execute(
            "DELETE FROM kv WHERE key = ?1 AND value = ?2",
            params![key, value],
        )?;
        Ok(n > 0)
    }

    /// Extend the TTL only if the stored value still matches and the entry is
    /// still live: the lease-renewal step of the lock protocol.
    pub fn kv_compare_extend(
        &self,
        key: &str,
        value: &str,
        ttl_ms: i64,
    ) -> Result<bool, StrataError> {
        let now = now_ms();
        let n = self.conn().execute(
            "UPDATE kv SET expires_at = ?1 \
             WHERE key = ?2 AND value = ?3 AND (expires_at IS NULL OR expires_at > ?4)",
            params![now + ttl_ms, key, value, now],
        )?;
        Ok(n > 0)
    }

    // ---- cache-aside ----

    pub fn cached_stm_pages(&self, user_id: i64) -> Result<Option<Vec<Page>>, StrataError> {
        self.cached_json(&stm_cache_key(user_id))
    }

    pub fn cache_stm_pages(
        &self,
        user_id: i64,
        pages: &[Page],
        ttl_ms: i64,
    ) -> Result<(), StrataError> {
        let payload = serde_json::to_string(pages)
            .map_err(|e| StrataError::Internal(format!("encode stm cache: {e}")))?;
        self.kv_put(&stm_cache_key(user_id), &payload, ttl_ms)
    }

    pub fn invalidate_stm_cache(&self, user_id: i64) -> Result<(), StrataError> {
        self.kv_delete(&stm_cache_key(user_id))
    }

    pub fn cached_knowledge(
        &self,
        user_id: i64,
    ) -> Result<Option<Vec<LongTermMemory>>, StrataError> {
        self.cached_json(&ltm_cache_key(user_id))
    }

    pub fn cache_knowledge(
        &self,
        user_id: i64,
        records: &[LongTermMemory],
        ttl_ms: i64,
    ) -> Result<(), StrataError> {
        let payload = serde_json::to_string(records)
            .map_err(|e| StrataError::Internal(format!("encode ltm cache: {e}")))?;
        self.kv_put(&ltm_cache_key(user_id), &payload, ttl_ms)
    }

    pub fn invalidate_knowledge_cache(&self, user_id: i64) -> Result<(), StrataError> {
        self.kv_delete(&ltm_cache_key(user_id))
    }

    /// An unparseable cached payload is dropped and treated as a miss;
    /// the durable store stays the source of truth.
    fn cached_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StrataError> {
        let Some(raw) = self.kv_get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(key, error = %e, "corrupt cache entry, discarding");
                self.kv_delete(key)?;
                Ok(None)
            }
        }
    }

    // ---- vector collections ----

    pub fn vector_insert(
        &self,
        coll: Collection,
        ref_id: i64,
        user_id: i64,
        content: &str,
        embedding: &[f32],
    ) -> Result<(), StrataError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}, user_id, content, embedding) \
                 VALUES (?1, ?2, ?3, ?4)",
                coll.table(),
                coll.key_column()
            ),
            params![ref_id, user_id, content, embedding_to_bytes(embedding)],
        )?;
        conn.execute(
            &format!("DELETE FROM {} WHERE ref_id = ?1", coll.fts_table()),
            params![ref_id.to_string()],
        )?;
        conn.execute(
            &format!(
                "INSERT INTO {} (ref_id, user_id, content) VALUES (?1, ?2, ?3)",
                coll.fts_table()
            ),
            params![ref_id.to_string(), user_id.to_string(), append_cjk_bigrams(content)],
        )?;
        Ok(())
    }

    pub fn vector_delete(&self, coll: Collection, ref_ids: &[i64]) -> Result<(), StrataError> {
        if ref_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ref_ids.len()].join(",");
        let conn = self.conn();
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} IN ({placeholders})",
                coll.table(),
                coll.key_column()
            ),
            params_from_iter(ref_ids.iter()),
        )?;
        let text_ids: Vec<String> = ref_ids.iter().map(|i| i.to_string()).collect();
        conn.execute(
            &format!("DELETE FROM {} WHERE ref_id IN ({placeholders})", coll.fts_table()),
            params_from_iter(text_ids.iter()),
        )?;
        Ok(())
    }

    /// Load vectors for brute-force cosine scoring, optionally filtered by
    /// user and/or an explicit id set.
    pub fn vector_rows(
        &self,
        coll: Collection,
        user_id: Option<i64>,
        ref_ids: Option<&[i64]>,
    ) -> Result<Vec<VectorRow>, StrataError> {
        let mut sql = format!(
            "SELECT {}, content, embedding FROM {} WHERE 1=1",
            coll.key_column(),
            coll.table()
        );
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(uid) = user_id {
            sql.push_str(" AND user_id = ?");
            values.push(uid.into());
        }
        if let Some(ids) = ref_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(",");
            sql.push_str(&format!(" AND {} IN ({placeholders})", coll.key_column()));
            values.extend(ids.iter().map(|&i| rusqlite::types::Value::from(i)));
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |r| {
                let blob: Vec<u8> = r.get(2)?;
                Ok(VectorRow {
                    ref_id: r.get(0)?,
                    content: r.get(1)?,
                    embedding: bytes_to_embedding(&blob),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// BM25 keyword search over a collection's FTS mirror.
    /// Returns `(ref_id, score)` with higher = better.
    pub fn fts_search(
        &self,
        coll: Collection,
        query: &str,
        user_id: Option<i64>,
        ref_ids: Option<&[i64]>,
        limit: usize,
    ) -> Result<Vec<(i64, f64)>, StrataError> {
        let sanitized: String = query
            .chars()
            .map(|c| if c.is_alphanumeric() || is_cjk(c) { c } else { ' ' })
            .collect();
        let sanitized = sanitized.trim().to_string();
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let processed = append_cjk_bigrams(&sanitized);
        let fts_query = processed.split_whitespace().collect::<Vec<_>>().join(" OR ");

        let mut sql = format!(
            "SELECT ref_id, rank FROM {} WHERE {} MATCH ?",
            coll.fts_table(),
            coll.fts_table()
        );
        let mut values: Vec<rusqlite::types::Value> = vec![fts_query.into()];
        if let Some(uid) = user_id {
            sql.push_str(" AND user_id = ?");
            values.push(uid.to_string().into());
        }
        if let Some(ids) = ref_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(",");
            sql.push_str(&format!(" AND ref_id IN ({placeholders})"));
            values.extend(ids.iter().map(|i| rusqlite::types::Value::from(i.to_string())));
        }
        sql.push_str(" ORDER BY rank LIMIT ?");
        values.push((limit as i64).into());

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |r| {
                let id: String = r.get(0)?;
                let rank: f64 = r.get(1)?;
                Ok((id, rank))
            })?
            .filter_map(|r| r.ok())
            // FTS5 rank is negative-better; flip it so higher = better.
            .filter_map(|(id, rank)| id.parse::<i64>().ok().map(|id| (id, -rank)))
            .collect();
        Ok(rows)
    }

    // ---- stats ----

    pub fn stats(&self) -> Result<TierStats, StrataError> {
        let conn = self.conn();
        let count_status = |status: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(
                "SELECT COUNT(*) FROM pages WHERE status = ?1",
                params![status],
                |r| r.get(0),
            )
        };
        Ok(TierStats {
            stm_pages: count_status("in_stm")?,
            mtm_pages: count_status("in_mtm")?,
            ltm_pages: count_status("in_ltm")?,
            segments: conn.query_row("SELECT COUNT(*) FROM segments", [], |r| r.get(0))?,
            knowledge: conn
                .query_row("SELECT COUNT(*) FROM long_term_memories", [], |r| r.get(0))?,
        })
    }
}

fn stm_cache_key(user_id: i64) -> String {
    format!("stm_pages:{user_id}")
}

fn ltm_cache_key(user_id: i64) -> String {
    format!("ltm:{user_id}")
}

fn row_to_page(r: &rusqlite::Row) -> rusqlite::Result<Page> {
    let status: String = r.get(5)?;
    Ok(Page {
        id: r.get(0)?,
        user_id: r.get(1)?,
        segment_id: r.get(2)?,
        user_input: r.get(3)?,
        agent_output: r.get(4)?,
        status: PageStatus::parse(&status).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("bad status {status}").into(),
            )
        })?,
        created_at: r.get(6)?,
    })
}

fn row_to_segment(r: &rusqlite::Row) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: r.get(0)?,
        user_id: r.get(1)?,
        overview: r.get(2)?,
        visit: r.get(3)?,
        last_visit: r.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> TierStore {
        TierStore::open(":memory:").expect("in-memory store")
    }

    #[test]
    fn page_lifecycle_forward_only() {
        let s = test_store();
        let p = s.create_page(1, "hi", "hello").unwrap();
        assert_eq!(p.status, PageStatus::InStm);

        let seg = s.create_segment(1, "greetings").unwrap();
        assert!(s.append_page_to_segment(p.id, seg.id).unwrap());
        // second append is a no-op: the page already left the hot tier
        assert!(!s.append_page_to_segment(p.id, seg.id).unwrap());

        // archive flips in_mtm → in_ltm and deletes the segment
        let archived = s
            .archive(
                &[NewKnowledge { user_id: 1, content: "likes greetings".into() }],
                &[seg.id],
                &[p.id],
            )
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert!(s.segments_for_user(1).unwrap().is_empty());
        assert!(s.pages_in_segment(seg.id).unwrap().is_empty());

        // archiving again touches nothing: the status guard no longer matches
        let again = s.archive(&[], &[], &[p.id]).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn overflow_is_fifo() {
        let s = test_store();
        for i in 0..6 {
            let conn = s.conn();
            conn.execute(
                "INSERT INTO pages (user_id, user_input, agent_output, status, created_at) \
                 VALUES (42, ?1, 'out', 'in_stm', ?2)",
                params![format!("q{i}"), 1000 + i as i64],
            )
            .unwrap();
        }
        let overflow = s.stm_overflow_pages(42, 5).unwrap();
        assert_eq!(overflow.len(), 1);
        assert_eq!(overflow[0].user_input, "q0");
        assert!(s.stm_overflow_pages(42, 6).unwrap().is_empty());
    }

    #[test]
    fn counter_recounts_and_clamps() {
        let s = test_store();
        s.create_page(7, "a", "b").unwrap();
        s.create_page(7, "c", "d").unwrap();
        // no counter row yet → recount from pages
        assert_eq!(s.stm_count(7).unwrap(), 2);
        assert_eq!(s.adjust_stm_count(7, 1).unwrap(), 3);
        assert_eq!(s.adjust_stm_count(7, -5).unwrap(), 0);

        // adjusting before any count was tracked falls back to a recount
        s.create_page(8, "x", "y").unwrap();
        assert_eq!(s.adjust_stm_count(8, -1).unwrap(), 1);
    }

    #[test]
    fn kv_set_nx_respects_live_entries() {
        let s = test_store();
        assert!(s.kv_set_nx("lock:a", "tok1", 60_000).unwrap());
        assert!(!s.kv_set_nx("lock:a", "tok2", 60_000).unwrap());
        assert_eq!(s.kv_get("lock:a").unwrap().as_deref(), Some("tok1"));
    }

    #[test]
    fn kv_set_nx_takes_over_expired_entries() {
        let s = test_store();
        assert!(s.kv_set_nx("lock:b", "tok1", -1).unwrap());
        assert!(s.kv_get("lock:b").unwrap().is_none());
        assert!(s.kv_set_nx("lock:b", "tok2", 60_000).unwrap());
        assert_eq!(s.kv_get("lock:b").unwrap().as_deref(), Some("tok2"));
    }

    #[test]
    fn kv_compare_delete_needs_matching_token() {
        let s = test_store();
        s.kv_set_nx("lock:c", "mine", 60_000).unwrap();
        assert!(!s.kv_compare_delete("lock:c", "theirs").unwrap());
        assert!(s.kv_compare_delete("lock:c", "mine").unwrap());
        assert!(s.kv_get("lock:c").unwrap().is_none());
    }

    #[test]
    fn kv_compare_extend_only_while_owned() {
        let s = test_store();
        s.kv_set_nx("lock:d", "mine", 60_000).unwrap();
        assert!(s.kv_compare_extend("lock:d", "mine", 120_000).unwrap());
        assert!(!s.kv_compare_extend("lock:d", "theirs", 120_000).unwrap());
        s.kv_delete("lock:d").unwrap();
        assert!(!s.kv_compare_extend("lock:d", "mine", 120_000).unwrap());
    }

    #[test]
    fn corrupt_cache_entry_is_discarded() {
        let s = test_store();
        s.kv_put("stm_pages:9", "{not json", 60_000).unwrap();
        assert!(s.cached_stm_pages(9).unwrap().is_none());
        // the bad entry is gone, not retried forever
        assert!(s.kv_get("stm_pages:9").unwrap().is_none());
    }

    #[test]
    fn stm_cache_roundtrip() {
        let s = test_store();
        let p = s.create_page(3, "q", "a").unwrap();
        s.cache_stm_pages(3, &[p.clone()], 60_000).unwrap();
        let cached = s.cached_stm_pages(3).unwrap().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, p.id);
        s.invalidate_stm_cache(3).unwrap();
        assert!(s.cached_stm_pages(3).unwrap().is_none());
    }

    #[test]
    fn fts_search_filters_by_user() {
        let s = test_store();
        let emb = vec![0.1_f32; 8];
        s.vector_insert(Collection::Segments, 1, 10, "coffee brewing tips", &emb).unwrap();
        s.vector_insert(Collection::Segments, 2, 11, "coffee roasting notes", &emb).unwrap();

        let hits = s.fts_search(Collection::Segments, "coffee", Some(10), None, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn vector_rows_filter_by_id_set() {
        let s = test_store();
        for id in 1..=3 {
            s.vector_insert(Collection::Pages, id, 5, "text", &[1.0, 0.0]).unwrap();
        }
        let rows = s.vector_rows(Collection::Pages, Some(5), Some(&[1, 3])).unwrap();
        let mut ids: Vec<i64> = rows.iter().map(|r| r.ref_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);

        s.vector_delete(Collection::Pages, &[1, 3]).unwrap();
        assert_eq!(s.vector_rows(Collection::Pages, Some(5), None).unwrap().len(), 1);
    }
}
