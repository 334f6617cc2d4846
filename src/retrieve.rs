//! Read path: assemble hot, warm and cold memory for a query.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::db_call;
use crate::error::StrataError;
use crate::index::RelevanceIndex;
use crate::store::{Page, TierStore};

#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub user_input: String,
    pub agent_output: String,
}

impl From<Page> for Exchange {
    fn from(p: Page) -> Self {
        Self { user_input: p.user_input, agent_output: p.agent_output }
    }
}

/// What the companion gets back: recent exchanges, topically relevant older
/// exchanges, and distilled knowledge statements.
#[derive(Debug, Serialize)]
pub struct MemoryBundle {
    pub hot: Vec<Exchange>,
    pub warm: Vec<Exchange>,
    pub cold: Vec<String>,
}

pub struct Retriever {
    store: Arc<TierStore>,
    index: Arc<RelevanceIndex>,
    cfg: MemoryConfig,
}

impl Retriever {
    pub fn new(store: Arc<TierStore>, index: Arc<RelevanceIndex>, cfg: MemoryConfig) -> Self {
        Self { store, index, cfg }
    }

    /// Hot and warm failures abort the call; a cold-tier failure degrades to
    /// an empty knowledge list since recent context is the part conversation
    /// quality actually depends on.
    pub async fn retrieve_memory(
        &self,
        user_id: i64,
        query: &str,
    ) -> Result<MemoryBundle, StrataError> {
        let hot = self.hot_tier(user_id).await?;
        let warm = self.warm_tier(user_id, query).await?;
        let cold = match self.cold_tier(user_id).await {
            Ok(cold) => cold,
            Err(e) => {
                warn!(user_id, error = %e, "cold tier unavailable, answering without it");
                Vec::new()
            }
        };
        debug!(user_id, hot = hot.len(), warm = warm.len(), cold = cold.len(), "memory assembled");
        Ok(MemoryBundle { hot, warm, cold })
    }

    /// Cache-aside over the user's hot pages, oldest first.
    async fn hot_tier(&self, user_id: i64) -> Result<Vec<Exchange>, StrataError> {
        let store = self.store.clone();
        let ttl = self.cfg.stm_cache_ttl.as_millis() as i64;
        let pages = db_call(move || {
            if let Some(pages) = store.cached_stm_pages(user_id)? {
                return Ok(pages);
            }
            let pages = store.stm_pages(user_id)?;
            store.cache_stm_pages(user_id, &pages, ttl)?;
            Ok(pages)
        })
        .await?;
        Ok(pages.into_iter().map(Exchange::from).collect())
    }

    /// Best-matching segment, then its top-k pages ranked against the query.
    /// Reading a segment bumps its visit stats (best-effort).
    async fn warm_tier(&self, user_id: i64, query: &str) -> Result<Vec<Exchange>, StrataError> {
        let Some(correlation) = self
            .index
            .most_relevant_segment(user_id, query, self.cfg.answer_weights)
            .await?
        else {
            return Ok(Vec::new());
        };
        let segment_id = correlation.segment_id;

        let pages = {
            let store = self.store.clone();
            db_call(move || store.pages_in_segment(segment_id)).await?
        };
        if pages.is_empty() {
            return Ok(Vec::new());
        }

        let page_ids: Vec<i64> = pages.iter().map(|p| p.id).collect();
        let ranked = self
            .index
            .top_k_pages(page_ids, query, self.cfg.page_top_k, self.cfg.answer_weights)
            .await?;

        {
            let store = self.store.clone();
            if let Err(e) = db_call(move || store.bump_segment_visit(segment_id)).await {
                warn!(user_id, segment_id, error = %e, "visit bump failed");
            }
        }

        let mut by_id: HashMap<i64, Page> = pages.into_iter().map(|p| (p.id, p)).collect();
        Ok(ranked
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .map(Exchange::from)
            .collect())
    }

    /// Cache-aside over the user's distilled knowledge.
    async fn cold_tier(&self, user_id: i64) -> Result<Vec<String>, StrataError> {
        let store = self.store.clone();
        let ttl = self.cfg.ltm_cache_ttl.as_millis() as i64;
        let records = db_call(move || {
            if let Some(records) = store.cached_knowledge(user_id)? {
                return Ok(records);
            }
            let records = store.knowledge_for_user(user_id)?;
            store.cache_knowledge(user_id, &records, ttl)?;
            Ok(records)
        })
        .await?;
        Ok(records.into_iter().map(|r| r.content).collect())
    }
}
