//! Consolidation pipeline: signals in, tier transitions out.
//!
//! A single feed loop pulls signals from the source into a bounded queue; a
//! fixed pool of workers drains it. Each signal is processed under the user's
//! distributed lock with a hard timeout, and a failure on one signal never
//! takes down the pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::ai::Distiller;
use crate::config::MemoryConfig;
use crate::db_call;
use crate::distlock::{memory_process_key, DistLock};
use crate::error::StrataError;
use crate::heat::segment_heat;
use crate::index::RelevanceIndex;
use crate::store::{now_ms, Collection, NewKnowledge, Page, TierStore};
use crate::util::build_qa_pair;

/// A request to consolidate one user's memory. Coalescing-safe: processing is
/// idempotent, so duplicate signals for the same user are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySignal {
    pub user_id: i64,
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Next signal, or `None` once the source is closed for good.
    async fn next_signal(&self) -> Result<Option<MemorySignal>, StrataError>;
}

/// In-process source backed by a bounded channel; the API handlers hold the
/// sender side.
pub struct QueueSource {
    rx: Mutex<mpsc::Receiver<MemorySignal>>,
}

impl QueueSource {
    pub fn channel(capacity: usize) -> (mpsc::Sender<MemorySignal>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl SignalSource for QueueSource {
    async fn next_signal(&self) -> Result<Option<MemorySignal>, StrataError> {
        Ok(self.rx.lock().await.recv().await)
    }
}

pub struct Orchestrator {
    store: Arc<TierStore>,
    index: Arc<RelevanceIndex>,
    lock: DistLock,
    distiller: Arc<dyn Distiller>,
    cfg: MemoryConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<TierStore>,
        index: Arc<RelevanceIndex>,
        lock: DistLock,
        distiller: Arc<dyn Distiller>,
        cfg: MemoryConfig,
    ) -> Self {
        Self { store, index, lock, distiller, cfg }
    }

    /// Run until the source closes or shutdown flips. On shutdown the intake
    /// stops first; dropping the queue sender lets workers drain what is
    /// already queued before they exit.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn SignalSource>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (tx, rx) = mpsc::channel::<MemorySignal>(self.cfg.queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.cfg.workers);
        for worker_id in 0..self.cfg.workers {
            let orch = self.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                orch.worker_loop(worker_id, rx).await;
            }));
        }
        info!(workers = self.cfg.workers, queue = self.cfg.queue_depth, "consolidation started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested, closing intake");
                    break;
                }
                signal = source.next_signal() => match signal {
                    Ok(Some(s)) => {
                        if tx.send(s).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("signal source closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "signal source error, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        drop(tx);
        for handle in workers {
            let _ = handle.await;
        }
        info!("consolidation drained");
    }

    async fn worker_loop(&self, worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<MemorySignal>>>) {
        loop {
            // hold the receiver lock only while waiting, never while processing
            let signal = { rx.lock().await.recv().await };
            let Some(signal) = signal else {
                debug!(worker_id, "queue closed, worker exiting");
                return;
            };
            match tokio::time::timeout(self.cfg.job_timeout, self.process_signal(signal)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(worker_id, user_id = signal.user_id, error = %e, "consolidation failed")
                }
                Err(_) => {
                    warn!(worker_id, user_id = signal.user_id, "consolidation timed out")
                }
            }
        }
    }

    /// One consolidation cycle for one user, under that user's lock. If the
    /// lock cannot be acquired within the retry budget the signal is skipped;
    /// the next exchange will trigger another one.
    pub async fn process_signal(&self, signal: MemorySignal) -> Result<(), StrataError> {
        let key = memory_process_key(signal.user_id);
        let Some(guard) = self
            .lock
            .acquire_with_retry(&key, self.cfg.lock_ttl, &self.cfg.lock_retry)
            .await?
        else {
            warn!(user_id = signal.user_id, "lock busy, skipping signal");
            return Ok(());
        };

        let result = self.run_transitions(signal.user_id).await;
        self.lock.unlock(guard).await?;
        result
    }

    async fn run_transitions(&self, user_id: i64) -> Result<(), StrataError> {
        self.transition_stm_to_mtm(user_id).await?;
        self.transition_mtm_to_ltm(user_id).await
    }

    /// Cluster hot-tier overflow into segments, oldest page first. A failure
    /// on one page leaves it hot for the next cycle and moves on.
    async fn transition_stm_to_mtm(&self, user_id: i64) -> Result<(), StrataError> {
        let count = {
            let store = self.store.clone();
            db_call(move || store.stm_count(user_id)).await?
        };
        if count as usize <= self.cfg.stm_capacity {
            return Ok(());
        }
        let overflow = {
            let store = self.store.clone();
            let capacity = self.cfg.stm_capacity;
            db_call(move || store.stm_overflow_pages(user_id, capacity)).await?
        };
        if overflow.is_empty() {
            return Ok(());
        }
        debug!(user_id, pages = overflow.len(), "hot tier over capacity");
        for page in overflow {
            let page_id = page.id;
            if let Err(e) = self.cluster_page(page).await {
                warn!(user_id, page_id, error = %e, "clustering failed, page stays hot");
            }
        }
        Ok(())
    }

    async fn cluster_page(&self, page: Page) -> Result<(), StrataError> {
        let user_id = page.user_id;
        let qa = build_qa_pair(&page.user_input, &page.agent_output);

        let correlation = self
            .index
            .most_relevant_segment(user_id, &qa, self.cfg.correlation_weights)
            .await?;
        let segment_id = match correlation {
            Some(c) if c.score >= self.cfg.correlation_threshold => {
                debug!(user_id, segment_id = c.segment_id, score = c.score, "joining segment");
                c.segment_id
            }
            _ => {
                let overview = self.distiller.segment_overview(std::slice::from_ref(&page)).await?;
                let segment = {
                    let store = self.store.clone();
                    let overview = overview.clone();
                    db_call(move || store.create_segment(user_id, &overview)).await?
                };
                self.index
                    .index_text(Collection::Segments, segment.id, user_id, &overview)
                    .await?;
                info!(user_id, segment_id = segment.id, "opened new segment");
                segment.id
            }
        };

        let moved = {
            let store = self.store.clone();
            let page_id = page.id;
            db_call(move || store.append_page_to_segment(page_id, segment_id)).await?
        };
        if !moved {
            // a replayed signal already clustered this page
            debug!(user_id, page_id = page.id, "page already left the hot tier");
            return Ok(());
        }

        {
            let store = self.store.clone();
            db_call(move || {
                store.adjust_stm_count(user_id, -1)?;
                store.invalidate_stm_cache(user_id)
            })
            .await?;
        }
        self.index
            .index_text(Collection::Pages, page.id, user_id, &qa)
            .await
    }

    /// Distill hot segments into long-term knowledge. The durable flip is one
    /// transaction; vector-index cleanup afterwards is best-effort.
    async fn transition_mtm_to_ltm(&self, user_id: i64) -> Result<(), StrataError> {
        let segments = {
            let store = self.store.clone();
            db_call(move || store.segments_for_user(user_id)).await?
        };
        if segments.is_empty() {
            return Ok(());
        }

        let now = now_ms();
        let mut records = Vec::new();
        let mut promoted_segments = Vec::new();
        let mut promoted_pages = Vec::new();

        for segment in segments {
            let pages = {
                let store = self.store.clone();
                let segment_id = segment.id;
                db_call(move || store.pages_in_segment(segment_id)).await?
            };
            let heat = segment_heat(&segment, pages.len(), now, &self.cfg.heat);
            if heat <= self.cfg.heat_threshold {
                continue;
            }
            debug!(user_id, segment_id = segment.id, heat, "segment hot enough to promote");

            // a failing distillation or redundancy check only costs this
            // segment its turn, not its siblings'
            let segment_id = segment.id;
            match self.evaluate_promotion(user_id, segment_id, &pages).await {
                Ok(Some(knowledge)) => {
                    records.push(knowledge);
                    promoted_segments.push(segment_id);
                    promoted_pages.extend(pages.iter().map(|p| p.id));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(user_id, segment_id, error = %e, "promotion evaluation failed")
                }
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        let archived = {
            let store = self.store.clone();
            let records = records.clone();
            let segment_ids = promoted_segments.clone();
            let page_ids = promoted_pages.clone();
            db_call(move || store.archive(&records, &segment_ids, &page_ids)).await?
        };
        info!(user_id, archived = archived.len(), "segments promoted to long-term memory");

        // vector mutations outside the transaction: an interruption here
        // leaves stale index entries, which later searches simply ignore
        for ltm in &archived {
            if let Err(e) = self
                .index
                .index_text(Collection::Knowledge, ltm.id, user_id, &ltm.content)
                .await
            {
                warn!(user_id, ltm_id = ltm.id, error = %e, "knowledge vector insert failed");
            }
        }
        if let Err(e) = self.index.remove(Collection::Segments, promoted_segments).await {
            warn!(user_id, error = %e, "segment vector cleanup failed");
        }
        if let Err(e) = self.index.remove(Collection::Pages, promoted_pages).await {
            warn!(user_id, error = %e, "page vector cleanup failed");
        }

        let store = self.store.clone();
        db_call(move || store.invalidate_knowledge_cache(user_id)).await
    }

    /// Distill a hot segment and decide whether its knowledge is new.
    /// `None` means the knowledge is already captured and the segment stays.
    async fn evaluate_promotion(
        &self,
        user_id: i64,
        segment_id: i64,
        pages: &[Page],
    ) -> Result<Option<NewKnowledge>, StrataError> {
        let knowledge = self.distiller.knowledge_extraction(pages).await?;
        let best = self
            .index
            .best_knowledge_score(user_id, &knowledge, self.cfg.correlation_weights)
            .await?;
        if let Some(score) = best {
            if score >= self.cfg.redundancy_threshold {
                info!(user_id, segment_id, score, "knowledge redundant, keeping segment");
                return Ok(None);
            }
        }
        Ok(Some(NewKnowledge { user_id, content: knowledge }))
    }
}
