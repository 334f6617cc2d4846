//! Read-path behavior: cache-aside on hot and cold tiers, warm-tier ranking
//! and visit accounting, graceful cold-tier degradation.

use std::sync::Arc;

use strata::config::MemoryConfig;
use strata::index::{LocalHashEmbedder, RelevanceIndex};
use strata::retrieve::Retriever;
use strata::store::{Collection, NewKnowledge, TierStore};
use strata::util::build_qa_pair;

fn harness(cfg: MemoryConfig) -> (Arc<TierStore>, Arc<RelevanceIndex>, Retriever) {
    let store = Arc::new(TierStore::open(":memory:").expect("store"));
    let index = Arc::new(RelevanceIndex::new(
        store.clone(),
        Arc::new(LocalHashEmbedder::default()),
        64,
    ));
    let retriever = Retriever::new(store.clone(), index.clone(), cfg);
    (store, index, retriever)
}

/// Build a warm segment the way consolidation would: segment row + overview
/// vector, pages attached and indexed.
async fn seed_segment(
    store: &Arc<TierStore>,
    index: &RelevanceIndex,
    user_id: i64,
    overview: &str,
    exchanges: &[(&str, &str)],
) -> i64 {
    let segment = store.create_segment(user_id, overview).unwrap();
    index
        .index_text(Collection::Segments, segment.id, user_id, overview)
        .await
        .unwrap();
    for (q, a) in exchanges {
        let page = store.create_page(user_id, q, a).unwrap();
        store.append_page_to_segment(page.id, segment.id).unwrap();
        index
            .index_text(Collection::Pages, page.id, user_id, &build_qa_pair(q, a))
            .await
            .unwrap();
    }
    segment.id
}

#[tokio::test]
async fn empty_user_gets_empty_bundle() {
    let (_store, _index, retriever) = harness(MemoryConfig::default());
    let bundle = retriever.retrieve_memory(1, "anything at all").await.unwrap();
    assert!(bundle.hot.is_empty());
    assert!(bundle.warm.is_empty());
    assert!(bundle.cold.is_empty());
}

#[tokio::test]
async fn hot_tier_returns_recent_exchanges_oldest_first() {
    let (store, _index, retriever) = harness(MemoryConfig::default());
    store.create_page(4, "first", "one").unwrap();
    store.create_page(4, "second", "two").unwrap();

    let bundle = retriever.retrieve_memory(4, "hi").await.unwrap();
    let inputs: Vec<&str> = bundle.hot.iter().map(|e| e.user_input.as_str()).collect();
    assert_eq!(inputs, vec!["first", "second"]);
}

#[tokio::test]
async fn hot_tier_is_served_from_cache_until_invalidated() {
    let (store, _index, retriever) = harness(MemoryConfig::default());
    store.create_page(4, "first", "one").unwrap();

    // first read populates the cache
    assert_eq!(retriever.retrieve_memory(4, "hi").await.unwrap().hot.len(), 1);

    // a write that skips invalidation is invisible through the cache
    store.create_page(4, "second", "two").unwrap();
    assert_eq!(retriever.retrieve_memory(4, "hi").await.unwrap().hot.len(), 1);

    store.invalidate_stm_cache(4).unwrap();
    assert_eq!(retriever.retrieve_memory(4, "hi").await.unwrap().hot.len(), 2);
}

#[tokio::test]
async fn warm_tier_ranks_pages_from_best_segment() {
    let mut cfg = MemoryConfig::default();
    cfg.page_top_k = 2;
    let (store, index, retriever) = harness(cfg);

    let coffee = seed_segment(
        &store,
        &index,
        5,
        "coffee brewing preferences",
        &[
            ("I bought a new coffee grinder", "what burr size"),
            ("my espresso tastes sour lately", "try a finer grind"),
            ("do you remember my favorite roast", "a light ethiopian roast"),
        ],
    )
    .await;
    seed_segment(
        &store,
        &index,
        5,
        "weekend hiking plans",
        &[("which trail should I hike", "the coastal one")],
    )
    .await;

    let bundle = retriever.retrieve_memory(5, "what coffee roast do I like").await.unwrap();
    assert_eq!(bundle.warm.len(), 2, "page_top_k caps the warm list");
    assert!(bundle.warm[0].user_input.contains("roast"));
    assert!(bundle.warm.iter().all(|e| !e.user_input.contains("trail")));

    // reading the segment warms it
    let segment = store
        .segments_for_user(5)
        .unwrap()
        .into_iter()
        .find(|s| s.id == coffee)
        .unwrap();
    assert_eq!(segment.visit, 1);
    assert!(segment.last_visit > 0);
}

#[tokio::test]
async fn cold_tier_returns_distilled_knowledge() {
    let (store, index, retriever) = harness(MemoryConfig::default());
    let archived = store
        .archive(
            &[NewKnowledge { user_id: 6, content: "prefers tea over coffee".into() }],
            &[],
            &[],
        )
        .unwrap();
    index
        .index_text(Collection::Knowledge, archived[0].id, 6, &archived[0].content)
        .await
        .unwrap();

    let bundle = retriever.retrieve_memory(6, "beverages").await.unwrap();
    assert_eq!(bundle.cold, vec!["prefers tea over coffee".to_string()]);
}

#[tokio::test]
async fn corrupt_cold_cache_falls_back_to_durable_rows() {
    let (store, _index, retriever) = harness(MemoryConfig::default());
    store
        .archive(&[NewKnowledge { user_id: 6, content: "plays the violin".into() }], &[], &[])
        .unwrap();
    store.kv_put("ltm:6", "{definitely not json", 60_000).unwrap();

    let bundle = retriever.retrieve_memory(6, "hobbies").await.unwrap();
    assert_eq!(bundle.cold, vec!["plays the violin".to_string()]);
}
