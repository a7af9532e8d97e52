//! End-to-end scenarios against in-memory indexers
//!
//! Each test stands up a muxer over the mock connection factory and drives
//! the public API the way a real ingester would: write, flap connections,
//! negotiate tags late, fall back to the spool cache.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ingest_muxer::testutil::{eventually, test_entry, MemoryCache, MockFactory};
use ingest_muxer::{CacheConfig, Entry, Muxer, MuxerConfig, MuxerError};

const ADDR_A: &str = "tcp://indexer-a:4023";
const ADDR_B: &str = "tcp://indexer-b:4023";

fn config(addrs: &[&str]) -> MuxerConfig {
    MuxerConfig::uniform(addrs.iter().map(|s| s.to_string()).collect(), "secret")
        .unwrap()
        .with_tags(vec!["default".into()])
        .with_identity("scenario-ingester", "0.1.0", "7f000001-0000")
        .with_retry_interval(Duration::from_millis(100))
}

async fn start_hot(cfg: MuxerConfig, factory: Arc<MockFactory>) -> Muxer {
    let muxer = Muxer::new(cfg, factory, None).await.unwrap();
    muxer.start().unwrap();
    muxer
        .wait_for_hot(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    muxer
}

fn payloads(entries: &[Entry]) -> HashSet<Vec<u8>> {
    entries.iter().map(|e| e.data.to_vec()).collect()
}

// =============================================================================
// Scenario: happy path across two destinations
// =============================================================================

#[tokio::test]
async fn test_happy_path_two_destinations() {
    let factory = Arc::new(MockFactory::new());
    let muxer = start_hot(config(&[ADDR_A, ADDR_B]), factory.clone()).await;
    assert_eq!(muxer.hot().unwrap(), 2);

    for i in 0..1000 {
        muxer.write_entry(test_entry(0, i)).await.unwrap();
    }
    muxer.sync(Duration::from_secs(5)).await.unwrap();

    let f = factory.clone();
    assert!(
        eventually(
            || f.all_delivered().len() == 1000,
            Duration::from_secs(10)
        )
        .await,
        "delivered {} of 1000",
        factory.all_delivered().len()
    );

    // every entry landed at exactly one indexer
    assert_eq!(payloads(&factory.all_delivered()).len(), 1000);

    // the emergency queue never came into play
    let m = muxer.metrics();
    assert_eq!(m.emergency_pushes, 0);
    assert_eq!(m.emergency_overflows, 0);
    assert_eq!(m.entries_dropped, 0);

    muxer.close().await.unwrap();
}

// =============================================================================
// Scenario: one destination flaps under load
// =============================================================================

#[tokio::test]
async fn test_single_connection_flap() {
    let factory = Arc::new(MockFactory::new());
    let muxer = start_hot(config(&[ADDR_A, ADDR_B]), factory.clone()).await;
    assert_eq!(muxer.hot().unwrap(), 2);

    for i in 0..500 {
        muxer.write_entry(test_entry(0, i)).await.unwrap();
    }

    // kill A: its session starts failing and redials are refused
    factory.kill(ADDR_A);

    for i in 500..1000 {
        muxer.write_entry(test_entry(0, i)).await.unwrap();
    }

    // A's failure is noticed and the hot count drops to 1
    assert!(
        eventually(
            || muxer.hot().map(|h| h == 1).unwrap_or(false),
            Duration::from_secs(10)
        )
        .await,
        "hot never dropped to 1"
    );

    // counters stay balanced through the transition
    assert_eq!(
        muxer.hot().unwrap() + muxer.dead().unwrap(),
        muxer.size().unwrap()
    );

    // everything, including A's recycled in-flight entries, lands via B
    let f = factory.clone();
    assert!(
        eventually(
            || f.all_delivered().len() == 1000,
            Duration::from_secs(15)
        )
        .await,
        "delivered {} of 1000 after flap",
        factory.all_delivered().len()
    );
    assert_eq!(payloads(&factory.all_delivered()).len(), 1000);

    // bring A back; the reconnect loop restores the hot count
    factory.revive(ADDR_A);
    assert!(
        eventually(
            || muxer.hot().map(|h| h == 2).unwrap_or(false),
            Duration::from_secs(10)
        )
        .await,
        "hot never returned to 2"
    );
    assert!(factory.connect_count(ADDR_A) >= 2);

    muxer.close().await.unwrap();
}

// =============================================================================
// Scenario: every destination down, file-backed cache takes the stream
// =============================================================================

#[tokio::test]
async fn test_all_down_with_cache() {
    let factory = Arc::new(MockFactory::new());
    // destination is dead before the muxer ever starts
    factory.kill(ADDR_A);

    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&[ADDR_A]).with_cache(CacheConfig {
        file_backing_location: Some(dir.path().join("spool")),
        max_cache_size: 0,
    });
    let cache = Arc::new(MemoryCache::new());
    let muxer = Muxer::new(cfg, factory.clone(), Some(cache.clone()))
        .await
        .unwrap();
    muxer.start().unwrap();

    // no connection will come hot, but the file-backed cache is consuming,
    // so ingest is still safe
    muxer
        .wait_for_hot(Some(Duration::from_secs(1)))
        .await
        .unwrap();

    for i in 0..100 {
        muxer.write_entry(test_entry(0, i)).await.unwrap();
    }

    // close drains whatever is still in the channels into the cache
    muxer.close().await.unwrap();

    assert_eq!(cache.stored().len(), 100);
    assert_eq!(payloads(&cache.stored()).len(), 100);
    assert!(cache.stored_tags().contains(&"default".to_string()));
}

// =============================================================================
// Scenario: cache unloads once a connection comes hot
// =============================================================================

#[tokio::test]
async fn test_cache_unloads_on_reconnect() {
    let factory = Arc::new(MockFactory::new());
    factory.kill(ADDR_A);

    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&[ADDR_A]).with_cache(CacheConfig {
        file_backing_location: Some(dir.path().join("spool")),
        max_cache_size: 0,
    });
    let cache = Arc::new(MemoryCache::new());
    let muxer = Muxer::new(cfg, factory.clone(), Some(cache.clone()))
        .await
        .unwrap();
    muxer.start().unwrap();

    for i in 0..50 {
        muxer.write_entry(test_entry(0, i)).await.unwrap();
    }
    // let the cache swallow the channel contents
    assert!(
        eventually(|| cache.stored().len() == 50, Duration::from_secs(5)).await,
        "cache holds {} of 50",
        cache.stored().len()
    );

    // destination comes back: spool stops and its blocks are pumped out
    factory.revive(ADDR_A);
    muxer
        .wait_for_hot(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let f = factory.clone();
    assert!(
        eventually(
            || f.all_delivered().len() == 50,
            Duration::from_secs(15)
        )
        .await,
        "delivered {} of 50 from cache",
        factory.all_delivered().len()
    );
    assert_eq!(payloads(&factory.all_delivered()).len(), 50);

    muxer.close().await.unwrap();
}

// =============================================================================
// Scenario: tag negotiated while connections are hot
// =============================================================================

#[tokio::test]
async fn test_late_tag_negotiation() {
    let factory = Arc::new(MockFactory::new());
    let muxer = start_hot(config(&[ADDR_A, ADDR_B]), factory.clone()).await;

    let tag = muxer.negotiate_tag("fresh").await.unwrap();
    assert_eq!(muxer.get_tag("fresh").unwrap(), tag);

    // both indexers now hold their own remote id for the new tag, and the
    // id spaces are disjoint by construction
    let ra = factory.indexer(ADDR_A).remote_tag("fresh").unwrap();
    let rb = factory.indexer(ADDR_B).remote_tag("fresh").unwrap();
    assert_ne!(ra, rb);

    for i in 0..200 {
        muxer.write_entry(test_entry(tag, i)).await.unwrap();
    }
    muxer.sync(Duration::from_secs(5)).await.unwrap();

    let f = factory.clone();
    assert!(
        eventually(
            || f.all_delivered().len() == 200,
            Duration::from_secs(10)
        )
        .await
    );

    // each indexer saw the tag in its own remote space
    for addr in [ADDR_A, ADDR_B] {
        let ix = factory.indexer(addr);
        let remote = ix.remote_tag("fresh").unwrap();
        for e in ix.delivered() {
            assert_eq!(e.tag, remote, "wrong remote tag at {addr}");
        }
    }

    muxer.close().await.unwrap();
}

// =============================================================================
// Scenario: negotiation failure forces a translator rebuild
// =============================================================================

#[tokio::test]
async fn test_failed_negotiation_replaces_connection() {
    let factory = Arc::new(MockFactory::new());
    let muxer = start_hot(config(&[ADDR_A, ADDR_B]), factory.clone()).await;
    let dials_before = factory.connect_count(ADDR_A);

    // A refuses the negotiation; the muxer closes it so the reconnect
    // builds a fresh, fully-populated translator
    factory.indexer(ADDR_A).set_fail_negotiate(true);
    let tag = muxer.negotiate_tag("fresh").await.unwrap();
    factory.indexer(ADDR_A).set_fail_negotiate(false);

    let f = factory.clone();
    assert!(
        eventually(
            || f.connect_count(ADDR_A) > dials_before,
            Duration::from_secs(10)
        )
        .await,
        "A never reconnected after failed negotiation"
    );

    // after the rebuild, a batch carrying the new tag flows end to end
    let batch = vec![
        test_entry(0, 0),
        test_entry(0, 1),
        test_entry(tag, 2),
        test_entry(0, 3),
    ];
    muxer.write_batch(batch).await.unwrap();

    let f = factory.clone();
    assert!(
        eventually(|| f.all_delivered().len() == 4, Duration::from_secs(10)).await,
        "batch delivered {} of 4",
        factory.all_delivered().len()
    );
    assert_eq!(payloads(&factory.all_delivered()).len(), 4);

    // the rebuilt session knows the new tag
    assert!(factory.indexer(ADDR_A).remote_tag("fresh").is_some());

    muxer.close().await.unwrap();
}

// =============================================================================
// Boundary: sync with everything down and no cache
// =============================================================================

#[tokio::test]
async fn test_sync_all_conns_down_no_cache() {
    let factory = Arc::new(MockFactory::new());
    factory.kill(ADDR_A);

    let muxer = Muxer::new(config(&[ADDR_A]), factory, None).await.unwrap();
    muxer.start().unwrap();

    let err = muxer.sync(Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(err, MuxerError::AllConnsDown));

    muxer.close().await.unwrap();
}

// =============================================================================
// Boundary: wait_for_hot times out without connections or cache
// =============================================================================

#[tokio::test]
async fn test_wait_for_hot_timeout() {
    let factory = Arc::new(MockFactory::new());
    factory.kill(ADDR_A);

    let muxer = Muxer::new(config(&[ADDR_A]), factory, None).await.unwrap();
    muxer.start().unwrap();

    let err = muxer
        .wait_for_hot(Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, MuxerError::ConnectionTimeout));

    muxer.close().await.unwrap();
}

// =============================================================================
// Boundary: total failure is surfaced
// =============================================================================

#[tokio::test]
async fn test_all_destinations_fatal() {
    let factory = Arc::new(MockFactory::new());
    factory.set_fatal(ADDR_A);
    factory.set_fatal(ADDR_B);

    let muxer = Muxer::new(config(&[ADDR_A, ADDR_B]), factory, None)
        .await
        .unwrap();
    muxer.start().unwrap();

    let err = muxer.wait_for_hot(Some(Duration::from_secs(5))).await;
    assert!(
        matches!(err, Err(MuxerError::AllConnsFailed(_))),
        "expected total failure, got {err:?}"
    );

    muxer.close().await.unwrap();
}
