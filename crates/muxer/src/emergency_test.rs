use super::*;
use crate::testutil::{test_entry, MockIndexer};
use std::net::{IpAddr, Ipv4Addr};

fn mock_conn() -> MockIndexer {
    MockIndexer::new("tcp://mock:4023", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 100)
}

// =============================================================================
// Push / pop
// =============================================================================

#[test]
fn test_push_pop_fifo() {
    let eq = EmergencyQueue::new();
    for i in 0..5 {
        eq.push(Some(test_entry(0, i)), None).unwrap();
    }
    assert_eq!(eq.len(), 5);
    for i in 0..5 {
        let item = eq.pop().unwrap();
        assert_eq!(item.entry.unwrap().data, format!("entry-{i}").as_bytes());
    }
    assert!(eq.pop().is_none());
}

#[test]
fn test_push_empty_item_is_noop() {
    let eq = EmergencyQueue::new();
    eq.push(None, None).unwrap();
    eq.push(None, Some(Vec::new())).unwrap();
    assert!(eq.is_empty());
}

#[test]
fn test_push_entry_and_batch_together() {
    let eq = EmergencyQueue::new();
    eq.push(Some(test_entry(0, 0)), Some(vec![test_entry(0, 1), test_entry(0, 2)]))
        .unwrap();
    assert_eq!(eq.len(), 1);
    let item = eq.pop().unwrap();
    assert!(item.entry.is_some());
    assert_eq!(item.batch.unwrap().len(), 2);
}

#[test]
fn test_overflow_at_capacity() {
    let eq = EmergencyQueue::new();
    for i in 0..MAX_EMERGENCY_LIST_SIZE {
        eq.push(Some(test_entry(0, i)), None).unwrap();
    }
    assert_eq!(eq.len(), MAX_EMERGENCY_LIST_SIZE);
    // pushes beyond capacity overflow, size stays put
    for i in 0..4 {
        let err = eq.push(Some(test_entry(0, 1000 + i)), None).unwrap_err();
        assert!(matches!(err, MuxerError::EmergencyListOverflow));
    }
    assert_eq!(eq.len(), MAX_EMERGENCY_LIST_SIZE);
}

// =============================================================================
// Clear
// =============================================================================

#[tokio::test]
async fn test_clear_writes_in_fifo_order() {
    let eq = EmergencyQueue::new();
    let conn = mock_conn();
    let tt = TagTranslator::from_remote(vec![100]);

    for i in 0..10 {
        eq.push(Some(test_entry(0, i)), None).unwrap();
    }
    assert!(eq.clear(&conn, &tt).await);
    assert!(eq.is_empty());

    let written = conn.unacked();
    assert_eq!(written.len(), 10);
    for (i, e) in written.iter().enumerate() {
        assert_eq!(e.data, format!("entry-{i}").as_bytes());
        // tags were translated on the way out
        assert_eq!(e.tag, 100);
    }
}

#[tokio::test]
async fn test_clear_translates_batches() {
    let eq = EmergencyQueue::new();
    let conn = mock_conn();
    let tt = TagTranslator::from_remote(vec![100, 101]);

    eq.push(None, Some(vec![test_entry(0, 0), test_entry(1, 1)]))
        .unwrap();
    assert!(eq.clear(&conn, &tt).await);

    let written = conn.unacked();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].tag, 100);
    assert_eq!(written[1].tag, 101);
}

#[tokio::test]
async fn test_clear_write_failure_pushes_back_with_local_tags() {
    let eq = EmergencyQueue::new();
    let conn = mock_conn();
    conn.set_fail_writes(true);
    let tt = TagTranslator::from_remote(vec![100]);

    eq.push(Some(test_entry(0, 0)), None).unwrap();
    assert!(!eq.clear(&conn, &tt).await);

    // the item went back at the tail with its tag restored to local space
    assert_eq!(eq.len(), 1);
    let item = eq.pop().unwrap();
    assert_eq!(item.entry.unwrap().tag, 0);
}

#[tokio::test]
async fn test_clear_untranslatable_tag_pushes_back() {
    let eq = EmergencyQueue::new();
    let conn = mock_conn();
    // translator knows only tag 0; the parked entry carries tag 7
    let tt = TagTranslator::from_remote(vec![100]);

    eq.push(Some(test_entry(7, 0)), None).unwrap();
    assert!(!eq.clear(&conn, &tt).await);
    assert_eq!(eq.len(), 1);
    assert_eq!(eq.pop().unwrap().entry.unwrap().tag, 7);
}

#[tokio::test]
async fn test_clear_batch_failure_reverses_translated_prefix() {
    let eq = EmergencyQueue::new();
    let conn = mock_conn();
    // tags 0 and 1 translate; tag 5 does not
    let tt = TagTranslator::from_remote(vec![100, 101]);

    eq.push(
        None,
        Some(vec![test_entry(0, 0), test_entry(1, 1), test_entry(5, 2)]),
    )
    .unwrap();
    assert!(!eq.clear(&conn, &tt).await);

    let item = eq.pop().unwrap();
    let batch = item.batch.unwrap();
    // the already-translated prefix came back in local space
    assert_eq!(batch[0].tag, 0);
    assert_eq!(batch[1].tag, 1);
    assert_eq!(batch[2].tag, 5);
    assert!(conn.unacked().is_empty());
}

#[tokio::test]
async fn test_clear_empty_queue_succeeds() {
    let eq = EmergencyQueue::new();
    let conn = mock_conn();
    let tt = TagTranslator::from_remote(vec![100]);
    assert!(eq.clear(&conn, &tt).await);
}
