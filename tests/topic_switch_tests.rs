//! Topic-switch behavior: quorum handling, partial-failure repair, and
//! checkpointed-offset reuse.

mod common;

use std::time::Duration;

use common::{Harness, REGION_A, REGION_B, REGION_C, REGIONS};
use estuary::IngestionError;

const PARTITION: u32 = 0;

#[tokio::test]
async fn switch_succeeds_with_minority_unreachable_and_repairs_later() {
    let harness = Harness::new(true);
    harness.bootstrap_partition(PARTITION).await;
    // Two stale records sit in region B's log before the rewind window.
    harness.pad_rt(REGION_B, PARTITION, 2);
    harness.deliver_topic_switch(PARTITION).await;

    // Region B's broker cannot resolve the rewind offset.
    harness.broker.set_unreachable(REGION_B, true);
    harness.task.start_consuming_as_leader(PARTITION).await.unwrap();

    // 1 unreachable < ceil((3+1)/2) = 2: the switch proceeds with the
    // reachable regions.
    let rt = harness.rt(PARTITION);
    assert!(harness.broker.is_subscribed(REGION_A, &rt));
    assert!(harness.broker.is_subscribed(REGION_C, &rt));
    assert!(!harness.broker.is_subscribed(REGION_B, &rt));

    // Once the region heals, the repair service resubscribes it.
    harness.broker.set_unreachable(REGION_B, false);
    for _ in 0..400 {
        if harness.broker.is_subscribed(REGION_B, &rt) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(
        harness.broker.is_subscribed(REGION_B, &rt),
        "repair service should have resubscribed region B"
    );

    // The repaired offset is synced into the partition state.
    let pcs = harness.task.partition_state(PARTITION).unwrap();
    let state = pcs.lock().await;
    assert!(state.leader_consumed_upstream_rt_offset(REGION_B) >= 0);
}

#[tokio::test]
async fn switch_aborts_on_quorum_failure_without_partial_subscription() {
    let harness = Harness::new(true);
    harness.bootstrap_partition(PARTITION).await;
    harness.deliver_topic_switch(PARTITION).await;

    harness.broker.set_unreachable(REGION_A, true);
    harness.broker.set_unreachable(REGION_B, true);

    let err = harness
        .task
        .start_consuming_as_leader(PARTITION)
        .await
        .unwrap_err();
    match err {
        IngestionError::TopicSwitchQuorumFailure { unreachable, total } => {
            assert_eq!((unreachable, total), (2, 3));
        }
        other => panic!("expected quorum failure, got {other:?}"),
    }

    // No partial subscription is observable: not even the reachable region
    // was subscribed.
    let rt = harness.rt(PARTITION);
    for region in REGIONS {
        assert!(!harness.broker.is_subscribed(region, &rt), "{region}");
    }
}

#[tokio::test]
async fn checkpointed_offsets_skip_the_rewind_lookup() {
    let harness = Harness::new(false);
    harness.bootstrap_partition(PARTITION).await;
    harness.deliver_topic_switch(PARTITION).await;

    // Checkpointed upstream offsets exist for every region, so the switch
    // must not need any timestamp lookup, even with all brokers dark.
    {
        let pcs = harness.task.partition_state(PARTITION).unwrap();
        let mut state = pcs.lock().await;
        state.update_latest_processed_upstream_rt_offset(REGION_A, 5);
        state.update_latest_processed_upstream_rt_offset(REGION_B, 6);
        state.update_latest_processed_upstream_rt_offset(REGION_C, 7);
    }
    for region in REGIONS {
        harness.broker.set_unreachable(region, true);
    }

    harness.task.start_consuming_as_leader(PARTITION).await.unwrap();

    // Consumption resumes after the last processed offset of each region.
    let rt = harness.rt(PARTITION);
    assert_eq!(harness.broker.subscription_cursor(REGION_A, &rt), Some(6));
    assert_eq!(harness.broker.subscription_cursor(REGION_B, &rt), Some(7));
    assert_eq!(harness.broker.subscription_cursor(REGION_C, &rt), Some(8));
}

#[tokio::test]
async fn switch_without_repair_service_propagates_single_region_failure() {
    let harness = Harness::new(false);
    harness.bootstrap_partition(PARTITION).await;
    harness.deliver_topic_switch(PARTITION).await;

    harness.broker.set_unreachable(REGION_B, true);
    let err = harness
        .task
        .start_consuming_as_leader(PARTITION)
        .await
        .unwrap_err();
    // Without a repair service the failed region cannot be deferred, so
    // the switch must not silently drop it.
    assert!(matches!(err, IngestionError::BrokerUnreachable { .. }));
}

#[tokio::test]
async fn leader_promotion_without_topic_switch_stays_on_version_topic() {
    let harness = Harness::new(false);
    harness.bootstrap_partition(PARTITION).await;

    harness.task.start_consuming_as_leader(PARTITION).await.unwrap();

    let pcs = harness.task.partition_state(PARTITION).unwrap();
    let state = pcs.lock().await;
    assert!(state.is_leader());
    assert!(!state.source_topic().is_real_time());
    let rt = harness.rt(PARTITION);
    for region in REGIONS {
        assert!(!harness.broker.is_subscribed(region, &rt));
    }
}

#[tokio::test]
async fn readiness_lag_tracks_multi_region_consumption() {
    let harness = Harness::new(false);
    harness.bootstrap_partition(PARTITION).await;
    harness.deliver_topic_switch(PARTITION).await;
    harness.task.start_consuming_as_leader(PARTITION).await.unwrap();

    // Empty logs: fully caught up.
    assert_eq!(
        harness
            .task
            .measure_rt_offset_lag_multi_region(PARTITION)
            .await
            .unwrap(),
        0
    );
    assert!(harness.task.is_ready_to_serve(PARTITION).await.unwrap());

    // Three unpolled records in region A show up as lag.
    for i in 0..3i64 {
        harness.push_rt_put(REGION_A, PARTITION, format!("k{i}").as_bytes(), b"v", 100 + i);
    }
    assert_eq!(
        harness
            .task
            .measure_rt_offset_lag_multi_region(PARTITION)
            .await
            .unwrap(),
        3
    );

    // Processing them brings the lag back to zero.
    harness.task.poll_once().await.unwrap();
    harness.drain(PARTITION).await;
    assert_eq!(
        harness
            .task
            .measure_rt_offset_lag_multi_region(PARTITION)
            .await
            .unwrap(),
        0
    );

    // One dark region falls back to the reachable ones.
    harness.broker.set_unreachable(REGION_B, true);
    assert_eq!(
        harness
            .task
            .measure_rt_offset_lag_multi_region(PARTITION)
            .await
            .unwrap(),
        0
    );

    // Two dark regions: not ready, and the partition reports lagging after
    // having announced readiness.
    harness.broker.set_unreachable(REGION_C, true);
    assert_eq!(
        harness
            .task
            .measure_rt_offset_lag_multi_region(PARTITION)
            .await
            .unwrap(),
        i64::MAX
    );
    assert!(!harness.task.is_ready_to_serve(PARTITION).await.unwrap());
    assert!(harness.task.is_ready_to_serve_announced_with_lag().await);
}

#[tokio::test]
async fn idle_window_gates_promotion() {
    let harness = Harness::new(false);
    harness.bootstrap_partition(PARTITION).await;

    // The bootstrap just touched version-topic activity, so the idle
    // window has not elapsed and promotion is refused.
    let promoted = harness.task.maybe_promote_to_leader(PARTITION).await.unwrap();
    assert!(!promoted);
    let pcs = harness.task.partition_state(PARTITION).unwrap();
    assert!(!pcs.lock().await.is_leader());
}
