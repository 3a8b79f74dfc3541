mod common;

use chrono::{Duration, TimeZone, Utc};
use common::*;
use overlay_core::models::{
    DatasetFormat, MetricId, MetricState, MetricSubject, MetricValue, NewMetric, OverlayParams,
    RollupGranularity,
};
use overlay_core::OverlayError;
use overlay_engine::{
    EngineError, MemoryGeographyResolver, MetricEngine, MetricEngineConfig, ProcessOutcome,
};
use overlay_geo::area::area_square_km;
use overlay_store::{MemoryMetricStore, MetricStore, RollupKey, Transition};
use std::sync::Arc;
use tokio::sync::watch;

type Engine = MetricEngine<MemoryMetricStore, MemoryGeographyResolver>;

fn metric_engine() -> (Engine, Arc<MemoryMetricStore>) {
    let store = Arc::new(MemoryMetricStore::new());
    let resolver: MemoryGeographyResolver = [open_water(1), zone(2, "west")].into_iter().collect();
    let config = MetricEngineConfig { poll_interval: std::time::Duration::from_millis(10), ..Default::default() };
    let engine = MetricEngine::new(Arc::clone(&store), Arc::new(resolver), engine(), config);
    (engine, store)
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() / b.abs().max(1e-12) < 1e-6
}

#[tokio::test]
async fn test_total_area_of_geography() {
    let (engine, store) = metric_engine();
    let id = engine.submit(NewMetric::total_area(MetricSubject::Geography { id: 2 })).await.unwrap();

    let outcome = engine.process(id).await.unwrap();

    let expected = area_square_km(&rect(0.0, 0.0, 5.0, 10.0));
    match &outcome {
        ProcessOutcome::Completed(MetricValue::TotalArea { square_km }) => assert!(close(*square_km, expected)),
        other => panic!("unexpected outcome {:?}", other),
    }

    let row = store.fetch(id).await.unwrap().unwrap();
    assert_eq!(row.state, MetricState::Complete);
    assert!(row.claimed);
    assert!(row.timeout_at.is_none());

    let rollups = store.list_rollups(RollupGranularity::Hour, None).await.unwrap();
    assert_eq!(rollups.len(), 1);
    assert_eq!((rollups[0].completed, rollups[0].failed), (1, 0));
}

#[tokio::test]
async fn test_finished_row_is_skipped() {
    let (engine, _) = metric_engine();
    let id = engine.submit(NewMetric::total_area(MetricSubject::Geography { id: 2 })).await.unwrap();
    engine.process(id).await.unwrap();

    let again = engine.process(id).await.unwrap();
    assert_eq!(again, ProcessOutcome::Skipped { state: MetricState::Complete });
}

#[tokio::test]
async fn test_unsupported_metric_type_fails_row() {
    let (engine, store) = metric_engine();
    let request = NewMetric {
        metric_type: "perimeter".to_string(),
        subject: MetricSubject::Geography { id: 1 },
        overlay: None,
    };
    let id = engine.submit(request).await.unwrap();

    let outcome = engine.process(id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Failed("Unsupported metric type: perimeter".to_string()));

    let row = store.fetch(id).await.unwrap().unwrap();
    assert_eq!(row.state, MetricState::Error);
    assert!(!row.claimed);
}

#[tokio::test]
async fn test_missing_geography_fails_row_and_resubmit_requeues() {
    let (engine, store) = metric_engine();
    let id = engine.submit(NewMetric::total_area(MetricSubject::Geography { id: 404 })).await.unwrap();

    let outcome = engine.process(id).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed(ref m) if m.contains("404")));

    let row = engine.resubmit(id).await.unwrap();
    assert_eq!(row.state, MetricState::Queued);
    assert!(row.error_message.is_none());

    let err = engine.resubmit(id).await.unwrap_err();
    assert!(matches!(err, EngineError::Overlay(OverlayError::InvalidTransition { .. })));
    assert_eq!(store.fetch(id).await.unwrap().unwrap().state, MetricState::Queued);
}

#[tokio::test]
async fn test_overlay_area_of_fragment() {
    let (engine, store) = metric_engine();
    let clipping = engine.clipping();

    let sketch = clipping.prepare(sketch_feature(&rect(1.0, 1.0, 9.0, 9.0))).await.unwrap();
    let fragments = clipping.create_fragments(&sketch, &[zone(2, "west")]).await.unwrap();
    assert_eq!(fragments.len(), 1);

    let params = OverlayParams {
        source_url: REEFS.to_string(),
        format: DatasetFormat::OverlayFgb,
        group_by: Some("class".to_string()),
    };
    let subject = MetricSubject::Fragment { hash: fragments[0].hash().clone() };
    let id = engine.submit(NewMetric::overlay_area(subject, params)).await.unwrap();

    let outcome = engine.process(id).await.unwrap();
    let reef = area_square_km(&rect(2.0, 2.0, 4.0, 4.0));
    match outcome {
        ProcessOutcome::Completed(MetricValue::OverlayArea { square_km_by_class }) => {
            assert!(close(square_km_by_class["reef"], reef));
            assert!(close(square_km_by_class[MetricValue::TOTAL_CLASS], reef));
            assert!(!square_km_by_class.contains_key("kelp"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(store.fetch(id).await.unwrap().unwrap().state, MetricState::Complete);
}

#[tokio::test]
async fn test_timeout_sweep_fails_stuck_rows_only() {
    let (engine, store) = metric_engine();
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let long_ago = now - Duration::hours(2);
    let subject = || MetricSubject::Geography { id: 1 };

    let stale_queued = store.insert(NewMetric::total_area(subject()), long_ago).await.unwrap().id;
    let fresh_queued = store.insert(NewMetric::total_area(subject()), now).await.unwrap().id;

    let stuck = store.insert(NewMetric::total_area(subject()), long_ago).await.unwrap().id;
    store
        .transition(stuck, &[MetricState::Queued], Transition::claim(long_ago + Duration::minutes(5)), long_ago)
        .await
        .unwrap();

    let done = store.insert(NewMetric::total_area(subject()), long_ago).await.unwrap().id;
    store.transition(done, &[MetricState::Queued], Transition::claim(long_ago), long_ago).await.unwrap();
    store
        .transition(
            done,
            &[MetricState::Processing],
            Transition::complete(MetricValue::TotalArea { square_km: 1.0 }),
            long_ago,
        )
        .await
        .unwrap();

    let mut timed_out = engine.sweep_timeouts(now).await.unwrap();
    timed_out.sort();
    assert_eq!(timed_out, vec![stale_queued, stuck]);

    let stuck_row = store.fetch(stuck).await.unwrap().unwrap();
    assert_eq!(stuck_row.state, MetricState::Error);
    assert!(stuck_row.error_message.unwrap().starts_with("Timeout"));

    assert_eq!(store.fetch(fresh_queued).await.unwrap().unwrap().state, MetricState::Queued);
    let done_row = store.fetch(done).await.unwrap().unwrap();
    assert_eq!(done_row.state, MetricState::Complete);
    assert_eq!(done_row.updated_at, long_ago);
}

#[tokio::test]
async fn test_resubmitted_row_gets_a_fresh_queue_window() {
    let (engine, store) = metric_engine();
    let hours_ago = Utc::now() - Duration::hours(30);
    let id = store.insert(NewMetric::total_area(MetricSubject::Geography { id: 1 }), hours_ago).await.unwrap().id;
    store.transition(id, &[MetricState::Queued], Transition::fail("boom"), hours_ago).await.unwrap();

    let row = engine.resubmit(id).await.unwrap();
    assert_eq!(row.created_at, hours_ago);

    let now = Utc::now();
    assert!(engine.sweep_timeouts(now).await.unwrap().is_empty());
    assert_eq!(engine.cleanup(now).await.unwrap().unclaimed_deleted, 0);
    assert_eq!(store.fetch(id).await.unwrap().unwrap().state, MetricState::Queued);

    // The window restarts at resubmission, not at creation
    let later = row.updated_at + Duration::minutes(11);
    assert_eq!(engine.sweep_timeouts(later).await.unwrap(), vec![id]);
}

#[tokio::test]
async fn test_cleanup_purges_rows_and_merges_rollups() {
    let (engine, store) = metric_engine();
    let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
    let subject = || MetricSubject::Geography { id: 1 };

    let unclaimed = store.insert(NewMetric::total_area(subject()), now - Duration::days(2)).await.unwrap().id;
    let recent = store.insert(NewMetric::total_area(subject()), now - Duration::hours(1)).await.unwrap().id;

    let old_complete = store.insert(NewMetric::total_area(subject()), now - Duration::days(40)).await.unwrap().id;
    let old_error = store.insert(NewMetric::total_area(subject()), now - Duration::days(40)).await.unwrap().id;
    for (id, finish) in [
        (old_complete, Transition::complete(MetricValue::TotalArea { square_km: 1.0 })),
        (old_error, Transition::fail("boom")),
    ] {
        let at = now - Duration::days(40);
        store.transition(id, &[MetricState::Queued], Transition::claim(at), at).await.unwrap();
        store.transition(id, &[MetricState::Processing], finish, at).await.unwrap();
    }

    let day = Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap();
    store.increment_rollup(RollupKey::at("total_area", RollupGranularity::Hour, day + Duration::hours(3)), 2, 1).await.unwrap();
    store.increment_rollup(RollupKey::at("total_area", RollupGranularity::Hour, day + Duration::hours(9)), 4, 0).await.unwrap();
    store.increment_rollup(RollupKey::at("total_area", RollupGranularity::Hour, now), 1, 0).await.unwrap();

    let report = engine.cleanup(now).await.unwrap();

    assert_eq!(report.unclaimed_deleted, 1);
    assert_eq!(report.expired_deleted, 1);
    assert_eq!(report.rollups_merged, 2);
    assert_eq!(report.daily_rollups, 1);

    assert!(store.fetch(unclaimed).await.unwrap().is_none());
    assert!(store.fetch(old_complete).await.unwrap().is_none());
    assert!(store.fetch(recent).await.unwrap().is_some());
    assert!(store.fetch(old_error).await.unwrap().is_some());

    let daily = store.list_rollups(RollupGranularity::Day, None).await.unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].bucket_start, day);
    assert_eq!((daily[0].completed, daily[0].failed), (6, 1));
    let hourly = store.list_rollups(RollupGranularity::Hour, None).await.unwrap();
    assert_eq!(hourly.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workers_drain_queue_and_stop() {
    let (engine, store) = metric_engine();
    let mut ids: Vec<MetricId> = Vec::new();
    for id in [1, 2, 1] {
        ids.push(engine.submit(NewMetric::total_area(MetricSubject::Geography { id })).await.unwrap());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_workers(3, shutdown_rx).await })
    };

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let mut finished = 0;
        for id in &ids {
            if store.fetch(*id).await.unwrap().unwrap().state == MetricState::Complete {
                finished += 1;
            }
        }
        if finished == ids.len() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "metrics were not processed in time");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
}
