//! Outstanding-response accounting with and without release.

mod common;

use common::{MockConnector, config, executor, get, ok};
use std::collections::HashSet;
use tether::client::{ReleaseOutcome, ResponseHandle};
use tether::error::ClientError;
use tether::pool::ReturnOutcome;

#[tokio::test]
async fn released_responses_reuse_one_connection() {
    let connector = MockConnector::replying(ok(""));
    let mut cfg = config();
    cfg.pool.per_destination_idle_cap = 2;
    let executor = executor(&cfg, &connector);

    for _ in 0..6 {
        let mut response = executor.execute(get()).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let outcome = response.release().await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Returned(ReturnOutcome::Pooled { evicted: 0 }));
    }

    let monitor = executor.monitor();
    assert!(monitor.connections_opened() <= 2);
    assert_eq!(connector.connects(), monitor.connections_opened());
    assert_eq!(monitor.outstanding_count(), 0);
    assert_eq!(monitor.background_worker_count(), 0);
    assert!(executor.pool().total_idle().await <= cfg.pool.global_idle_cap);
}

#[tokio::test]
async fn unreleased_responses_accumulate() {
    let connector = MockConnector::replying(ok("hello"));
    let mut cfg = config();
    cfg.pool.per_destination_idle_cap = 2;
    let executor = executor(&cfg, &connector);

    let mut held = Vec::new();
    for _ in 0..6 {
        held.push(executor.execute(get()).await.unwrap());
    }

    let monitor = executor.monitor();
    assert_eq!(monitor.outstanding_count(), 6);
    assert_eq!(monitor.background_worker_count(), 6);
    assert_eq!(monitor.connections_opened(), 6);
    assert_eq!(executor.pool().total_idle().await, 0);

    // Each handle pins a different connection.
    let ids: HashSet<_> = held.iter().map(|r| r.connection_id().unwrap()).collect();
    assert_eq!(ids.len(), 6);
}

#[tokio::test]
async fn outstanding_grows_with_each_unreleased_request() {
    let connector = MockConnector::replying(ok("x"));
    let executor = executor(&config(), &connector);

    let mut held = Vec::new();
    for n in 1..=10 {
        held.push(executor.execute(get()).await.unwrap());
        assert_eq!(executor.monitor().outstanding_count(), n);
    }

    for mut response in held {
        response.release().await.unwrap();
    }
    assert_eq!(executor.monitor().outstanding_count(), 0);
    assert_eq!(executor.monitor().background_worker_count(), 0);
}

#[tokio::test]
async fn dropping_unreleased_handle_closes_connection() {
    let connector = MockConnector::replying(ok("body"));
    let executor = executor(&config(), &connector);

    let response = executor.execute(get()).await.unwrap();
    drop(response);

    let snap = executor.monitor().snapshot();
    assert_eq!(snap.outstanding, 0);
    assert_eq!(snap.handles_abandoned, 1);
    assert_eq!(snap.handles_released, 0);
    assert_eq!(snap.live_connections, 0);
    assert_eq!(executor.pool().total_idle().await, 0);

    // Nothing went back to the pool, so the next request dials again.
    let mut next = executor.execute(get()).await.unwrap();
    next.release().await.unwrap();
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn with_response_releases_on_success_and_error() {
    let connector = MockConnector::replying(ok("payload"));
    let executor = executor(&config(), &connector);

    let status = executor
        .with_response(get(), async |response: &mut ResponseHandle| {
            Ok::<_, ClientError>(response.status().as_u16())
        })
        .await
        .unwrap();
    assert_eq!(status, 200);

    let failed: Result<(), ClientError> = executor
        .with_response(get(), async |_response: &mut ResponseHandle| {
            Err(ClientError::InvalidRequest("caller gave up".to_string()))
        })
        .await;
    assert!(matches!(failed, Err(ClientError::InvalidRequest(_))));

    let snap = executor.monitor().snapshot();
    assert_eq!(snap.outstanding, 0);
    assert_eq!(snap.handles_released, 2);
    assert_eq!(snap.handles_abandoned, 0);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn consuming_body_releases() {
    let connector = MockConnector::replying(ok("hello world"));
    let executor = executor(&config(), &connector);

    let response = executor.execute(get()).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "hello world");

    assert_eq!(executor.monitor().outstanding_count(), 0);
    assert_eq!(executor.pool().total_idle().await, 1);
}
