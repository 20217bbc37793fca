//! Guarantees that must hold for every request and every queue.

mod common;

use std::time::Duration as StdDuration;

use chrono::Duration;
use common::*;
use docket_common::Clock;
use docket_net::{PassthroughReason, Request, RequestBody, Response};
use docket_sw::{
    CacheStore, ClientMessage, EngineEvent, FetchResult, QueueKind, RevalidationOutcome,
};
use http::StatusCode;
use serde_json::json;

#[tokio::test]
async fn denylisted_paths_never_touch_any_partition() {
    let h = harness().await;
    let sensitive = [
        "/api/cases/9/privileged/memo",
        "/api/CONFIDENTIAL/settlement",
        "/api/documents/attorney-client/notes.pdf",
        "/authentication/session",
        "/login?next=/cases",
        "/oauth/authorize",
        "/api/cases/9/work-product/draft",
        "/static/privileged.js",
    ];

    for path in sensitive {
        h.network
            .respond(&full(path), Response::plain(StatusCode::OK, "secret"));
        let result = h.engine.handle_fetch(Request::get(url(path))).await;
        assert!(
            matches!(result, FetchResult::Passthrough(PassthroughReason::Sensitive(_))),
            "{path} was intercepted"
        );
    }

    assert!(h.network.seen().is_empty(), "engine fetched a sensitive URL");
    for partition in h.store.partitions().await.unwrap() {
        for key in h.store.keys(&partition).await.unwrap() {
            assert!(
                !sensitive.iter().any(|p| key == full(p)),
                "{key} stored in {partition}"
            );
        }
    }
}

#[tokio::test]
async fn cache_first_uses_fresh_entry_and_refreshes_expired_one() {
    let h = harness().await;
    let statute = "/api/statutes/ca/civ-335";
    h.network
        .respond(&full(statute), json_at(json!({"rev": 1}), start_time()));

    h.engine.handle_fetch(Request::get(url(statute))).await;
    assert_eq!(h.network.hits(&full(statute)), 1);

    h.clock.advance(Duration::days(6));
    let fresh = h
        .engine
        .handle_fetch(Request::get(url(statute)))
        .await
        .into_response()
        .unwrap();
    assert!(fresh.from_cache);
    assert_eq!(h.network.hits(&full(statute)), 1);

    h.clock.advance(Duration::days(2));
    h.network
        .respond(&full(statute), json_at(json!({"rev": 2}), h.clock.now()));
    let refreshed = h
        .engine
        .handle_fetch(Request::get(url(statute)))
        .await
        .into_response()
        .unwrap();
    assert!(!refreshed.from_cache);
    assert_eq!(h.network.hits(&full(statute)), 2);

    let stored = h
        .store
        .match_entry("docket-legal-resources-v1", &full(statute))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.body, refreshed.body.to_vec());
}

#[tokio::test]
async fn stale_while_revalidate_returns_before_hanging_refetch() {
    let mut h = harness().await;
    let search = "/api/search?q=laches";
    h.network
        .respond(&full(search), json_at(json!({"hits": 1}), start_time()));

    h.engine.handle_fetch(Request::get(url(search))).await;
    next_event(&mut h.events, |e| matches!(e, EngineEvent::Revalidated { .. })).await;

    let gate = h.network.hang(&full(search));
    let cached = tokio::time::timeout(
        StdDuration::from_secs(1),
        h.engine.handle_fetch(Request::get(url(search))),
    )
    .await
    .expect("handler blocked on the network")
    .into_response()
    .unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.body_json::<serde_json::Value>().unwrap()["hits"], 1);

    h.network
        .respond(&full(search), json_at(json!({"hits": 2}), start_time()));
    gate.notify_one();

    let event = next_event(&mut h.events, |e| matches!(e, EngineEvent::Revalidated { .. })).await;
    assert!(matches!(
        event,
        EngineEvent::Revalidated { outcome: RevalidationOutcome::Updated { status: 200 }, .. }
    ));
    let stored = h
        .store
        .match_entry("docket-search-v1", &full(search))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&stored.body).unwrap()["hits"],
        2
    );
}

#[tokio::test]
async fn queue_drains_in_order_and_keeps_failures_intact() {
    let h = harness().await;
    let endpoint = full("/api/annotations");

    for label in ["A", "B", "C"] {
        h.engine
            .handle_message(ClientMessage::QueueAnnotation(json!({"label": label})))
            .await
            .unwrap();
    }
    let before = h.engine.queues().list(QueueKind::Annotations).await.unwrap();
    let b_before = serde_json::to_string(&before[1]).unwrap();

    h.network.respond_with(&endpoint, |request| {
        let failing = matches!(&request.body, Some(RequestBody::Bytes(b))
            if String::from_utf8_lossy(b).contains("\"B\""));
        Some(if failing {
            Response::plain(StatusCode::INTERNAL_SERVER_ERROR, "try later")
        } else {
            Response::new(StatusCode::OK, "")
        })
    });

    let report = h
        .engine
        .handle_sync_tag("annotation-sync")
        .await
        .unwrap()
        .unwrap();

    let posted: Vec<String> = h
        .network
        .seen()
        .iter()
        .map(|r| match &r.body {
            Some(RequestBody::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
            other => panic!("unexpected body {other:?}"),
        })
        .collect();
    assert_eq!(
        posted,
        vec![
            r#"{"label":"A"}"#.to_string(),
            r#"{"label":"B"}"#.to_string(),
            r#"{"label":"C"}"#.to_string(),
        ]
    );
    assert_eq!(report.delivered.len(), 2);
    assert_eq!(report.failed, vec![before[1].id]);

    let after = h.engine.queues().list(QueueKind::Annotations).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(serde_json::to_string(&after[0]).unwrap(), b_before);

    h.network
        .respond(&endpoint, Response::new(StatusCode::NO_CONTENT, ""));
    let retry = h
        .engine
        .handle_sync_tag("annotation-sync")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retry.delivered, after);
    assert!(h
        .engine
        .queues()
        .list(QueueKind::Annotations)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn ttl_boundary_is_strict() {
    let h = harness().await;
    let rule = "/api/regulations/osha/1910";
    h.network
        .respond(&full(rule), json_at(json!({"v": 1}), start_time()));
    h.engine.handle_fetch(Request::get(url(rule))).await;

    // Exactly the seven-day max age: still fresh.
    h.clock.set(start_time() + Duration::days(7));
    let at_boundary = h
        .engine
        .handle_fetch(Request::get(url(rule)))
        .await
        .into_response()
        .unwrap();
    assert!(at_boundary.from_cache);
    assert_eq!(h.network.hits(&full(rule)), 1);

    // One microsecond later: expired.
    h.clock
        .set(start_time() + Duration::days(7) + Duration::microseconds(1));
    let past_boundary = h
        .engine
        .handle_fetch(Request::get(url(rule)))
        .await
        .into_response()
        .unwrap();
    assert!(!past_boundary.from_cache);
    assert_eq!(h.network.hits(&full(rule)), 2);
}

#[tokio::test]
async fn route_capacity_evicts_oldest_entries() {
    let h = harness().await;
    for i in 0..55 {
        let path = format!("/api/cases/{i}/documents/1");
        h.network
            .respond(&full(&path), json_at(json!({"i": i}), start_time()));
        h.engine.handle_fetch(Request::get(url(&path))).await;
        h.clock.advance(Duration::seconds(1));
    }

    let keys = h.store.keys("docket-documents-v1").await.unwrap();
    assert_eq!(keys.len(), 50);
    assert!(!keys.contains(&full("/api/cases/0/documents/1")));
    assert!(keys.contains(&full("/api/cases/54/documents/1")));
}
