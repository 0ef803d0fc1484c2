//! Concurrent traffic through the networking node
//!
//! Every request must come back exactly once and leave no correlation behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use ocpp_node::dispatch::Outcome;
use ocpp_node::ocpp::messages::{GenericStatus, GetCrlRequest, GetCrlResponse};
use serde_json::json;

use super::harness::*;

fn get_crl(request_id: i64) -> GetCrlRequest {
    serde_json::from_value(json!({
        "requestId": request_id,
        "certificateHashData": {
            "hashAlgorithm": "SHA256",
            "issuerNameHash": "aa",
            "issuerKeyHash": "bb",
            "serialNumber": "01"
        }
    }))
    .unwrap()
}

async fn run(requests: i64) -> Duration {
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(dispatcher(NN), forwarding(NN)),
        node(
            dispatcher(CSMS).on::<GetCrlRequest, _, _>(move |_, request| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis((request.request_id % 7) as u64)).await;
                    Ok(Some(GetCrlResponse {
                        status: GenericStatus::Accepted,
                        get_crl_request_id: request.request_id,
                        status_info: None,
                        signatures: vec![],
                        custom_data: None,
                    }))
                }
            }),
            forwarding(CSMS),
        ),
    );

    let started = Instant::now();
    let outcomes = join_all((0..requests).map(|n| {
        let cs = net.cs.clone();
        async move { cs.send_request(Some(CSMS.into()), &get_crl(n), None).await }
    }))
    .await;
    let elapsed = started.elapsed();

    for (n, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Outcome::Response(response) => assert_eq!(response.get_crl_request_id, n as i64),
            other => panic!("request {n} failed: {other:?}"),
        }
    }
    assert_eq!(handled.load(Ordering::SeqCst), requests as usize);
    assert_eq!(net.cs.correlations().pending_count(), 0);
    assert_eq!(net.nn.correlations().pending_count(), 0);
    assert_eq!(net.nn.status().forwarded, requests as u64);
    elapsed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_each_answered_once() {
    run(100).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_sustained_load() {
    let elapsed = run(5_000).await;
    println!("5000 relayed requests in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(30));
}
