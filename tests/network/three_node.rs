use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use ocpp_node::binary::BinaryFormat;
use ocpp_node::dispatch::Outcome;
use ocpp_node::envelope::{Envelope, JsonRequestMessage};
use ocpp_node::forwarding::{FilterVerdict, ForwardingResult};
use ocpp_node::node::{builtin, ChannelSink, MessageSink, NodeOptions, NodeRole};
use ocpp_node::ocpp::messages::{
    BinaryDataTransferRequest, BinaryDataTransferResponse, DataTransferRequest, DataTransferStatus,
    HeartbeatRequest, HeartbeatResponse,
};
use ocpp_node::ocpp::{ErrorCode, NetworkPath, NetworkingNodeId, OcppRequest, OcppResponse};

use super::harness::*;

fn fixed_heartbeat() -> HeartbeatResponse {
    HeartbeatResponse {
        current_time: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        signatures: vec![],
        custom_data: None,
    }
}

#[tokio::test]
async fn test_request_travels_through_networking_node() {
    let seen_path: Arc<Mutex<Option<NetworkPath>>> = Arc::new(Mutex::new(None));
    let record = seen_path.clone();
    let csms = node(
        dispatcher(CSMS).on::<HeartbeatRequest, _, _>(move |ctx, _| {
            *record.lock() = Some(ctx.network_path.clone());
            async { Ok(Some(fixed_heartbeat())) }
        }),
        forwarding(CSMS),
    );
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(dispatcher(NN), forwarding(NN)),
        csms,
    );

    let outcome = net
        .cs
        .send_request(Some(CSMS.into()), &HeartbeatRequest::default(), None)
        .await;

    assert_eq!(outcome, Outcome::Response(fixed_heartbeat()));
    assert_eq!(
        seen_path.lock().as_ref().map(ToString::to_string).as_deref(),
        Some("CS001 -> NN01")
    );
    assert_eq!(net.nn.status().forwarded, 1);
    assert_eq!(net.cs.correlations().pending_count(), 0);
    assert_eq!(net.nn.correlations().pending_count(), 0);
}

#[tokio::test]
async fn test_stations_reusing_a_request_id_are_kept_apart() {
    let nn = node(dispatcher(NN), forwarding(NN));
    let csms = node(
        dispatcher(CSMS).on::<HeartbeatRequest, _, _>(|ctx, _| async move {
            // CS002 is answered first
            if ctx.source.as_ref().map(NetworkingNodeId::as_str) == Some(CS) {
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
            Ok(Some(fixed_heartbeat()))
        }),
        forwarding(CSMS),
    );
    let (nn_to_csms, csms_to_nn) = link(&nn, &csms);
    nn.connect(CSMS.into(), nn_to_csms);
    csms.set_uplink(csms_to_nn);

    let mut stations = Vec::new();
    for station in [CS, "CS002"] {
        let (sink, rx) = ChannelSink::new();
        let request = Envelope::JsonRequest(
            JsonRequestMessage::new("1".into(), HeartbeatRequest::ACTION, json!({}))
                .to(CSMS.into())
                .with_path(NetworkPath::from_source(station.into())),
        );
        let from: Arc<dyn MessageSink> = Arc::new(sink);
        nn.handle_envelope(from, request).await;
        stations.push((station, rx));
    }

    for (station, mut rx) in stations {
        let answer = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match answer {
            Envelope::JsonResponse(m) => {
                assert_eq!(m.request_id.as_str(), "1");
                assert_eq!(m.destination, Some(station.into()));
                assert_eq!(m.network_path.to_string(), "CSMS -> NN01");
            }
            other => panic!("{station} expected a response, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
    assert_eq!(nn.status().forwarded, 2);
    assert_eq!(nn.correlations().pending_count(), 0);
}

#[tokio::test]
async fn test_default_drop_never_reaches_csms() {
    let reached = Arc::new(Mutex::new(false));
    let flag = reached.clone();
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(dispatcher(NN), forwarding(NN).default_result(ForwardingResult::Drop)),
        node(
            dispatcher(CSMS).on::<HeartbeatRequest, _, _>(move |_, _| {
                *flag.lock() = true;
                async { Ok(Some(fixed_heartbeat())) }
            }),
            forwarding(CSMS),
        ),
    );

    let outcome = net
        .cs
        .send_request(Some(CSMS.into()), &HeartbeatRequest::default(), None)
        .await;

    match outcome {
        Outcome::RemoteError {
            code, description, ..
        } => {
            assert_eq!(code, ErrorCode::GenericError);
            assert_eq!(description, "Filtered: Default handler");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert!(!*reached.lock());
    assert_eq!(net.nn.status().dropped, 1);
}

#[tokio::test]
async fn test_vendor_filter_answers_locally() {
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(
            dispatcher(NN),
            forwarding(NN).filter_typed::<DataTransferRequest, _, _>(|_, request| async move {
                Ok((request.vendor_id == "com.local").then(|| {
                    FilterVerdict::drop("handled by networking node").with_response(Outcome::Response(
                        json!({"status": "Accepted", "data": "from NN01"}),
                    ))
                }))
            }),
        ),
        node(builtin::register(dispatcher(CSMS), NodeRole::Csms), forwarding(CSMS)),
    );

    let local = DataTransferRequest {
        vendor_id: "com.local".to_string(),
        message_id: None,
        data: None,
        signatures: vec![],
        custom_data: None,
    };
    let answered = net
        .cs
        .send_request(Some(CSMS.into()), &local, None)
        .await
        .into_response()
        .unwrap();
    assert_eq!(answered.status, DataTransferStatus::Accepted);
    assert_eq!(answered.data, Some(json!("from NN01")));

    let remote = DataTransferRequest {
        vendor_id: "com.remote".to_string(),
        ..local
    };
    let forwarded = net
        .cs
        .send_request(Some(CSMS.into()), &remote, None)
        .await
        .into_response()
        .unwrap();
    assert_eq!(forwarded.status, DataTransferStatus::UnknownVendorId);
}

#[tokio::test]
async fn test_relay_timeout_reaches_origin_once() {
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node_with(
            dispatcher(NN),
            forwarding(NN),
            NodeOptions {
                request_timeout: Duration::from_secs(2),
                relay_timeout: Duration::from_millis(100),
            },
        ),
        node(
            dispatcher(CSMS).on::<HeartbeatRequest, _, _>(|_, _| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(Some(fixed_heartbeat()))
            }),
            forwarding(CSMS),
        ),
    );

    let outcome = net
        .cs
        .send_request(Some(CSMS.into()), &HeartbeatRequest::default(), None)
        .await;
    match outcome {
        Outcome::RemoteError {
            code, description, ..
        } => {
            assert_eq!(code, ErrorCode::GenericError);
            assert!(description.starts_with("Timeout after"), "{description}");
        }
        other => panic!("expected a remote timeout, got {other:?}"),
    }

    // the late CSMS answer is discarded by NN01
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(net.nn.correlations().pending_count(), 0);
    assert_eq!(net.cs.correlations().pending_count(), 0);
}

#[tokio::test]
async fn test_local_timeout_without_answer() {
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(dispatcher(NN), forwarding(NN)),
        node(
            dispatcher(CSMS).on::<HeartbeatRequest, _, _>(|ctx, _| async move {
                ctx.cancel.cancelled().await;
                Ok(None)
            }),
            forwarding(CSMS),
        ),
    );

    let outcome = net
        .cs
        .send_request(
            Some(CSMS.into()),
            &HeartbeatRequest::default(),
            Some(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(outcome, Outcome::Timeout { .. }));
    net.csms.shutdown();
}

#[tokio::test]
async fn test_binary_data_transfer_end_to_end() {
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(dispatcher(NN), forwarding(NN)),
        node(builtin::register(dispatcher(CSMS), NodeRole::Csms), forwarding(CSMS)),
    );
    let payload = BinaryDataTransferRequest {
        vendor_id: "org.openchargealliance".to_string(),
        message_id: Some("firmware-chunk".to_string()),
        data: vec![0xde, 0xad, 0xbe, 0xef],
        signatures: vec![],
    }
    .to_binary(BinaryFormat::Extensible)
    .unwrap();

    let outcome = net
        .cs
        .send_binary(Some(CSMS.into()), BinaryDataTransferRequest::ACTION, payload, None)
        .await;
    let response = BinaryDataTransferResponse::from_binary(&outcome.into_response().unwrap()).unwrap();
    assert_eq!(response.status, DataTransferStatus::UnknownVendorId);
    assert_eq!(response.additional_info.as_deref(), Some("org.openchargealliance"));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TeleportRequest {
    target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TeleportResponse {}

impl OcppRequest for TeleportRequest {
    const ACTION: &'static str = "Teleport";
    type Response = TeleportResponse;
}
impl OcppResponse for TeleportResponse {}

#[tokio::test]
async fn test_unknown_action_is_not_implemented() {
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(dispatcher(NN), forwarding(NN)),
        node(dispatcher(CSMS), forwarding(CSMS)),
    );
    let outcome = net
        .cs
        .send_request(
            Some(CSMS.into()),
            &TeleportRequest {
                target: "Mars".to_string(),
            },
            None,
        )
        .await;
    assert_eq!(outcome.error_code(), Some(ErrorCode::NotImplemented));
}

#[tokio::test]
async fn test_networking_node_answers_its_own_heartbeat() {
    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(builtin::register(dispatcher(NN), NodeRole::NetworkingNode), forwarding(NN)),
        node(dispatcher(CSMS), forwarding(CSMS)),
    );
    let outcome = net
        .cs
        .send_request(Some(NetworkingNodeId::from(NN)), &HeartbeatRequest::default(), None)
        .await;
    assert!(outcome.is_response());
    assert_eq!(net.nn.status().forwarded, 0);
}
