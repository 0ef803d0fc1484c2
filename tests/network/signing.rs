use std::sync::Arc;

use ocpp_node::dispatch::Outcome;
use ocpp_node::node::{builtin, NodeRole};
use ocpp_node::ocpp::messages::HeartbeatRequest;
use ocpp_node::ocpp::ErrorCode;
use ocpp_node::signatures::{DirectionalKeys, Ed25519Policy, SigningKey, VerificationMode};

use super::harness::*;

fn key(id: &str, seed_byte: u8) -> Arc<SigningKey> {
    Arc::new(SigningKey::from_seed_hex(id, &hex::encode([seed_byte; 32])).unwrap())
}

/// Signs both directions with `own`, requires signatures from `peers`.
fn policy(own: &Arc<SigningKey>, peers: &[&Arc<SigningKey>]) -> Ed25519Policy {
    let keys = || {
        peers.iter().fold(
            DirectionalKeys::new(VerificationMode::Require).with_signing_key(own.clone()),
            |keys, peer| keys.trust(peer.key_id(), peer.public_key().to_vec()),
        )
    };
    Ed25519Policy::new(keys(), keys())
}

#[tokio::test]
async fn test_every_hop_re_signs() {
    let (cs_key, nn_key, csms_key) = (key("cs001", 1), key("nn01", 2), key("csms", 3));

    let net = chain(
        node(signed(dispatcher(CS), policy(&cs_key, &[&nn_key])), forwarding(CS)),
        node(
            signed(dispatcher(NN), policy(&nn_key, &[&cs_key, &csms_key])),
            forwarding(NN),
        ),
        node(
            signed(
                builtin::register(dispatcher(CSMS), NodeRole::Csms),
                policy(&csms_key, &[&nn_key]),
            ),
            forwarding(CSMS),
        ),
    );

    let outcome = net
        .cs
        .send_request(Some(CSMS.into()), &HeartbeatRequest::default(), None)
        .await;
    assert!(outcome.is_response(), "{outcome:?}");
}

#[tokio::test]
async fn test_unsigned_request_is_not_forwarded() {
    let (nn_key, csms_key) = (key("nn01", 2), key("csms", 3));
    let cs_key = key("cs001", 1);

    let net = chain(
        node(dispatcher(CS), forwarding(CS)),
        node(
            signed(dispatcher(NN), policy(&nn_key, &[&cs_key, &csms_key])),
            forwarding(NN),
        ),
        node(
            signed(
                builtin::register(dispatcher(CSMS), NodeRole::Csms),
                policy(&csms_key, &[&nn_key]),
            ),
            forwarding(CSMS),
        ),
    );

    let outcome = net
        .cs
        .send_request(Some(CSMS.into()), &HeartbeatRequest::default(), None)
        .await;
    match outcome {
        Outcome::RemoteError { code, .. } => assert_eq!(code, ErrorCode::SecurityError),
        other => panic!("expected a security error, got {other:?}"),
    }
    assert_eq!(net.nn.status().forwarded, 0);
}

#[tokio::test]
async fn test_untrusted_relay_is_rejected_by_csms() {
    let (cs_key, nn_key, csms_key) = (key("cs001", 1), key("nn01", 2), key("csms", 3));
    let stranger = key("stranger", 9);

    let net = chain(
        node(signed(dispatcher(CS), policy(&cs_key, &[&nn_key])), forwarding(CS)),
        node(
            signed(dispatcher(NN), policy(&nn_key, &[&cs_key, &csms_key])),
            forwarding(NN),
        ),
        node(
            signed(
                builtin::register(dispatcher(CSMS), NodeRole::Csms),
                policy(&csms_key, &[&stranger]),
            ),
            forwarding(CSMS),
        ),
    );

    let outcome = net
        .cs
        .send_request(Some(CSMS.into()), &HeartbeatRequest::default(), None)
        .await;
    assert_eq!(outcome.error_code(), Some(ErrorCode::SecurityError));
}
