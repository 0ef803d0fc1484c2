use std::sync::Arc;
use std::time::Duration;

use ocpp_node::binary::BinaryFormat;
use ocpp_node::dispatch::{Dispatcher, DispatcherBuilder};
use ocpp_node::envelope::WireFrame;
use ocpp_node::forwarding::{ForwardingEngine, ForwardingEngineBuilder};
use ocpp_node::node::{FrameSink, MessageSink, NetworkingNode, NodeOptions};
use ocpp_node::ocpp::MessageCatalog;
use ocpp_node::signatures::SignaturePolicy;
use tokio::sync::mpsc::UnboundedReceiver;

pub const CS: &str = "CS001";
pub const NN: &str = "NN01";
pub const CSMS: &str = "CSMS";

pub fn dispatcher(id: &str) -> DispatcherBuilder {
    Dispatcher::builder(id.into(), Arc::new(MessageCatalog::standard()))
}

pub fn forwarding(id: &str) -> ForwardingEngineBuilder {
    ForwardingEngine::builder(id.into())
}

pub fn node(dispatcher: DispatcherBuilder, forwarding: ForwardingEngineBuilder) -> Arc<NetworkingNode> {
    node_with(dispatcher, forwarding, NodeOptions {
        request_timeout: Duration::from_secs(2),
        relay_timeout: Duration::from_secs(2),
    })
}

pub fn node_with(
    dispatcher: DispatcherBuilder,
    forwarding: ForwardingEngineBuilder,
    options: NodeOptions,
) -> Arc<NetworkingNode> {
    NetworkingNode::new(dispatcher.build(), forwarding.build(), options)
}

pub fn signed(builder: DispatcherBuilder, policy: impl SignaturePolicy + 'static) -> DispatcherBuilder {
    builder.signatures(Arc::new(policy))
}

fn pump(mut rx: UnboundedReceiver<WireFrame>, to: Arc<NetworkingNode>, reply: Arc<dyn MessageSink>) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            to.spawn_frame(reply.clone(), frame);
        }
    });
}

/// Connect `a` and `b`; returns the sinks `a -> b` and `b -> a`.
pub fn link(a: &Arc<NetworkingNode>, b: &Arc<NetworkingNode>) -> (Arc<dyn MessageSink>, Arc<dyn MessageSink>) {
    let (a_to_b, a_rx) = FrameSink::new(BinaryFormat::Extensible);
    let (b_to_a, b_rx) = FrameSink::new(BinaryFormat::Compact);
    let a_to_b: Arc<dyn MessageSink> = Arc::new(a_to_b);
    let b_to_a: Arc<dyn MessageSink> = Arc::new(b_to_a);

    pump(a_rx, b.clone(), b_to_a.clone());
    pump(b_rx, a.clone(), a_to_b.clone());
    (a_to_b, b_to_a)
}

pub struct Chain {
    pub cs: Arc<NetworkingNode>,
    pub nn: Arc<NetworkingNode>,
    pub csms: Arc<NetworkingNode>,
}

/// CS001 <-> NN01 <-> CSMS, with CS001 using NN01 as its uplink.
pub fn chain(cs: Arc<NetworkingNode>, nn: Arc<NetworkingNode>, csms: Arc<NetworkingNode>) -> Chain {
    let (cs_to_nn, nn_to_cs) = link(&cs, &nn);
    let (nn_to_csms, csms_to_nn) = link(&nn, &csms);

    cs.set_uplink(cs_to_nn);
    nn.connect(CS.into(), nn_to_cs);
    nn.connect(CSMS.into(), nn_to_csms);
    csms.set_uplink(csms_to_nn);

    Chain { cs, nn, csms }
}
