use std::sync::Arc;

use serde_json::json;

use crosstalk_core::config::{MAX_PAYLOAD_BYTES, PROTOCOL_VERSION};
use crosstalk_protocol::frames::EventFrame;
use crosstalk_protocol::handshake::{
    ClientPolicy, ConnectChallenge, HelloOk, ServerFeatures, ServerInfo,
};

use crate::app::AppState;

pub fn make_nonce() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The pre-auth challenge event, serialized for the wire.
pub fn challenge_event(nonce: &str) -> String {
    let frame = EventFrame::new(
        "connect.challenge",
        ConnectChallenge {
            nonce: nonce.to_string(),
        },
    );
    serde_json::to_string(&frame).unwrap_or_default()
}

/// The hello-ok payload returned on successful auth.
pub fn hello_ok_payload(state: &Arc<AppState>) -> HelloOk {
    HelloOk {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            name: "crosstalk".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            node_id: "gateway".to_string(),
        },
        features: ServerFeatures {
            streaming: state.config.agent.block_streaming,
            idempotent_rpc: true,
            exec_approvals: true,
            node_forwarding: true,
        },
        snapshot: json!({
            "channels": state.channels.names(),
            "nodes": state.nodes.list(),
        }),
        policy: ClientPolicy {
            max_message_size: MAX_PAYLOAD_BYTES,
            rate_limit: None,
        },
    }
}
