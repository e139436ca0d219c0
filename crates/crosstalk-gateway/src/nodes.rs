//! Remote node hosts: registration, listing, and mediated invocation.
//!
//! A node host is an ordinary WS connection that presented `node` info at
//! connect time. `node.invoke` forwards a request frame down that
//! connection and awaits the node's response frame. `system.run` invokes
//! pass through the approval allowlist and ledger first;
//! `system.execApprovals.set` is never forwarded — the approvals file is
//! owned by the gateway.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crosstalk_core::{GatewayError, Result};
use crosstalk_protocol::frames::{ReqFrame, ResFrame};
use crosstalk_protocol::handshake::NodeInfo;

const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NodeHandle {
    pub node_id: String,
    pub conn_id: String,
    pub commands: Vec<String>,
    pub display_name: Option<String>,
    /// Outbound frame queue of the node's WS connection.
    pub tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, NodeHandle>,
    pending: DashMap<String, oneshot::Sender<ResFrame>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: &NodeInfo, conn_id: &str, tx: mpsc::UnboundedSender<String>) {
        info!(node = %info.node_id, conn = %conn_id, commands = info.commands.len(), "node registered");
        self.nodes.insert(
            info.node_id.clone(),
            NodeHandle {
                node_id: info.node_id.clone(),
                conn_id: conn_id.to_string(),
                commands: info.commands.clone(),
                display_name: info.display_name.clone(),
                tx,
            },
        );
    }

    /// Drop every node registered by a closing connection.
    pub fn unregister_conn(&self, conn_id: &str) {
        self.nodes.retain(|_, handle| handle.conn_id != conn_id);
    }

    pub fn list(&self) -> Vec<Value> {
        self.nodes
            .iter()
            .map(|entry| {
                json!({
                    "nodeId": entry.node_id,
                    "connected": true,
                    "commands": entry.commands,
                    "displayName": entry.display_name,
                })
            })
            .collect()
    }

    /// Forward a command to a node and await its response.
    pub async fn invoke(&self, node_id: &str, command: &str, params: Value) -> Result<Value> {
        let invoke_id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let handle = self.nodes.get(node_id).ok_or_else(|| {
                GatewayError::Unavailable(format!("node '{node_id}' is not connected"))
            })?;
            self.pending.insert(invoke_id.clone(), reply_tx);

            let frame = ReqFrame::new(invoke_id.clone(), command, Some(params));
            let json = serde_json::to_string(&frame)?;
            if handle.tx.send(json).is_err() {
                self.pending.remove(&invoke_id);
                return Err(GatewayError::Unavailable(format!(
                    "node '{node_id}' connection is closing"
                )));
            }
        }

        let res = match tokio::time::timeout(INVOKE_TIMEOUT, reply_rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => {
                return Err(GatewayError::Unavailable(format!(
                    "node '{node_id}' disconnected mid-invoke"
                )))
            }
            Err(_) => {
                self.pending.remove(&invoke_id);
                return Err(GatewayError::Timeout {
                    what: format!("node.invoke {command}"),
                    ms: INVOKE_TIMEOUT.as_millis() as u64,
                });
            }
        };

        if res.ok {
            Ok(res.payload.unwrap_or(Value::Null))
        } else {
            let (code, message) = res
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or_else(|| ("UNKNOWN".to_string(), "node error".to_string()));
            Err(GatewayError::Unavailable(format!("{code}: {message}")))
        }
    }

    /// Route a response frame from a node connection to its waiter.
    /// Returns whether a pending invoke consumed it.
    pub fn resolve(&self, res: ResFrame) -> bool {
        match self.pending.remove(&res.id) {
            Some((_, waiter)) => {
                if waiter.send(res).is_err() {
                    warn!("invoke waiter dropped before the node answered");
                }
                true
            }
            None => false,
        }
    }
}
