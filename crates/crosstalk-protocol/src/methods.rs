// Well-known WS method names — must match operator client expectations.

// chat
pub const CHAT_SEND: &str = "chat.send";
pub const CHAT_ABORT: &str = "chat.abort";
pub const CHAT_HISTORY: &str = "chat.history";

// config
pub const CONFIG_GET: &str = "config.get";
pub const CONFIG_SET: &str = "config.set";
pub const CONFIG_PATCH: &str = "config.patch";
pub const CONFIG_APPLY: &str = "config.apply";
pub const CONFIG_SCHEMA: &str = "config.schema";

// nodes
pub const NODE_LIST: &str = "node.list";
pub const NODE_INVOKE: &str = "node.invoke";

// exec approvals
pub const EXEC_APPROVAL_REQUEST: &str = "exec.approval.request";
pub const EXEC_APPROVAL_RESOLVE: &str = "exec.approval.resolve";

// node-side commands mediated by the gateway
pub const SYSTEM_RUN: &str = "system.run";
pub const SYSTEM_EXEC_APPROVALS_SET: &str = "system.execApprovals.set";

// handshake
pub const CONNECT: &str = "connect";
