//! Standard message `type` vocabulary, grouped by channel

// Events
pub const EMIT_EVENT: &str = "emit_event";
pub const EVENT_ACK: &str = "event_ack";

// State
pub const STATE_UPDATE: &str = "state_update";
pub const STATE_REQUEST: &str = "state_request";
pub const STATE_RESPONSE: &str = "state_response";
pub const STATE_CONFLICT: &str = "state_conflict";

// Presence
pub const PRESENCE_JOIN: &str = "presence_join";
pub const PRESENCE_LEAVE: &str = "presence_leave";
pub const PRESENCE_UPDATE: &str = "presence_update";
pub const PRESENCE_LIST: &str = "presence_list";

// Cursor
pub const CURSOR_MOVE: &str = "cursor_move";
pub const CURSOR_HIDE: &str = "cursor_hide";

// Debug
pub const TRACE: &str = "trace";
pub const LOG: &str = "log";
pub const ERROR: &str = "error";

// System
pub const HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";

// Pipeline
pub const PIPELINE_UPDATE: &str = "pipeline_update";
pub const PIPELINE_EXECUTE: &str = "pipeline_execute";

// AI
pub const AI_REQUEST: &str = "ai_request";
pub const AI_RESPONSE: &str = "ai_response";
pub const AI_STREAM: &str = "ai_stream";

// Permissions
pub const PERMISSION_REQUEST: &str = "permission_request";
pub const PERMISSION_APPROVED: &str = "permission_approved";
pub const PERMISSION_DENIED: &str = "permission_denied";
pub const PERMISSION_REVOKED: &str = "permission_revoked";
pub const PERMISSION_CHECK: &str = "permission_check";
