/// Default HTTP/websocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 4000;

/// Per-stream bound on a pending transfer accumulator (20 MiB)
pub const MAX_TRANSFER_SIZE: usize = 20 * 1024 * 1024;

/// Maximum size of a single stored blob (20 MiB)
pub const MAX_BLOB_SIZE: usize = 20 * 1024 * 1024;

/// Delay between the visible and the silent copy of a dual push, in milliseconds
pub const DEFAULT_SILENT_PUSH_DELAY_MS: u64 = 3_000;

/// Longest edge of a generated drawing thumbnail, in pixels
pub const THUMBNAIL_SIZE: u32 = 300;

/// `data.type` values carried by push notifications
pub const NOTIFICATION_TYPE_MATCH: &str = "match";
pub const NOTIFICATION_TYPE_UNMATCH: &str = "unmatch";
pub const NOTIFICATION_TYPE_MESSAGE: &str = "message";
pub const NOTIFICATION_TYPE_COMMENT: &str = "comment";
pub const NOTIFICATION_TYPE_FRIEND_REQUEST: &str = "friend_request";
pub const NOTIFICATION_TYPE_FRIEND_REQUEST_UPDATE: &str = "friend_request_update";
