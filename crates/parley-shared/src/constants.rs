/// Application name
pub const APP_NAME: &str = "Parley";

/// Maximum text message length in bytes
pub const MAX_TEXT_SIZE: usize = 16_384;

/// Maximum image payload size in bytes (10 MiB)
pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

/// Content types accepted for image payloads
pub const IMAGE_CONTENT_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp", "image/gif"];

/// A user counts as online if their last activity is within this window
pub const PRESENCE_WINDOW_SECS: i64 = 5 * 60;

/// Unanswered call invites expire after this long
pub const CALL_INVITE_EXPIRY_SECS: u64 = 30;

/// Accepted calls that never receive an explicit end are closed after this
/// long, so abandoned entries cannot accumulate
pub const CALL_MAX_DURATION_SECS: u64 = 4 * 60 * 60;

/// Clients stop sending typing pings after this much silence
pub const TYPING_TIMEOUT_SECS: u64 = 2;

/// Outbound queue depth per connected session
pub const SESSION_QUEUE_DEPTH: usize = 256;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
