//! Reserved field keys
//!
//! Every message carries `timestamp`, `source`, and `route`. The remaining
//! constants name the fields that built-in sources and processors emit, so
//! drivers and tests don't scatter string literals.

/// ISO-8601 UTC timestamp, stamped at message creation
pub const TIMESTAMP: &str = "timestamp";

/// URI of the originating endpoint
pub const SOURCE: &str = "source";

/// Name of the route the message is flowing through
pub const ROUTE: &str = "route";

/// The message body: what sinks write and `transform` produces
pub const BODY: &str = "body";

/// Monotone counter emitted by the timer source
pub const TICK_ID: &str = "tick_id";

/// Filesystem path (file source)
pub const PATH: &str = "path";

/// File size in bytes (file source)
pub const SIZE: &str = "size";

/// Raw file content, base64-encoded (file source)
pub const CONTENT_BYTES: &str = "content_bytes";

/// File content as UTF-8, present only when the bytes decode cleanly
pub const CONTENT_UTF8: &str = "content_utf8_if_valid";

/// HTTP request method (http source)
pub const METHOD: &str = "method";

/// HTTP request headers as a string map (http source)
pub const HEADERS: &str = "headers";

/// MQTT topic the payload arrived on (mqtt source)
pub const TOPIC: &str = "topic";

/// MQTT payload (mqtt source)
pub const PAYLOAD: &str = "payload";

/// MQTT quality-of-service level (mqtt source)
pub const QOS: &str = "qos";

/// Number of messages in an aggregate window
pub const COUNT: &str = "count";

/// Timestamp of the first message in an aggregate window
pub const WINDOW_START: &str = "window_start";

/// Timestamp at which an aggregate window was closed
pub const WINDOW_END: &str = "window_end";

/// The buffered messages of an aggregate window, in arrival order
pub const ITEMS: &str = "items";

/// Value of the `group_by` key for a grouped aggregate window
pub const GROUP: &str = "group";
