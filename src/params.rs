//! Protocol constants and tuning parameters.

use std::time::Duration;

/// NDT protocol version this client declares compatibility with.
pub const NDT_VERSION_COMPAT: &str = "v3.7.0";

/// Default control port for in-clear sessions.
pub const DEFAULT_PORT: &str = "3001";

/// Default control port for TLS sessions.
pub const DEFAULT_TLS_PORT: &str = "3010";

/// Banner sent by plain-protocol servers right after login.
pub const KICKOFF: &[u8; 13] = b"123456 654321";

/// SRV_QUEUE value meaning the server is ready to run tests.
pub const QUEUE_READY: &str = "0";

/// SRV_QUEUE value meaning the server is busy and we should move on.
pub const QUEUE_BUSY: &str = "9977";

/// SRV_QUEUE value used as a keepalive while we sit in the queue.
pub const QUEUE_HEARTBEAT: &str = "9990";

/// Maximum payload of a legacy NDT record (the length field is a u16).
pub const MAX_MSG_SIZE: usize = 65535;

/// Request path used by the NDT WebSocket dialect.
pub const WS_REQUEST_PATH: &str = "/ndt_protocol";

/// GUID from RFC 6455 used to compute Sec-WebSocket-Accept.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Sec-WebSocket-Protocol value for the control connection.
pub const WS_PROTO_CONTROL: &str = "ndt";

/// Sec-WebSocket-Protocol value for upload measurement connections.
pub const WS_PROTO_C2S: &str = "c2s";

/// Sec-WebSocket-Protocol value for download measurement connections.
pub const WS_PROTO_S2C: &str = "s2c";

/// Largest WebSocket message we accept from the server.
pub const MAX_WS_MESSAGE: usize = 1 << 24;

/// Size of the scratch buffer used to drain download flows.
pub const DOWNLOAD_BUF_SIZE: usize = 1 << 17;

/// Size of the pseudorandom payload written by upload flows.
pub const UPLOAD_CHUNK_SIZE: usize = 8192;

/// Interval between throughput samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// How long we linger draining a connection that is winding down.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);
