//! Default values shared by listeners and clients

/// Connection-level defaults
pub mod connection {
    /// Kernel send/receive buffer size requested for each socket
    pub const SOCKET_BUFFER_SIZE: usize = 8192;

    /// Initial capacity of the receive carry-over buffer
    pub const MESSAGE_BUFFER_SIZE: usize = 4096;

    /// Largest accepted frame, length prefix included (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Packets allowed to wait in one connection's send queue
    pub const MAX_PENDING_PACKETS: usize = 4096;
}

/// Listener defaults
pub mod listener {
    pub const BIND_ADDRESS: &str = "127.0.0.1:8500";

    pub const MAX_CONNECTIONS: usize = 20_000;
}

/// Client defaults
pub mod client {
    /// Upper bound on live connections a client keeps
    pub const MAX_CONNECTIONS: usize = 64;

    /// Time a request may wait for a connection, retries included (milliseconds)
    pub const SEND_TIMEOUT_MS: u64 = 3_000;

    /// Time a sent request may wait for its reply (milliseconds)
    pub const RECEIVE_TIMEOUT_MS: u64 = 3_000;

    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Pending-send sweep period (milliseconds)
    pub const PENDING_SWEEP_INTERVAL_MS: u64 = 500;

    /// In-flight receive-timeout sweep period (milliseconds)
    pub const IN_FLIGHT_SWEEP_INTERVAL_MS: u64 = 1_000;
}

/// Reconnect backoff defaults (milliseconds)
pub mod backoff {
    /// Jitter window applied after an established connection drops
    pub const AFTER_DROP_MIN_MS: u64 = 100;
    pub const AFTER_DROP_MAX_MS: u64 = 1_500;

    /// Jitter window applied after a connect attempt fails
    pub const AFTER_FAILURE_MIN_MS: u64 = 1_000;
    pub const AFTER_FAILURE_MAX_MS: u64 = 3_000;
}
