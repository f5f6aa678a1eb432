use reqwest::Client;
use std::time::Duration;

/// Builds a client whose every request is bounded by `timeout`.
pub fn build_client(timeout: Duration, connect: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client for calls whose deadline is enforced by the caller (polling loops, streamed bodies).
pub fn build_unbounded_client(connect: Duration) -> Client {
    Client::builder()
        .connect_timeout(connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}
