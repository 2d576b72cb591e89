use std::time::Duration;

use anyhow::{Context, Result};

/// Every outbound call (LLM, image, remote archive) goes through a client with an
/// explicit timeout so a hung upstream can only stall one turn for a bounded time.
pub fn build_http_client_with_timeout(timeout: Duration) -> Result<reqwest::Client> {
    let allow_system_proxy = std::env::var("DUOLOGUE_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(timeout, false) {
            Ok(client) => return Ok(client),
            Err(error) => tracing::warn!(
                "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                error
            ),
        }
    }

    attempt_build(timeout, true).context("Failed to initialize HTTP client")
}

fn attempt_build(timeout: Duration, no_proxy: bool) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(concat!("duologue/", env!("CARGO_PKG_VERSION")));
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
