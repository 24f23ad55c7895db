//! Shared upstream HTTP clients.
//!
//! One pooled client per TLS-verification mode; reqwest keeps per-host
//! connection pools underneath. Timeouts are applied per request phase by the
//! callers, not on the client builder.

use std::time::Duration;

use anyhow::Result;
use reqwest::Client;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 8;

pub struct HttpClientPool {
    verified: Client,
    insecure: Client,
}

impl HttpClientPool {
    pub fn new() -> Result<Self> {
        Ok(Self {
            verified: builder().build()?,
            insecure: builder().danger_accept_invalid_certs(true).build()?,
        })
    }

    pub fn get(&self, verify_ssl: bool) -> &Client {
        if verify_ssl {
            &self.verified
        } else {
            &self.insecure
        }
    }
}

fn builder() -> reqwest::ClientBuilder {
    Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
}
