//! Fault-injecting HTTP client.
//!
//! Wraps a `reqwest::Client` and, per request, may sleep before delegating
//! and may rewrite a successful response's status to 500 after delegating.
//! Request bodies are never touched, nothing is retried, and the injected
//! sleep aborts as soon as the owning scope is cancelled.

use crate::config::ChaosConfig;
use anyhow::{bail, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct ChaosHttpClient {
    client: reqwest::Client,
    chaos: ChaosConfig,
    cancel: CancellationToken,
    rng: Mutex<SmallRng>,
}

/// A fully read response. Captured eagerly so the status can be rewritten
/// while body and headers stay intact.
#[derive(Debug)]
pub struct ChaosResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: bytes::Bytes,
}

impl ChaosResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl ChaosHttpClient {
    pub fn new(timeout: Duration, chaos: ChaosConfig, cancel: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let seed = rand::thread_rng().gen();
        Ok(Self {
            client,
            chaos,
            cancel,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        })
    }

    /// The underlying client, for building requests to pass to [`execute`].
    ///
    /// [`execute`]: Self::execute
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn execute(&self, request: reqwest::RequestBuilder) -> Result<ChaosResponse> {
        if let Some(delay) = self.draw_delay() {
            debug!(delay_ms = delay.as_millis() as u64, "chaos: delaying request");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => bail!("request cancelled during injected delay"),
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        let status = if self.draw_error() {
            debug!("chaos: rewriting response to 500");
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            status
        };

        Ok(ChaosResponse {
            status,
            headers,
            body,
        })
    }

    fn draw_delay(&self) -> Option<Duration> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        if self.chaos.max_delay_ms > 0 && rng.gen::<f64>() < self.chaos.delay_rate {
            Some(Duration::from_millis(rng.gen_range(0..self.chaos.max_delay_ms)))
        } else {
            None
        }
    }

    fn draw_error(&self) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen::<f64>() < self.chaos.error_rate
    }
}
