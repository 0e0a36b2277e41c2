//! Shared HTTP client with retry and backoff.
//!
//! One [`HttpClient`] is built from the `[http]` config section and handed to
//! every connector and to the Elasticsearch store. It wraps a
//! `reqwest::Client` (timeout, user agent, certificate policy) and retries
//! transient failures:
//!
//! - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, ...)
//! - other HTTP 4xx → fail immediately
//! - network errors → retry

use std::time::Duration;

use harvest_core::{HarvestError, Result};
use reqwest::{RequestBuilder, Response};

use crate::config::HttpConfig;

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    max_retries: u32,
    retry_base: Duration,
}

impl HttpClient {
    pub fn from_config(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| HarvestError::Http(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Override the first backoff delay; later delays double from it.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send the request produced by `build`, retrying transient failures.
    ///
    /// `build` is called once per attempt since a `RequestBuilder` cannot be
    /// reused after `send`.
    pub async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.retry_base * (1u32 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, "retrying request");
                tokio::time::sleep(delay).await;
            }

            match build(&self.client).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let url = response.url().to_string();
                    let body = response.text().await.unwrap_or_default();
                    let err = HarvestError::Http(format!("{} returned {}: {}", url, status, body));

                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%url, %status, "transient HTTP error");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "HTTP request failed");
                    last_err = Some(HarvestError::Http(e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| HarvestError::Http("request failed after retries".into())))
    }

    /// GET `url` with query `params` and return the body as text.
    pub async fn get_text(&self, url: &str, params: &[(&str, String)]) -> Result<String> {
        tracing::debug!(url, ?params, "GET");
        let response = self.send(|c| c.get(url).query(params)).await?;
        response
            .text()
            .await
            .map_err(|e| HarvestError::Http(format!("cannot read body of {}: {}", url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(max_retries: u32) -> HttpClient {
        let cfg = HttpConfig {
            max_retries,
            ..HttpConfig::default()
        };
        HttpClient::from_config(&cfg)
            .unwrap()
            .with_retry_base(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/flaky",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        (StatusCode::SERVICE_UNAVAILABLE, "busy".to_string())
                    } else {
                        (StatusCode::OK, "done".to_string())
                    }
                }),
            )
            .with_state(hits.clone());
        let base = serve(app).await;

        let body = client(3)
            .get_text(&format!("{}/flaky", base), &[])
            .await
            .unwrap();
        assert_eq!(body, "done");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/missing",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NOT_FOUND
                }),
            )
            .with_state(hits.clone());
        let base = serve(app).await;

        let err = client(3)
            .get_text(&format!("{}/missing", base), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Http(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/down",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }),
            )
            .with_state(hits.clone());
        let base = serve(app).await;

        assert!(client(2)
            .get_text(&format!("{}/down", base), &[])
            .await
            .is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
