//! HTTP extraction: one GET, body decoded as JSON.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cetl-extract";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Single-attempt fetcher. Timeouts, connect failures and non-2xx statuses
/// are all reported as errors; nothing is retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch `url` and decode the body as JSON.
    pub async fn fetch_json(&self, run_id: Uuid, url: &str) -> Result<JsonValue, FetchError> {
        let result = self.fetch_bytes(run_id, url).await.and_then(|resp| {
            let value = serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
                url: resp.final_url.clone(),
                source,
            })?;
            Ok((resp, value))
        });

        match result {
            Ok((resp, value)) => {
                info!(
                    %run_id,
                    url,
                    status = resp.status.as_u16(),
                    bytes = resp.body.len(),
                    "data extracted"
                );
                Ok(value)
            }
            Err(err) => {
                warn!(
                    %run_id,
                    url,
                    error = &err as &dyn std::error::Error,
                    "extraction failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("cetl-test".into()),
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn decodes_json_body() {
        let base = serve(Router::new().route(
            "/people",
            get(|| async {
                (
                    [("content-type", "application/json")],
                    r#"[{"id":1,"name":"Alice","age":28}]"#,
                )
            }),
        ))
        .await;

        let value = fetcher()
            .fetch_json(Uuid::new_v4(), &format!("{base}/people"))
            .await
            .expect("fetch");
        assert_eq!(value[0]["name"], "Alice");
        assert_eq!(value[0]["age"], 28);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let base = serve(Router::new().route(
            "/gone",
            get(|| async { (AxumStatus::NOT_FOUND, "nope") }),
        ))
        .await;

        let err = fetcher()
            .fetch_json(Uuid::new_v4(), &format!("{base}/gone"))
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus { status, url } => {
                assert_eq!(status, 404);
                assert!(url.ends_with("/gone"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let base = serve(Router::new().route(
            "/flaky",
            get(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "busy") }),
        ))
        .await;

        let err = fetcher()
            .fetch_json(Uuid::new_v4(), &format!("{base}/flaky"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let base = serve(Router::new().route("/bad", get(|| async { "{not json" }))).await;

        let err = fetcher()
            .fetch_json(Uuid::new_v4(), &format!("{base}/bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
        assert_eq!(
            err.to_string(),
            format!("response from {base}/bad is not valid JSON")
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = fetcher()
            .fetch_json(Uuid::new_v4(), &format!("http://{addr}/people"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
    }
}
