use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RemoteErrorDetail, SyncError};

pub type Query = Vec<(String, String)>;

/// Read access to the remote catalog.
pub trait CatalogClient: Send + Sync {
    /// GET `path` (relative to the configured base URL) and parse the body as JSON.
    fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value, SyncError>;
}

impl<C: CatalogClient + ?Sized> CatalogClient for &C {
    fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value, SyncError> {
        (**self).get(path, query)
    }
}

static SHARED_CLIENT: OnceLock<Client> = OnceLock::new();

/// Process-wide pooled client, built on first use.
fn shared_client() -> Result<Client, SyncError> {
    if let Some(client) = SHARED_CLIENT.get() {
        return Ok(client.clone());
    }
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("nvdb-sync/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SyncError::Http(err.to_string()))?,
    );
    let client = Client::builder()
        .default_headers(headers)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|err| SyncError::Http(err.to_string()))?;
    Ok(SHARED_CLIENT.get_or_init(|| client).clone())
}

#[derive(Clone)]
pub struct CatalogHttpClient {
    client: Client,
    base_url: String,
    headers: HeaderMap,
    max_response_bytes: u64,
}

impl CatalogHttpClient {
    pub fn new(config: &Config) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| SyncError::Configuration(format!("header {name}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| SyncError::Configuration(format!("header value: {err}")))?;
            headers.insert(name, value);
        }
        Ok(Self {
            client: shared_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers,
            max_response_bytes: config.max_response_bytes,
        })
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, SyncError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 5;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req()
                .send()
                .map_err(|err| SyncError::Http(err.to_string()))?;
            let status = response.status().as_u16();
            if attempt < MAX_RETRIES && is_retryable_status(status) {
                let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                debug!(status, attempt, "retrying catalog request");
                thread::sleep(Duration::from_millis(delay));
                attempt += 1;
                continue;
            }
            return Ok(response);
        }
    }

    fn handle_status(response: Response, url: &str) -> Result<Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(parse_error_body(status, &body, url))
    }

    fn read_json(&self, response: Response) -> Result<Value, SyncError> {
        let limit = self.max_response_bytes;
        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        if let Some(bytes) = declared.filter(|bytes| *bytes > limit) {
            return Err(SyncError::MemoryPressure { bytes, limit });
        }
        let body = response
            .bytes()
            .map_err(|err| SyncError::Http(err.to_string()))?;
        if body.len() as u64 > limit {
            return Err(SyncError::MemoryPressure {
                bytes: body.len() as u64,
                limit,
            });
        }
        serde_json::from_slice(&body).map_err(|err| SyncError::UnexpectedResponse(err.to_string()))
    }
}

impl CatalogClient for CatalogHttpClient {
    fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value, SyncError> {
        let url = self.url(path);
        debug!(%url, ?query, "catalog request");
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .headers(self.headers.clone())
                .query(query)
        })?;
        let response = Self::handle_status(response, &url)?;
        self.read_json(response)
    }
}

/// Join a base URL and a catalog path, tolerating absolute paths and full URLs.
pub fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        format!("{base}/")
    } else {
        format!("{base}/{path}")
    }
}

/// Turn a non-success body into a typed error, logging structured details.
pub fn parse_error_body(status: u16, body: &str, url: &str) -> SyncError {
    let errors = serde_json::from_str::<Vec<RemoteErrorDetail>>(body)
        .ok()
        .filter(|errors| {
            !errors.is_empty()
                && errors
                    .iter()
                    .all(|err| err.code.is_some() || err.message.is_some())
        });
    match errors {
        Some(errors) => {
            warn!(status, %url, "catalog API call failed");
            for error in &errors {
                warn!(code = ?error.code, message = ?error.message, "catalog error");
            }
            SyncError::RemoteApi { status, errors }
        }
        None => SyncError::Status {
            status,
            message: body.to_string(),
        },
    }
}

fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn join_handles_slashes() {
        assert_eq!(join_url("http://h/api/", "/vegobjekter/105"), "http://h/api/vegobjekter/105");
        assert_eq!(join_url("http://h/api", "vegobjekter"), "http://h/api/vegobjekter");
        assert_eq!(join_url("http://h/api", "/"), "http://h/api/");
        assert_eq!(join_url("http://h/api", "https://other/x"), "https://other/x");
    }

    #[test]
    fn structured_error_body_becomes_remote_api_error() {
        let body = r#"[{"code": 4005, "message": "Objekttype finnes ikke"}]"#;
        let err = parse_error_body(404, body, "http://h/x");
        assert_matches!(err, SyncError::RemoteApi { status: 404, ref errors } if errors.len() == 1);
    }

    #[test]
    fn unstructured_error_body_keeps_text() {
        let err = parse_error_body(400, "bad request", "http://h/x");
        assert_matches!(err, SyncError::Status { status: 400, ref message } if message == "bad request");
    }

    #[test]
    fn only_server_errors_are_retried() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(429));
    }
}
