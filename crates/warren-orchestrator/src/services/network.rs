//! Built-in `network` service.
//!
//! One method, `fetch(url, options?)`, backed by a shared `reqwest` client.
//! Responses are fully buffered, size-capped, and returned as
//! `{status, statusText, headers, body}` with the body decoded as UTF-8
//! (lossy) text.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{ServiceContext, ServiceError, ServiceHandler};

/// Ceiling on a buffered response body.
pub const MAX_FETCH_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Whole-request timeout applied to every fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound HTTP for workers.
pub struct NetworkService {
    client: reqwest::Client,
}

impl NetworkService {
    /// Build the service and its shared HTTP client.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Internal`] when the client cannot be constructed.
    pub fn new() -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

impl std::fmt::Debug for NetworkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkService").finish_non_exhaustive()
    }
}

/// Optional second argument to `fetch`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FetchOptions {
    method: Option<String>,
    headers: BTreeMap<String, String>,
    body: Option<String>,
}

/// Validate and split the `fetch` argument array.
fn parse_fetch_args(args: &[Value]) -> Result<(String, FetchOptions), ServiceError> {
    let url = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::invalid_args("fetch", "expected a URL string as first argument"))?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ServiceError::invalid_args(
            "fetch",
            "only http and https URLs are supported",
        ));
    }
    let options = match args.get(1) {
        None | Some(Value::Null) => FetchOptions::default(),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| ServiceError::invalid_args("fetch", format!("bad options object: {e}")))?,
    };
    Ok((url.to_string(), options))
}

#[async_trait::async_trait]
impl ServiceHandler for NetworkService {
    async fn call(
        &self,
        _ctx: &ServiceContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value, ServiceError> {
        if method != "fetch" {
            return Err(ServiceError::UnknownMethod {
                service: "network".to_string(),
                method: method.to_string(),
            });
        }
        let (url, options) = parse_fetch_args(args)?;

        let http_method = match options.method.as_deref() {
            None => reqwest::Method::GET,
            Some(name) => reqwest::Method::from_bytes(name.to_uppercase().as_bytes())
                .map_err(|_| ServiceError::invalid_args("fetch", format!("bad method `{name}`")))?,
        };

        let mut request = self.client.request(http_method, &url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = options.body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| ServiceError::Fetch {
            reason: e.to_string(),
        })?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        if let Some(length) = response.content_length() {
            if length as usize > MAX_FETCH_BODY_BYTES {
                return Err(ServiceError::Fetch {
                    reason: format!(
                        "response body is {length} bytes, maximum is {MAX_FETCH_BODY_BYTES}"
                    ),
                });
            }
        }

        let mut body = Vec::new();
        let mut stream = response;
        while let Some(chunk) = stream.chunk().await.map_err(|e| ServiceError::Fetch {
            reason: e.to_string(),
        })? {
            if body.len() + chunk.len() > MAX_FETCH_BODY_BYTES {
                return Err(ServiceError::Fetch {
                    reason: format!("response body exceeds {MAX_FETCH_BODY_BYTES} bytes"),
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(json!({
            "status": status.as_u16(),
            "statusText": status.canonical_reason().unwrap_or(""),
            "headers": headers,
            "body": String::from_utf8_lossy(&body).into_owned(),
        }))
    }
}
