//! Thin JSON HTTP helpers shared by collaborators that speak to an external
//! HTTP service (the document store). Kept close to the teacher's
//! `http.rs` — `build_url` + `send_json` — since neither the request shape
//! nor the error handling needs anything more here.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;

use crate::error::{Result, SandboxError};
use crate::util::http_client;

pub fn build_url(base: &str, path: &str) -> Result<Url> {
    let base_url = Url::parse(base).map_err(|err| SandboxError::Http(format!("invalid base URL: {err}")))?;
    base_url
        .join(path)
        .map_err(|err| SandboxError::Http(format!("invalid path '{path}': {err}")))
}

pub fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

pub async fn send_json(method: Method, url: Url, body: Option<Value>, headers: HeaderMap) -> Result<(StatusCode, String)> {
    let client = http_client()?;
    let mut request = client.request(method, url).headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request
        .send()
        .await
        .map_err(|err| SandboxError::Http(format!("request failed: {err}")))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| SandboxError::Http(format!("reading response body: {err}")))?;

    if !status.is_success() {
        return Err(SandboxError::Http(format!("HTTP {status}: {text}")));
    }

    Ok((status, text))
}
