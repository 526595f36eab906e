//! Client for the external document-store collaborator.
//!
//! Out of scope as a component (spec.md §1 names the web API around it as
//! external), but the Session Manager still needs to push session records
//! and the Scraper Adapter its raw series somewhere, so this is the thin
//! write-only client, grounded on the teacher's `http.rs::sidecar_post_json`
//! shape and `original_source/report_handler.py`'s session/report document
//! layout.

use reqwest::Method;

use crate::config::AppConfig;
use crate::error::{Result, SandboxError};
use crate::http::{build_url, json_headers, send_json};
use crate::session::Session;

/// Write `session` to the document store's sessions collection, if one is
/// configured. No-op (not an error) when no base URL is configured — the
/// document store is an optional external collaborator.
pub async fn publish_session(session: &Session) -> Result<()> {
    let config = AppConfig::load();
    let Some(base_url) = &config.document_store.base_url else {
        return Ok(());
    };

    let url = build_url(base_url, "/sessions")?;
    let payload = serde_json::to_value(session)
        .map_err(|err| SandboxError::Storage(format!("serializing session: {err}")))?;
    send_json(Method::POST, url, Some(payload), json_headers()).await?;
    Ok(())
}

/// Write a raw scraper-series document, same shape as the queue's report
/// envelope, used when the scraper adapter needs to persist its bundle
/// outside the queue as well (spec.md §4.7 "as one document in the store").
pub async fn publish_document(collection: &str, payload: serde_json::Value) -> Result<()> {
    let config = AppConfig::load();
    let Some(base_url) = &config.document_store.base_url else {
        return Ok(());
    };

    let url = build_url(base_url, &format!("/{collection}"))?;
    send_json(Method::POST, url, Some(payload), json_headers()).await?;
    Ok(())
}
