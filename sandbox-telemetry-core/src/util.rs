use once_cell::sync::OnceCell;
use reqwest::Client;
use std::time::Duration;

use crate::error::{Result, SandboxError};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared HTTP client used by the scraper adapter and the document-store client.
/// Built once with a 30s timeout and reused for all subsequent calls.
pub fn http_client() -> Result<&'static Client> {
    HTTP_CLIENT
        .get_or_try_init(|| {
            Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|err| SandboxError::Http(format!("failed to build HTTP client: {err}")))
        })
        .map(|c| c)
}

/// Parse a string as a JSON object, rejecting anything else (arrays, scalars).
pub fn parse_json_object(value: &str, field_name: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::Map::new());
    }
    let parsed: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|err| SandboxError::Validation(format!("{field_name} is not valid JSON: {err}")))?;
    match parsed {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(SandboxError::Validation(format!(
            "{field_name} must be a JSON object"
        ))),
    }
}

/// Round a unix timestamp (seconds) down to the nearest multiple of `step_s`.
pub fn round_down_to(ts_s: u64, step_s: u64) -> u64 {
    if step_s == 0 {
        return ts_s;
    }
    ts_s - (ts_s % step_s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_down_to_rounds_to_multiple() {
        assert_eq!(round_down_to(95, 30), 90);
        assert_eq!(round_down_to(90, 30), 90);
        assert_eq!(round_down_to(29, 30), 0);
    }

    #[test]
    fn parse_json_object_rejects_arrays() {
        let err = parse_json_object("[1,2,3]", "build_args").unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[test]
    fn parse_json_object_allows_empty() {
        let map = parse_json_object("", "build_args").unwrap();
        assert!(map.is_empty());
    }
}
