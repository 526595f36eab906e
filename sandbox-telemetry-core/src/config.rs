//! Process-wide configuration loaded once from the environment.
//!
//! Mirrors the teacher's `SidecarRuntimeConfig::load()` idiom: a single
//! `OnceCell`, environment variables read with sensible defaults, no
//! reloading at runtime.

use std::env;
use std::path::PathBuf;

use once_cell::sync::OnceCell;

static STATE_DIR: OnceCell<PathBuf> = OnceCell::new();

/// Where session/sandbox JSON documents are persisted. `SANDBOX_STATE_DIR`,
/// defaulting to `./state`.
pub fn state_dir() -> &'static PathBuf {
    STATE_DIR.get_or_init(|| {
        let dir = env::var("SANDBOX_STATE_DIR").unwrap_or_else(|_| "./state".to_string());
        PathBuf::from(dir)
    })
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub url: String,
    pub queue_name: String,
    pub publish_interval_s: f64,
}

#[derive(Clone, Debug)]
pub struct ScraperConfig {
    pub base_url: Option<String>,
    pub lookback_s: u64,
    pub step_s: u64,
}

#[derive(Clone, Debug)]
pub struct DocumentStoreConfig {
    pub base_url: Option<String>,
}

/// Top-level ambient configuration, assembled once from the environment.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub scraper: ScraperConfig,
    pub document_store: DocumentStoreConfig,
}

static APP_CONFIG: OnceCell<AppConfig> = OnceCell::new();

impl AppConfig {
    pub fn load() -> &'static AppConfig {
        APP_CONFIG.get_or_init(|| AppConfig {
            queue: QueueConfig {
                url: env::var("QUEUE_URL").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string()),
                queue_name: env::var("QUEUE_NAME").unwrap_or_else(|_| "BenchmarkerReports".to_string()),
                publish_interval_s: env::var("REPORT_PUBLISH_INTERVAL_S")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.5),
            },
            scraper: ScraperConfig {
                base_url: env::var("SCRAPER_BASE_URL").ok(),
                lookback_s: env::var("SCRAPER_LOOKBACK_S")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
                step_s: env::var("SCRAPER_STEP_S")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2),
            },
            document_store: DocumentStoreConfig {
                base_url: env::var("DOCUMENT_STORE_BASE_URL").ok(),
            },
        })
    }
}
