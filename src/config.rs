use std::time::Duration;

use eyre::{Result, eyre};
use url::Url;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HISTORY_WINDOW: usize = 50;

/// Settings for talking to the completion endpoint.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub model: String,
    pub base_url: Url,
    pub request_timeout: Duration,
    /// Number of most recent messages replayed per request; zero replays all.
    pub history_window: usize,
}

impl ChatConfig {
    pub fn new(model: &str, base_url: &str, timeout_secs: u64, history_window: usize) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(eyre!("Model name cannot be empty"));
        }
        if timeout_secs == 0 {
            return Err(eyre!("Request timeout must be at least one second"));
        }

        Ok(Self {
            model: model.trim().to_string(),
            base_url: parse_base_url(base_url)?,
            request_timeout: Duration::from_secs(timeout_secs),
            history_window,
        })
    }

    pub fn endpoint(&self) -> Result<Url> {
        self.base_url
            .join("chat/completions")
            .map_err(|e| eyre!("Invalid completion endpoint: {}", e))
    }
}

// `Url::join` replaces the last path segment unless the base ends in '/'.
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).map_err(|e| eyre!("Invalid base URL '{}': {}", raw, e))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(eyre!("Base URL must use http or https: {}", raw));
    }

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_version_segment() {
        let config = ChatConfig::new("gpt-3.5-turbo", "https://api.openai.com/v1", 30, 10).unwrap();
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn default_points_at_openai() {
        let config = ChatConfig::new(
            DEFAULT_MODEL,
            DEFAULT_BASE_URL,
            DEFAULT_TIMEOUT_SECS,
            DEFAULT_HISTORY_WINDOW,
        )
        .unwrap();
        assert_eq!(config.model, "gpt-3.5-turbo");
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(ChatConfig::new("", DEFAULT_BASE_URL, 30, 10).is_err());
        assert!(ChatConfig::new("gpt", DEFAULT_BASE_URL, 0, 10).is_err());
        assert!(ChatConfig::new("gpt", "ftp://example.com/", 30, 10).is_err());
        assert!(ChatConfig::new("gpt", "not a url", 30, 10).is_err());
    }
}
