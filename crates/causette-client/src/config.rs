//! Client configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can start with zero
//! configuration for local development.

use std::time::Duration;

use causette_net::Platform;
use causette_shared::constants::TYPING_WINDOW;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Freshness window for typing indicators.  A typing timestamp older
    /// than this is treated as stale, and the auto-expiry timer clears the
    /// local user's indicator after this long without a keystroke.
    /// Env: `TYPING_WINDOW_MS`
    /// Default: 5000
    pub typing_window: Duration,

    /// Platform this client registers push tokens for.
    /// Env: `PUSH_PLATFORM` (`web` / `webview`)
    /// Default: `web`
    pub platform: Platform,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            typing_window: TYPING_WINDOW,
            platform: Platform::Web,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TYPING_WINDOW_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.typing_window = Duration::from_millis(ms),
                _ => {
                    tracing::warn!(
                        value = %val,
                        "Invalid TYPING_WINDOW_MS, using default"
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("PUSH_PLATFORM") {
            match parse_platform(&val) {
                Some(platform) => config.platform = platform,
                None => {
                    tracing::warn!(
                        value = %val,
                        "Invalid PUSH_PLATFORM, using default"
                    );
                }
            }
        }

        config
    }
}

fn parse_platform(value: &str) -> Option<Platform> {
    match value.trim().to_ascii_lowercase().as_str() {
        "web" => Some(Platform::Web),
        "webview" => Some(Platform::WebView),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.typing_window, Duration::from_millis(5_000));
        assert_eq!(config.platform, Platform::Web);
    }

    #[test]
    fn test_parse_platform() {
        assert_eq!(parse_platform("web"), Some(Platform::Web));
        assert_eq!(parse_platform(" WebView "), Some(Platform::WebView));
        assert_eq!(parse_platform("android"), None);
    }
}
