use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_APP_NAME: &str = "LibreTube";
const DEFAULT_TIMEOUT_SECS: u64 = 45;

/// Runtime settings for the sender, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application part of the name shown on the receiver.
    pub app_name: String,
    /// Device part of the name shown on the receiver.
    pub device_name: String,
    /// Timeout for every request except the streaming bind.
    pub request_timeout: Duration,
    /// Where the key/value store lives. `None` means the default location.
    pub state_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.into(),
            device_name: "Rust".into(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            state_file: None,
        }
    }
}

impl Config {
    /// `LOUNGE_APP_NAME`, `LOUNGE_DEVICE_NAME`, `LOUNGE_TIMEOUT_SECS`,
    /// `LOUNGE_STATE_FILE`. Unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let device_name = non_empty("LOUNGE_DEVICE_NAME")
            .or_else(|| non_empty("HOSTNAME"))
            .unwrap_or(defaults.device_name);

        let request_timeout = non_empty("LOUNGE_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        Self {
            app_name: non_empty("LOUNGE_APP_NAME").unwrap_or(defaults.app_name),
            device_name,
            request_timeout,
            state_file: non_empty("LOUNGE_STATE_FILE").map(PathBuf::from),
        }
    }

    /// Name the receiver lists for this sender, e.g. `LibreTube (Pixel 7)`.
    pub fn client_name(&self) -> String {
        format!("{} ({})", self.app_name, self.device_name)
    }
}
