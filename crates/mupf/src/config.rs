//! # Configuration
//!
//! Settings for an [`App`](crate::App): where to listen, which features to
//! request, and how long to wait for a page.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::features::Features;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 57107;

pub const ENV_HOST: &str = "MUPF_HOST";
pub const ENV_PORT: &str = "MUPF_PORT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    /// `0` lets the OS pick a free port.
    pub port: u16,
    pub charset: String,
    pub features: Features,
    /// Launch the default browser at every summoned session's URL.
    pub open_browser: bool,
    /// How long `summon_session` waits for the page to connect.
    pub connect_timeout: Duration,
    /// How long `Session::close` waits for the page to acknowledge `*last*`.
    pub close_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            charset: "utf-8".to_string(),
            features: Features::default(),
            open_browser: false,
            connect_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overridden by `MUPF_HOST` and `MUPF_PORT` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var(ENV_HOST) {
            config.host = host;
        }
        if let Ok(port) = std::env::var(ENV_PORT) {
            config.port = port
                .trim()
                .parse()
                .map_err(|e| Error::InvalidArgument(format!("{}={:?}: {}", ENV_PORT, port, e)))?;
        }
        Ok(config)
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    /// Switches one feature. Fails for user names not starting with `_`.
    pub fn feature(mut self, name: &str, on: bool) -> Result<Self> {
        self.features.set(name, on)?;
        Ok(self)
    }

    pub fn open_browser(mut self, open: bool) -> Self {
        self.open_browser = open;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}
