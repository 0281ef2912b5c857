use std::env;

use url::Url;

use crate::error::LtiError;

/// Hardcoded production default for the Kialo tool
pub const DEFAULT_TOOL_URL: &str = "https://www.kialo-edu.com";

/// Environment variable that overrides the tool URL when no admin value is set
pub const TOOL_URL_ENV: &str = "KIALO_TOOL_URL";

/// Configuration for the LTI platform
#[derive(Debug, Clone)]
pub struct Config {
    /// Public base URL of this platform, used as the `iss` of every token
    pub platform_url: String,
    /// Display name of the platform
    pub platform_name: String,
    /// Admin-configured tool URL; takes precedence over the environment override
    pub admin_tool_url: Option<String>,
    /// OAuth2 client id the tool is registered under
    pub client_id: String,
    /// Shared secret for the tool backend's client-credentials grant
    pub client_secret: String,
    /// Path to the SQLite database
    pub db_path: String,
    /// Port the platform service listens on
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform_url: "http://127.0.0.1:3000".to_string(),
            platform_name: "Kialo LTI Platform".to_string(),
            admin_tool_url: None,
            client_id: "kialo-tool".to_string(),
            client_secret: "kialo-tool-secret".to_string(),
            db_path: "storage.db".to_string(),
            port: 3000,
        }
    }
}

impl Config {
    /// Create a configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            platform_url: env::var("PLATFORM_URL").unwrap_or(defaults.platform_url),
            platform_name: env::var("PLATFORM_NAME").unwrap_or(defaults.platform_name),
            admin_tool_url: None,
            client_id: env::var("LTI_CLIENT_ID").unwrap_or(defaults.client_id),
            client_secret: env::var("LTI_CLIENT_SECRET").unwrap_or(defaults.client_secret),
            db_path: env::var("DB_PATH").unwrap_or(defaults.db_path),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    /// Resolve the external tool's base URL.
    ///
    /// Precedence: admin-configured URL, then the `KIALO_TOOL_URL` environment
    /// override, then the production default. The result is validated as an
    /// absolute http(s) URL and normalized to have no trailing slash.
    pub fn tool_url(&self) -> Result<String, LtiError> {
        resolve_tool_url(
            self.admin_tool_url.as_deref(),
            env::var(TOOL_URL_ENV).ok().as_deref(),
        )
    }
}

fn resolve_tool_url(
    admin_url: Option<&str>,
    env_url: Option<&str>,
) -> Result<String, LtiError> {
    let candidate = admin_url.or(env_url).unwrap_or(DEFAULT_TOOL_URL);

    let parsed = Url::parse(candidate)
        .map_err(|e| LtiError::Configuration(format!("invalid tool URL {candidate:?}: {e}")))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(LtiError::Configuration(format!(
            "tool URL {candidate:?} must use http or https"
        )));
    }
    if parsed.host_str().is_none() {
        return Err(LtiError::Configuration(format!(
            "tool URL {candidate:?} has no host"
        )));
    }

    Ok(candidate.trim_end_matches('/').to_string())
}
