use std::collections::HashSet;

use tracing::debug;

use crate::config::Config;
use crate::error::LtiError;
use crate::key_store::{KeyChain, PublicJwk};

/// Registration identifier of the single Kialo tool registration
pub const REGISTRATION_ID: &str = "kialo";

/// Platform-side identifiers and endpoints of a registration
#[derive(Debug, Clone)]
pub struct PlatformDetails {
    pub id: String,
    pub name: String,
    pub audience: String,
    pub oidc_auth_url: String,
    pub token_url: String,
}

/// Tool-side identifiers and endpoints of a registration
#[derive(Debug, Clone)]
pub struct ToolDetails {
    pub id: String,
    pub name: String,
    pub audience: String,
    pub login_url: String,
    pub launch_url: String,
    pub deeplink_url: String,
}

/// An LTI registration binding this platform to the Kialo tool.
///
/// Constructed fresh on every request from configuration; never stored.
#[derive(Debug, Clone)]
pub struct Registration {
    pub identifier: String,
    pub client_id: String,
    pub platform: PlatformDetails,
    pub tool: ToolDetails,
    pub deployment_ids: HashSet<String>,
    pub platform_keychain: KeyChain,
    pub tool_keychain: Option<KeyChain>,
    pub platform_jwks_url: String,
    pub tool_jwks_url: String,
}

impl Registration {
    pub fn has_deployment(&self, deployment_id: &str) -> bool {
        self.deployment_ids.contains(deployment_id)
    }

    /// Resolve the tool's public key for a key ID.
    ///
    /// Uses the registration's tool keychain when one is present, otherwise
    /// fetches the tool's published JWKS.
    pub async fn tool_public_key(&self, kid: &str) -> Result<PublicJwk, LtiError> {
        if let Some(keychain) = &self.tool_keychain {
            if keychain.public_key.kid == kid {
                return Ok(keychain.public_key.clone());
            }
        }

        debug!("Fetching tool JWKS from {}", self.tool_jwks_url);
        let document: serde_json::Value = reqwest::get(&self.tool_jwks_url).await?.json().await?;

        let keys = document
            .get("keys")
            .and_then(|k| k.as_array())
            .ok_or_else(|| LtiError::KeyNotFound(format!("tool JWKS has no keys: {kid}")))?;

        for key in keys {
            if key.get("kid").and_then(|k| k.as_str()) == Some(kid) {
                let n = key.get("n").and_then(|v| v.as_str());
                let e = key.get("e").and_then(|v| v.as_str());
                if let (Some(n), Some(e)) = (n, e) {
                    return Ok(PublicJwk {
                        kty: "RSA".to_string(),
                        kid: kid.to_string(),
                        n: n.to_string(),
                        e: e.to_string(),
                    });
                }
            }
        }

        Err(LtiError::KeyNotFound(kid.to_string()))
    }
}

/// Assemble a registration from configuration and the platform keychain.
///
/// Pure apart from reading configuration; the keychain invariant (a private
/// key must be present) is enforced here because everything signed downstream
/// depends on it.
pub fn create_registration(
    config: &Config,
    platform_keychain: KeyChain,
    deployment_id: Option<&str>,
) -> Result<Registration, LtiError> {
    if platform_keychain.private_key.is_none() {
        return Err(LtiError::Configuration(
            "platform keychain has no private key".to_string(),
        ));
    }

    let tool_url = config.tool_url()?;
    let platform_url = config.platform_url.trim_end_matches('/').to_string();

    let mut deployment_ids = HashSet::new();
    if let Some(id) = deployment_id {
        deployment_ids.insert(id.to_string());
    }

    Ok(Registration {
        identifier: REGISTRATION_ID.to_string(),
        client_id: config.client_id.clone(),
        platform: PlatformDetails {
            id: platform_url.clone(),
            name: config.platform_name.clone(),
            audience: platform_url.clone(),
            oidc_auth_url: format!("{platform_url}/lti/auth"),
            token_url: format!("{platform_url}/lti/token"),
        },
        tool: ToolDetails {
            id: tool_url.clone(),
            name: "Kialo".to_string(),
            audience: config.client_id.clone(),
            login_url: format!("{tool_url}/lti/login"),
            launch_url: format!("{tool_url}/lti/launch"),
            deeplink_url: format!("{tool_url}/lti/deeplink"),
        },
        deployment_ids,
        platform_keychain,
        tool_keychain: None,
        platform_jwks_url: format!("{platform_url}/lti/jwks"),
        tool_jwks_url: format!("{tool_url}/lti/jwks"),
    })
}
