use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::api::{TokenRequest, TokenResponse};
use crate::claims::service_scopes;
use crate::config::Config;
use crate::crypto::CryptoService;
use crate::error::LtiError;
use crate::key_store::PlatformKeyStore;

/// Lifetime of issued service tokens, in seconds
pub const TOKEN_TTL_SECS: i64 = 3600;

/// Claims of a platform-signed service access token
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub scope: String,
}

impl ServiceTokenClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }
}

/// Issues and validates OAuth2 client-credentials tokens for the grading and
/// URL-update service endpoints.
#[derive(Clone)]
pub struct ServiceTokenIssuer {
    config: Config,
    keys: PlatformKeyStore,
}

impl ServiceTokenIssuer {
    pub fn new(config: Config, keys: PlatformKeyStore) -> Self {
        Self { config, keys }
    }

    fn audience(&self) -> String {
        self.config.platform_url.trim_end_matches('/').to_string()
    }

    /// Issue a token for a client-credentials request.
    ///
    /// A request missing any required OAuth parameter is an
    /// `unsupported_grant_type` rejection; a bad secret is `invalid_client`.
    pub async fn issue(&self, request: &TokenRequest) -> Result<TokenResponse, LtiError> {
        let grant_type = request
            .grant_type
            .as_deref()
            .filter(|g| !g.is_empty())
            .ok_or(LtiError::UnsupportedGrantType)?;
        if grant_type != "client_credentials" {
            warn!("Rejected token request with grant type {:?}", grant_type);
            return Err(LtiError::UnsupportedGrantType);
        }
        let client_id = request
            .client_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(LtiError::UnsupportedGrantType)?;
        let client_secret = request
            .client_secret
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(LtiError::UnsupportedGrantType)?;

        if client_id != self.config.client_id || client_secret != self.config.client_secret {
            warn!("Rejected token request with bad credentials for {:?}", client_id);
            return Err(LtiError::InvalidClient);
        }

        let allowed: HashSet<&str> = service_scopes().into_iter().collect();
        let scope = match request.scope.as_deref().filter(|s| !s.is_empty()) {
            Some(requested) => {
                let requested_set: HashSet<&str> = requested.split_whitespace().collect();
                if !requested_set.is_subset(&allowed) {
                    let rejected: Vec<&&str> = requested_set.difference(&allowed).collect();
                    return Err(LtiError::InsufficientScope(format!("{rejected:?}")));
                }
                requested.to_string()
            }
            None => service_scopes().join(" "),
        };

        let now = Utc::now().timestamp();
        let claims = ServiceTokenClaims {
            iss: self.audience(),
            sub: client_id.to_string(),
            aud: self.audience(),
            exp: now + TOKEN_TTL_SECS,
            iat: now,
            jti: Ulid::new().to_string(),
            scope: scope.clone(),
        };

        let keychain = self.keys.platform_keychain().await?;
        let access_token = CryptoService::sign(&claims, &keychain)?;

        debug!("Issued service token for {} with scope {:?}", client_id, scope);

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: TOKEN_TTL_SECS,
            scope,
        })
    }

    /// Validate a bearer token and require one scope on it
    pub async fn validate(
        &self,
        token: &str,
        required_scope: &str,
    ) -> Result<ServiceTokenClaims, LtiError> {
        let keychain = self.keys.platform_keychain().await?;
        let audience = self.audience();
        let validation = CryptoService::platform_validation(&audience, &audience);

        let claims: ServiceTokenClaims =
            CryptoService::decode_claims(token, &keychain.public_key, &validation)?;

        if !claims.has_scope(required_scope) {
            return Err(LtiError::InsufficientScope(required_scope.to_string()));
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::{SCOPE_AGS_SCORE, SCOPE_UPDATE_DISCUSSION_URL};

    async fn test_issuer() -> ServiceTokenIssuer {
        let config = Config {
            platform_url: "http://platform.example".to_string(),
            ..Config::default()
        };
        let keys = PlatformKeyStore::in_memory().await.unwrap();
        ServiceTokenIssuer::new(config, keys)
    }

    fn credentials(issuer: &ServiceTokenIssuer) -> TokenRequest {
        TokenRequest {
            grant_type: Some("client_credentials".to_string()),
            client_id: Some(issuer.config.client_id.clone()),
            client_secret: Some(issuer.config.client_secret.clone()),
            scope: None,
        }
    }

    #[tokio::test]
    async fn test_issue_and_validate_round_trip() {
        let issuer = test_issuer().await;

        let response = issuer.issue(&credentials(&issuer)).await.unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, TOKEN_TTL_SECS);

        let claims = issuer
            .validate(&response.access_token, SCOPE_AGS_SCORE)
            .await
            .unwrap();
        assert_eq!(claims.sub, issuer.config.client_id);
        assert!(claims.has_scope(SCOPE_UPDATE_DISCUSSION_URL));
    }

    #[tokio::test]
    async fn test_missing_parameters_are_unsupported_grant_type() {
        let issuer = test_issuer().await;

        // Empty request
        assert!(matches!(
            issuer.issue(&TokenRequest::default()).await,
            Err(LtiError::UnsupportedGrantType)
        ));

        // Wrong grant type
        let mut request = credentials(&issuer);
        request.grant_type = Some("authorization_code".to_string());
        assert!(matches!(
            issuer.issue(&request).await,
            Err(LtiError::UnsupportedGrantType)
        ));

        // Missing secret
        let mut request = credentials(&issuer);
        request.client_secret = None;
        assert!(matches!(
            issuer.issue(&request).await,
            Err(LtiError::UnsupportedGrantType)
        ));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_invalid_client() {
        let issuer = test_issuer().await;

        let mut request = credentials(&issuer);
        request.client_secret = Some("wrong".to_string());
        assert!(matches!(
            issuer.issue(&request).await,
            Err(LtiError::InvalidClient)
        ));
    }

    #[tokio::test]
    async fn test_scope_restriction() {
        let issuer = test_issuer().await;

        // A subset of the allowed scopes is granted as requested
        let mut request = credentials(&issuer);
        request.scope = Some(SCOPE_AGS_SCORE.to_string());
        let response = issuer.issue(&request).await.unwrap();
        assert_eq!(response.scope, SCOPE_AGS_SCORE);

        // A token restricted to one scope cannot be used for another
        assert!(matches!(
            issuer
                .validate(&response.access_token, SCOPE_UPDATE_DISCUSSION_URL)
                .await,
            Err(LtiError::InsufficientScope(_))
        ));

        // Unknown scopes are rejected outright
        let mut request = credentials(&issuer);
        request.scope = Some("https://evil.example/scope".to_string());
        assert!(matches!(
            issuer.issue(&request).await,
            Err(LtiError::InsufficientScope(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_rejects_foreign_tokens() {
        let issuer = test_issuer().await;
        let other = test_issuer().await;

        let response = other.issue(&credentials(&other)).await.unwrap();
        assert!(matches!(
            issuer.validate(&response.access_token, SCOPE_AGS_SCORE).await,
            Err(LtiError::SignatureInvalid)
        ));
    }
}
