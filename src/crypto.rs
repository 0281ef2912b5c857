use std::collections::HashSet;

use jsonwebkey::JsonWebKey;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::error::LtiError;
use crate::key_store::{KeyChain, PublicJwk};

/// Service for signing and verifying LTI messages.
///
/// This layer only deals with RS256 signatures and compact serialization;
/// claim-level validation (issuer, audience, expiry, nonce reuse) belongs to
/// the launch flow so the trust boundary stays narrow.
pub struct CryptoService;

impl CryptoService {
    /// Create a JWT header with the given key ID
    pub fn create_header(key_id: &str) -> Header {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key_id.to_string());
        header.typ = Some("JWT".to_string());
        header
    }

    /// Sign claims with a keychain's private key
    pub fn sign<T: Serialize>(claims: &T, keychain: &KeyChain) -> Result<String, LtiError> {
        let private_jwk = keychain.private_key.as_deref().ok_or_else(|| {
            LtiError::Configuration(format!(
                "keychain {} has no private key",
                keychain.key_set_name
            ))
        })?;

        // The stored private key is a JWK document; convert to PEM for signing
        let jwk: JsonWebKey = serde_json::from_str(private_jwk)?;
        let encoding_key = EncodingKey::from_rsa_pem(jwk.key.to_pem().as_bytes())?;

        let header = Self::create_header(&keychain.key_id);
        debug!("Signing message with key ID: {}", keychain.key_id);

        Ok(encode(&header, claims, &encoding_key)?)
    }

    /// Verify a token's signature against a public key.
    ///
    /// Checks the RS256 signature and nothing else.
    pub fn verify(token: &str, public_key: &PublicJwk) -> Result<(), LtiError> {
        let decoding_key = DecodingKey::from_rsa_components(&public_key.n, &public_key.e)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        decode::<serde_json::Value>(token, &decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => LtiError::SignatureInvalid,
                _ => LtiError::Jwt(e),
            }
        })?;

        Ok(())
    }

    /// Decode a token into typed claims after full validation
    pub fn decode_claims<T: DeserializeOwned>(
        token: &str,
        public_key: &PublicJwk,
        validation: &Validation,
    ) -> Result<T, LtiError> {
        let decoding_key = DecodingKey::from_rsa_components(&public_key.n, &public_key.e)?;

        let token_data = decode::<T>(token, &decoding_key, validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => LtiError::SignatureInvalid,
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    LtiError::ClaimMismatch("aud".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                    LtiError::ClaimMismatch("iss".to_string())
                }
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    LtiError::ClaimMismatch("exp".to_string())
                }
                _ => LtiError::Jwt(e),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Validation options for a platform-signed token addressed to the platform
    pub fn platform_validation(issuer: &str, audience: &str) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation
    }

    /// Extract the key ID from a token's header
    pub fn key_id(token: &str) -> Result<String, LtiError> {
        let header = decode_header(token)?;
        header
            .kid
            .ok_or_else(|| LtiError::ClaimMismatch("missing kid in JWT header".to_string()))
    }
}
