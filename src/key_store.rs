use std::sync::Arc;

use josekit::jwk::Jwk;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Row, sqlite::{SqlitePool, SqlitePoolOptions}};
use tracing::{debug, info};
use ulid::Ulid;

use crate::error::LtiError;

/// Key set name of the platform signing key
pub const PLATFORM_KEY_SET: &str = "kialo-platform";

const RSA_KEY_BITS: u32 = 2048;

/// Public half of an RSA keychain in JWK form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicJwk {
    pub kty: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

/// A signing keychain.
///
/// The platform keychain always carries its private key (as a private JWK
/// JSON document); a tool keychain only has the public half.
#[derive(Debug, Clone)]
pub struct KeyChain {
    pub key_id: String,
    pub key_set_name: String,
    pub algorithm: String,
    pub public_key: PublicJwk,
    pub private_key: Option<String>,
}

impl KeyChain {
    /// Generate a fresh RSA-2048 keychain
    pub fn generate(key_set_name: &str) -> Result<Self, LtiError> {
        let mut jwk = Jwk::generate_rsa_key(RSA_KEY_BITS)?;
        let key_id = Ulid::new().to_string();
        jwk.set_key_id(key_id.as_str());

        let n = jwk_str_parameter(&jwk, "n")?;
        let e = jwk_str_parameter(&jwk, "e")?;

        // Persist the full private JWK so the signing key survives restarts
        let mut private_map = serde_json::Map::new();
        for name in ["kty", "n", "e", "d", "p", "q", "dp", "dq", "qi"] {
            if let Some(value) = jwk.parameter(name) {
                private_map.insert(name.to_string(), value.clone());
            }
        }
        private_map.insert("kid".to_string(), json!(key_id));

        Ok(Self {
            key_id: key_id.clone(),
            key_set_name: key_set_name.to_string(),
            algorithm: "RS256".to_string(),
            public_key: PublicJwk {
                kty: "RSA".to_string(),
                kid: key_id,
                n,
                e,
            },
            private_key: Some(serde_json::Value::Object(private_map).to_string()),
        })
    }

    /// JWKS document describing this keychain's public key
    pub fn public_jwks_document(&self) -> serde_json::Value {
        json!({
            "keys": [{
                "kty": self.public_key.kty,
                "use": "sig",
                "alg": self.algorithm,
                "kid": self.public_key.kid,
                "n": self.public_key.n,
                "e": self.public_key.e,
            }]
        })
    }
}

fn jwk_str_parameter(jwk: &Jwk, name: &str) -> Result<String, LtiError> {
    jwk.parameter(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            LtiError::Configuration(format!("generated RSA key is missing parameter {name:?}"))
        })
}

/// SQLite-backed store for the platform's persistent signing keychain
#[derive(Clone)]
pub struct PlatformKeyStore {
    pool: Arc<SqlitePool>,
}

impl PlatformKeyStore {
    pub async fn new(db_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(db_url).await?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests and local experiments
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS platform_keys (
                key_set_name TEXT PRIMARY KEY,
                key_id TEXT NOT NULL,
                private_jwk TEXT NOT NULL,
                public_n TEXT NOT NULL,
                public_e TEXT NOT NULL,
                algorithm TEXT NOT NULL DEFAULT 'RS256',
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Return the platform signing keychain, generating it exactly once.
    ///
    /// Every launch, deep-link and service token is anchored on this key, so
    /// a generation failure is fatal. Repeated calls return the same key id
    /// and key material.
    pub async fn platform_keychain(&self) -> Result<KeyChain, LtiError> {
        if let Some(keychain) = self.load(PLATFORM_KEY_SET).await? {
            debug!("Loaded platform keychain with key ID: {}", keychain.key_id);
            return Ok(keychain);
        }

        let keychain = KeyChain::generate(PLATFORM_KEY_SET)?;
        let private_jwk = keychain
            .private_key
            .as_deref()
            .ok_or_else(|| LtiError::Configuration("generated keychain has no private key".into()))?;

        // ON CONFLICT DO NOTHING keeps the first key if two requests race
        sqlx::query(
            "INSERT INTO platform_keys (key_set_name, key_id, private_jwk, public_n, public_e, algorithm)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(key_set_name) DO NOTHING",
        )
        .bind(&keychain.key_set_name)
        .bind(&keychain.key_id)
        .bind(private_jwk)
        .bind(&keychain.public_key.n)
        .bind(&keychain.public_key.e)
        .bind(&keychain.algorithm)
        .execute(&*self.pool)
        .await?;

        let stored = self
            .load(PLATFORM_KEY_SET)
            .await?
            .ok_or_else(|| LtiError::Configuration("platform keychain was not persisted".into()))?;

        info!("Generated platform keychain with key ID: {}", stored.key_id);
        Ok(stored)
    }

    async fn load(&self, key_set_name: &str) -> Result<Option<KeyChain>, LtiError> {
        let row = sqlx::query(
            "SELECT key_id, private_jwk, public_n, public_e, algorithm
             FROM platform_keys WHERE key_set_name = ?",
        )
        .bind(key_set_name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(|row| {
            let key_id: String = row.get("key_id");
            KeyChain {
                key_id: key_id.clone(),
                key_set_name: key_set_name.to_string(),
                algorithm: row.get("algorithm"),
                public_key: PublicJwk {
                    kty: "RSA".to_string(),
                    kid: key_id,
                    n: row.get("public_n"),
                    e: row.get("public_e"),
                },
                private_key: Some(row.get("private_jwk")),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_platform_keychain_is_generated_once() {
        let store = PlatformKeyStore::in_memory().await.unwrap();

        let first = store.platform_keychain().await.unwrap();
        let second = store.platform_keychain().await.unwrap();

        assert_eq!(first.key_id, second.key_id);
        assert_eq!(first.public_key.n, second.public_key.n);
        assert_eq!(first.private_key, second.private_key);
    }

    #[tokio::test]
    async fn test_generated_keychain_has_private_material() {
        let keychain = KeyChain::generate(PLATFORM_KEY_SET).unwrap();

        assert!(keychain.private_key.is_some());
        let private: serde_json::Value =
            serde_json::from_str(keychain.private_key.as_deref().unwrap()).unwrap();
        assert_eq!(private["kid"], keychain.key_id.as_str());
        assert!(private["d"].is_string());
    }

    #[tokio::test]
    async fn test_jwks_document_exposes_only_public_parts() {
        let keychain = KeyChain::generate(PLATFORM_KEY_SET).unwrap();
        let doc = keychain.public_jwks_document();

        let keys = doc["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0]["kty"], "RSA");
        assert_eq!(keys[0]["alg"], "RS256");
        assert!(keys[0].get("d").is_none());
    }
}
