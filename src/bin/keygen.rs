use tracing::info;

use kialo_lti::{config::Config, key_store::PlatformKeyStore, logging};

/// Provision the platform signing keychain.
///
/// Safe to run repeatedly; the key is generated exactly once and reused
/// afterwards.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::setup_default_logging()?;
    info!("Starting keygen");

    let config = Config::from_env();

    if !std::path::Path::new(&config.db_path).exists() {
        std::fs::File::create(&config.db_path)?;
    }

    let db_url = format!("sqlite:{}", config.db_path);
    let store = PlatformKeyStore::new(&db_url).await?;

    let keychain = store.platform_keychain().await?;
    info!("Platform signing key ready with key ID: {}", keychain.key_id);

    println!("Key ID: {}", keychain.key_id);
    println!(
        "JWKS document:\n{}",
        serde_json::to_string_pretty(&keychain.public_jwks_document())?
    );
    println!(
        "Published at: {}/lti/jwks",
        config.platform_url.trim_end_matches('/')
    );

    Ok(())
}
