use std::collections::HashMap;
use std::error::Error;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::Value;
use tracing::{debug, error, info};
use ulid::Ulid;

use kialo_lti::{
    api::{ScoreUpdate, SESSION_USER_HEADER},
    claims::{CLAIM_RESOURCE_LINK, CLAIM_ROLES},
    config::Config,
    course_store::{DEMO_COURSE_ID, DEMO_MODULE_ID, DEMO_STUDENT_ID},
    crypto::CryptoService,
    key_store::PublicJwk,
    logging,
};

/// Drives a full resource-link launch and grade postback against a running
/// platform, playing the Kialo tool's part of the exchange.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::setup_default_logging()?;
    info!("Starting tool client script");

    let config = Config::from_env();
    let platform_url = config.platform_url.trim_end_matches('/').to_string();
    let user_id = DEMO_STUDENT_ID;

    let client = reqwest::Client::new();

    // Step 1: open the course module, receiving the login-initiation form
    let launch_url =
        format!("{platform_url}/courses/{DEMO_COURSE_ID}/modules/{DEMO_MODULE_ID}/launch");
    debug!("Requesting launch form from {}", launch_url);
    let html = client
        .get(&launch_url)
        .header(SESSION_USER_HEADER, user_id.to_string())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let login = form_values(&html);
    let login_hint = login
        .get("login_hint")
        .ok_or("launch form is missing login_hint")?;
    let message_hint = login
        .get("lti_message_hint")
        .ok_or("launch form is missing lti_message_hint")?;
    let client_id = login
        .get("client_id")
        .ok_or("launch form is missing client_id")?;
    let target = login
        .get("target_link_uri")
        .ok_or("launch form is missing target_link_uri")?;
    info!("Received login initiation with login_hint: {}", login_hint);

    // Step 2: answer with the OIDC authentication request
    let state = Ulid::new().to_string();
    let nonce = Ulid::new().to_string();
    let form = [
        ("scope", "openid"),
        ("response_type", "id_token"),
        ("client_id", client_id.as_str()),
        ("redirect_uri", target.as_str()),
        ("login_hint", login_hint.as_str()),
        ("lti_message_hint", message_hint.as_str()),
        ("state", state.as_str()),
        ("response_mode", "form_post"),
        ("nonce", nonce.as_str()),
        ("prompt", "none"),
    ];
    let html = client
        .post(format!("{platform_url}/lti/auth"))
        .header(SESSION_USER_HEADER, user_id.to_string())
        .form(&form)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let response = form_values(&html);
    let id_token = response
        .get("id_token")
        .ok_or("auth response is missing id_token")?;
    if response.get("state").map(String::as_str) != Some(state.as_str()) {
        error!("Platform echoed a different state");
        return Err("state mismatch".into());
    }

    // Step 3: verify the ID token against the published platform key
    let jwks: Value = client
        .get(format!("{platform_url}/lti/jwks"))
        .send()
        .await?
        .json()
        .await?;
    let key = platform_key(&jwks).ok_or("platform JWKS has no usable key")?;
    CryptoService::verify(id_token, &key)?;

    let claims = decode_payload(id_token)?;
    println!("✅ Launch verified for subject {}", claims["sub"]);
    println!("   Roles: {}", claims[CLAIM_ROLES]);
    println!("   Resource link: {}", claims[CLAIM_RESOURCE_LINK]["id"]);
    if claims["nonce"] != Value::String(nonce.clone()) {
        error!("ID token carries a different nonce");
        return Err("nonce mismatch".into());
    }

    // Step 4: fetch a service token the way the tool backend would
    let token: Value = client
        .post(format!("{platform_url}/lti/token"))
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let access_token = token["access_token"]
        .as_str()
        .ok_or("token endpoint returned no access_token")?
        .to_string();
    info!("Obtained service token");

    // Step 5: read the line item and post a score back
    let lineitem: Value = client
        .get(format!(
            "{platform_url}/lti/lineitem?course_id={DEMO_COURSE_ID}&cmid={DEMO_MODULE_ID}&resource_link_id={DEMO_MODULE_ID}"
        ))
        .bearer_auth(&access_token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!(
        "   Line item {:?} with maximum score {}",
        lineitem["label"], lineitem["scoreMaximum"]
    );

    let score = ScoreUpdate {
        user_id,
        score_given: Some(72.0),
        comment: Some("Strong counterarguments".to_string()),
        timestamp: None,
    };
    let result: Value = client
        .post(format!(
            "{platform_url}/lti/lineitem/scores?course_id={DEMO_COURSE_ID}&cmid={DEMO_MODULE_ID}"
        ))
        .bearer_auth(&access_token)
        .json(&score)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if result["success"] == Value::Bool(true) {
        println!("✅ Grade posted back for user {}", user_id);
    } else {
        println!("❌ Grade postback was rejected: {}", result);
    }

    Ok(())
}

/// Pull the hidden input values out of an auto-submitting form
fn form_values(html: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for chunk in html.split("<input ").skip(1) {
        if let (Some(name), Some(value)) = (attr(chunk, "name=\""), attr(chunk, "value=\"")) {
            values.insert(unescape(name), unescape(value));
        }
    }
    values
}

fn attr<'a>(chunk: &'a str, prefix: &str) -> Option<&'a str> {
    let start = chunk.find(prefix)? + prefix.len();
    let rest = &chunk[start..];
    Some(&rest[..rest.find('"')?])
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// First RSA key of a JWKS document
fn platform_key(jwks: &Value) -> Option<PublicJwk> {
    let key = jwks.get("keys")?.as_array()?.first()?;
    Some(PublicJwk {
        kty: key.get("kty")?.as_str()?.to_string(),
        kid: key.get("kid")?.as_str()?.to_string(),
        n: key.get("n")?.as_str()?.to_string(),
        e: key.get("e")?.as_str()?.to_string(),
    })
}

/// Decode a JWT payload without validation, for display
fn decode_payload(token: &str) -> Result<Value, Box<dyn Error>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err("invalid JWT format".into());
    }
    let payload = URL_SAFE_NO_PAD.decode(parts[1])?;
    Ok(serde_json::from_slice(&payload)?)
}
