use serde::{Deserialize, Serialize};

/// Header the demo host uses to convey the authenticated session user.
///
/// In a real deployment the host LMS session provides the user; this header is
/// the stand-in adapter for it.
pub const SESSION_USER_HEADER: &str = "x-session-user";

/// OIDC third-party-initiated login parameters posted to the auth endpoint.
///
/// Every field is optional at the wire level so that missing parameters are
/// rejected by the flow with a logged reason instead of an extractor error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthRequestParams {
    pub scope: Option<String>,
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub login_hint: Option<String>,
    pub lti_message_hint: Option<String>,
    pub state: Option<String>,
    pub response_mode: Option<String>,
    pub nonce: Option<String>,
    pub prompt: Option<String>,
}

/// Query parameters of the deep-linking entry point
#[derive(Debug, Deserialize)]
pub struct SelectQuery {
    pub courseid: i64,
    pub deploymentid: String,
}

/// Form body of an inbound deep-linking response
#[derive(Debug, Deserialize)]
pub struct SelectResponseForm {
    #[serde(rename = "JWT")]
    pub jwt: String,
    pub deploymentid: String,
}

/// Query parameters addressing a line item
#[derive(Debug, Serialize, Deserialize)]
pub struct LineItemQuery {
    pub course_id: i64,
    pub cmid: i64,
    pub resource_link_id: String,
}

/// Grade postback from the tool backend
#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreUpdate {
    #[serde(rename = "userId")]
    pub user_id: i64,
    #[serde(rename = "scoreGiven", skip_serializing_if = "Option::is_none")]
    pub score_given: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Response to a grade postback
#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreUpdateResponse {
    pub success: bool,
}

/// OAuth2 client-credentials token request.
///
/// All fields optional; the issuer validates presence and rejects with
/// `unsupported_grant_type` per the LTI service conventions.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
}

/// OAuth2 token response
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
}

/// OAuth2 error body
#[derive(Debug, Serialize, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
}

/// Service request updating the stored discussion URL of an activity
#[derive(Debug, Serialize, Deserialize)]
pub struct DiscussionUrlUpdate {
    pub course_id: i64,
    pub cmid: i64,
    pub resource_link_id: String,
    pub discussion_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discussion_title: Option<String>,
}

/// Response to a discussion URL update
#[derive(Debug, Serialize, Deserialize)]
pub struct DiscussionUrlUpdateResponse {
    pub success: bool,
}
