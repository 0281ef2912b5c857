use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// LTI version placed in every launch message
pub const LTI_VERSION: &str = "1.3.0";

// Claim URIs from the IMS LTI 1.3 core and deep-linking specifications
pub const CLAIM_MESSAGE_TYPE: &str = "https://purl.imsglobal.org/spec/lti/claim/message_type";
pub const CLAIM_VERSION: &str = "https://purl.imsglobal.org/spec/lti/claim/version";
pub const CLAIM_DEPLOYMENT_ID: &str = "https://purl.imsglobal.org/spec/lti/claim/deployment_id";
pub const CLAIM_TARGET_LINK_URI: &str =
    "https://purl.imsglobal.org/spec/lti/claim/target_link_uri";
pub const CLAIM_RESOURCE_LINK: &str = "https://purl.imsglobal.org/spec/lti/claim/resource_link";
pub const CLAIM_ROLES: &str = "https://purl.imsglobal.org/spec/lti/claim/roles";
pub const CLAIM_CONTEXT: &str = "https://purl.imsglobal.org/spec/lti/claim/context";
pub const CLAIM_CUSTOM: &str = "https://purl.imsglobal.org/spec/lti/claim/custom";
pub const CLAIM_DEEP_LINKING_SETTINGS: &str =
    "https://purl.imsglobal.org/spec/lti-dl/claim/deep_linking_settings";
pub const CLAIM_CONTENT_ITEMS: &str =
    "https://purl.imsglobal.org/spec/lti-dl/claim/content_items";
pub const CLAIM_DEEP_LINKING_DATA: &str = "https://purl.imsglobal.org/spec/lti-dl/claim/data";
pub const CLAIM_AGS_ENDPOINT: &str = "https://purl.imsglobal.org/spec/lti-ags/claim/endpoint";

// Kialo-specific claims carried in the resource-link ID token
pub const CLAIM_DISCUSSION_URL_ENDPOINT: &str =
    "https://kialo-edu.com/lti/claim/discussion_url_endpoint";
pub const CLAIM_PLUGIN_VERSION: &str = "https://kialo-edu.com/lti/claim/plugin_version";

// LIS role URIs
pub const ROLE_INSTRUCTOR: &str =
    "http://purl.imsglobal.org/vocab/lis/v2/membership#Instructor";
pub const ROLE_LEARNER: &str = "http://purl.imsglobal.org/vocab/lis/v2/membership#Learner";

// Service scopes accepted by the token endpoint
pub const SCOPE_AGS_LINEITEM: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem";
pub const SCOPE_AGS_RESULT_READONLY: &str =
    "https://purl.imsglobal.org/spec/lti-ags/scope/result.readonly";
pub const SCOPE_AGS_SCORE: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/score";
pub const SCOPE_UPDATE_DISCUSSION_URL: &str =
    "https://kialo-edu.com/lti/scope/update_discussion_url";

/// All scopes a service token may carry
pub fn service_scopes() -> [&'static str; 4] {
    [
        SCOPE_AGS_LINEITEM,
        SCOPE_AGS_RESULT_READONLY,
        SCOPE_AGS_SCORE,
        SCOPE_UPDATE_DISCUSSION_URL,
    ]
}

/// Scopes advertised in the AGS endpoint claim of a launch
pub fn ags_scopes() -> [&'static str; 3] {
    [SCOPE_AGS_LINEITEM, SCOPE_AGS_RESULT_READONLY, SCOPE_AGS_SCORE]
}

/// Custom claim keys for group-scoped launches
pub const CUSTOM_GROUP_ID: &str = "kialoGroupId";
pub const CUSTOM_GROUP_NAME: &str = "kialoGroupName";

/// The three LTI message types this platform handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LtiMessageType {
    #[serde(rename = "LtiResourceLinkRequest")]
    ResourceLinkRequest,
    #[serde(rename = "LtiDeepLinkingRequest")]
    DeepLinkingRequest,
    #[serde(rename = "LtiDeepLinkingResponse")]
    DeepLinkingResponse,
}

/// Group a launch is scoped to, carried as custom claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupClaim {
    pub id: i64,
    pub name: String,
}

/// Claims of the platform-signed `lti_message_hint` JWT.
///
/// This token is issued and consumed by the platform itself, so it uses plain
/// claim names. It carries the full launch context so that the OIDC callback
/// leg is stateless apart from the nonce check.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageHintClaims {
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub registration_id: String,
    pub message_type: LtiMessageType,
    pub deployment_id: String,
    pub course_id: i64,
    pub user_id: i64,
    pub target_link_uri: String,
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cm_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_link_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupClaim>,
}

/// The resource-link claim of a launch ID token
#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceLinkClaim {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// The context (course) claim of a launch ID token
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextClaim {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub kinds: Vec<String>,
}

/// The AGS endpoint claim advertising the grading service to the tool
#[derive(Debug, Serialize, Deserialize)]
pub struct AgsEndpointClaim {
    pub scope: Vec<String>,
    pub lineitem: String,
}

/// ID token for a resource-link launch
#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceLinkIdToken {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub nonce: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/message_type")]
    pub message_type: LtiMessageType,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/version")]
    pub version: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/deployment_id")]
    pub deployment_id: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/target_link_uri")]
    pub target_link_uri: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/resource_link")]
    pub resource_link: ResourceLinkClaim,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/roles")]
    pub roles: Vec<String>,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/context")]
    pub context: ContextClaim,
    #[serde(
        rename = "https://purl.imsglobal.org/spec/lti/claim/custom",
        skip_serializing_if = "Option::is_none"
    )]
    pub custom: Option<HashMap<String, String>>,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti-ags/claim/endpoint")]
    pub ags_endpoint: AgsEndpointClaim,
    #[serde(rename = "https://kialo-edu.com/lti/claim/discussion_url_endpoint")]
    pub discussion_url_endpoint: String,
    #[serde(rename = "https://kialo-edu.com/lti/claim/plugin_version")]
    pub plugin_version: String,
    // OIDC standard claims of the launching user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoneinfo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

/// Deep-linking settings offered to the tool in a deep-linking request.
///
/// The platform only ever accepts a single `ltiResourceLink` presented in a
/// window, and the `data` value is an opaque platform-signed token whose only
/// purpose is to prove round-trip integrity.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeepLinkingSettingsClaim {
    pub deep_link_return_url: String,
    pub accept_types: Vec<String>,
    pub accept_presentation_document_targets: Vec<String>,
    pub accept_multiple: bool,
    pub auto_create: bool,
    pub data: String,
}

/// ID token for a deep-linking request
#[derive(Debug, Serialize, Deserialize)]
pub struct DeepLinkingRequestIdToken {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub nonce: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/message_type")]
    pub message_type: LtiMessageType,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/version")]
    pub version: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/deployment_id")]
    pub deployment_id: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/roles")]
    pub roles: Vec<String>,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/context")]
    pub context: ContextClaim,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti-dl/claim/deep_linking_settings")]
    pub deep_linking_settings: DeepLinkingSettingsClaim,
}

/// A content item of a deep-linking response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Content item type the platform accepts
pub const CONTENT_ITEM_RESOURCE_LINK: &str = "ltiResourceLink";

/// Claims of an inbound tool-signed deep-linking response.
///
/// `message_type` is kept as a string so that an unexpected value surfaces as
/// a distinct validation failure instead of a deserialization error.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeepLinkingResponseClaims {
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub nonce: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/message_type")]
    pub message_type: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/version")]
    pub version: String,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti/claim/deployment_id")]
    pub deployment_id: String,
    #[serde(
        rename = "https://purl.imsglobal.org/spec/lti-dl/claim/data",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<String>,
    #[serde(rename = "https://purl.imsglobal.org/spec/lti-dl/claim/content_items")]
    pub content_items: Vec<ContentItem>,
}

/// Claims of the opaque `data` token a deep-linking request carries.
///
/// Only the signature matters; the fields just make the token well-formed.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeepLinkingDataClaims {
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}
