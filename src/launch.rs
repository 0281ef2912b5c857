use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use ulid::Ulid;

use crate::api::AuthRequestParams;
use crate::claims::{
    AgsEndpointClaim, CONTENT_ITEM_RESOURCE_LINK, CUSTOM_GROUP_ID, CUSTOM_GROUP_NAME,
    ContextClaim, DeepLinkingDataClaims, DeepLinkingRequestIdToken, DeepLinkingResponseClaims,
    DeepLinkingSettingsClaim, GroupClaim, LTI_VERSION, LtiMessageType, MessageHintClaims,
    ResourceLinkClaim, ResourceLinkIdToken, ROLE_INSTRUCTOR, ROLE_LEARNER, ags_scopes,
};
use crate::config::Config;
use crate::course_store::CourseStore;
use crate::crypto::CryptoService;
use crate::error::LtiError;
use crate::key_store::{KeyChain, PlatformKeyStore};
use crate::nonce_store::{NonceSource, NonceStore, UlidNonceSource};
use crate::registration::{Registration, create_registration};

/// Capability required to manage the activity and to use deep linking
pub const CAP_KIALO_ADMIN: &str = "mod/kialo:kialo_admin";

/// Validity window of platform-signed launch messages, in seconds
pub const MESSAGE_TTL_SECS: i64 = 3600;

/// Capability view of the host's permission system.
///
/// The launch flow depends only on this interface; the host adapts its own
/// permission checks behind it.
pub trait AuthorizationContext: Send + Sync {
    fn has_capability(&self, capability: &str) -> bool;
}

/// An HTML form that posts itself to the next leg of the flow
#[derive(Debug)]
pub struct AutoSubmitForm {
    pub action: String,
    pub params: Vec<(String, String)>,
}

impl AutoSubmitForm {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Render as an auto-submitting HTML document
    pub fn to_html(&self) -> String {
        let mut inputs = String::new();
        for (name, value) in &self.params {
            inputs.push_str(&format!(
                "<input type=\"hidden\" name=\"{}\" value=\"{}\"/>\n",
                escape_attr(name),
                escape_attr(value)
            ));
        }
        format!(
            "<!DOCTYPE html>\n<html>\n<body>\n<form id=\"lti\" method=\"post\" action=\"{}\">\n{}</form>\n<script>document.getElementById(\"lti\").submit();</script>\n</body>\n</html>\n",
            escape_attr(&self.action),
            inputs
        )
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// The resource the teacher selected through deep linking
#[derive(Debug, Clone, PartialEq)]
pub struct DeepLinkingResult {
    pub deployment_id: String,
    pub discussion_url: String,
    pub discussion_title: Option<String>,
}

/// Orchestrates the three LTI legs: resource-link launch, OIDC login auth,
/// and deep linking.
///
/// Each leg is a single synchronous exchange; on any validation failure the
/// user restarts the flow from the beginning.
#[derive(Clone)]
pub struct LaunchFlow {
    config: Config,
    keys: PlatformKeyStore,
    nonces: NonceStore,
    courses: CourseStore,
    nonce_source: Arc<dyn NonceSource>,
    tool_keychain: Option<KeyChain>,
}

impl LaunchFlow {
    pub fn new(
        config: Config,
        keys: PlatformKeyStore,
        nonces: NonceStore,
        courses: CourseStore,
    ) -> Self {
        Self {
            config,
            keys,
            nonces,
            courses,
            nonce_source: Arc::new(UlidNonceSource),
            tool_keychain: None,
        }
    }

    /// Replace the nonce source, used by tests for determinism
    pub fn with_nonce_source(mut self, source: Arc<dyn NonceSource>) -> Self {
        self.nonce_source = source;
        self
    }

    /// Pin the tool's keychain instead of fetching its JWKS
    pub fn with_tool_keychain(mut self, keychain: KeyChain) -> Self {
        self.tool_keychain = Some(keychain);
        self
    }

    fn platform_audience(&self) -> String {
        self.config.platform_url.trim_end_matches('/').to_string()
    }

    async fn registration(&self, deployment_id: Option<&str>) -> Result<Registration, LtiError> {
        let keychain = self.keys.platform_keychain().await?;
        let mut registration = create_registration(&self.config, keychain, deployment_id)?;
        registration.tool_keychain = self.tool_keychain.clone();
        Ok(registration)
    }

    /// Build the third-party-initiated login form for a resource-link launch.
    ///
    /// The login hint is the composite key `"{course_id}/{user_id}"`; the full
    /// launch context travels in a platform-signed `lti_message_hint` JWT so
    /// the callback leg needs no session state.
    pub async fn init_resource_link(
        &self,
        authz: &dyn AuthorizationContext,
        course_id: i64,
        cm_id: i64,
        deployment_id: &str,
        user_id: i64,
        target_link_uri: &str,
    ) -> Result<AutoSubmitForm, LtiError> {
        if !self.courses.is_enrolled(course_id, user_id).await? {
            return Err(LtiError::NotAuthorized(format!(
                "user {user_id} is not enrolled in course {course_id}"
            )));
        }

        let is_admin = authz.has_capability(CAP_KIALO_ADMIN);
        let roles = if is_admin {
            vec![ROLE_INSTRUCTOR.to_string()]
        } else {
            vec![ROLE_LEARNER.to_string()]
        };

        // Admins see all groups, so group scoping only applies to learners
        let group = if is_admin {
            None
        } else {
            self.courses.latest_group(course_id, user_id).await?
        };

        let registration = self.registration(Some(deployment_id)).await?;
        let hint = self.message_hint(
            &registration,
            LtiMessageType::ResourceLinkRequest,
            deployment_id,
            course_id,
            user_id,
            target_link_uri,
            roles,
            Some(cm_id),
            group,
        );
        let message_hint = CryptoService::sign(&hint, &registration.platform_keychain)?;

        info!(
            "Initiating resource link launch for user {} in course {} (module {})",
            user_id, course_id, cm_id
        );

        Ok(self.login_form(&registration, course_id, user_id, target_link_uri, message_hint, deployment_id))
    }

    /// Build the third-party-initiated login form for content selection.
    ///
    /// Deep linking is restricted to users holding the admin capability.
    pub async fn init_deep_link(
        &self,
        authz: &dyn AuthorizationContext,
        course_id: i64,
        user_id: i64,
        deployment_id: &str,
    ) -> Result<AutoSubmitForm, LtiError> {
        if !authz.has_capability(CAP_KIALO_ADMIN) {
            return Err(LtiError::NotAuthorized(
                "deep linking requires the kialo admin capability".to_string(),
            ));
        }
        if !self.courses.is_enrolled(course_id, user_id).await? {
            return Err(LtiError::NotAuthorized(format!(
                "user {user_id} is not enrolled in course {course_id}"
            )));
        }

        let registration = self.registration(Some(deployment_id)).await?;
        let target_link_uri = registration.tool.deeplink_url.clone();
        let hint = self.message_hint(
            &registration,
            LtiMessageType::DeepLinkingRequest,
            deployment_id,
            course_id,
            user_id,
            &target_link_uri,
            vec![ROLE_INSTRUCTOR.to_string()],
            None,
            None,
        );
        let message_hint = CryptoService::sign(&hint, &registration.platform_keychain)?;

        info!(
            "Initiating deep linking for user {} in course {}",
            user_id, course_id
        );

        Ok(self.login_form(&registration, course_id, user_id, &target_link_uri, message_hint, deployment_id))
    }

    #[allow(clippy::too_many_arguments)]
    fn message_hint(
        &self,
        registration: &Registration,
        message_type: LtiMessageType,
        deployment_id: &str,
        course_id: i64,
        user_id: i64,
        target_link_uri: &str,
        roles: Vec<String>,
        cm_id: Option<i64>,
        group: Option<GroupClaim>,
    ) -> MessageHintClaims {
        let now = Utc::now().timestamp();
        MessageHintClaims {
            iss: registration.platform.audience.clone(),
            aud: registration.platform.audience.clone(),
            exp: now + MESSAGE_TTL_SECS,
            iat: now,
            registration_id: registration.identifier.clone(),
            message_type,
            deployment_id: deployment_id.to_string(),
            course_id,
            user_id,
            target_link_uri: target_link_uri.to_string(),
            roles,
            cm_id,
            resource_link_id: cm_id.map(|id| id.to_string()),
            group,
        }
    }

    fn login_form(
        &self,
        registration: &Registration,
        course_id: i64,
        user_id: i64,
        target_link_uri: &str,
        message_hint: String,
        deployment_id: &str,
    ) -> AutoSubmitForm {
        AutoSubmitForm {
            action: registration.tool.login_url.clone(),
            params: vec![
                ("iss".to_string(), registration.platform.audience.clone()),
                ("login_hint".to_string(), format!("{course_id}/{user_id}")),
                ("target_link_uri".to_string(), target_link_uri.to_string()),
                ("lti_message_hint".to_string(), message_hint),
                ("client_id".to_string(), registration.client_id.clone()),
                ("lti_deployment_id".to_string(), deployment_id.to_string()),
            ],
        }
    }

    /// Handle the OIDC callback leg and issue the signed ID token.
    ///
    /// The launch context is recovered entirely from the `lti_message_hint`
    /// JWT; apart from nonce bookkeeping this step holds no state.
    pub async fn lti_auth(
        &self,
        params: &AuthRequestParams,
        session_user_id: i64,
    ) -> Result<AutoSubmitForm, LtiError> {
        let scope = required_param(&params.scope, "scope")?;
        let response_type = required_param(&params.response_type, "response_type")?;
        let client_id = required_param(&params.client_id, "client_id")?;
        let redirect_uri = required_param(&params.redirect_uri, "redirect_uri")?;
        let login_hint = required_param(&params.login_hint, "login_hint")?;
        let message_hint = required_param(&params.lti_message_hint, "lti_message_hint")?;
        let state = required_param(&params.state, "state")?;
        let response_mode = required_param(&params.response_mode, "response_mode")?;
        let nonce = required_param(&params.nonce, "nonce")?;
        let prompt = required_param(&params.prompt, "prompt")?;

        if scope != "openid" {
            return Err(LtiError::ClaimMismatch("scope must be openid".to_string()));
        }
        if response_type != "id_token" {
            return Err(LtiError::ClaimMismatch(
                "response_type must be id_token".to_string(),
            ));
        }
        if response_mode != "form_post" {
            return Err(LtiError::ClaimMismatch(
                "response_mode must be form_post".to_string(),
            ));
        }
        if prompt != "none" {
            return Err(LtiError::ClaimMismatch("prompt must be none".to_string()));
        }

        let (hint_course_id, hint_user_id) = parse_login_hint(login_hint)?;
        if hint_user_id != session_user_id {
            return Err(LtiError::ClaimMismatch(
                "login_hint does not match the authenticated user".to_string(),
            ));
        }

        // The message hint must carry a verifiable platform signature
        let keychain = self.keys.platform_keychain().await?;
        let audience = self.platform_audience();
        let hint: MessageHintClaims = CryptoService::decode_claims(
            message_hint,
            &keychain.public_key,
            &CryptoService::platform_validation(&audience, &audience),
        )?;

        let registration = create_registration(&self.config, keychain, Some(&hint.deployment_id))?;
        if hint.registration_id != registration.identifier {
            return Err(LtiError::ClaimMismatch(
                "message hint names an unknown registration".to_string(),
            ));
        }
        if client_id != registration.client_id {
            return Err(LtiError::ClaimMismatch("client_id".to_string()));
        }
        if hint.course_id != hint_course_id || hint.user_id != hint_user_id {
            return Err(LtiError::ClaimMismatch(
                "login_hint does not match the launch context".to_string(),
            ));
        }
        if !redirect_uri.starts_with(&registration.tool.id) {
            return Err(LtiError::ClaimMismatch(
                "redirect_uri is not a tool endpoint".to_string(),
            ));
        }

        self.nonces.mark_used(nonce).await?;

        let user = self
            .courses
            .user(session_user_id)
            .await?
            .ok_or_else(|| LtiError::NotAuthorized(format!("unknown user {session_user_id}")))?;
        if !self.courses.is_enrolled(hint.course_id, user.id).await? {
            return Err(LtiError::NotAuthorized(format!(
                "user {} is not enrolled in course {}",
                user.id, hint.course_id
            )));
        }
        let course = self
            .courses
            .course(hint.course_id)
            .await?
            .ok_or_else(|| LtiError::NotFound(format!("course {}", hint.course_id)))?;
        let context = ContextClaim {
            id: course.id.to_string(),
            title: Some(course.name),
            kinds: vec!["CourseSection".to_string()],
        };

        let now = Utc::now().timestamp();
        let id_token = match hint.message_type {
            LtiMessageType::ResourceLinkRequest => {
                let cm_id = hint
                    .cm_id
                    .ok_or_else(|| LtiError::ClaimMismatch("message hint has no module".to_string()))?;
                let resource_link_id = hint
                    .resource_link_id
                    .clone()
                    .ok_or_else(|| LtiError::ClaimMismatch("message hint has no resource link".to_string()))?;
                let module = self
                    .courses
                    .module(cm_id)
                    .await?
                    .ok_or_else(|| LtiError::NotFound(format!("module {cm_id}")))?;
                if module.deployment_id != hint.deployment_id {
                    return Err(LtiError::ClaimMismatch(
                        "deployment_id does not match the module".to_string(),
                    ));
                }

                let custom = hint.group.as_ref().map(|group| {
                    let mut map = HashMap::new();
                    map.insert(CUSTOM_GROUP_ID.to_string(), group.id.to_string());
                    map.insert(CUSTOM_GROUP_NAME.to_string(), group.name.clone());
                    map
                });

                let claims = ResourceLinkIdToken {
                    iss: audience.clone(),
                    aud: registration.client_id.clone(),
                    sub: user.subject_id(),
                    exp: now + MESSAGE_TTL_SECS,
                    iat: now,
                    nonce: nonce.to_string(),
                    message_type: LtiMessageType::ResourceLinkRequest,
                    version: LTI_VERSION.to_string(),
                    deployment_id: hint.deployment_id.clone(),
                    target_link_uri: hint.target_link_uri.clone(),
                    resource_link: ResourceLinkClaim {
                        id: resource_link_id.clone(),
                        title: Some(module.name.clone()),
                    },
                    roles: hint.roles.clone(),
                    context,
                    custom,
                    ags_endpoint: AgsEndpointClaim {
                        scope: ags_scopes().iter().map(|s| s.to_string()).collect(),
                        lineitem: format!(
                            "{audience}/lti/lineitem?course_id={}&cmid={cm_id}&resource_link_id={resource_link_id}",
                            hint.course_id
                        ),
                    },
                    discussion_url_endpoint: format!("{audience}/lti/discussion-url"),
                    plugin_version: env!("CARGO_PKG_VERSION").to_string(),
                    name: Some(user.full_name()),
                    given_name: Some(user.given_name.clone()),
                    family_name: Some(user.family_name.clone()),
                    middle_name: user.middle_name.clone(),
                    email: Some(user.email.clone()),
                    locale: Some(user.locale.clone()),
                    zoneinfo: Some(user.timezone.clone()),
                    picture: user.picture_url.clone(),
                    preferred_username: Some(user.username.clone()),
                };
                CryptoService::sign(&claims, &registration.platform_keychain)?
            }
            LtiMessageType::DeepLinkingRequest => {
                let data_claims = DeepLinkingDataClaims {
                    iss: audience.clone(),
                    aud: audience.clone(),
                    exp: now + MESSAGE_TTL_SECS,
                    iat: now,
                    jti: self.nonce_source.generate(),
                };
                let data = CryptoService::sign(&data_claims, &registration.platform_keychain)?;

                let claims = DeepLinkingRequestIdToken {
                    iss: audience.clone(),
                    aud: registration.client_id.clone(),
                    sub: user.subject_id(),
                    exp: now + MESSAGE_TTL_SECS,
                    iat: now,
                    nonce: nonce.to_string(),
                    message_type: LtiMessageType::DeepLinkingRequest,
                    version: LTI_VERSION.to_string(),
                    deployment_id: hint.deployment_id.clone(),
                    roles: hint.roles.clone(),
                    context,
                    deep_linking_settings: DeepLinkingSettingsClaim {
                        deep_link_return_url: format!("{audience}/lti/select"),
                        accept_types: vec![CONTENT_ITEM_RESOURCE_LINK.to_string()],
                        accept_presentation_document_targets: vec!["window".to_string()],
                        accept_multiple: false,
                        auto_create: false,
                        data,
                    },
                };
                CryptoService::sign(&claims, &registration.platform_keychain)?
            }
            LtiMessageType::DeepLinkingResponse => {
                return Err(LtiError::MessageTypeInvalid(
                    "LtiDeepLinkingResponse".to_string(),
                ));
            }
        };

        info!(
            "Issued ID token for user {} in course {} ({:?})",
            user.id, hint.course_id, hint.message_type
        );

        Ok(AutoSubmitForm {
            action: redirect_uri.to_string(),
            params: vec![
                ("id_token".to_string(), id_token),
                ("state".to_string(), state.to_string()),
            ],
        })
    }

    /// Validate an inbound tool-signed deep-linking response.
    ///
    /// Deep linking is atomic and single-selection: exactly one
    /// `ltiResourceLink` content item with a non-empty URL is accepted, and
    /// every other shape is a distinct hard failure.
    pub async fn validate_deep_linking_response(
        &self,
        jwt: &str,
        deployment_id: &str,
    ) -> Result<DeepLinkingResult, LtiError> {
        let registration = self.registration(Some(deployment_id)).await?;

        let kid = CryptoService::key_id(jwt)?;
        let tool_key = registration.tool_public_key(&kid).await?;
        let validation = CryptoService::platform_validation(
            &registration.client_id,
            &registration.platform.audience,
        );
        let claims: DeepLinkingResponseClaims =
            CryptoService::decode_claims(jwt, &tool_key, &validation)?;

        if claims.deployment_id != deployment_id || !registration.has_deployment(&claims.deployment_id)
        {
            return Err(LtiError::ClaimMismatch(
                "deployment_id is not registered".to_string(),
            ));
        }

        self.nonces.mark_used(&claims.nonce).await?;

        if claims.message_type != "LtiDeepLinkingResponse" {
            return Err(LtiError::MessageTypeInvalid(claims.message_type));
        }

        // The data token is opaque; only its platform signature matters
        if let Some(data) = &claims.data {
            CryptoService::verify(data, &registration.platform_keychain.public_key)?;
        }

        if claims.content_items.len() != 1 {
            return Err(LtiError::ContentItemCountInvalid(claims.content_items.len()));
        }
        let item = &claims.content_items[0];
        if item.item_type != CONTENT_ITEM_RESOURCE_LINK {
            return Err(LtiError::ContentItemTypeInvalid(item.item_type.clone()));
        }
        let url = item
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(LtiError::ContentItemUrlMissing)?;

        debug!("Deep linking selected discussion: {}", url);

        Ok(DeepLinkingResult {
            deployment_id: claims.deployment_id,
            discussion_url: url.to_string(),
            discussion_title: item.title.clone(),
        })
    }

    /// Generate a state value for an outbound exchange
    pub fn generate_state(&self) -> String {
        Ulid::new().to_string()
    }
}

fn required_param<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, LtiError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LtiError::ClaimMismatch(format!("missing parameter {name}")))
}

fn parse_login_hint(login_hint: &str) -> Result<(i64, i64), LtiError> {
    let malformed = || LtiError::ClaimMismatch("malformed login_hint".to_string());
    let (course, user) = login_hint.split_once('/').ok_or_else(malformed)?;
    Ok((
        course.parse().map_err(|_| malformed())?,
        user.parse().map_err(|_| malformed())?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::ContentItem;
    use crate::course_store::{
        DEMO_COURSE_ID, DEMO_DEPLOYMENT_ID, DEMO_GROUPED_STUDENT_ID, DEMO_MODULE_ID,
        DEMO_STUDENT_ID, DEMO_TEACHER_ID,
    };

    const TARGET_URI: &str = "https://kialo.example/lti/launch";

    async fn test_flow() -> LaunchFlow {
        let config = Config {
            platform_url: "http://platform.example".to_string(),
            admin_tool_url: Some("https://kialo.example".to_string()),
            ..Config::default()
        };
        let keys = PlatformKeyStore::in_memory().await.unwrap();
        let nonces = NonceStore::in_memory().await.unwrap();
        let courses = CourseStore::in_memory().await.unwrap();
        courses.seed_demo().await.unwrap();
        LaunchFlow::new(config, keys, nonces, courses)
    }

    async fn init_launch(flow: &LaunchFlow, user_id: i64) -> AutoSubmitForm {
        let authz = flow
            .courses
            .authorization(DEMO_COURSE_ID, user_id)
            .await
            .unwrap();
        flow.init_resource_link(
            &authz,
            DEMO_COURSE_ID,
            DEMO_MODULE_ID,
            DEMO_DEPLOYMENT_ID,
            user_id,
            TARGET_URI,
        )
        .await
        .unwrap()
    }

    fn auth_params(flow: &LaunchFlow, form: &AutoSubmitForm, user_id: i64, nonce: &str) -> AuthRequestParams {
        AuthRequestParams {
            scope: Some("openid".to_string()),
            response_type: Some("id_token".to_string()),
            client_id: Some(flow.config.client_id.clone()),
            redirect_uri: Some(TARGET_URI.to_string()),
            login_hint: Some(format!("{DEMO_COURSE_ID}/{user_id}")),
            lti_message_hint: form.param("lti_message_hint").map(|s| s.to_string()),
            state: Some("state-1".to_string()),
            response_mode: Some("form_post".to_string()),
            nonce: Some(nonce.to_string()),
            prompt: Some("none".to_string()),
        }
    }

    async fn decode_hint(flow: &LaunchFlow, form: &AutoSubmitForm) -> MessageHintClaims {
        let keychain = flow.keys.platform_keychain().await.unwrap();
        let audience = flow.platform_audience();
        CryptoService::decode_claims(
            form.param("lti_message_hint").unwrap(),
            &keychain.public_key,
            &CryptoService::platform_validation(&audience, &audience),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resource_link_login_hint_and_signature() {
        let flow = test_flow().await;
        let form = init_launch(&flow, DEMO_TEACHER_ID).await;

        assert_eq!(form.action, "https://kialo.example/lti/login");
        assert_eq!(
            form.param("login_hint").unwrap(),
            format!("{DEMO_COURSE_ID}/{DEMO_TEACHER_ID}")
        );
        assert_eq!(form.param("iss").unwrap(), "http://platform.example");
        assert_eq!(form.param("lti_deployment_id").unwrap(), DEMO_DEPLOYMENT_ID);

        // The message hint must verify against the platform key
        let keychain = flow.keys.platform_keychain().await.unwrap();
        assert!(
            CryptoService::verify(form.param("lti_message_hint").unwrap(), &keychain.public_key)
                .is_ok()
        );

        let hint = decode_hint(&flow, &form).await;
        assert_eq!(hint.message_type, LtiMessageType::ResourceLinkRequest);
        assert_eq!(hint.roles, vec![ROLE_INSTRUCTOR.to_string()]);
        assert_eq!(hint.resource_link_id.as_deref(), Some("501"));
    }

    #[tokio::test]
    async fn test_role_mapping() {
        let flow = test_flow().await;

        let form = init_launch(&flow, DEMO_TEACHER_ID).await;
        assert_eq!(
            decode_hint(&flow, &form).await.roles,
            vec![ROLE_INSTRUCTOR.to_string()]
        );

        let form = init_launch(&flow, DEMO_STUDENT_ID).await;
        assert_eq!(
            decode_hint(&flow, &form).await.roles,
            vec![ROLE_LEARNER.to_string()]
        );
    }

    #[tokio::test]
    async fn test_unenrolled_user_is_rejected_before_any_message() {
        let flow = test_flow().await;
        let authz = flow.courses.authorization(DEMO_COURSE_ID, 9999).await.unwrap();

        let result = flow
            .init_resource_link(
                &authz,
                DEMO_COURSE_ID,
                DEMO_MODULE_ID,
                DEMO_DEPLOYMENT_ID,
                9999,
                TARGET_URI,
            )
            .await;
        assert!(matches!(result, Err(LtiError::NotAuthorized(_))));
    }

    #[tokio::test]
    async fn test_group_claims_for_learners_only() {
        let flow = test_flow().await;

        // Learner in one group gets the group claim
        let form = init_launch(&flow, DEMO_GROUPED_STUDENT_ID).await;
        let hint = decode_hint(&flow, &form).await;
        let group = hint.group.unwrap();
        assert_eq!(group.id, 21);
        assert_eq!(group.name, "Red team");

        // Teachers are excluded from group scoping even when they belong to one
        flow.courses
            .add_group_member(21, DEMO_TEACHER_ID, "2024-02-01T08:00:00Z")
            .await
            .unwrap();
        let form = init_launch(&flow, DEMO_TEACHER_ID).await;
        assert!(decode_hint(&flow, &form).await.group.is_none());
    }

    #[tokio::test]
    async fn test_init_deep_link_requires_instructor() {
        let flow = test_flow().await;

        let authz = flow
            .courses
            .authorization(DEMO_COURSE_ID, DEMO_STUDENT_ID)
            .await
            .unwrap();
        let result = flow
            .init_deep_link(&authz, DEMO_COURSE_ID, DEMO_STUDENT_ID, DEMO_DEPLOYMENT_ID)
            .await;
        assert!(matches!(result, Err(LtiError::NotAuthorized(_))));

        let authz = flow
            .courses
            .authorization(DEMO_COURSE_ID, DEMO_TEACHER_ID)
            .await
            .unwrap();
        let form = flow
            .init_deep_link(&authz, DEMO_COURSE_ID, DEMO_TEACHER_ID, DEMO_DEPLOYMENT_ID)
            .await
            .unwrap();
        let hint = decode_hint(&flow, &form).await;
        assert_eq!(hint.message_type, LtiMessageType::DeepLinkingRequest);
        assert_eq!(hint.target_link_uri, "https://kialo.example/lti/deeplink");
    }

    #[tokio::test]
    async fn test_lti_auth_issues_resource_link_id_token() {
        let flow = test_flow().await;
        let form = init_launch(&flow, DEMO_STUDENT_ID).await;

        let params = auth_params(&flow, &form, DEMO_STUDENT_ID, "nonce-1");
        let response = flow.lti_auth(&params, DEMO_STUDENT_ID).await.unwrap();

        assert_eq!(response.action, TARGET_URI);
        assert_eq!(response.param("state").unwrap(), "state-1");

        let keychain = flow.keys.platform_keychain().await.unwrap();
        let validation = CryptoService::platform_validation(
            "http://platform.example",
            &flow.config.client_id,
        );
        let claims: ResourceLinkIdToken = CryptoService::decode_claims(
            response.param("id_token").unwrap(),
            &keychain.public_key,
            &validation,
        )
        .unwrap();

        assert_eq!(claims.sub, DEMO_STUDENT_ID.to_string());
        assert_eq!(claims.nonce, "nonce-1");
        assert_eq!(claims.version, LTI_VERSION);
        assert_eq!(claims.deployment_id, DEMO_DEPLOYMENT_ID);
        assert_eq!(claims.roles, vec![ROLE_LEARNER.to_string()]);
        assert_eq!(claims.context.id, DEMO_COURSE_ID.to_string());
        assert_eq!(claims.resource_link.id, DEMO_MODULE_ID.to_string());
        assert!(claims.ags_endpoint.lineitem.contains("cmid=501"));
        assert_eq!(
            claims.discussion_url_endpoint,
            "http://platform.example/lti/discussion-url"
        );
        assert_eq!(claims.preferred_username.as_deref(), Some("ben.learner"));
        assert_eq!(claims.email.as_deref(), Some("ben@school.example"));
        // Ben has no group, so no custom claims
        assert!(claims.custom.is_none());
    }

    #[tokio::test]
    async fn test_lti_auth_attaches_group_custom_claims() {
        let flow = test_flow().await;
        let form = init_launch(&flow, DEMO_GROUPED_STUDENT_ID).await;

        let params = auth_params(&flow, &form, DEMO_GROUPED_STUDENT_ID, "nonce-2");
        let response = flow.lti_auth(&params, DEMO_GROUPED_STUDENT_ID).await.unwrap();

        let keychain = flow.keys.platform_keychain().await.unwrap();
        let validation = CryptoService::platform_validation(
            "http://platform.example",
            &flow.config.client_id,
        );
        let claims: ResourceLinkIdToken = CryptoService::decode_claims(
            response.param("id_token").unwrap(),
            &keychain.public_key,
            &validation,
        )
        .unwrap();

        let custom = claims.custom.unwrap();
        assert_eq!(custom.get(CUSTOM_GROUP_ID).map(String::as_str), Some("21"));
        assert_eq!(
            custom.get(CUSTOM_GROUP_NAME).map(String::as_str),
            Some("Red team")
        );
    }

    #[tokio::test]
    async fn test_lti_auth_issues_deep_linking_request() {
        let flow = test_flow()
            .await
            .with_nonce_source(Arc::new(crate::nonce_store::FixedNonceSource(
                "fixed-jti".to_string(),
            )));
        let authz = flow
            .courses
            .authorization(DEMO_COURSE_ID, DEMO_TEACHER_ID)
            .await
            .unwrap();
        let form = flow
            .init_deep_link(&authz, DEMO_COURSE_ID, DEMO_TEACHER_ID, DEMO_DEPLOYMENT_ID)
            .await
            .unwrap();

        let mut params = auth_params(&flow, &form, DEMO_TEACHER_ID, "nonce-3");
        params.redirect_uri = Some("https://kialo.example/lti/deeplink".to_string());
        let response = flow.lti_auth(&params, DEMO_TEACHER_ID).await.unwrap();

        let keychain = flow.keys.platform_keychain().await.unwrap();
        let validation = CryptoService::platform_validation(
            "http://platform.example",
            &flow.config.client_id,
        );
        let claims: DeepLinkingRequestIdToken = CryptoService::decode_claims(
            response.param("id_token").unwrap(),
            &keychain.public_key,
            &validation,
        )
        .unwrap();

        let settings = claims.deep_linking_settings;
        assert_eq!(settings.deep_link_return_url, "http://platform.example/lti/select");
        assert_eq!(settings.accept_types, vec!["ltiResourceLink".to_string()]);
        assert_eq!(
            settings.accept_presentation_document_targets,
            vec!["window".to_string()]
        );
        assert!(!settings.accept_multiple);
        assert!(!settings.auto_create);

        // The data token is platform-signed and carries the injected nonce
        assert!(CryptoService::verify(&settings.data, &keychain.public_key).is_ok());
        let data: DeepLinkingDataClaims = CryptoService::decode_claims(
            &settings.data,
            &keychain.public_key,
            &CryptoService::platform_validation("http://platform.example", "http://platform.example"),
        )
        .unwrap();
        assert_eq!(data.jti, "fixed-jti");
    }

    #[tokio::test]
    async fn test_lti_auth_rejects_parameter_mismatches() {
        let flow = test_flow().await;
        let form = init_launch(&flow, DEMO_STUDENT_ID).await;

        let base = auth_params(&flow, &form, DEMO_STUDENT_ID, "nonce-4");

        let mut params = AuthRequestParams { scope: Some("profile".to_string()), ..base.clone() };
        assert!(matches!(
            flow.lti_auth(&params, DEMO_STUDENT_ID).await,
            Err(LtiError::ClaimMismatch(_))
        ));

        params = AuthRequestParams { response_type: Some("code".to_string()), ..base.clone() };
        assert!(matches!(
            flow.lti_auth(&params, DEMO_STUDENT_ID).await,
            Err(LtiError::ClaimMismatch(_))
        ));

        params = AuthRequestParams { prompt: Some("login".to_string()), ..base.clone() };
        assert!(matches!(
            flow.lti_auth(&params, DEMO_STUDENT_ID).await,
            Err(LtiError::ClaimMismatch(_))
        ));

        params = AuthRequestParams { client_id: Some("someone-else".to_string()), ..base.clone() };
        assert!(matches!(
            flow.lti_auth(&params, DEMO_STUDENT_ID).await,
            Err(LtiError::ClaimMismatch(_))
        ));

        params = AuthRequestParams { nonce: None, ..base.clone() };
        assert!(matches!(
            flow.lti_auth(&params, DEMO_STUDENT_ID).await,
            Err(LtiError::ClaimMismatch(_))
        ));

        // login_hint naming a different user than the session
        assert!(matches!(
            flow.lti_auth(&base.clone(), DEMO_TEACHER_ID).await,
            Err(LtiError::ClaimMismatch(_))
        ));

        // redirect_uri outside the tool
        params = AuthRequestParams {
            redirect_uri: Some("https://evil.example/launch".to_string()),
            ..base.clone()
        };
        assert!(matches!(
            flow.lti_auth(&params, DEMO_STUDENT_ID).await,
            Err(LtiError::ClaimMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_lti_auth_rejects_tampered_message_hint() {
        let flow = test_flow().await;
        let form = init_launch(&flow, DEMO_STUDENT_ID).await;

        // Sign a hint with a key that is not the platform's
        let foreign = KeyChain::generate("foreign").unwrap();
        let hint = decode_hint(&flow, &form).await;
        let forged = CryptoService::sign(&hint, &foreign).unwrap();

        let mut params = auth_params(&flow, &form, DEMO_STUDENT_ID, "nonce-5");
        params.lti_message_hint = Some(forged);

        assert!(matches!(
            flow.lti_auth(&params, DEMO_STUDENT_ID).await,
            Err(LtiError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_lti_auth_rejects_replayed_nonce() {
        let flow = test_flow().await;
        let form = init_launch(&flow, DEMO_STUDENT_ID).await;

        let params = auth_params(&flow, &form, DEMO_STUDENT_ID, "nonce-6");
        flow.lti_auth(&params, DEMO_STUDENT_ID).await.unwrap();

        assert!(matches!(
            flow.lti_auth(&params, DEMO_STUDENT_ID).await,
            Err(LtiError::NonceReused)
        ));
    }

    // Deep-linking response validation

    struct DeepLinkFixture {
        flow: LaunchFlow,
        tool_keychain: KeyChain,
    }

    async fn deep_link_fixture() -> DeepLinkFixture {
        let tool_keychain = KeyChain::generate("kialo-tool").unwrap();
        let flow = test_flow().await.with_tool_keychain(tool_keychain.clone());
        DeepLinkFixture { flow, tool_keychain }
    }

    fn response_claims(
        flow: &LaunchFlow,
        nonce: &str,
        content_items: Vec<ContentItem>,
    ) -> DeepLinkingResponseClaims {
        let now = Utc::now().timestamp();
        DeepLinkingResponseClaims {
            iss: flow.config.client_id.clone(),
            aud: "http://platform.example".to_string(),
            exp: now + 600,
            iat: now,
            nonce: nonce.to_string(),
            message_type: "LtiDeepLinkingResponse".to_string(),
            version: LTI_VERSION.to_string(),
            deployment_id: DEMO_DEPLOYMENT_ID.to_string(),
            data: None,
            content_items,
        }
    }

    fn resource_item(url: Option<&str>) -> ContentItem {
        ContentItem {
            item_type: CONTENT_ITEM_RESOURCE_LINK.to_string(),
            url: url.map(|u| u.to_string()),
            title: Some("Climate".to_string()),
        }
    }

    #[tokio::test]
    async fn test_deep_linking_response_accepts_single_resource_link() {
        let fixture = deep_link_fixture().await;
        let claims = response_claims(
            &fixture.flow,
            "dl-nonce-1",
            vec![resource_item(Some("https://kialo.example/p/42"))],
        );
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();

        let result = fixture
            .flow
            .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
            .await
            .unwrap();

        assert_eq!(result.deployment_id, DEMO_DEPLOYMENT_ID);
        assert_eq!(result.discussion_url, "https://kialo.example/p/42");
        assert_eq!(result.discussion_title.as_deref(), Some("Climate"));
    }

    #[tokio::test]
    async fn test_deep_linking_response_verifies_data_token() {
        let fixture = deep_link_fixture().await;
        let keychain = fixture.flow.keys.platform_keychain().await.unwrap();

        let now = Utc::now().timestamp();
        let data_claims = DeepLinkingDataClaims {
            iss: "http://platform.example".to_string(),
            aud: "http://platform.example".to_string(),
            exp: now + 600,
            iat: now,
            jti: "jti-1".to_string(),
        };
        let mut claims = response_claims(
            &fixture.flow,
            "dl-nonce-2",
            vec![resource_item(Some("https://kialo.example/p/42"))],
        );
        claims.data = Some(CryptoService::sign(&data_claims, &keychain).unwrap());
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await
                .is_ok()
        );

        // A data token signed by anyone else fails
        let foreign = KeyChain::generate("foreign").unwrap();
        let mut claims = response_claims(
            &fixture.flow,
            "dl-nonce-3",
            vec![resource_item(Some("https://kialo.example/p/42"))],
        );
        claims.data = Some(CryptoService::sign(&data_claims, &foreign).unwrap());
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_deep_linking_response_content_item_failures_are_distinct() {
        let fixture = deep_link_fixture().await;

        // Zero items
        let claims = response_claims(&fixture.flow, "dl-nonce-4", vec![]);
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::ContentItemCountInvalid(0))
        ));

        // More than one item
        let claims = response_claims(
            &fixture.flow,
            "dl-nonce-5",
            vec![
                resource_item(Some("https://kialo.example/p/1")),
                resource_item(Some("https://kialo.example/p/2")),
            ],
        );
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::ContentItemCountInvalid(2))
        ));

        // Wrong content type
        let mut item = resource_item(Some("https://kialo.example/p/1"));
        item.item_type = "html".to_string();
        let claims = response_claims(&fixture.flow, "dl-nonce-6", vec![item]);
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::ContentItemTypeInvalid(_))
        ));

        // Missing and empty URLs
        let claims = response_claims(&fixture.flow, "dl-nonce-7", vec![resource_item(None)]);
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::ContentItemUrlMissing)
        ));

        let claims = response_claims(&fixture.flow, "dl-nonce-8", vec![resource_item(Some(""))]);
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::ContentItemUrlMissing)
        ));
    }

    #[tokio::test]
    async fn test_deep_linking_response_rejects_replay_and_bad_claims() {
        let fixture = deep_link_fixture().await;

        // Nonce replay
        let claims = response_claims(
            &fixture.flow,
            "dl-nonce-9",
            vec![resource_item(Some("https://kialo.example/p/42"))],
        );
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        fixture
            .flow
            .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
            .await
            .unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::NonceReused)
        ));

        // Wrong message type
        let mut claims = response_claims(
            &fixture.flow,
            "dl-nonce-10",
            vec![resource_item(Some("https://kialo.example/p/42"))],
        );
        claims.message_type = "LtiResourceLinkRequest".to_string();
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::MessageTypeInvalid(_))
        ));

        // Wrong audience
        let mut claims = response_claims(
            &fixture.flow,
            "dl-nonce-11",
            vec![resource_item(Some("https://kialo.example/p/42"))],
        );
        claims.aud = "https://other.example".to_string();
        let jwt = CryptoService::sign(&claims, &fixture.tool_keychain).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::ClaimMismatch(_))
        ));

        // Signed by a key that is not the tool's
        let impostor = {
            let mut keychain = KeyChain::generate("kialo-tool").unwrap();
            keychain.key_id = fixture.tool_keychain.key_id.clone();
            keychain
        };
        let claims = response_claims(
            &fixture.flow,
            "dl-nonce-12",
            vec![resource_item(Some("https://kialo.example/p/42"))],
        );
        let jwt = CryptoService::sign(&claims, &impostor).unwrap();
        assert!(matches!(
            fixture
                .flow
                .validate_deep_linking_response(&jwt, DEMO_DEPLOYMENT_ID)
                .await,
            Err(LtiError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_auto_submit_form_escapes_values() {
        let form = AutoSubmitForm {
            action: "https://kialo.example/lti/login".to_string(),
            params: vec![("state".to_string(), "a\"b<c>".to_string())],
        };
        let html = form.to_html();

        assert!(html.contains("a&quot;b&lt;c&gt;"));
        assert!(html.contains("document.getElementById(\"lti\").submit()"));
    }

    #[test]
    fn test_parse_login_hint() {
        assert_eq!(parse_login_hint("7/101").unwrap(), (7, 101));
        assert!(parse_login_hint("7").is_err());
        assert!(parse_login_hint("a/b").is_err());
    }
}
