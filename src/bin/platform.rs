use axum::{
    Json, Router,
    extract::{Form, Path, Query, RawForm, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use kialo_lti::{
    api::{
        AuthRequestParams, DiscussionUrlUpdate, DiscussionUrlUpdateResponse, LineItemQuery,
        OAuthErrorBody, ScoreUpdate, ScoreUpdateResponse, SelectQuery, SelectResponseForm,
        SESSION_USER_HEADER, TokenRequest,
    },
    claims::{SCOPE_AGS_LINEITEM, SCOPE_AGS_SCORE, SCOPE_UPDATE_DISCUSSION_URL, service_scopes},
    config::Config,
    course_store::CourseStore,
    error::LtiError,
    grading::GradingService,
    key_store::PlatformKeyStore,
    launch::LaunchFlow,
    logging,
    nonce_store::NonceStore,
    service_token::ServiceTokenIssuer,
};

#[derive(Clone)]
struct AppState {
    config: Config,
    flow: LaunchFlow,
    grading: GradingService,
    tokens: ServiceTokenIssuer,
    courses: CourseStore,
    keys: PlatformKeyStore,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::setup_default_logging()?;
    info!("Starting LTI platform service");

    let config = Config::from_env();

    if !std::path::Path::new(&config.db_path).exists() {
        std::fs::File::create(&config.db_path)?;
    }

    let db_url = format!("sqlite:{}", config.db_path);

    let keys = PlatformKeyStore::new(&db_url).await?;
    let nonces = NonceStore::new(&db_url).await?;
    let courses = CourseStore::new(&db_url).await?;
    courses.seed_demo().await?;

    // The signing key is fatal to every flow, so provision it up front
    let keychain = keys.platform_keychain().await?;
    info!("Platform signing key ID: {}", keychain.key_id);

    let state = AppState {
        flow: LaunchFlow::new(config.clone(), keys.clone(), nonces, courses.clone()),
        grading: GradingService::new(courses.clone()),
        tokens: ServiceTokenIssuer::new(config.clone(), keys.clone()),
        courses,
        keys,
        config: config.clone(),
    };

    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build our application with routes
    let app = Router::new()
        .route("/courses/{course_id}/modules/{cm_id}/launch", get(launch_module))
        .route("/lti/auth", get(lti_auth_get).post(lti_auth_post))
        .route("/lti/select", get(lti_select).post(lti_select_response))
        .route("/lti/jwks", get(lti_jwks))
        .route("/.well-known/openid-configuration", get(openid_configuration))
        .route("/lti/lineitem", get(lti_lineitem))
        .route("/lti/lineitem/scores", post(lti_scores))
        .route("/lti/token", post(lti_token))
        .route("/lti/discussion-url", post(update_discussion_url))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Authenticated session user, as reported by the host session adapter
fn session_user(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(SESSION_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// Convert a flow failure into the generic user-facing error page.
///
/// The detailed reason only goes to the logs.
fn error_page(err: &LtiError) -> Response {
    error!("LTI flow failed: {}", err);
    let status = match err {
        LtiError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        LtiError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Html(
            "<html><body><h1>Something went wrong</h1>\
             <p>The launch could not be completed. Please go back and try again.</p>\
             </body></html>"
                .to_string(),
        ),
    )
        .into_response()
}

fn login_required() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Html("<html><body><h1>Please log in first</h1></body></html>".to_string()),
    )
        .into_response()
}

/// Launch a course module into the Kialo discussion it embeds
async fn launch_module(
    State(state): State<AppState>,
    Path((course_id, cm_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let Some(user_id) = session_user(&headers) else {
        return login_required();
    };

    let module = match state.courses.module(cm_id).await {
        Ok(Some(module)) if module.course_id == course_id => module,
        Ok(_) => return error_page(&LtiError::NotFound(format!("module {cm_id}"))),
        Err(e) => return error_page(&LtiError::from(e)),
    };

    // Launch the selected discussion, or the tool's generic launch page when
    // no discussion has been deep-linked yet
    let target_link_uri = match module.discussion_url.clone() {
        Some(url) => url,
        None => match state.config.tool_url() {
            Ok(tool_url) => format!("{tool_url}/lti/launch"),
            Err(e) => return error_page(&e),
        },
    };

    let authz = match state.courses.authorization(course_id, user_id).await {
        Ok(authz) => authz,
        Err(e) => return error_page(&LtiError::from(e)),
    };

    match state
        .flow
        .init_resource_link(
            &authz,
            course_id,
            cm_id,
            &module.deployment_id,
            user_id,
            &target_link_uri,
        )
        .await
    {
        Ok(form) => Html(form.to_html()).into_response(),
        Err(e) => error_page(&e),
    }
}

async fn lti_auth_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuthRequestParams>,
) -> Response {
    lti_auth(state, headers, params).await
}

async fn lti_auth_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<AuthRequestParams>,
) -> Response {
    lti_auth(state, headers, params).await
}

/// OIDC third-party-initiated login callback
async fn lti_auth(state: AppState, headers: HeaderMap, params: AuthRequestParams) -> Response {
    let Some(user_id) = session_user(&headers) else {
        return login_required();
    };

    match state.flow.lti_auth(&params, user_id).await {
        Ok(form) => Html(form.to_html()).into_response(),
        Err(e) => error_page(&e),
    }
}

/// Deep-linking entry point: send the teacher to the tool's selection UI
async fn lti_select(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SelectQuery>,
) -> Response {
    let Some(user_id) = session_user(&headers) else {
        return login_required();
    };

    let authz = match state.courses.authorization(query.courseid, user_id).await {
        Ok(authz) => authz,
        Err(e) => return error_page(&LtiError::from(e)),
    };

    match state
        .flow
        .init_deep_link(&authz, query.courseid, user_id, &query.deploymentid)
        .await
    {
        Ok(form) => Html(form.to_html()).into_response(),
        Err(e) => error_page(&e),
    }
}

/// Deep-linking response receiver: validate the selection and store it
async fn lti_select_response(
    State(state): State<AppState>,
    Form(form): Form<SelectResponseForm>,
) -> Response {
    let result = match state
        .flow
        .validate_deep_linking_response(&form.jwt, &form.deploymentid)
        .await
    {
        Ok(result) => result,
        Err(e) => return error_page(&e),
    };

    let module = match state.courses.module_by_deployment(&result.deployment_id).await {
        Ok(Some(module)) => module,
        Ok(None) => {
            return error_page(&LtiError::NotFound(format!(
                "deployment {}",
                result.deployment_id
            )));
        }
        Err(e) => return error_page(&LtiError::from(e)),
    };

    if let Err(e) = state
        .courses
        .set_discussion(
            module.id,
            &result.discussion_url,
            result.discussion_title.as_deref(),
        )
        .await
    {
        return error_page(&LtiError::from(e));
    }

    info!(
        "Deep linking stored discussion {} for module {}",
        result.discussion_url, module.id
    );

    // Close the selection window and notify the opener
    Html(
        "<html><body>\
         <p>Discussion selected. You can close this window.</p>\
         <script>\
         if (window.opener) { window.opener.postMessage({ type: \"kialo_discussion_selected\" }, \"*\"); }\
         window.close();\
         </script>\
         </body></html>"
            .to_string(),
    )
    .into_response()
}

/// Publish the platform's public signing key
async fn lti_jwks(State(state): State<AppState>) -> Response {
    match state.keys.platform_keychain().await {
        Ok(keychain) => Json(keychain.public_jwks_document()).into_response(),
        Err(e) => {
            error!("Failed to load platform keychain: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Static OpenID/LTI platform configuration document
async fn openid_configuration(State(state): State<AppState>) -> Json<serde_json::Value> {
    let issuer = state.config.platform_url.trim_end_matches('/').to_string();
    let mut scopes = vec!["openid".to_string()];
    scopes.extend(service_scopes().iter().map(|s| s.to_string()));

    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/lti/auth"),
        "token_endpoint": format!("{issuer}/lti/token"),
        "jwks_uri": format!("{issuer}/lti/jwks"),
        "response_types_supported": ["id_token"],
        "response_modes_supported": ["form_post"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "grant_types_supported": ["client_credentials"],
        "scopes_supported": scopes,
        "claims_supported": [
            "sub", "name", "given_name", "family_name", "middle_name",
            "email", "locale", "zoneinfo", "picture", "preferred_username"
        ],
    }))
}

/// Require a bearer token carrying one scope
async fn require_scope(
    state: &AppState,
    headers: &HeaderMap,
    scope: &str,
) -> Result<(), Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(token) = token else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(OAuthErrorBody {
                error: "invalid_token".to_string(),
            }),
        )
            .into_response());
    };

    match state.tokens.validate(token, scope).await {
        Ok(_) => Ok(()),
        Err(LtiError::InsufficientScope(scope)) => {
            error!("Service token is missing scope {}", scope);
            Err((
                StatusCode::FORBIDDEN,
                Json(OAuthErrorBody {
                    error: "insufficient_scope".to_string(),
                }),
            )
                .into_response())
        }
        Err(e) => {
            error!("Service token rejected: {}", e);
            Err((
                StatusCode::UNAUTHORIZED,
                Json(OAuthErrorBody {
                    error: "invalid_token".to_string(),
                }),
            )
                .into_response())
        }
    }
}

/// AGS line-item descriptor
async fn lti_lineitem(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LineItemQuery>,
) -> Response {
    if let Err(response) = require_scope(&state, &headers, SCOPE_AGS_LINEITEM).await {
        return response;
    }

    // The line item id is the canonical URL of this request
    let issuer = state.config.platform_url.trim_end_matches('/');
    let request_url = format!(
        "{issuer}/lti/lineitem?course_id={}&cmid={}&resource_link_id={}",
        params.course_id, params.cmid, params.resource_link_id
    );

    match state
        .grading
        .line_item(params.course_id, params.cmid, &params.resource_link_id, &request_url)
        .await
    {
        Ok(item) => Json(item).into_response(),
        Err(LtiError::NotFound(what)) => {
            error!("Line item not found: {}", what);
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            error!("Line item lookup failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScoresParams {
    course_id: i64,
    cmid: i64,
}

/// AGS score postback
async fn lti_scores(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ScoresParams>,
    Json(score): Json<ScoreUpdate>,
) -> Response {
    if let Err(response) = require_scope(&state, &headers, SCOPE_AGS_SCORE).await {
        return response;
    }

    match state
        .grading
        .update_grade(params.course_id, params.cmid, &score)
        .await
    {
        Ok(success) => Json(ScoreUpdateResponse { success }).into_response(),
        Err(e) => {
            error!("Grade update failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// OAuth2 client-credentials token endpoint
async fn lti_token(State(state): State<AppState>, RawForm(body): RawForm) -> Response {
    // Tolerate an absent or malformed body; it just means missing parameters
    let request: TokenRequest = serde_urlencoded::from_bytes(&body).unwrap_or_default();

    match state.tokens.issue(&request).await {
        Ok(response) => Json(response).into_response(),
        Err(LtiError::UnsupportedGrantType) => (
            StatusCode::BAD_REQUEST,
            Json(OAuthErrorBody {
                error: "unsupported_grant_type".to_string(),
            }),
        )
            .into_response(),
        Err(LtiError::InvalidClient) => (
            StatusCode::UNAUTHORIZED,
            Json(OAuthErrorBody {
                error: "invalid_client".to_string(),
            }),
        )
            .into_response(),
        Err(LtiError::InsufficientScope(scope)) => {
            error!("Token request asked for invalid scope: {}", scope);
            (
                StatusCode::BAD_REQUEST,
                Json(OAuthErrorBody {
                    error: "invalid_scope".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Token issuance failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Service endpoint letting the tool backend update a stored discussion URL
async fn update_discussion_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<DiscussionUrlUpdate>,
) -> Response {
    if let Err(response) = require_scope(&state, &headers, SCOPE_UPDATE_DISCUSSION_URL).await {
        return response;
    }

    let module = match state.courses.module(update.cmid).await {
        Ok(Some(module)) if module.course_id == update.course_id => module,
        Ok(_) => return Json(DiscussionUrlUpdateResponse { success: false }).into_response(),
        Err(e) => {
            error!("Discussion URL update failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // The resource link of a module is its course-module id
    if update.resource_link_id != module.id.to_string() {
        error!(
            "Discussion URL update names resource link {} for module {}",
            update.resource_link_id, module.id
        );
        return Json(DiscussionUrlUpdateResponse { success: false }).into_response();
    }

    match state
        .courses
        .set_discussion(
            module.id,
            &update.discussion_url,
            update.discussion_title.as_deref(),
        )
        .await
    {
        Ok(success) => Json(DiscussionUrlUpdateResponse { success }).into_response(),
        Err(e) => {
            error!("Discussion URL update failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
