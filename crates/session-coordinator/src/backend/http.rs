use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};
use url::Url;

use super::{AuthBackend, Credentials, Grant};
use crate::error::{BackendError, TransportError};
use crate::pipeline::{ApiRequest, ApiResponse, RequestBody, Transport};
use crate::renewal::MAX_DELAY;
use crate::session::UserIdentity;

/// Default timeout for a single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_USER_AGENT: &str = concat!("session-coordinator/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept in a [`BackendError::Status`] message.
const MAX_ERROR_BODY: usize = 512;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Where the backend's endpoints live.
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub base_url: Url,
    pub refresh_path: String,
    pub identity_path: String,
    pub logout_path: String,
    pub sign_in_path: String,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl HttpBackendConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            refresh_path: "/api/auth/refresh".to_string(),
            identity_path: "/api/auth/me".to_string(),
            logout_path: "/api/auth/logout".to_string(),
            sign_in_path: "/api/auth/login".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Resolve `path` against the base URL, keeping any path prefix the base carries.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let prefixed = format!("{}/", base.path());
            base.set_path(&prefixed);
        }
        base.join(path.trim_start_matches('/'))
    }
}

/// Cookie-session HTTP backend.
///
/// The credential lives in the client's cookie store: the backend sets it on
/// sign-in and refresh, and every request (auth or application) carries it.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    refresh_url: Url,
    identity_url: Url,
    logout_url: Url,
    sign_in_url: Url,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        install_rustls_provider();

        let client = Client::builder()
            .cookie_store(true)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        let resolve = |path: &str| {
            config
                .endpoint(path)
                .map_err(|e| BackendError::Config(format!("invalid endpoint {path:?}: {e}")))
        };

        Ok(Self {
            refresh_url: resolve(&config.refresh_path)?,
            identity_url: resolve(&config.identity_path)?,
            logout_url: resolve(&config.logout_path)?,
            sign_in_url: resolve(&config.sign_in_path)?,
            client,
            config,
        })
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    /// Build `request` against the base URL. Called once per attempt, so
    /// bodies consumed by sending (multipart) are rebuilt for a replay.
    fn build(&self, request: &ApiRequest) -> Result<RequestBuilder, TransportError> {
        let mut url = self.config.endpoint(request.path()).map_err(|e| {
            TransportError::InvalidRequest(format!("{}: {}", request.path(), e))
        })?;
        if !request.query_pairs().is_empty() {
            url.query_pairs_mut().extend_pairs(
                request
                    .query_pairs()
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            );
        }

        let builder = self.client.request(request.method().clone(), url);
        Ok(match request.body() {
            None => builder,
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Bytes { content_type, data }) => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            Some(RequestBody::File {
                field,
                file_name,
                data,
            }) => {
                let part = Part::bytes(data.to_vec()).file_name(file_name.clone());
                builder.multipart(Form::new().part(field.clone(), part))
            }
        })
    }
}

#[async_trait]
impl AuthBackend for HttpBackend {
    async fn refresh(&self) -> Result<Grant, BackendError> {
        trace!(url = %self.refresh_url, "Refreshing credential");
        let response = self.client.post(self.refresh_url.clone()).send().await?;
        let body = read_auth_response(AuthCall::Session, response).await?;
        Ok(parse_grant(&body))
    }

    async fn fetch_identity(&self) -> Result<UserIdentity, BackendError> {
        let response = self.client.get(self.identity_url.clone()).send().await?;
        let body = read_auth_response(AuthCall::Session, response).await?;
        serde_json::from_slice(&body).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn logout(&self) -> Result<(), BackendError> {
        let response = self.client.post(self.logout_url.clone()).send().await?;
        read_auth_response(AuthCall::Logout, response).await?;
        Ok(())
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Grant, BackendError> {
        let response = self
            .client
            .post(self.sign_in_url.clone())
            .json(&json!({
                "userName": credentials.username,
                "password": credentials.password(),
            }))
            .send()
            .await?;

        let body = read_auth_response(AuthCall::SignIn, response).await?;
        Ok(parse_grant(&body))
    }
}

#[async_trait]
impl Transport for HttpBackend {
    async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let response = self.build(request)?.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(
            method = %request.method(),
            path = request.path(),
            %status,
            bytes = body.len(),
            "Request completed"
        );
        Ok(ApiResponse::new(status, headers, body))
    }
}

/// Which auth endpoint answered; they read a 401 differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthCall {
    /// Refresh or identity: 401 means the credential is not accepted.
    Session,
    /// 401 means bad credentials, not a stale session.
    SignIn,
    /// 401 means already logged out server-side.
    Logout,
}

async fn read_auth_response(call: AuthCall, response: Response) -> Result<Bytes, BackendError> {
    let status = response.status();
    let body = response.bytes().await?;
    match auth_failure(call, status, &body) {
        Some(e) => Err(e),
        None => Ok(body),
    }
}

/// Map an auth endpoint's answer to an error. `None` means the call succeeded.
fn auth_failure(call: AuthCall, status: StatusCode, body: &[u8]) -> Option<BackendError> {
    if status.is_success() {
        return None;
    }

    match (call, status) {
        (AuthCall::Logout, StatusCode::UNAUTHORIZED) => None,
        (AuthCall::Session, StatusCode::UNAUTHORIZED) => Some(BackendError::Unauthenticated),
        _ => Some(BackendError::Status {
            status: status.as_u16(),
            message: error_message(status, body),
        }),
    }
}

fn error_message(status: StatusCode, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
    }
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantBody {
    /// Seconds until expiry.
    expires_in: Option<u64>,
    expires_at: Option<DateTime<Utc>>,
}

/// Read the credential lifetime from a refresh or sign-in body.
///
/// Cookie backends often answer with an empty body or a body without expiry
/// information; both yield a grant with unknown expiry.
fn parse_grant(body: &[u8]) -> Grant {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Grant::default();
    }

    let parsed = match serde_json::from_slice::<GrantBody>(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "Grant body is not JSON; expiry unknown");
            return Grant::default();
        }
    };

    let expires_in = parsed.expires_in.map(Duration::from_secs).or_else(|| {
        parsed
            .expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    });
    Grant {
        expires_in: expires_in.map(|d| d.min(MAX_DELAY)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grant_variants() {
        assert_eq!(parse_grant(b""), Grant::default());
        assert_eq!(parse_grant(b"  \n"), Grant::default());
        assert_eq!(parse_grant(b"OK"), Grant::default());
        assert_eq!(
            parse_grant(br#"{"userName":"alice"}"#),
            Grant::default()
        );
        assert_eq!(
            parse_grant(br#"{"expiresIn": 900}"#),
            Grant::expiring_in(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_parse_grant_caps_lifetime() {
        let body = format!(r#"{{"expiresIn": {}}}"#, u64::MAX);
        assert_eq!(parse_grant(body.as_bytes()).expires_in, Some(MAX_DELAY));
    }

    #[test]
    fn test_parse_grant_absolute_expiry() {
        let at = Utc::now() + chrono::TimeDelta::minutes(10);
        let body = serde_json::to_vec(&json!({ "expiresAt": at })).unwrap();
        let expires_in = parse_grant(&body).expires_in.unwrap();
        assert!(expires_in > Duration::from_secs(590));
        assert!(expires_in <= Duration::from_secs(600));

        let past = Utc::now() - chrono::TimeDelta::minutes(1);
        let body = serde_json::to_vec(&json!({ "expiresAt": past })).unwrap();
        assert_eq!(parse_grant(&body).expires_in, Some(Duration::ZERO));
    }

    #[test]
    fn test_endpoint_keeps_base_prefix() {
        let config = HttpBackendConfig::new(Url::parse("https://assets.example.com/portal").unwrap());
        assert_eq!(
            config.endpoint("/api/auth/me").unwrap().as_str(),
            "https://assets.example.com/portal/api/auth/me"
        );

        let config = HttpBackendConfig::new(Url::parse("https://localhost:7036/").unwrap());
        assert_eq!(
            config.endpoint("api/asset/hierarchy").unwrap().as_str(),
            "https://localhost:7036/api/asset/hierarchy"
        );
    }

    #[test]
    fn test_auth_status_mapping() {
        assert!(auth_failure(AuthCall::Session, StatusCode::OK, b"").is_none());
        assert!(matches!(
            auth_failure(AuthCall::Session, StatusCode::UNAUTHORIZED, b""),
            Some(BackendError::Unauthenticated)
        ));
        assert!(matches!(
            auth_failure(AuthCall::SignIn, StatusCode::UNAUTHORIZED, b"Invalid username or password"),
            Some(BackendError::Status { status: 401, message }) if message == "Invalid username or password"
        ));
        assert!(auth_failure(AuthCall::Logout, StatusCode::UNAUTHORIZED, b"").is_none());
        assert!(matches!(
            auth_failure(AuthCall::Logout, StatusCode::INTERNAL_SERVER_ERROR, b""),
            Some(BackendError::Status { status: 500, message }) if message == "Internal Server Error"
        ));
        assert!(matches!(
            auth_failure(AuthCall::Session, StatusCode::FORBIDDEN, b"  locked  "),
            Some(BackendError::Status { status: 403, message }) if message == "locked"
        ));
    }

    #[test]
    fn test_error_message_is_truncated() {
        let body = "x".repeat(MAX_ERROR_BODY + 10);
        let message = error_message(StatusCode::BAD_GATEWAY, body.as_bytes());
        assert_eq!(message.len(), MAX_ERROR_BODY + 3);
        assert!(message.ends_with("..."));
    }

    fn local_backend() -> HttpBackend {
        HttpBackend::new(HttpBackendConfig::new(Url::parse("http://127.0.0.1:8080/portal").unwrap()))
            .unwrap()
    }

    #[test]
    fn test_build_query_and_json_body() {
        let backend = local_backend();
        let request = ApiRequest::post("/api/asset/add")
            .query("name", "Pump 1")
            .query("parentName", "Plant")
            .json(json!({ "note": "spare" }));

        let built = backend.build(&request).unwrap().build().unwrap();
        assert_eq!(built.method(), &reqwest::Method::POST);
        assert_eq!(
            built.url().as_str(),
            "http://127.0.0.1:8080/portal/api/asset/add?name=Pump+1&parentName=Plant"
        );
        assert_eq!(built.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(
            built.body().and_then(|b| b.as_bytes()),
            Some(br#"{"note":"spare"}"#.as_slice())
        );
    }

    #[test]
    fn test_build_raw_body() {
        let backend = local_backend();
        let request = ApiRequest::put("/api/asset/raw").bytes("text/csv", "name\nPump 1\n");

        let built = backend.build(&request).unwrap().build().unwrap();
        assert_eq!(built.headers()[CONTENT_TYPE], "text/csv");
        assert_eq!(
            built.body().and_then(|b| b.as_bytes()),
            Some(b"name\nPump 1\n".as_slice())
        );
    }

    #[test]
    fn test_build_file_upload_each_attempt() {
        let backend = local_backend();
        let request =
            ApiRequest::post("/api/asset/upload").file("file", "assets.json", r#"[{"name":"A"}]"#);

        for _ in 0..2 {
            let built = backend.build(&request).unwrap().build().unwrap();
            let content_type = built.headers()[CONTENT_TYPE].to_str().unwrap();
            assert!(content_type.starts_with("multipart/form-data; boundary="));
            assert!(built.body().is_some());
        }
    }

    #[test]
    fn test_new_resolves_auth_endpoints() {
        let backend =
            HttpBackend::new(HttpBackendConfig::new(Url::parse("http://127.0.0.1:8080").unwrap()))
                .unwrap();
        assert_eq!(
            backend.refresh_url.as_str(),
            "http://127.0.0.1:8080/api/auth/refresh"
        );
        assert_eq!(backend.sign_in_url.path(), "/api/auth/login");
    }
}
