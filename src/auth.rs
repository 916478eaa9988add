//! 账户注册、认证处理、会话管理与登录限流。

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::Json as JsonResponse;
use axum::{body::Body as AxumBody, middleware, response::IntoResponse};
use axum_extra::extract::{CookieJar, TypedHeader, cookie::Cookie};
use axum_extra::headers::{Authorization, authorization::Basic};
use chrono::Utc;
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::ErrorKind;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::write_atomic;
use crate::config::AUTH_COOKIE_NAME;
use crate::error::{ApiError, ApiJson};
use crate::http::{RequestScheme, is_https_request, resolve_client_ip};

/// The single registered account as persisted in the credentials file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAccount {
    username: String,
    password_hash: String,
    created_at: String,
}

#[derive(Debug)]
pub struct SessionEntry {
    pub username: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct LoginAttempt {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthSettings {
    pub session_ttl: Duration,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
    pub trust_proxy: bool,
}

/// Per-IP failed login accounting. `max_attempts == 0` disables it.
#[derive(Debug)]
pub struct LoginThrottle {
    attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    window: Duration,
    max_attempts: u32,
    lockout: Duration,
}

impl LoginThrottle {
    pub fn new(window: Duration, max_attempts: u32, lockout: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            window,
            max_attempts,
            lockout,
        }
    }

    /// 返回剩余锁定秒数；未锁定时返回 `None`。
    pub async fn check(&self, ip: IpAddr) -> Option<u64> {
        if self.max_attempts == 0 {
            return None;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.get_mut(&ip)?;

        if let Some(locked_until) = entry.locked_until {
            if now < locked_until {
                return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
            }
            entry.locked_until = None;
            entry.failures = 0;
            entry.window_start = now;
        }

        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.failures = 0;
        }

        None
    }

    pub async fn record_failure(&self, ip: IpAddr) {
        if self.max_attempts == 0 {
            return;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(ip).or_insert(LoginAttempt {
            window_start: now,
            failures: 0,
            locked_until: None,
        });

        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.failures = 0;
            entry.locked_until = None;
        }

        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.max_attempts {
            entry.locked_until = Some(now + self.lockout);
            warn!(client_ip = %ip, "login locked out");
        }
    }

    pub async fn clear(&self, ip: IpAddr) {
        self.attempts.lock().await.remove(&ip);
    }

    /// 清理过期的登录失败记录。
    pub async fn prune(&self) {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        attempts.retain(|_, entry| {
            if let Some(locked_until) = entry.locked_until {
                return locked_until > now;
            }
            now.duration_since(entry.window_start) <= self.window
        });
    }
}

/// Owns the registered account, live sessions and the login throttle.
#[derive(Debug)]
pub struct Authenticator {
    credentials_path: PathBuf,
    account: RwLock<Option<StoredAccount>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    session_ttl: Duration,
    throttle: LoginThrottle,
    trust_proxy: bool,
}

impl Authenticator {
    /// 读取凭据文件；不存在时等待首次注册。
    pub async fn load(credentials_path: PathBuf, settings: AuthSettings) -> std::io::Result<Self> {
        let account = read_account(&credentials_path).await?;
        match &account {
            Some(account) => info!(username = account.username, "account loaded"),
            None => warn!("no account registered yet, registration is open"),
        }
        Ok(Self {
            credentials_path,
            account: RwLock::new(account),
            sessions: Mutex::new(HashMap::new()),
            session_ttl: settings.session_ttl,
            throttle: LoginThrottle::new(
                settings.login_window,
                settings.login_max_attempts,
                settings.login_lockout,
            ),
            trust_proxy: settings.trust_proxy,
        })
    }

    pub async fn has_account(&self) -> bool {
        self.account.read().await.is_some()
    }

    /// 一次性注册：已有账户时返回 `Forbidden`。
    pub async fn register(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(ApiError::BadRequest("username and password are required".into()));
        }

        let mut account = self.account.write().await;
        if account.is_some() {
            return Err(ApiError::Forbidden("account already registered".into()));
        }

        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))??;
        let stored = StoredAccount {
            username: username.to_string(),
            password_hash,
            created_at: Utc::now().to_rfc3339(),
        };
        let encoded = serde_json::to_vec_pretty(&stored)
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        write_atomic(&self.credentials_path, &encoded)
            .await
            .map_err(|err| ApiError::Internal(format!("failed to save credentials: {err}")))?;

        info!(username = stored.username, "account registered");
        *account = Some(stored);
        Ok(())
    }

    /// 校验用户名与密码（argon2 校验在阻塞线程中执行）。
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let Some(account) = self.account.read().await.clone() else {
            return false;
        };
        if account.username != username {
            return false;
        }
        let password = password.to_string();
        tokio::task::spawn_blocking(move || verify_password(&account.password_hash, &password))
            .await
            .unwrap_or(false)
    }

    /// 限流键：连接地址，或受信任代理给出的 `x-forwarded-for`。
    pub fn client_ip(&self, headers: &HeaderMap, connect_ip: Option<IpAddr>) -> IpAddr {
        resolve_client_ip(headers, connect_ip, self.trust_proxy)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// 经过登录限流的密码校验，登录接口与 Basic 认证共用。
    pub async fn check_credentials(
        &self,
        client_ip: IpAddr,
        username: &str,
        password: &str,
    ) -> Result<(), ApiError> {
        if let Some(retry_after) = self.throttle.check(client_ip).await {
            return Err(ApiError::TooManyRequests(retry_after));
        }
        if !self.verify(username, password).await {
            self.throttle.record_failure(client_ip).await;
            warn!(client_ip = %client_ip, "credential check failed");
            return Err(ApiError::Unauthorized(HeaderMap::new()));
        }
        self.throttle.clear(client_ip).await;
        Ok(())
    }

    pub async fn create_session(&self, username: &str) -> String {
        let token = Uuid::new_v4().to_string();
        let entry = SessionEntry {
            username: username.to_string(),
            expires_at: Instant::now() + self.session_ttl,
        };
        self.sessions.lock().await.insert(token.clone(), entry);
        token
    }

    /// 有效会话返回对应用户名；过期会话被顺带移除。
    pub async fn session_user(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(token) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.username.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    pub async fn end_session(&self, token: &str) {
        self.sessions.lock().await.remove(token);
    }

    /// 清理过期会话与登录失败记录。
    pub async fn prune(&self) {
        {
            let mut sessions = self.sessions.lock().await;
            let now = Instant::now();
            sessions.retain(|_, entry| entry.expires_at > now);
        }
        self.throttle.prune().await;
    }

    fn session_max_age(&self) -> CookieDuration {
        CookieDuration::seconds(i64::try_from(self.session_ttl.as_secs()).unwrap_or(i64::MAX))
    }
}

async fn read_account(path: &Path) -> std::io::Result<Option<StoredAccount>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|err| ApiError::Internal(err.to_string()))?;
    let salt =
        SaltString::encode_b64(&salt_bytes).map_err(|err| ApiError::Internal(err.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ApiError::Internal(err.to_string()))
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// 认证中间件：校验 Cookie 或 Basic 认证。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<Authenticator>>,
    jar: CookieJar,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME)
        && auth.session_user(cookie.value()).await.is_some()
    {
        return Ok(next.run(req).await);
    }

    if let Some(TypedHeader(basic)) = &auth_header {
        let connect_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let client_ip = auth.client_ip(req.headers(), connect_ip);
        match auth
            .check_credentials(client_ip, basic.username(), basic.password())
            .await
        {
            Ok(()) => return Ok(next.run(req).await),
            Err(ApiError::Unauthorized(_)) => {}
            Err(err) => return Err(err),
        }
    }

    let mut headers = HeaderMap::new();
    if auth_header.is_some() {
        headers.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Basic realm="HaziVault""#),
        );
    }
    Err(ApiError::Unauthorized(headers))
}

fn is_auth_exempt_path(path: &str) -> bool {
    if path.starts_with("/api/auth/") || path == "/api/version" {
        return true;
    }
    !path.starts_with("/api/")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CredentialsRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
pub(crate) struct AccountExists {
    exists: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthStatus {
    authenticated: bool,
    username: Option<String>,
}

/// 是否已注册账户。
pub async fn auth_exists(
    Extension(auth): Extension<Arc<Authenticator>>,
) -> JsonResponse<AccountExists> {
    JsonResponse(AccountExists {
        exists: auth.has_account().await,
    })
}

/// 首次注册管理员账户。
pub async fn auth_register(
    Extension(auth): Extension<Arc<Authenticator>>,
    ApiJson(payload): ApiJson<CredentialsRequest>,
) -> Result<StatusCode, ApiError> {
    auth.register(&payload.username, &payload.password).await?;
    Ok(StatusCode::CREATED)
}

/// 登录接口：创建会话并写入 Cookie。
pub async fn auth_login(
    Extension(auth): Extension<Arc<Authenticator>>,
    Extension(scheme): Extension<RequestScheme>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    ApiJson(payload): ApiJson<CredentialsRequest>,
) -> Result<(CookieJar, axum::response::Response), ApiError> {
    let client_ip = auth.client_ip(&headers, Some(addr.ip()));
    auth.check_credentials(client_ip, &payload.username, &payload.password)
        .await?;

    let token = auth.create_session(&payload.username).await;

    let secure = is_https_request(&headers, scheme);
    let cookie = Cookie::build((AUTH_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(axum_extra::extract::cookie::SameSite::Strict)
        .max_age(auth.session_max_age())
        .build();
    info!(username = payload.username, client_ip = %client_ip, "login");
    Ok((jar.add(cookie), StatusCode::NO_CONTENT.into_response()))
}

/// 登出接口：清理会话并删除 Cookie。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<Authenticator>>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        auth.end_session(cookie.value()).await;
    }

    (
        jar.remove(Cookie::build(AUTH_COOKIE_NAME).path("/").build()),
        StatusCode::NO_CONTENT,
    )
}

/// 查询当前登录状态。
pub async fn auth_status(
    Extension(auth): Extension<Arc<Authenticator>>,
    jar: CookieJar,
) -> JsonResponse<AuthStatus> {
    let username = match jar.get(AUTH_COOKIE_NAME) {
        Some(cookie) => auth.session_user(cookie.value()).await,
        None => None,
    };
    JsonResponse(AuthStatus {
        authenticated: username.is_some(),
        username,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings() -> AuthSettings {
        AuthSettings {
            session_ttl: Duration::from_secs(60),
            login_window: Duration::from_secs(60),
            login_max_attempts: 2,
            login_lockout: Duration::from_secs(60),
            trust_proxy: false,
        }
    }

    async fn make_auth(temp: &tempfile::TempDir) -> Arc<Authenticator> {
        Arc::new(
            Authenticator::load(temp.path().join("credentials.json"), settings())
                .await
                .expect("load auth"),
        )
    }

    async fn login(
        auth: &Arc<Authenticator>,
        password: &str,
    ) -> Result<(CookieJar, axum::response::Response), ApiError> {
        login_with_headers(auth, password, HeaderMap::new()).await
    }

    async fn login_with_headers(
        auth: &Arc<Authenticator>,
        password: &str,
        headers: HeaderMap,
    ) -> Result<(CookieJar, axum::response::Response), ApiError> {
        auth_login(
            Extension(auth.clone()),
            Extension(RequestScheme::Http),
            ConnectInfo(SocketAddr::from((Ipv4Addr::LOCALHOST, 4000))),
            headers,
            CookieJar::new(),
            ApiJson(CredentialsRequest {
                username: "admin".to_string(),
                password: password.to_string(),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn registration_is_one_time() {
        let temp = tempdir().expect("tempdir");
        let auth = make_auth(&temp).await;
        assert!(!auth_exists(Extension(auth.clone())).await.0.exists);

        auth.register("admin", "s3cret").await.expect("register");
        assert!(auth_exists(Extension(auth.clone())).await.0.exists);

        let second = auth.register("other", "pw").await;
        assert!(matches!(second, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn registration_requires_both_fields() {
        let temp = tempdir().expect("tempdir");
        let auth = make_auth(&temp).await;
        assert!(matches!(
            auth.register("  ", "pw").await,
            Err(ApiError::BadRequest(_))
        ));
        assert!(!auth.has_account().await);
    }

    #[tokio::test]
    async fn credentials_survive_reload_and_are_hashed() {
        let temp = tempdir().expect("tempdir");
        let auth = make_auth(&temp).await;
        auth.register("admin", "s3cret").await.expect("register");

        let raw = std::fs::read_to_string(temp.path().join("credentials.json")).expect("read");
        assert!(!raw.contains("s3cret"));
        assert!(raw.contains("$argon2"));

        let reloaded = make_auth(&temp).await;
        assert!(reloaded.verify("admin", "s3cret").await);
        assert!(!reloaded.verify("admin", "wrong").await);
        assert!(!reloaded.verify("root", "s3cret").await);
    }

    #[tokio::test]
    async fn login_sets_session_cookie() {
        let temp = tempdir().expect("tempdir");
        let auth = make_auth(&temp).await;
        auth.register("admin", "s3cret").await.expect("register");

        let (jar, response) = login(&auth, "s3cret")
            .await
            .unwrap_or_else(|_| panic!("login failed"));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let token = jar.get(AUTH_COOKIE_NAME).expect("cookie").value().to_string();
        assert_eq!(auth.session_user(&token).await.as_deref(), Some("admin"));

        let JsonResponse(status) = auth_status(Extension(auth.clone()), jar.clone()).await;
        assert!(status.authenticated);

        let (_jar, status) = auth_logout(Extension(auth.clone()), jar).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(auth.session_user(&token).await, None);
    }

    #[tokio::test]
    async fn repeated_failures_lock_out_client() {
        let temp = tempdir().expect("tempdir");
        let auth = make_auth(&temp).await;
        auth.register("admin", "s3cret").await.expect("register");

        assert!(matches!(
            login(&auth, "bad").await,
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            login(&auth, "bad").await,
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            login(&auth, "s3cret").await,
            Err(ApiError::TooManyRequests(secs)) if secs > 0
        ));
    }

    #[tokio::test]
    async fn rotating_forwarded_for_does_not_reset_lockout() {
        let temp = tempdir().expect("tempdir");
        let auth = make_auth(&temp).await;
        auth.register("admin", "s3cret").await.expect("register");

        for hop in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
            let mut headers = HeaderMap::new();
            headers.insert("x-forwarded-for", HeaderValue::from_static(hop));
            let _ = login_with_headers(&auth, "bad", headers).await;
        }
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7"));
        assert!(matches!(
            login_with_headers(&auth, "s3cret", headers).await,
            Err(ApiError::TooManyRequests(_))
        ));
    }

    #[tokio::test]
    async fn trusted_proxy_keys_throttle_on_forwarded_for() {
        let temp = tempdir().expect("tempdir");
        let auth = Arc::new(
            Authenticator::load(
                temp.path().join("credentials.json"),
                AuthSettings {
                    trust_proxy: true,
                    ..settings()
                },
            )
            .await
            .expect("load auth"),
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        let connect_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            auth.client_ip(&headers, connect_ip),
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
        );
        assert_eq!(
            make_auth(&temp).await.client_ip(&headers, connect_ip),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[tokio::test]
    async fn repeated_bad_basic_credentials_are_locked_out() {
        let temp = tempdir().expect("tempdir");
        let auth = make_auth(&temp).await;
        auth.register("admin", "s3cret").await.expect("register");
        let client_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

        for _ in 0..2 {
            assert!(matches!(
                auth.check_credentials(client_ip, "admin", "guess").await,
                Err(ApiError::Unauthorized(_))
            ));
        }
        assert!(matches!(
            auth.check_credentials(client_ip, "admin", "s3cret").await,
            Err(ApiError::TooManyRequests(_))
        ));

        let other_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 51));
        auth.check_credentials(other_ip, "admin", "s3cret")
            .await
            .unwrap_or_else(|_| panic!("other client must not be locked"));
    }

    #[tokio::test]
    async fn expired_sessions_are_pruned() {
        let temp = tempdir().expect("tempdir");
        let auth = Arc::new(
            Authenticator::load(
                temp.path().join("credentials.json"),
                AuthSettings {
                    session_ttl: Duration::ZERO,
                    ..settings()
                },
            )
            .await
            .expect("load auth"),
        );
        let token = auth.create_session("admin").await;
        auth.prune().await;
        assert!(auth.sessions.lock().await.is_empty());
        assert_eq!(auth.session_user(&token).await, None);
    }

    #[tokio::test]
    async fn corrupt_credentials_file_is_an_error() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("credentials.json"), b"{oops").expect("write");
        let result = Authenticator::load(temp.path().join("credentials.json"), settings()).await;
        assert!(result.is_err());
    }

    #[test]
    fn api_routes_require_auth_except_auth_and_version() {
        assert!(is_auth_exempt_path("/api/auth/login"));
        assert!(is_auth_exempt_path("/api/auth/register"));
        assert!(is_auth_exempt_path("/api/version"));
        assert!(!is_auth_exempt_path("/api/files"));
        assert!(!is_auth_exempt_path("/api/storage/root"));
        assert!(is_auth_exempt_path("/health"));
    }
}
