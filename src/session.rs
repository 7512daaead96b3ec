// ===============================
// src/session.rs
// ===============================
//
// AuthSession: owns the app key/secret, the access token and the live
// authorization state against the TT REST API.
//
// - authenticate(): one token request; Err means Unauthorized.
// - Authorization state is published on a watch channel, so loss can be
//   observed independently of any in-flight request.
// - The token is renewed before expiry while the session is authorized.
//   Once authorization is lost it stays lost: no re-login.
//
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

use crate::domain::FillRecord;
use crate::metrics::{AUTH_RENEWALS, FILLS_MALFORMED};
use crate::tt::{key_fingerprint, parse_fill, timestamp_ns, FillsPage, TokenResponse};

const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;
const MIN_RENEW_LEAD: Duration = Duration::from_secs(30);
const RENEW_RETRY: Duration = Duration::from_secs(15);
/// Pages read per fetch; the rest of a larger backlog comes on the next poll.
pub const MAX_PAGES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    Unauthorized,
    Authorized,
    Lost(String),
}

#[derive(Clone)]
pub struct Credentials {
    pub app_key: String,
    pub app_secret: String,
    pub environment: String,
}

impl Credentials {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            environment: environment.into(),
        }
    }

    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.app_key)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &self.fingerprint())
            .field("app_secret", &"<redacted>")
            .field("environment", &self.environment)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("cannot build http client: {0}")]
    Client(String),
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("token request failed: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authorization expired: {0}")]
    AuthExpired(String),
}

/// What the download worker needs from the venue.
#[async_trait]
pub trait FillSource: Send + Sync {
    /// Every fill with a UTC timestamp at or after `since`, in venue order.
    async fn fetch_fills_since(&self, since: DateTime<Utc>) -> Result<Vec<FillRecord>, FetchError>;

    /// Live authorization state; flips to [`AuthStatus::Lost`] on loss.
    fn auth_status(&self) -> watch::Receiver<AuthStatus>;

    fn is_authorized(&self) -> bool {
        matches!(*self.auth_status().borrow(), AuthStatus::Authorized)
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    issued_at: Instant,
    expires_at: Instant,
}

impl AccessToken {
    fn renew_at(&self) -> Instant {
        let lifetime = self.expires_at.saturating_duration_since(self.issued_at);
        // short-lived tokens still get half their lifetime before renewal
        let lead = (lifetime / 5).max(MIN_RENEW_LEAD).min(lifetime / 2);
        self.expires_at.checked_sub(lead).unwrap_or(self.issued_at)
    }
}

pub struct AuthSession {
    http: reqwest::Client,
    api_url: String,
    credentials: Credentials,
    token: RwLock<Option<AccessToken>>,
    status: watch::Sender<AuthStatus>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl AuthSession {
    pub fn new(
        api_url: impl Into<String>,
        credentials: Credentials,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AuthError::Client(e.to_string()))?;
        let (status, _rx) = watch::channel(AuthStatus::Unauthorized);
        Ok(Arc::new(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
            status,
            keepalive: Mutex::new(None),
        }))
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn status(&self) -> AuthStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    /// Log in with the stored credentials. On success the session is
    /// Authorized and token renewal runs in the background.
    pub async fn authenticate(self: &Arc<Self>) -> Result<(), AuthError> {
        let key = self.credentials.fingerprint();
        match self.request_token().await {
            Ok(token) => {
                self.store_token(token);
                self.status.send_replace(AuthStatus::Authorized);
                self.spawn_keepalive();
                info!(app_key = %key, environment = %self.credentials.environment, "authorized");
                Ok(())
            }
            Err(e) => {
                self.status.send_replace(AuthStatus::Unauthorized);
                warn!(app_key = %key, error = %e, "login failed");
                Err(e)
            }
        }
    }

    /// Mark authorization as lost. First reason wins; later calls are no-ops.
    pub fn invalidate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let changed = self.status.send_if_modified(|s| {
            if *s == AuthStatus::Authorized {
                *s = AuthStatus::Lost(reason.clone());
                true
            } else {
                false
            }
        });
        if changed {
            if let Ok(mut t) = self.token.write() {
                *t = None;
            }
            error!(%reason, "authorization lost");
        }
    }

    /// Stop background token renewal.
    pub fn close(&self) {
        if let Ok(mut slot) = self.keepalive.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    fn store_token(&self, token: AccessToken) {
        if let Ok(mut t) = self.token.write() {
            *t = Some(token);
        }
    }

    fn current_token(&self) -> Result<String, FetchError> {
        if let AuthStatus::Lost(reason) = self.status() {
            return Err(FetchError::AuthExpired(reason));
        }
        self.token
            .read()
            .ok()
            .and_then(|t| t.as_ref().map(|t| t.value.clone()))
            .ok_or_else(|| FetchError::AuthExpired("not authorized".to_string()))
    }

    fn token_times(&self) -> Option<(Instant, Instant)> {
        let t = self.token.read().ok()?;
        t.as_ref().map(|t| (t.renew_at(), t.expires_at))
    }

    fn env_segment(&self) -> String {
        urlencoding::encode(&self.credentials.environment).into_owned()
    }

    async fn request_token(&self) -> Result<AccessToken, AuthError> {
        let url = format!("{}/ttid/{}/token", self.api_url, self.env_segment());
        let app_key = format!("{}:{}", self.credentials.app_key, self.credentials.app_secret);
        let rsp = self
            .http
            .post(url)
            .header("x-api-key", &self.credentials.app_key)
            .form(&[("grant_type", "user_app"), ("app_key", app_key.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let code = rsp.status();
        if code == StatusCode::UNAUTHORIZED || code == StatusCode::FORBIDDEN {
            let body = rsp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(format!("HTTP {code} {body}").trim().to_string()));
        }
        if !code.is_success() {
            return Err(AuthError::Network(format!("HTTP {code}")));
        }

        let body: TokenResponse = rsp
            .json()
            .await
            .map_err(|e| AuthError::Network(format!("undecodable token reply: {e}")))?;
        if !body.is_ok() {
            return Err(AuthError::Rejected(body.status_message.unwrap_or(body.status)));
        }
        let value = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Rejected("token reply carries no access_token".to_string()))?;
        let lifetime = body.seconds_until_expiry.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let issued_at = Instant::now();
        debug!(token_type = ?body.token_type, lifetime_secs = lifetime, "token issued");
        Ok(AccessToken {
            value,
            issued_at,
            expires_at: issued_at + Duration::from_secs(lifetime),
        })
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(keepalive(weak));
        if let Ok(mut slot) = self.keepalive.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        token: &str,
        since: DateTime<Utc>,
        page_key: Option<&str>,
    ) -> Result<FillsPage, FetchError> {
        let mut query = vec![("minTimestamp", timestamp_ns(since).to_string())];
        if let Some(k) = page_key {
            query.push(("nextPageKey", k.to_string()));
        }
        let rsp = self
            .http
            .get(url)
            .header("x-api-key", &self.credentials.app_key)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let code = rsp.status();
        if code == StatusCode::UNAUTHORIZED || code == StatusCode::FORBIDDEN {
            let reason = format!("fills request rejected with HTTP {code}");
            self.invalidate(reason.clone());
            return Err(FetchError::AuthExpired(reason));
        }
        if !code.is_success() {
            return Err(FetchError::Network(format!("fills request failed with HTTP {code}")));
        }
        let page: FillsPage = rsp
            .json()
            .await
            .map_err(|e| FetchError::Network(format!("undecodable fills page: {e}")))?;
        if !page.is_ok() {
            let msg = page.status_message.clone().unwrap_or_else(|| page.status.clone());
            return Err(FetchError::Network(format!("fills request not ok: {msg}")));
        }
        Ok(page)
    }
}

#[async_trait]
impl FillSource for AuthSession {
    async fn fetch_fills_since(&self, since: DateTime<Utc>) -> Result<Vec<FillRecord>, FetchError> {
        let token = self.current_token()?;
        let url = format!("{}/ttledger/{}/fills", self.api_url, self.env_segment());

        let mut fills = Vec::new();
        let mut page_key: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self.fetch_page(&url, &token, since, page_key.as_deref()).await?;
            for raw in page.fills {
                match parse_fill(raw) {
                    Ok(fill) => fills.push(fill),
                    Err(e) => {
                        FILLS_MALFORMED.inc();
                        error!(error = %e, "skipping malformed fill");
                    }
                }
            }
            match page.next_page_key.filter(|k| !page.last_page && !k.is_empty()) {
                Some(next) if page_key.as_deref() == Some(next.as_str()) => {
                    return Err(FetchError::Network(format!("page key {next} repeated")));
                }
                Some(next) => page_key = Some(next),
                None => {
                    debug!(count = fills.len(), "fills fetched");
                    return Ok(fills);
                }
            }
        }
        warn!(count = fills.len(), pages = MAX_PAGES, "page limit reached, remaining fills deferred");
        Ok(fills)
    }

    fn auth_status(&self) -> watch::Receiver<AuthStatus> {
        self.subscribe()
    }
}

/// Renew the access token ahead of expiry for as long as the session is
/// authorized. A rejected renewal, or running past expiry, loses authorization.
async fn keepalive(session: Weak<AuthSession>) {
    let mut next_attempt = match session.upgrade().and_then(|s| s.token_times()) {
        Some((renew_at, _)) => renew_at,
        None => return,
    };
    loop {
        sleep_until(next_attempt).await;
        let Some(s) = session.upgrade() else { return };
        if s.status() != AuthStatus::Authorized {
            return;
        }
        match s.request_token().await {
            Ok(token) => {
                next_attempt = token.renew_at();
                s.store_token(token);
                AUTH_RENEWALS.with_label_values(&["ok"]).inc();
                info!("access token renewed");
            }
            Err(AuthError::Rejected(reason)) => {
                AUTH_RENEWALS.with_label_values(&["rejected"]).inc();
                s.invalidate(format!("token renewal rejected: {reason}"));
                return;
            }
            Err(e) => {
                AUTH_RENEWALS.with_label_values(&["error"]).inc();
                let Some((_, expires_at)) = s.token_times() else { return };
                let now = Instant::now();
                if now >= expires_at {
                    s.invalidate(format!("access token expired, last renewal error: {e}"));
                    return;
                }
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=1000));
                next_attempt = (now + RENEW_RETRY + jitter).min(expires_at);
                warn!(error = %e, retry_in = ?(next_attempt - now), "token renewal failed");
            }
        }
    }
}
