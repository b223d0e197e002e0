use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use fundsync_core::{FieldDefinition, RawSourceRecord};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

use crate::throttle::{retryable_status, retryable_transport, RequestQuota, RetryPolicy};
use crate::{BitableSource, HttpClientConfig, SourceError};

const TOKEN_PATH: &str = "/open-apis/auth/v3/tenant_access_token/internal";
const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;
const RATE_LIMITED_CODES: &[i64] = &[99991400, 1254290];
const AUTH_CODES: &[i64] = &[91403, 99991661, 99991663, 99991664, 99991665, 99991668, 99991671];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LarkCredentials {
    pub app_id: String,
    pub app_secret: String,
    pub app_token: String,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Live Bitable client. Tenant tokens are cached until five minutes before they expire.
#[derive(Debug)]
pub struct LarkBitableClient {
    http: reqwest::Client,
    base_url: String,
    credentials: LarkCredentials,
    page_size: u32,
    retry: RetryPolicy,
    quota: Option<RequestQuota>,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    tenant_access_token: String,
    expire: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Option<Vec<T>>,
    has_more: Option<bool>,
    page_token: Option<String>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: None,
            has_more: Some(false),
            page_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeClass {
    Ok,
    RateLimited,
    Auth,
    Other,
}

fn classify_code(code: i64, auth_endpoint: bool) -> CodeClass {
    if code == 0 {
        CodeClass::Ok
    } else if RATE_LIMITED_CODES.contains(&code) {
        CodeClass::RateLimited
    } else if auth_endpoint || AUTH_CODES.contains(&code) {
        CodeClass::Auth
    } else {
        CodeClass::Other
    }
}

fn envelope_error(body: &JsonValue, auth_endpoint: bool) -> Option<(CodeClass, i64, String)> {
    let code = body.get("code")?.as_i64()?;
    let msg = body
        .get("msg")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    Some((classify_code(code, auth_endpoint), code, msg))
}

impl LarkBitableClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: LarkCredentials,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let http = builder.build().context("building reqwest client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            http,
            base_url,
            credentials,
            page_size: config.page_size.clamp(1, 500),
            retry: config.retry,
            quota: config.requests_per_second.map(RequestQuota::per_second),
            token: Mutex::new(None),
        })
    }

    fn table_url(&self, table_id: &str, resource: &str) -> String {
        format!(
            "{}/open-apis/bitable/v1/apps/{}/tables/{}/{}",
            self.base_url, self.credentials.app_token, table_id, resource
        )
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        let body = serde_json::json!({
            "app_id": self.credentials.app_id,
            "app_secret": self.credentials.app_secret,
        });
        let value = self
            .send_json("tenant_access_token", true, || self.http.post(&url).json(&body))
            .await?;
        let parsed: TokenResponse = serde_json::from_value(value)
            .map_err(|err| SourceError::Decode(format!("tenant_access_token: {err}")))?;
        if parsed.tenant_access_token.is_empty() {
            return Err(SourceError::Auth("empty tenant access token".to_string()));
        }

        let lifetime = parsed
            .expire
            .unwrap_or_default()
            .saturating_sub(TOKEN_REFRESH_MARGIN_SECS);
        debug!(lifetime_secs = lifetime, "obtained tenant access token");
        *cached = Some(CachedToken {
            value: parsed.tenant_access_token.clone(),
            refresh_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(parsed.tenant_access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Sends with retry on throttling, 5xx and transport failures. Returns the decoded
    /// body once the envelope code is zero.
    async fn send_json(
        &self,
        endpoint: &'static str,
        auth_endpoint: bool,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<JsonValue, SourceError> {
        let attempts = self.retry.attempts();
        let mut last_error = String::new();
        let mut timed_out = false;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry.delay_before(attempt);
                warn!(
                    endpoint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retrying bitable request"
                );
                tokio::time::sleep(delay).await;
            }

            if let Some(quota) = &self.quota {
                quota.acquire().await;
            }

            let response = match build().send().await {
                Ok(response) => response,
                Err(err) if retryable_transport(&err) => {
                    timed_out = err.is_timeout();
                    last_error = err.to_string();
                    continue;
                }
                Err(err) => {
                    return Err(SourceError::Transient {
                        attempts: attempt + 1,
                        message: err.to_string(),
                        timed_out: err.is_timeout(),
                    })
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SourceError::Auth(format!("http {status} from {endpoint}")));
            }
            if !status.is_success() && retryable_status(status) {
                timed_out = false;
                last_error = format!("http {status} from {endpoint}");
                continue;
            }

            let body: JsonValue = match response.json().await {
                Ok(body) => body,
                Err(err) if err.is_timeout() => {
                    timed_out = true;
                    last_error = err.to_string();
                    continue;
                }
                Err(err) if status.is_success() => {
                    return Err(SourceError::Decode(format!("{endpoint}: {err}")))
                }
                Err(_) => {
                    return Err(SourceError::Api {
                        code: i64::from(status.as_u16()),
                        msg: format!("http {status} from {endpoint}"),
                    })
                }
            };

            let Some((class, code, msg)) = envelope_error(&body, auth_endpoint) else {
                return Err(SourceError::Decode(format!(
                    "{endpoint}: response carries no code"
                )));
            };
            match class {
                CodeClass::Ok if status.is_success() => return Ok(body),
                CodeClass::RateLimited => {
                    timed_out = false;
                    last_error = format!("rate limited ({code}): {msg}");
                }
                CodeClass::Auth => return Err(SourceError::Auth(format!("{code}: {msg}"))),
                CodeClass::Ok | CodeClass::Other => {
                    return Err(SourceError::Api { code, msg });
                }
            }
        }

        Err(SourceError::Transient {
            attempts,
            message: last_error,
            timed_out,
        })
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        url: &str,
        page_token: Option<&str>,
    ) -> Result<Page<T>, SourceError> {
        let mut refreshed = false;
        loop {
            let token = self.access_token().await?;
            let mut query = vec![("page_size", self.page_size.to_string())];
            if let Some(page_token) = page_token {
                query.push(("page_token", page_token.to_string()));
            }

            let result = self
                .send_json(endpoint, false, || {
                    self.http.get(url).bearer_auth(&token).query(&query)
                })
                .await;
            match result {
                Ok(value) => {
                    let envelope: Envelope<Page<T>> = serde_json::from_value(value)
                        .map_err(|err| SourceError::Decode(format!("{endpoint}: {err}")))?;
                    return Ok(envelope.data.unwrap_or_default());
                }
                // A cached token can be revoked before its advertised expiry.
                Err(SourceError::Auth(reason)) if !refreshed => {
                    debug!(endpoint, %reason, "refreshing tenant token after rejection");
                    refreshed = true;
                    self.invalidate_token().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn paginate<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        url: &str,
    ) -> Result<Vec<T>, SourceError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page: Page<T> = self.get_page(endpoint, url, page_token.as_deref()).await?;
            pages += 1;
            items.extend(page.items.unwrap_or_default());

            match page.page_token.filter(|t| !t.is_empty()) {
                Some(next) if page.has_more != Some(false) => {
                    if page_token.as_deref() == Some(next.as_str()) {
                        warn!(endpoint, page_token = %next, "page token repeated; stopping pagination");
                        break;
                    }
                    page_token = Some(next);
                }
                _ => break,
            }
        }

        debug!(endpoint, pages, items = items.len(), "pagination complete");
        Ok(items)
    }
}

#[async_trait]
impl BitableSource for LarkBitableClient {
    async fn list_records(&self, table_id: &str) -> Result<Vec<RawSourceRecord>, SourceError> {
        let url = self.table_url(table_id, "records");
        let span = info_span!("bitable_fetch", table_id, endpoint = "records");
        let mut records: Vec<RawSourceRecord> =
            self.paginate("records", &url).instrument(span).await?;
        for record in &mut records {
            record.source_table = table_id.to_string();
        }
        Ok(records)
    }

    async fn list_fields(&self, table_id: &str) -> Result<Vec<FieldDefinition>, SourceError> {
        let url = self.table_url(table_id, "fields");
        let span = info_span!("bitable_fetch", table_id, endpoint = "fields");
        self.paginate("fields", &url).instrument(span).await
    }
}
