//! A single shared HTTP session: auth injection, retrying backoff, and
//! response classification. Grounded on the teacher's `journal-client`
//! retry wrapper (`exponential_backoff::Backoff`, reset-on-success) and on
//! `flow-client`'s pattern of a thin `api_exec`-style helper around
//! `reqwest` that turns non-2xx into a typed error at the edge.

mod retry;

use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::TransportError;

pub use retry::RetryPolicy;

/// Zuora pins its REST contract to this WSDL version; every REST call
/// carries it regardless of auth mode.
pub const LATEST_WSDL_VERSION: &str = "91.0";

const RETRY_ATTEMPTS: u32 = 5;
/// Zuora's documented guidance: no jitter, ~30s seed factor.
const RETRY_SEED: Duration = Duration::from_secs(30);

const RETRYABLE_STATUSES: &[StatusCode] = &[
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Clone)]
pub enum AuthMode {
    Basic { username: String, password: String },
    OAuth { client_id: String, client_secret: String },
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    /// A token is valid if it is present and more than 60 seconds from
    /// expiry, matching `Client.is_auth_token_valid`'s one-minute buffer.
    fn is_valid(&self) -> bool {
        self.expires_at.saturating_duration_since(Instant::now()) > Duration::from_secs(60)
    }
}

/// A raw, already-retried response: the transport has already exhausted
/// its retry budget for 429/5xx, so whatever status comes back here is
/// final. Callers decide whether a given status is an error.
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl RawResponse {
    pub fn json(&self) -> Result<Value, TransportError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Matches the upstream's `noSuchDataSource` sentinel: a 400 response
    /// whose first error message names an object that cannot be exported.
    pub fn is_no_such_data_source(&self) -> bool {
        self.status == StatusCode::BAD_REQUEST && self.text().contains("noSuchDataSource")
    }
}

pub struct Transport {
    client: reqwest::Client,
    base_url: url::Url,
    auth: AuthMode,
    token: Mutex<Option<CachedToken>>,
}

impl Transport {
    pub fn new(client: reqwest::Client, base_url: url::Url, auth: AuthMode) -> Transport {
        Transport {
            client,
            base_url,
            auth,
            token: Mutex::new(None),
        }
    }

    fn url_for(&self, path: &str) -> url::Url {
        self.base_url.join(path).unwrap_or_else(|_| self.base_url.clone())
    }

    async fn ensure_valid_token(&self) -> Result<String, TransportError> {
        let AuthMode::OAuth {
            client_id,
            client_secret,
        } = &self.auth
        else {
            unreachable!("ensure_valid_token is only called under OAuth auth");
        };

        {
            let cached = self.token.lock().await;
            if let Some(token) = cached.as_ref() {
                if token.is_valid() {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let form = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let url = self.url_for("oauth/token");
        tracing::info!(%url, "requesting oauth access token");
        let resp = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(TransportError::Request)?;
        let body: Value = resp.json().await.map_err(TransportError::Request)?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| TransportError::ApiError {
                status: 200,
                body: "oauth response missing access_token".to_string(),
            })?
            .to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);

        let token = CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        };
        *self.token.lock().await = Some(token);
        Ok(access_token)
    }

    async fn apply_auth(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, TransportError> {
        let req = req.header("X-Zuora-WSDL-Version", LATEST_WSDL_VERSION);
        match &self.auth {
            AuthMode::Basic { username, password } => {
                Ok(req.header("apiAccessKeyId", username).header("apiSecretAccessKey", password))
            }
            AuthMode::OAuth { .. } => {
                let token = self.ensure_valid_token().await?;
                Ok(req.bearer_auth(token))
            }
        }
    }

    async fn send(&self, method: Method, path: &str, json_body: Option<&Value>) -> Result<RawResponse, TransportError> {
        let url = self.url_for(path);
        let mut policy = RetryPolicy::new(RETRY_ATTEMPTS, RETRY_SEED);

        loop {
            let mut req = self.client.request(method.clone(), url.clone());
            req = self.apply_auth(req).await?;
            if let Some(body) = json_body {
                req = req.json(body);
            }

            tracing::info!(%method, %url, "sending request");
            let resp = req.send().await.map_err(TransportError::Request)?;
            let status = resp.status();
            let body = resp.bytes().await.map_err(TransportError::Request)?;

            if status == StatusCode::TOO_MANY_REQUESTS {
                match policy.next_delay() {
                    Some(delay) => {
                        tracing::warn!(%url, ?delay, "rate limited, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        return Err(TransportError::RateLimited(String::from_utf8_lossy(&body).into_owned()));
                    }
                }
            }

            if RETRYABLE_STATUSES.contains(&status) {
                match policy.next_delay() {
                    Some(delay) => {
                        tracing::warn!(%url, %status, ?delay, "retryable server error, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        return Err(TransportError::Retryable {
                            status: status.as_u16(),
                            body: String::from_utf8_lossy(&body).into_owned(),
                        });
                    }
                }
            }

            return Ok(RawResponse { status, body });
        }
    }

    /// GET a path and require a 2xx status.
    pub async fn get(&self, path: &str) -> Result<RawResponse, TransportError> {
        let resp = self.send(Method::GET, path, None).await?;
        self.require_success(resp)
    }

    /// GET a path without requiring a 2xx status; used by discovery's
    /// probe path, which must inspect 400 bodies without treating them as
    /// errors.
    pub async fn get_raw(&self, path: &str) -> Result<RawResponse, TransportError> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<RawResponse, TransportError> {
        let value = serde_json::to_value(body)?;
        let resp = self.send(Method::POST, path, Some(&value)).await?;
        self.require_success(resp)
    }

    /// POST a path without requiring a 2xx status; used by discovery's
    /// probe path (both AQuA and REST probes surface their outcome via a
    /// message field on an otherwise-200 or 400 response).
    pub async fn post_raw<T: Serialize>(&self, path: &str, body: &T) -> Result<RawResponse, TransportError> {
        let value = serde_json::to_value(body)?;
        self.send(Method::POST, path, Some(&value)).await
    }

    pub async fn delete(&self, path: &str) -> Result<RawResponse, TransportError> {
        let resp = self.send(Method::DELETE, path, None).await?;
        self.require_success(resp)
    }

    /// Streams the body of a GET as an async byte stream, for line-by-line
    /// CSV consumption. Does not buffer the whole file in memory.
    pub async fn stream_get(
        &self,
        path: &str,
    ) -> Result<impl futures::Stream<Item = reqwest::Result<Bytes>>, TransportError> {
        let url = self.url_for(path);
        let mut req = self.client.get(url.clone());
        req = self.apply_auth(req).await?;
        tracing::info!(%url, "streaming request");
        let resp = req.send().await.map_err(TransportError::Request)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(TransportError::ApiError {
                status: 404,
                body: "file not found".to_string(),
            });
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::ApiError { status, body });
        }
        Ok(resp.bytes_stream())
    }

    fn require_success(&self, resp: RawResponse) -> Result<RawResponse, TransportError> {
        if resp.is_success() {
            Ok(resp)
        } else {
            Err(TransportError::ApiError {
                status: resp.status.as_u16(),
                body: resp.text(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cached_token_validity_window() {
        let valid = CachedToken {
            access_token: "tok".to_string(),
            expires_at: Instant::now() + Duration::from_secs(120),
        };
        assert!(valid.is_valid());

        let about_to_expire = CachedToken {
            access_token: "tok".to_string(),
            expires_at: Instant::now() + Duration::from_secs(30),
        };
        assert!(!about_to_expire.is_valid());
    }
}
