//! Resolves which of Zuora's fixed base URLs applies to a given
//! `(api_type, sandbox, european)` combination, and probes it to confirm
//! the configured credentials are accepted.

use url::Url;

use crate::config::Config;
use crate::error::TransportError;
use crate::transport::{AuthMode, Transport};

/// Candidate base URL table, straight from the upstream's `URLS` dict.
/// Unlike a live multi-candidate probe, the `(api_type, sandbox, european)`
/// triple already determines exactly one base URL; resolution here is a
/// lookup, and `check` separately verifies the credentials work against it.
fn base_url(is_aqua: bool, sandbox: bool, european: bool) -> &'static str {
    match (is_aqua, sandbox, european) {
        (true, false, false) => "https://www.zuora.com/",
        (true, true, false) => "https://apisandbox.zuora.com/",
        (true, false, true) => "https://rest.eu.zuora.com/",
        (true, true, true) => "https://rest.sandbox.eu.zuora.com/",
        (false, false, false) => "https://rest.zuora.com/",
        (false, true, false) => "https://rest.apisandbox.zuora.com/",
        (false, false, true) => "https://rest.eu.zuora.com/",
        (false, true, true) => "https://rest.sandbox.eu.zuora.com/",
    }
}

pub fn resolve_base_url(config: &Config) -> Url {
    let raw = base_url(config.is_aqua(), config.is_sandbox(), config.is_european());
    Url::parse(raw).expect("base url table entries are well-formed")
}

pub fn auth_mode(config: &Config) -> AuthMode {
    if config.is_oauth() {
        AuthMode::OAuth {
            client_id: config.username.clone(),
            client_secret: config.password.clone(),
        }
    } else {
        AuthMode::Basic {
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

/// Builds the shared transport for a config: resolves the base URL and
/// constructs a single `reqwest::Client` that the whole process reuses.
pub fn build_transport(config: &Config) -> Transport {
    let client = reqwest::Client::new();
    Transport::new(client, resolve_base_url(config), auth_mode(config))
}

/// A well-known object guaranteed to exist on every tenant, used for the
/// `check` subcommand's cheap describe probe.
pub const PROBE_OBJECT: &str = "Account";

/// Exercises the resolved base URL with a minimal request. In sync mode:
/// a describe call for `Account`. In batch mode: submission (and
/// immediate deletion) of a tiny `limit 1` job. A 401 anywhere here means
/// the credentials are outright rejected.
pub async fn check_credentials(config: &Config, transport: &Transport) -> Result<(), TransportError> {
    if config.is_aqua() {
        let query = format!("select Id from {} limit 1", PROBE_OBJECT);
        let payload = crate::drivers::batch::probe_payload(&query, config.partner_id());
        let resp = transport.post_raw("v1/batch-query/", &payload).await?;
        if resp.status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::BadCredentials);
        }
        if let Ok(body) = resp.json() {
            if let Some(id) = body.get("id").and_then(|v| v.as_str()) {
                let _ = transport.delete(&format!("v1/batch-query/jobs/{id}")).await;
            }
            // AQuA signals an unrecognised partner id (and similar
            // tenant-level misconfiguration) as a 200 carrying a message
            // body rather than a 4xx/5xx status; a probe against a
            // well-known object with a trivially valid query should never
            // produce one, so surface it as the resolution failure it is.
            if let Some(message) = body.get("message").and_then(|v| v.as_str()) {
                return Err(TransportError::ApiError {
                    status: resp.status.as_u16(),
                    body: message.to_string(),
                });
            }
        }
        Ok(())
    } else {
        let resp = transport.get_raw(&format!("v1/describe/{}", PROBE_OBJECT)).await?;
        if resp.status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::BadCredentials);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_batch_production_us() {
        assert_eq!(base_url(true, false, false), "https://www.zuora.com/");
    }

    #[test]
    fn resolves_sync_sandbox_eu() {
        assert_eq!(base_url(false, true, true), "https://rest.sandbox.eu.zuora.com/");
    }

    #[test]
    fn batch_and_sync_share_eu_production_host() {
        assert_eq!(base_url(true, false, true), base_url(false, false, true));
    }
}
