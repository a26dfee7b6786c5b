//! HTTP implementation of [`ObjectGateway`] over the request service REST API.
//!
//! Retries transport failures and 5xx answers with exponential backoff and
//! renews the session credential when the service rejects it. Everything
//! above this layer sees a clean success/failure boundary.
use super::session::{credential_rejected, Session};
use super::{Envelope, ObjectGateway, ObjectKind};
use crate::model::is_truthy;
use crate::util::truncate_string;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::thread;
use std::time::Duration;

pub const DEV_SERVER: &str = "https://cms-pdmv-dev.web.cern.ch/mcm/";
pub const PROD_SERVER: &str = "https://cms-pdmv-prod.web.cern.ch/mcm/";

const BODY_PREVIEW_BYTES: usize = 300;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Server root, ending with `/`.
    pub server: String,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
    pub page_size: usize,
}

enum Call<'a> {
    Get,
    Put(&'a Value),
    Delete,
}

impl Call<'_> {
    fn name(&self) -> &'static str {
        match self {
            Call::Get => "GET",
            Call::Put(_) => "PUT",
            Call::Delete => "DELETE",
        }
    }
}

struct Reply {
    status: u16,
    content_type: Option<String>,
    body: String,
}

pub struct HttpGateway {
    agent: ureq::Agent,
    settings: HttpSettings,
    session: Session,
    user_agent: String,
}

impl HttpGateway {
    pub fn new(settings: HttpSettings, session: Session) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .http_status_as_error(false)
            .build()
            .into();
        let user_agent = format!(
            "mcm-cascade/{} ({} {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        Self {
            agent,
            settings,
            session,
            user_agent,
        }
    }

    pub fn server(&self) -> &str {
        &self.settings.server
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        self.send(Call::Get, path)
    }

    fn get_envelope(&self, path: &str) -> Result<Envelope> {
        envelope_from(self.get_json(path)?, path)
    }

    fn send(&self, call: Call<'_>, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.settings.server, path);
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        let mut renewals = 0;
        loop {
            attempt += 1;
            let reply = match self.send_once(&call, &url) {
                Ok(reply) => reply,
                Err(err) if attempt < max_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        %url,
                        error = %err,
                        "transport failure, retrying"
                    );
                    thread::sleep(self.backoff(attempt));
                    continue;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "{} {url} failed after {attempt} attempts",
                        call.name()
                    )));
                }
            };

            if credential_rejected(reply.status, reply.content_type.as_deref()) {
                if self.session.is_anonymous() || renewals >= max_attempts {
                    return Err(anyhow!(
                        "{} {url}: credentials rejected (HTTP {}) after {renewals} renewals",
                        call.name(),
                        reply.status
                    ));
                }
                renewals += 1;
                tracing::debug!(renewals, max_attempts, %url, "credentials expired, renewing");
                self.session.renew().context("renew credentials")?;
                attempt -= 1;
                continue;
            }

            if reply.status >= 500 && attempt < max_attempts {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    %url,
                    status = reply.status,
                    "server error, retrying"
                );
                thread::sleep(self.backoff(attempt));
                continue;
            }

            return decode_body(&reply, &url);
        }
    }

    fn send_once(&self, call: &Call<'_>, url: &str) -> Result<Reply> {
        let response = match call {
            Call::Get => self.decorate(self.agent.get(url)).call(),
            Call::Delete => self.decorate(self.agent.delete(url)).call(),
            Call::Put(body) => self.decorate(self.agent.put(url)).send_json(body),
        };
        let mut response = response.with_context(|| format!("{} {url}", call.name()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("read response body of {url}"))?;
        Ok(Reply {
            status,
            content_type,
            body,
        })
    }

    fn decorate<B>(&self, builder: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        let builder = builder
            .header("User-Agent", &self.user_agent)
            .header("Accept", "application/json");
        match self.session.auth_header() {
            Some((name, value)) => builder.header(name, &value),
            None => builder,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.settings
            .retry_backoff
            .saturating_mul(factor)
            .min(MAX_BACKOFF)
    }
}

fn decode_body(reply: &Reply, url: &str) -> Result<Value> {
    serde_json::from_str(&reply.body).map_err(|err| {
        anyhow!(
            "non-JSON response (HTTP {}) from {url}: {err}; body starts with {:?}",
            reply.status,
            truncate_string(reply.body.trim(), BODY_PREVIEW_BYTES)
        )
    })
}

fn envelope_from(value: Value, path: &str) -> Result<Envelope> {
    serde_json::from_value(value).with_context(|| format!("decode response envelope of {path}"))
}

impl ObjectGateway for HttpGateway {
    fn get(&self, kind: ObjectKind, prepid: &str) -> Result<Option<Value>> {
        let path = format!("restapi/{kind}/get/{}", prepid.trim());
        let mut body = self.get_json(&path)?;
        let results = body
            .get_mut("results")
            .map(Value::take)
            .unwrap_or(Value::Null);
        if !is_truthy(&results) {
            tracing::debug!(%kind, prepid, "not found");
            return Ok(None);
        }
        Ok(Some(results))
    }

    fn search(&self, kind: ObjectKind, query: &str) -> Result<Vec<Value>> {
        let mut collected = Vec::new();
        let mut page = 0usize;
        loop {
            let path = format!(
                "search/?db_name={kind}&limit={}&page={page}&{query}",
                self.settings.page_size
            );
            let body = self.get_json(&path)?;
            let results = match body.get("results") {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(anyhow!("search {kind} {query:?}: unexpected results {other}"))
                }
            };
            tracing::debug!(%kind, query, page, found = results.len(), "search page");
            if results.is_empty() {
                break;
            }
            collected.extend(results);
            page += 1;
        }
        Ok(collected)
    }

    fn put(&self, kind: ObjectKind, method: &str, body: &Value) -> Result<Envelope> {
        let path = format!("restapi/{kind}/{method}");
        envelope_from(self.send(Call::Put(body), &path)?, &path)
    }

    fn delete(&self, kind: ObjectKind, prepid: &str) -> Result<Envelope> {
        let path = format!("restapi/{kind}/delete/{prepid}");
        envelope_from(self.send(Call::Delete, &path)?, &path)
    }

    fn approve(&self, kind: ObjectKind, prepid: &str) -> Result<Envelope> {
        self.get_envelope(&format!("restapi/{kind}/approve/{prepid}"))
    }

    fn reset(&self, prepid: &str) -> Result<Envelope> {
        self.get_envelope(&format!("restapi/requests/reset/{prepid}"))
    }

    fn soft_reset(&self, prepid: &str) -> Result<Envelope> {
        self.get_envelope(&format!("restapi/requests/soft_reset/{prepid}"))
    }

    fn rewind_to_root(&self, chain_prepid: &str) -> Result<Envelope> {
        self.get_envelope(&format!(
            "restapi/chained_requests/rewind_to_root/{chain_prepid}"
        ))
    }

    fn flow(&self, chain_prepid: &str, force: bool) -> Result<Envelope> {
        let path = if force {
            format!("restapi/chained_requests/flow/{chain_prepid}/force")
        } else {
            format!("restapi/chained_requests/flow/{chain_prepid}")
        };
        self.get_envelope(&path)
    }

    fn reserve(&self, chain_prepid: &str, target_campaign: &str) -> Result<Envelope> {
        self.get_envelope(&format!(
            "restapi/chained_requests/flow/{chain_prepid}/reserve/{target_campaign}"
        ))
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
