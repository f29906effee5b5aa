//! Multi-endpoint forwarding
//!
//! Sends one prepared request to each configured endpoint in order until an
//! endpoint succeeds or the credential is known to be unusable. Every attempt
//! is classified; the caller gets the final `Outcome` plus a per-attempt trail.

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use common::Secret;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::classify::{Classifier, Outcome, UpstreamReply};
use crate::error::{Error, Result};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Static header added to every upstream request.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Request as it should reach the upstream, minus credential and endpoint.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One endpoint attempt, reported for metrics and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub endpoint: String,
    pub outcome: &'static str,
}

/// Final result of a forward across all endpoints.
#[derive(Debug, Clone)]
pub struct Forwarded {
    pub outcome: Outcome,
    pub attempts: Vec<Attempt>,
}

/// Sends requests across an ordered endpoint list with fallback.
///
/// Cheap to clone: the reqwest client is reference counted internally.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    timeout: Duration,
    classifier: Classifier,
    injected: Vec<(HeaderName, HeaderValue)>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("endpoints", &self.endpoints)
            .field("timeout", &self.timeout)
            .field("injected", &self.injected.len())
            .finish()
    }
}

impl Forwarder {
    /// Build a forwarder.
    ///
    /// Fails when the endpoint list is empty or any endpoint is not an
    /// absolute http(s) URL. Invalid header injections are skipped with a
    /// warning, as is any attempt to inject `Authorization`.
    pub fn new(
        client: reqwest::Client,
        endpoints: &[String],
        timeout: Duration,
        classifier: Classifier,
        injections: &[HeaderInjection],
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        let endpoints = endpoints
            .iter()
            .map(|raw| parse_endpoint(raw))
            .collect::<Result<Vec<_>>>()?;

        let mut injected = Vec::with_capacity(injections.len());
        for injection in injections {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == header::AUTHORIZATION {
                warn!(header = %injection.name, "refusing to inject authorization header");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            injected.push((name, value));
        }

        Ok(Self {
            client,
            endpoints,
            timeout,
            classifier,
            injected,
        })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Forward `request` using `secret` as the bearer credential.
    ///
    /// Stops at the first success or auth-fatal outcome. Retryable failures
    /// move on to the next endpoint; if every endpoint fails the last failure
    /// is returned. Only header construction can error.
    pub async fn forward(
        &self,
        request: &ForwardRequest,
        secret: &Secret<String>,
    ) -> Result<Forwarded> {
        let headers = self.outbound_headers(&request.headers, secret)?;
        let mut attempts = Vec::with_capacity(self.endpoints.len());
        let mut last_failure: Option<Outcome> = None;

        for endpoint in &self.endpoints {
            let url = with_query(endpoint, request.query.as_deref());
            let reply = self.send(&url, request, headers.clone()).await;
            let outcome = self.classifier.classify(&reply);

            attempts.push(Attempt {
                endpoint: endpoint.to_string(),
                outcome: outcome.label(),
            });

            if outcome.is_success() || outcome.is_auth_fatal() {
                debug!(endpoint = %endpoint, outcome = outcome.label(), "upstream attempt finished");
                return Ok(Forwarded { outcome, attempts });
            }

            match &reply {
                UpstreamReply::Response { status, .. } => {
                    warn!(endpoint = %endpoint, status, outcome = outcome.label(), "upstream attempt failed, trying next endpoint");
                }
                UpstreamReply::Transport { timeout, message } => {
                    warn!(endpoint = %endpoint, timeout, error = %message, "upstream unreachable, trying next endpoint");
                }
            }
            last_failure = Some(outcome);
        }

        Ok(Forwarded {
            outcome: last_failure.unwrap_or(Outcome::UpstreamUnavailable { status: None }),
            attempts,
        })
    }

    /// Inbound headers with routing and credential headers removed, then the
    /// configured injections and the bearer credential applied.
    fn outbound_headers(&self, inbound: &HeaderMap, secret: &Secret<String>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(inbound.len() + self.injected.len() + 1);
        for (name, value) in inbound {
            if is_hop_by_hop(name.as_str())
                || name == header::HOST
                || name == header::AUTHORIZATION
                || name == header::CONTENT_LENGTH
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        for (name, value) in &self.injected {
            headers.insert(name.clone(), value.clone());
        }

        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", secret.expose()))
            .map_err(|_| Error::InvalidCredentialHeader)?;
        bearer.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, bearer);
        Ok(headers)
    }

    async fn send(&self, url: &Url, request: &ForwardRequest, headers: HeaderMap) -> UpstreamReply {
        let sent = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(headers)
            .timeout(self.timeout)
            .body(request.body.clone())
            .send()
            .await;

        let response = match sent {
            Ok(r) => r,
            Err(e) => return transport_failure(&e),
        };
        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => UpstreamReply::Response {
                status,
                body: body.to_vec(),
            },
            Err(e) => transport_failure(&e),
        }
    }
}

fn transport_failure(e: &reqwest::Error) -> UpstreamReply {
    UpstreamReply::Transport {
        timeout: e.is_timeout(),
        message: e.to_string(),
    }
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidEndpoint(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::InvalidEndpoint(format!(
            "{raw}: unsupported scheme {other}"
        ))),
    }
}

/// Append a raw query string to an endpoint, keeping any query it already has.
fn with_query(endpoint: &Url, query: Option<&str>) -> Url {
    let query = match query {
        Some(q) if !q.is_empty() => q,
        _ => return endpoint.clone(),
    };
    let mut url = endpoint.clone();
    let merged = match endpoint.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
        _ => query.to_string(),
    };
    url.set_query(Some(&merged));
    url
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
