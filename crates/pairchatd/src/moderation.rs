use crate::config::ServerConfig;
use crate::metrics::{counters, histograms};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Outcome of a content check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Relay the message.
    Allow,
    /// Drop the message and tell the sender why.
    Reject {
        /// Category that triggered the rejection.
        reason: String,
    },
}

/// Errors from the moderation service. None of them block a message.
#[derive(Error, Debug)]
pub enum ModerationError {
    /// Transport, status or decoding failure.
    #[error("moderation request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The configured endpoint is not a usable URL.
    #[error("invalid moderation url: {0}")]
    InvalidUrl(String),
    /// The service answered without any result entry.
    #[error("moderation response contained no results")]
    EmptyResponse,
}

impl ModerationError {
    fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_timeout())
    }
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: BTreeMap<String, bool>,
}

impl ModerationResult {
    fn into_verdict(self) -> Verdict {
        if !self.flagged {
            return Verdict::Allow;
        }
        let reason = self
            .categories
            .into_iter()
            .find_map(|(name, hit)| hit.then_some(name))
            .unwrap_or_else(|| "flagged".to_string());
        Verdict::Reject { reason }
    }
}

fn parse_url(url: &str) -> Result<Url, ModerationError> {
    let parsed = url
        .parse::<Url>()
        .map_err(|e| ModerationError::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ModerationError::InvalidUrl(format!(
            "scheme must be http or https, got: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(ModerationError::InvalidUrl("missing host".to_string()));
    }
    Ok(parsed)
}

#[derive(Clone)]
struct ModerationClient {
    http: Client,
    url: Url,
    key: String,
}

impl ModerationClient {
    async fn classify(&self, text: &str) -> Result<Verdict, ModerationError> {
        let response: ModerationResponse = self
            .http
            .post(self.url.clone())
            .bearer_auth(&self.key)
            .json(&ModerationRequest { input: text })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .results
            .into_iter()
            .next()
            .map(ModerationResult::into_verdict)
            .ok_or(ModerationError::EmptyResponse)
    }
}

/// Content check run on every chat message before relay.
///
/// Fails open: any error, timeout or unexpected response allows the message.
/// Without a credential every check is bypassed.
#[derive(Clone)]
pub struct ModerationGate {
    client: Option<ModerationClient>,
    deadline: Duration,
}

impl ModerationGate {
    /// A gate that allows everything without calling out.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            client: None,
            deadline: Duration::ZERO,
        }
    }

    /// Build a gate for `url`. Returns a disabled gate if `key` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is unusable or the HTTP client cannot be built.
    pub fn new(key: Option<&str>, url: &str, deadline: Duration) -> Result<Self, ModerationError> {
        let Some(key) = key else {
            return Ok(Self::disabled());
        };
        let http = Client::builder()
            .timeout(deadline)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client: Some(ModerationClient {
                http,
                url: parse_url(url)?,
                key: key.to_string(),
            }),
            deadline,
        })
    }

    /// Build a gate from the server configuration.
    ///
    /// # Errors
    ///
    /// See [`ModerationGate::new`].
    pub fn from_config(config: &ServerConfig) -> Result<Self, ModerationError> {
        Self::new(
            config.moderation_key.as_deref(),
            &config.moderation_url,
            Duration::from_millis(config.moderation_timeout_ms),
        )
    }

    /// Returns `true` if checks call out to the moderation service.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Classify `text`. Never fails.
    pub async fn check(&self, text: &str) -> Verdict {
        let Some(client) = &self.client else {
            counters::moderation_checks_total("bypassed");
            return Verdict::Allow;
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.deadline, client.classify(text)).await;
        histograms::moderation_latency_seconds(start.elapsed().as_secs_f64());

        match result {
            Ok(Ok(verdict)) => {
                match &verdict {
                    Verdict::Allow => counters::moderation_checks_total("allowed"),
                    Verdict::Reject { reason } => {
                        counters::moderation_checks_total("rejected");
                        debug!(reason = %reason, "message rejected by moderation");
                    }
                }
                verdict
            }
            Ok(Err(e)) if e.is_timeout() => {
                counters::moderation_checks_total("timeout");
                warn!(error = %e, "moderation check timed out, allowing message");
                Verdict::Allow
            }
            Ok(Err(e)) => {
                counters::moderation_checks_total("error");
                warn!(error = %e, "moderation check failed, allowing message");
                Verdict::Allow
            }
            Err(_) => {
                counters::moderation_checks_total("timeout");
                warn!(deadline = ?self.deadline, "moderation check timed out, allowing message");
                Verdict::Allow
            }
        }
    }
}
