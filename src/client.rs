use anyhow::{Context, Result, anyhow};
use reqwest::{
    Client, Url,
    header::{ACCEPT, RETRY_AFTER},
};
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    carrier::Carrier,
    common::{
        is_retryable_status, min_interval_for_rate, parse_retry_after, truncate_for_log,
        wait_for_rate_slot,
    },
};

const FHIR_ACCEPT: &str = "application/fhir+json, application/json;q=0.9";
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Spaces request starts at least `min_interval` apart across every clone.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    next_slot: Arc<Mutex<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn per_second(requests_per_second: f64) -> Self {
        Self {
            next_slot: Arc::new(Mutex::new(Instant::now())),
            min_interval: min_interval_for_rate(requests_per_second),
        }
    }

    pub async fn wait(&self) {
        wait_for_rate_slot(&self.next_slot, self.min_interval).await;
    }
}

/// GET `url` and decode a JSON body, retrying transient failures.
pub async fn fetch_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    accept: &str,
    limiter: &RateLimiter,
    policy: RetryPolicy,
) -> Result<T> {
    let attempts = policy.max_retries.max(1);
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=attempts {
        limiter.wait().await;
        let response = client.get(url).header(ACCEPT, accept).send().await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    let body = resp
                        .text()
                        .await
                        .with_context(|| format!("Failed reading response body from {url}"))?;
                    return serde_json::from_str(&body).with_context(|| {
                        format!("Invalid JSON from {url}. Body: {}", truncate_for_log(&body))
                    });
                }

                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                let body = resp.text().await.unwrap_or_default();
                if is_retryable_status(status) {
                    if attempt == attempts {
                        return Err(anyhow!(
                            "Retryable status {} for {} after {} attempts. Body: {}",
                            status,
                            url,
                            attempts,
                            truncate_for_log(&body)
                        ));
                    }
                    tracing::debug!(%status, attempt, url, "retrying after transient status");
                    tokio::time::sleep(retry_after.unwrap_or(backoff)).await;
                    backoff = (backoff + backoff).min(MAX_BACKOFF);
                    continue;
                }

                return Err(anyhow!(
                    "Non-retryable status {} for {}. Body: {}",
                    status,
                    url,
                    truncate_for_log(&body)
                ));
            }
            Err(err) => {
                if attempt == attempts {
                    return Err(anyhow!("Request failed for {url}: {err}"));
                }
                tracing::debug!(attempt, url, error = %err, "retrying after transport error");
                tokio::time::sleep(backoff).await;
                backoff = (backoff + backoff).min(MAX_BACKOFF);
            }
        }
    }

    Err(anyhow!("Unexpected request flow for {url}"))
}

/// One carrier's FHIR endpoint plus the throttling and retry policy used against it.
#[derive(Debug, Clone)]
pub struct FhirClient {
    http: Client,
    base_url: Url,
    carrier: Carrier,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl FhirClient {
    pub fn new(
        http: Client,
        carrier: Carrier,
        base_url_override: Option<&str>,
        limiter: RateLimiter,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let raw = base_url_override.unwrap_or(carrier.base_url());
        let with_slash = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };
        let base_url =
            Url::parse(&with_slash).with_context(|| format!("Invalid FHIR base URL {raw}"))?;
        Ok(Self {
            http,
            base_url,
            carrier,
            limiter,
            policy,
        })
    }

    pub fn carrier(&self) -> Carrier {
        self.carrier
    }

    pub fn search_url(&self, resource_type: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(resource_type)
            .with_context(|| format!("Failed building {resource_type} search URL"))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
            if let Some((key, value)) = self.carrier.page_size_param(resource_type) {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Absolute URL for a resource reference such as `Location/123`.
    pub fn resolve(&self, reference: &str) -> Result<Url> {
        let reference = reference.trim();
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Url::parse(reference).with_context(|| format!("Invalid reference {reference}"));
        }
        self.base_url
            .join(reference.trim_start_matches('/'))
            .with_context(|| format!("Failed resolving reference {reference}"))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        fetch_json(&self.http, url, FHIR_ACCEPT, &self.limiter, self.policy).await
    }

    pub async fn read<T: DeserializeOwned>(&self, reference: &str) -> Result<T> {
        let url = self.resolve(reference)?;
        self.get_json(url.as_str()).await
    }
}
