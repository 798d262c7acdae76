//! HTTP webhook notifier: POSTs each alert notice as JSON.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use super::{AlertNotice, Notifier};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebhookNotifier {
    url: String,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("invalid webhook url {}", url))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("unsupported webhook scheme: {}", other)),
        }
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Ok(Self {
            url: parsed.to_string(),
            agent,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn notify(&self, notice: &AlertNotice) -> Result<()> {
        let body = serde_json::to_string(notice).context("serialize alert notice")?;
        self.agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|e| anyhow!("webhook POST to {} failed: {}", self.url, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(WebhookNotifier::new("ftp://example.com/hook").is_err());
        assert!(WebhookNotifier::new("not a url").is_err());
        assert!(WebhookNotifier::new("https://example.com/hook").is_ok());
    }
}
