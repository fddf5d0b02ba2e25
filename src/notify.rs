/// HTTP egress
///
/// Two outbound calls: a per-detection webhook whose URL carries the sound
/// name, and a periodic liveness heartbeat. Both run on the async runtime,
/// off the audio thread. Failures are logged and never stop detection.

use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::detector::Detection;

/// Placeholder replaced by the sound name in webhook templates
pub const SOUND_PLACEHOLDER: &str = "{sound}";

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: StatusCode, url: String },
}

/// Build an HTTP client with a request timeout
pub fn http_client(timeout: Duration) -> Result<Client, NotifyError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Substitute the percent-encoded sound name into a URL template
pub fn render_url(template: &str, name: &str) -> Result<Url, NotifyError> {
    let encoded: String = url::form_urlencoded::byte_serialize(name.as_bytes())
        .collect::<String>()
        .replace('+', "%20");
    let rendered = template.replace(SOUND_PLACEHOLDER, &encoded);

    Url::parse(&rendered).map_err(|e| NotifyError::InvalidUrl {
        url: rendered,
        reason: e.to_string(),
    })
}

fn parse_url(url: &str) -> Result<Url, NotifyError> {
    Url::parse(url).map_err(|e| NotifyError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Calls a webhook for every detection
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    template: String,
}

impl WebhookNotifier {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        Self::with_client(http_client(timeout)?, template)
    }

    /// Use an existing client (shared pools, custom proxy settings)
    pub fn with_client(client: Client, template: impl Into<String>) -> Result<Self, NotifyError> {
        let template = template.into();
        render_url(&template, "probe")?;

        if !template.contains(SOUND_PLACEHOLDER) {
            warn!(
                "Webhook URL has no {} placeholder; every sound calls the same URL",
                SOUND_PLACEHOLDER
            );
        }

        Ok(Self { client, template })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Send one notification (GET on the rendered URL)
    pub async fn notify(&self, detection: &Detection) -> Result<(), NotifyError> {
        let url = render_url(&self.template, &detection.name)?;
        debug!("Notifying {}", url);

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                status,
                url: url.to_string(),
            });
        }

        info!("Notified '{}' ({})", detection.name, status);
        Ok(())
    }
}

/// Drain the detection queue into the webhook until every sender is gone.
///
/// Returns the number of notifications delivered.
pub async fn dispatch_notifications(
    mut rx: mpsc::UnboundedReceiver<Detection>,
    notifier: WebhookNotifier,
) -> u64 {
    let mut delivered = 0;

    while let Some(detection) = rx.recv().await {
        match notifier.notify(&detection).await {
            Ok(()) => delivered += 1,
            Err(e) => error!("Notification for '{}' failed: {}", detection.name, e),
        }
    }

    debug!("Notification queue closed after {} deliveries", delivered);
    delivered
}

/// Periodic liveness ping
#[derive(Debug, Clone)]
pub struct Heartbeat {
    client: Client,
    url: Url,
    payload: Option<serde_json::Value>,
    period: Duration,
}

impl Heartbeat {
    pub fn new(
        url: &str,
        payload: Option<serde_json::Value>,
        period: Duration,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        Self::with_client(http_client(timeout)?, url, payload, period)
    }

    pub fn with_client(
        client: Client,
        url: &str,
        payload: Option<serde_json::Value>,
        period: Duration,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            client,
            url: parse_url(url)?,
            payload,
            period,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// POST once, with the JSON payload as body when configured
    pub async fn beat(&self) -> Result<StatusCode, NotifyError> {
        let mut request = self.client.post(self.url.clone());
        if let Some(payload) = &self.payload {
            request = request.json(payload);
        }

        let status = request.send().await?.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                status,
                url: self.url.to_string(),
            });
        }
        Ok(status)
    }

    /// Beat immediately, then once per period, until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!("Heartbeat to {} every {:?}", self.url, self.period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.beat() => match result {
                    Ok(status) => debug!("Heartbeat sent ({})", status),
                    Err(e) => error!("Heartbeat failed: {}", e),
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
        }

        debug!("Heartbeat stopped");
    }
}
