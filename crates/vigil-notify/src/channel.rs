//! Outbound channel capability.
//!
//! `Notifier` is the seam the dispatcher sends through. `ChannelRouter`
//! is the production implementation: it resolves a channel name to its
//! configured sink and delivers over a webhook or into the log.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{info, warn};

use vigil_core::config::{ChannelSink, ChannelSpec};

use crate::error::{NotifyError, NotifyResult};
use crate::message::AlertMessage;

/// Boxed future returned by [`Notifier::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = NotifyResult<()>> + Send + 'a>>;

/// Delivers one alert to a named channel.
pub trait Notifier: Send + Sync {
    fn send<'a>(&'a self, channel: &'a str, message: &'a AlertMessage) -> SendFuture<'a>;
}

/// Routes alerts to configured webhook and log sinks.
pub struct ChannelRouter {
    sinks: HashMap<String, ChannelSink>,
    client: reqwest::Client,
}

impl ChannelRouter {
    /// Build a router; every request is bounded by `send_timeout`.
    pub fn new(channels: &[ChannelSpec], send_timeout: Duration) -> NotifyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(send_timeout)
            .user_agent("vigil-notify/0.1")
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;
        let sinks = channels
            .iter()
            .map(|c| (c.name.clone(), c.sink.clone()))
            .collect();
        Ok(Self { sinks, client })
    }

    /// Configured channel names.
    pub fn channels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sinks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    async fn post_webhook(&self, channel: &str, url: &str, message: &AlertMessage) -> NotifyResult<()> {
        let response = self
            .client
            .post(url)
            .json(&message.webhook_payload())
            .send()
            .await
            .map_err(|e| NotifyError::Transport {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            warn!(%channel, status = status.as_u16(), "webhook rejected alert");
            Err(NotifyError::Rejected {
                channel: channel.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

impl Notifier for ChannelRouter {
    fn send<'a>(&'a self, channel: &'a str, message: &'a AlertMessage) -> SendFuture<'a> {
        Box::pin(async move {
            match self.sinks.get(channel) {
                Some(ChannelSink::Webhook { url }) => self.post_webhook(channel, url, message).await,
                Some(ChannelSink::Log) => {
                    info!(
                        %channel,
                        kind = message.kind.as_str(),
                        incident = %message.incident_id,
                        service = %message.service_id,
                        severity = %message.severity,
                        state = %message.state,
                        cause = %message.cause,
                        "alert"
                    );
                    Ok(())
                }
                None => Err(NotifyError::UnknownChannel(channel.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    use super::*;
    use crate::message::AlertKind;

    type Received = Arc<Mutex<Vec<Value>>>;

    /// Local webhook receiver answering with `status`.
    async fn webhook_server(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(seen): State<Received>, Json(body): Json<Value>| async move {
                        seen.lock().unwrap().push(body);
                        status
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), received)
    }

    fn router(url: &str) -> ChannelRouter {
        ChannelRouter::new(
            &[
                ChannelSpec {
                    name: "ops".to_string(),
                    sink: ChannelSink::Webhook {
                        url: url.to_string(),
                    },
                },
                ChannelSpec {
                    name: "audit".to_string(),
                    sink: ChannelSink::Log,
                },
            ],
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn message() -> AlertMessage {
        AlertMessage::engine(AlertKind::EngineDegraded, "state store unavailable", 0)
    }

    #[tokio::test]
    async fn webhook_receives_attachment_payload() {
        let (url, received) = webhook_server(StatusCode::OK).await;
        let router = router(&url);

        router.send("ops", &message()).await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["attachments"][0]["title"], "vigil: ENGINE DEGRADED");
    }

    #[tokio::test]
    async fn webhook_error_status_is_rejected() {
        let (url, _) = webhook_server(StatusCode::SERVICE_UNAVAILABLE).await;
        let err = router(&url).send("ops", &message()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { status: 503, .. }));
    }

    #[tokio::test]
    async fn log_sink_and_unknown_channel() {
        let router = router("http://127.0.0.1:1/hook");
        router.send("audit", &message()).await.unwrap();
        assert!(matches!(
            router.send("pager", &message()).await,
            Err(NotifyError::UnknownChannel(_))
        ));
        assert_eq!(router.channels(), vec!["audit", "ops"]);
    }
}
