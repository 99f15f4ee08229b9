use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use sketchmate_shared::NotificationSubscription;

use super::payload::PushPayload;

/// Failure to deliver one push. Always absorbed by the notifier.
#[derive(Debug, Error)]
pub enum NotificationDeliveryError {
    #[error("push provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push provider rejected message: {status}")]
    Rejected { status: u16 },

    #[error("push transport error: {0}")]
    Other(String),
}

/// Provider-specific delivery of one payload to one subscription.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(
        &self,
        target: &NotificationSubscription,
        payload: &PushPayload,
    ) -> Result<(), NotificationDeliveryError>;
}

/// Where FCM access tokens come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A token supplied by the operator.
    Static(String),
    /// A service-account token endpoint answering `{access_token, expires_in}`,
    /// such as the GCE metadata server.
    Metadata(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Tokens this close to expiry are refreshed before use.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// FCM HTTP v1 (`projects/<id>/messages:send`).
pub struct FcmTransport {
    client: reqwest::Client,
    send_url: String,
    tokens: TokenSource,
    cached: Mutex<Option<CachedToken>>,
}

impl FcmTransport {
    pub fn new(
        endpoint: &str,
        project_id: &str,
        tokens: TokenSource,
    ) -> Result<Self, NotificationDeliveryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sketchmate-server/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                endpoint.trim_end_matches('/'),
                project_id
            ),
            tokens,
            cached: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, NotificationDeliveryError> {
        let url = match &self.tokens {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata(url) => url,
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached
            .as_ref()
            .filter(|t| t.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN)
        {
            return Ok(token.value.clone());
        }

        let response = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotificationDeliveryError::Rejected {
                status: response.status().as_u16(),
            });
        }
        let token: TokenResponse = response.json().await?;
        debug!(expires_in = token.expires_in, "Refreshed FCM access token");

        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(token.access_token)
    }

    fn body(target: &NotificationSubscription, payload: &PushPayload) -> serde_json::Value {
        let mut message = json!({
            "token": target.token,
            "data": payload.data,
            "android": { "priority": "high" },
        });
        match &payload.alert {
            Some(alert) => {
                let mut notification = json!({
                    "title": alert.title,
                    "body": alert.body,
                });
                if let Some(image) = &alert.image {
                    notification["image"] = json!(image);
                }
                message["notification"] = notification;
                message["apns"] = json!({ "headers": { "apns-priority": "10" } });
            }
            None => {
                message["apns"] = json!({
                    "headers": { "apns-priority": "5", "apns-push-type": "background" },
                    "payload": { "aps": { "content-available": 1 } },
                });
            }
        }
        json!({ "message": message })
    }
}

#[async_trait]
impl PushTransport for FcmTransport {
    async fn send(
        &self,
        target: &NotificationSubscription,
        payload: &PushPayload,
    ) -> Result<(), NotificationDeliveryError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(&self.send_url)
            .bearer_auth(token)
            .json(&Self::body(target, payload))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotificationDeliveryError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Used when no push project is configured.
pub struct LogTransport;

#[async_trait]
impl PushTransport for LogTransport {
    async fn send(
        &self,
        target: &NotificationSubscription,
        payload: &PushPayload,
    ) -> Result<(), NotificationDeliveryError> {
        info!(
            fingerprint = %target.fingerprint,
            kind = payload.kind().unwrap_or("unknown"),
            silent = payload.is_silent(),
            "Push (log only)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use axum::http::header::AUTHORIZATION;
    use axum::http::{HeaderMap, Uri};
    use axum::routing::get;
    use axum::{Json, Router};

    use super::*;
    use crate::notify::payload::match_notification;
    use sketchmate_shared::Platform;

    fn target() -> NotificationSubscription {
        NotificationSubscription {
            token: "tok".into(),
            platform: Platform::Ios,
            fingerprint: "fp".into(),
            model: "iPhone".into(),
            os: "17".into(),
            logged_in: true,
        }
    }

    #[test]
    fn visible_body_has_notification_block() {
        let body = FcmTransport::body(&target(), &match_notification("Bob"));
        let message = &body["message"];
        assert_eq!(message["token"], "tok");
        assert_eq!(message["notification"]["title"], "You are matched to Bob");
        assert_eq!(message["data"]["type"], "match");
        assert_eq!(message["apns"]["headers"]["apns-priority"], "10");
        assert!(message["apns"].get("payload").is_none());
    }

    #[test]
    fn silent_body_is_data_only() {
        let body = FcmTransport::body(&target(), &match_notification("Bob").silent());
        let message = &body["message"];
        assert!(message.get("notification").is_none());
        assert_eq!(message["apns"]["payload"]["aps"]["content-available"], 1);
        assert_eq!(message["android"]["priority"], "high");
    }

    #[derive(Clone, Default)]
    struct FakeFcm {
        token_fetches: Arc<AtomicUsize>,
        requests: Arc<StdMutex<Vec<(String, String, serde_json::Value)>>>,
    }

    async fn fake_fcm() -> (FakeFcm, String) {
        let fake = FakeFcm::default();
        let tokens = fake.token_fetches.clone();
        let requests = fake.requests.clone();
        let app = Router::new()
            .route(
                "/token",
                get(move |headers: HeaderMap| {
                    let tokens = tokens.clone();
                    async move {
                        assert_eq!(headers["metadata-flavor"], "Google");
                        let n = tokens.fetch_add(1, Ordering::SeqCst);
                        Json(json!({
                            "access_token": format!("token-{n}"),
                            "expires_in": 3600,
                            "token_type": "Bearer",
                        }))
                    }
                }),
            )
            .fallback(move |uri: Uri, headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let requests = requests.clone();
                async move {
                    let auth = headers[AUTHORIZATION].to_str().unwrap().to_string();
                    requests.lock().unwrap().push((uri.path().to_string(), auth, body));
                    Json(json!({ "name": "projects/p/messages/1" }))
                }
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (fake, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn sends_to_v1_endpoint_with_cached_token() {
        let (fake, base) = fake_fcm().await;
        let transport = FcmTransport::new(
            &base,
            "sketchmate-test",
            TokenSource::Metadata(format!("{base}/token")),
        )
        .unwrap();

        transport.send(&target(), &match_notification("Bob")).await.unwrap();
        transport
            .send(&target(), &match_notification("Bob").silent())
            .await
            .unwrap();

        assert_eq!(fake.token_fetches.load(Ordering::SeqCst), 1);
        let requests = fake.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "/v1/projects/sketchmate-test/messages:send");
        assert_eq!(requests[0].1, "Bearer token-0");
        assert_eq!(requests[0].2["message"]["token"], "tok");
        assert!(requests[1].2["message"].get("notification").is_none());
    }

    #[tokio::test]
    async fn static_token_skips_token_endpoint() {
        let (fake, base) = fake_fcm().await;
        let transport =
            FcmTransport::new(&base, "p", TokenSource::Static("fixed".into())).unwrap();
        transport.send(&target(), &match_notification("Bob")).await.unwrap();

        assert_eq!(fake.token_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(fake.requests.lock().unwrap()[0].1, "Bearer fixed");
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_error() {
        let transport = FcmTransport::new(
            "http://127.0.0.1:1",
            "p",
            TokenSource::Static("fixed".into()),
        )
        .unwrap();
        assert!(matches!(
            transport.send(&target(), &match_notification("Bob")).await,
            Err(NotificationDeliveryError::Http(_))
        ));
    }

    #[tokio::test]
    async fn log_transport_never_fails() {
        assert!(LogTransport
            .send(&target(), &match_notification("Bob"))
            .await
            .is_ok());
    }
}
