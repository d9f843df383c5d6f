use super::installer::InstallerHandle;
use super::window::{PageSession, WindowListener};
use super::BridgeError;
use crate::protocol::{
    is_tagged, request_id_of, FetchOptions, ProxyRequest, ProxyResponse, ResponseType,
    FETCH_RESPONSE_TYPE, PAGE_SOURCE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// What the controller asks the content relay to fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub url: String,
    pub options: FetchOptions,
    pub want_body: bool,
    pub response_type: ResponseType,
}

impl RelayRequest {
    /// GET `url` and return the body as bytes.
    pub fn bytes(url: &str) -> Self {
        Self {
            url: url.to_string(),
            options: FetchOptions::get(),
            want_body: true,
            response_type: ResponseType::Bytes,
        }
    }
}

struct RelayEnvelope {
    request: RelayRequest,
    reply: oneshot::Sender<ProxyResponse>,
}

/// Fresh correlation id. Uniqueness comes from the random v4 uuid.
pub fn next_request_id() -> String {
    format!("mrm_{}", Uuid::new_v4().simple())
}

/// Content-context service bridging relay requests to the page window.
pub struct ContentRelay {
    page: PageSession,
    installer: InstallerHandle,
    timeout: Duration,
}

impl ContentRelay {
    pub fn new(page: PageSession, installer: InstallerHandle, timeout: Duration) -> Self {
        Self {
            page,
            installer,
            timeout,
        }
    }

    /// Run the relay as its own task. Every request is served on a task of
    /// its own, so slow requests never hold up the others.
    pub fn spawn(self) -> RelayHandle {
        let (tx, mut rx) = mpsc::channel::<RelayEnvelope>(64);
        let relay = Arc::new(self);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let relay = relay.clone();
                tokio::spawn(async move {
                    let response = relay.handle(envelope.request).await;
                    let _ = envelope.reply.send(response);
                });
            }
            log::debug!("Content relay for {} stopped", relay.page.id());
        });

        RelayHandle { tx }
    }

    /// Proxy one request through the page. Always produces exactly one
    /// response: the correlated answer, or a `PAGE_FETCH_TIMEOUT` failure.
    pub async fn handle(&self, request: RelayRequest) -> ProxyResponse {
        if let Err(e) = self.installer.ensure_installed(&self.page).await {
            log::debug!("Bridge install on {} not confirmed: {}", self.page.id(), e);
        }

        let request_id = next_request_id();

        // The listener is registered before the request goes out and is
        // dropped on every exit path below.
        let mut listener = self.page.window().subscribe();
        let message = ProxyRequest {
            request_id: request_id.clone(),
            url: request.url,
            options: request.options,
            want_body: request.want_body,
            response_type: request.response_type,
        }
        .to_message();
        self.page.window().post_message(message);

        match tokio::time::timeout(self.timeout, wait_for_response(&mut listener, &request_id)).await {
            Ok(response) => response,
            Err(_) => {
                log::warn!(
                    "Page fetch {} on {} timed out after {}ms",
                    request_id,
                    self.page.id(),
                    self.timeout.as_millis()
                );
                ProxyResponse::timeout(request_id)
            }
        }
    }
}

async fn wait_for_response(listener: &mut WindowListener, request_id: &str) -> ProxyResponse {
    while let Some(message) = listener.next().await {
        if !is_tagged(&message, PAGE_SOURCE, FETCH_RESPONSE_TYPE) {
            continue;
        }
        if request_id_of(&message) != Some(request_id) {
            continue;
        }
        return match ProxyResponse::from_message(&message) {
            Ok(response) => response,
            Err(e) => ProxyResponse::failure(request_id, e.to_string()),
        };
    }
    // The window is gone; only the timer can end this request now.
    std::future::pending().await
}

/// Handle the controller uses to reach a content relay.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayEnvelope>,
}

impl RelayHandle {
    pub async fn send(&self, request: RelayRequest) -> Result<ProxyResponse, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(RelayEnvelope { request, reply })
            .await
            .map_err(|_| BridgeError::RelayUnavailable)?;
        response.await.map_err(|_| BridgeError::RelayDropped)
    }
}
