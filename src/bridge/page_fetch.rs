//! The fetch bridge that runs inside the page context.
//!
//! It answers every tagged fetch request on the window with exactly one tagged
//! response, carrying the original request id. Failures of any kind are turned
//! into `ok: false` responses; nothing is thrown back across the window.

use super::window::{PageSession, WindowListener};
use crate::http_client::{FetchedResponse, PageNetwork};
use crate::protocol::{
    is_tagged, request_id_of, ProxyBody, ProxyRequest, ProxyResponse, ResponseType,
    EXTENSION_SOURCE, FETCH_REQUEST_TYPE,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Start serving fetch requests on `page`. `listener` must already be
/// subscribed to the page window so nothing posted after this call is missed.
pub(crate) fn run(page: &PageSession, mut listener: WindowListener) -> JoinHandle<()> {
    let window = page.window().clone();
    let network = page.network();
    let closed = page.closed_token();
    let page_id = page.id();

    tokio::spawn(async move {
        log::debug!("Page fetch bridge listening on {}", page_id);
        loop {
            let message = tokio::select! {
                biased;
                _ = closed.cancelled() => break,
                message = listener.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            if !is_tagged(&message, EXTENSION_SOURCE, FETCH_REQUEST_TYPE) {
                continue;
            }

            let window = window.clone();
            let network = network.clone();
            tokio::spawn(async move {
                if let Some(response) = serve(network, &message).await {
                    window.post_message(response.to_message());
                }
            });
        }
        log::debug!("Page fetch bridge on {} stopped", page_id);
    })
}

/// Handle one request message. Returns `None` only when the message carries no
/// readable request id, since such a response could never be correlated.
pub(crate) async fn serve(network: Arc<dyn PageNetwork>, message: &Value) -> Option<ProxyResponse> {
    let request = match ProxyRequest::from_message(message) {
        Ok(request) => request,
        Err(e) => {
            let request_id = request_id_of(message)?;
            log::warn!("Malformed fetch request {}: {}", request_id, e);
            return Some(ProxyResponse::failure(request_id, e.to_string()));
        }
    };

    let init = request.options.resolve();
    let response = match network.fetch(&request.url, &init).await {
        Ok(response) => response,
        Err(e) => {
            log::debug!("Page fetch of {} failed: {}", request.url, e);
            return Some(ProxyResponse::failure(request.request_id, e.to_string()));
        }
    };

    let mut proxied = ProxyResponse {
        request_id: request.request_id.clone(),
        ok: response.ok(),
        status: Some(response.status),
        status_text: response.status_text.clone(),
        headers: response.headers.clone(),
        body: None,
        response_type: request.response_type,
        error: None,
    };

    if request.want_body {
        match read_body(response, request.response_type).await {
            Ok(body) => proxied.body = Some(body),
            Err(e) => return Some(ProxyResponse::failure(request.request_id, e)),
        }
    }

    Some(proxied)
}

async fn read_body(response: FetchedResponse, response_type: ResponseType) -> Result<ProxyBody, String> {
    let body = match response_type {
        ResponseType::Text => ProxyBody::Text(response.text().await.map_err(|e| e.to_string())?),
        ResponseType::Json => ProxyBody::Json(response.json().await.map_err(|e| e.to_string())?),
        ResponseType::Bytes => ProxyBody::Bytes(response.bytes().await.map_err(|e| e.to_string())?),
    };
    Ok(body)
}
