//! REST API of the service, used by the channel and presence handles for history and by the
//!  client for everything that does not need the realtime connection.

use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::Authenticator;
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::http::engine::RequestEngine;
use crate::http::paginated::PaginatedResult;
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::protocol::{Message, PresenceMessage};

#[derive(Clone)]
pub struct Rest {
    engine: Arc<RequestEngine>,
}

fn channel_path(channel: &str, suffix: &str) -> String {
    format!("/channels/{}/{}", utf8_percent_encode(channel, NON_ALPHANUMERIC), suffix)
}

impl Rest {
    pub fn new(options: &ClientOptions, client: Arc<dyn HttpClient>, authenticator: Arc<dyn Authenticator>) -> Rest {
        Rest {
            engine: Arc::new(RequestEngine::new(options, client, authenticator)),
        }
    }

    /// The service's clock, in milliseconds since the epoch
    pub async fn time(&self) -> Result<i64> {
        let response = self.engine.execute(&HttpRequest::new(Method::Get, "/time")).await?;
        response.json::<Vec<i64>>()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Decode("empty time response".to_string()))
    }

    pub async fn stats(&self, params: &[(&str, &str)]) -> Result<PaginatedResult<Value>> {
        self.paginated_request(Method::Get, "/stats", params).await
    }

    pub async fn history(&self, channel: &str, params: &[(&str, &str)]) -> Result<PaginatedResult<Message>> {
        self.paginated_request(Method::Get, &channel_path(channel, "messages"), params).await
    }

    /// Publishes without the realtime connection
    pub async fn publish(&self, channel: &str, messages: &[Message]) -> Result<()> {
        let body = serde_json::to_vec(messages)
            .map_err(|e| Error::Decode(e.to_string()))?;
        let request = HttpRequest::new(Method::Post, channel_path(channel, "messages"))
            .with_json_body(Bytes::from(body));
        self.engine.execute(&request).await?;
        Ok(())
    }

    /// Current members as seen by the service, independent of any realtime attachment
    pub async fn presence_get(&self, channel: &str, params: &[(&str, &str)]) -> Result<PaginatedResult<PresenceMessage>> {
        self.paginated_request(Method::Get, &channel_path(channel, "presence"), params).await
    }

    pub async fn presence_history(&self, channel: &str, params: &[(&str, &str)]) -> Result<PaginatedResult<PresenceMessage>> {
        self.paginated_request(Method::Get, &channel_path(channel, "presence/history"), params).await
    }

    /// Any REST endpoint. The response is returned as is if it has a success status.
    pub async fn request(&self, method: Method, path: &str, params: &[(&str, &str)], body: Option<Value>) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(method, path).with_params(params);
        if let Some(body) = body {
            let body = serde_json::to_vec(&body)
                .map_err(|e| Error::Decode(e.to_string()))?;
            request = request.with_json_body(Bytes::from(body));
        }
        self.engine.execute(&request).await
    }

    /// Any REST endpoint returning a JSON array of `T`, following `Link` headers for further pages
    pub async fn paginated_request<T: DeserializeOwned>(&self, method: Method, path: &str, params: &[(&str, &str)]) -> Result<PaginatedResult<T>> {
        let request = HttpRequest::new(method, path).with_params(params);
        PaginatedResult::fetch(self.engine.clone(), request).await
    }
}
