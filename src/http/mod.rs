//! The HTTP side of the client. Requests go through [engine::RequestEngine], which adds
//!  authentication, and retries against fallback hosts; the actual HTTP implementation is
//!  pluggable through [HttpClient].

pub mod engine;
pub mod hosts;
pub mod paginated;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    /// absolute path, starting with `/`
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> HttpRequest {
        HttpRequest {
            method,
            path: path.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_params(mut self, params: &[(&str, &str)]) -> HttpRequest {
        self.params.extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn with_json_body(mut self, body: Bytes) -> HttpRequest {
        self.headers.push(("content-type".to_string(), "application/json".to_string()));
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn url(&self, host: &str) -> String {
        if self.params.is_empty() {
            return format!("https://{}{}", host, self.path);
        }
        let query = self.params.iter()
            .map(|(k, v)| format!("{}={}", utf8_percent_encode(k, NON_ALPHANUMERIC), utf8_percent_encode(v, NON_ALPHANUMERIC)))
            .collect::<Vec<_>>()
            .join("&");
        format!("https://{}{}?{}", host, self.path, query)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> HttpResponse {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> HttpResponse {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).into_iter().next()
    }

    /// all values of a header that may be repeated, e.g. `Link`
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers.iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Decode(format!("invalid response body: {}", e)))
    }
}

/// The HTTP implementation. Returns `Err` only if no response was received (connection refused,
///  TLS failure, ...); responses with an error status are `Ok`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn execute(&self, host: &str, request: &HttpRequest) -> anyhow::Result<HttpResponse>;
}
