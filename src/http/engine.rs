use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::auth::{Authenticator, Credential, CredentialState};
use crate::config::ClientOptions;
use crate::error::{codes, Error, ErrorInfo, Result};
use crate::http::hosts::HostSelector;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::util::random::RngRandom;

enum AttemptError {
    /// worth trying another host
    Retryable(ErrorInfo),
    Fatal(Error),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorInfo,
}

/// The `ErrorInfo` of an error response, from the `{"error": {...}}` body if there is one
pub fn error_info(response: &HttpResponse) -> ErrorInfo {
    match serde_json::from_slice::<ErrorBody>(&response.body) {
        Ok(body) => body.error,
        Err(_) => {
            let text = String::from_utf8_lossy(&response.body);
            let message = if text.trim().is_empty() {
                format!("HTTP status {}", response.status)
            }
            else {
                text.chars().take(200).collect()
            };
            ErrorInfo::new(response.status as u32 * 100, response.status, message)
        }
    }
}

/// Executes requests against the REST hosts: authenticates them, retries retryable failures on
///  the next host, and refreshes a rejected token once.
pub struct RequestEngine {
    client: Arc<dyn HttpClient>,
    authenticator: Arc<dyn Authenticator>,
    hosts: Mutex<HostSelector<RngRandom>>,
    timeout: Duration,
    max_attempts: usize,
    protocol_version: String,
}

impl RequestEngine {
    pub fn new(options: &ClientOptions, client: Arc<dyn HttpClient>, authenticator: Arc<dyn Authenticator>) -> RequestEngine {
        RequestEngine {
            client,
            authenticator,
            hosts: Mutex::new(HostSelector::new(options)),
            timeout: options.http_request_timeout,
            max_attempts: options.http_max_retry_count as usize + 1,
            protocol_version: options.protocol_version.clone(),
        }
    }

    fn hosts(&self) -> MutexGuard<'_, HostSelector<RngRandom>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[tracing::instrument(name = "http_request", skip_all, fields(method = request.method.as_str(), path = %request.path))]
    pub async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let credential = self.credential().await?;
        match self.execute_with(request, &credential).await {
            Err(Error::Auth(info)) if info.is_token_error() => {
                debug!("token rejected ({}), refreshing", info);
                let credential = self.authenticator.refresh().await
                    .map_err(Error::Auth)?;
                self.execute_with(request, &credential).await
            }
            result => result,
        }
    }

    async fn credential(&self) -> Result<Credential> {
        match self.authenticator.current_credential() {
            CredentialState::Valid(credential) => Ok(credential),
            CredentialState::NeedsRefresh => self.authenticator.refresh().await
                .map_err(Error::Auth),
        }
    }

    async fn execute_with(&self, request: &HttpRequest, credential: &Credential) -> Result<HttpResponse> {
        let mut request = request.clone();
        request.headers.push(("authorization".to_string(), credential.authorization_header()));
        request.headers.push(("accept".to_string(), "application/json".to_string()));
        request.headers.push(("x-protocol-version".to_string(), self.protocol_version.clone()));

        let candidates = self.hosts().candidates(Instant::now());
        let max_attempts = self.max_attempts.min(candidates.len());

        let mut last_error = None;
        let mut attempts = 0;
        for host in candidates.into_iter().take(max_attempts) {
            attempts += 1;
            match self.attempt(&host, &request, attempts).await {
                Ok(response) => {
                    self.hosts().on_success(&host, Instant::now());
                    return Ok(response);
                }
                Err(AttemptError::Fatal(e)) => {
                    self.hosts().on_reachable(&host);
                    return Err(e);
                }
                Err(AttemptError::Retryable(info)) => {
                    warn!("request to {} failed: {}", host, info);
                    self.hosts().on_failure(&host, Instant::now());
                    last_error = Some(info);
                }
            }
        }

        let info = last_error
            .unwrap_or_else(|| ErrorInfo::new(codes::CONNECTION_FAILED, 503, "no host to send the request to"));
        Err(Error::Request { info, retryable: true, attempts })
    }

    async fn attempt(&self, host: &str, request: &HttpRequest, attempt: u32) -> std::result::Result<HttpResponse, AttemptError> {
        debug!("attempt #{}: {} {}", attempt, request.method.as_str(), request.url(host));
        let response = match time::timeout(self.timeout, self.client.execute(host, request)).await {
            Err(_) => {
                let message = format!("request to {} timed out after {:?}", host, self.timeout);
                return Err(AttemptError::Retryable(ErrorInfo::new(codes::TIMEOUT, 504, message)));
            }
            Ok(Err(e)) => {
                let message = format!("request to {} failed: {}", host, e);
                return Err(AttemptError::Retryable(ErrorInfo::new(codes::CONNECTION_FAILED, 503, message)));
            }
            Ok(Ok(response)) => response,
        };

        if response.is_success() {
            return Ok(response);
        }
        let info = error_info(&response);
        if response.status >= 500 {
            Err(AttemptError::Retryable(info))
        }
        else if info.is_auth_error() {
            Err(AttemptError::Fatal(Error::Auth(info)))
        }
        else {
            Err(AttemptError::Fatal(Error::Request { info, retryable: false, attempts: attempt }))
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;
    use rstest::rstest;

    use super::*;
    use crate::auth::{KeyAuthenticator, MockAuthenticator};
    use crate::http::{Method, MockHttpClient};
    use crate::test_util::test_options;

    fn engine(client: MockHttpClient) -> RequestEngine {
        engine_with(client, Arc::new(KeyAuthenticator::new("app.key:secret")))
    }

    fn engine_with(client: MockHttpClient, authenticator: Arc<dyn Authenticator>) -> RequestEngine {
        RequestEngine::new(&test_options(), Arc::new(client), authenticator)
    }

    fn time_request() -> HttpRequest {
        HttpRequest::new(Method::Get, "/time")
    }

    #[tokio::test]
    async fn test_success_on_primary() {
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .withf(|host, request| host == "rest.test" && request.header("authorization") == Some("Basic YXBwLmtleTpzZWNyZXQ="))
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(200, "[1]")));

        let response = engine(client).execute(&time_request()).await.unwrap();
        assert_eq!(response.json::<Vec<i64>>().unwrap(), vec![1]);
    }

    #[rstest]
    #[case::server_error(500)]
    #[case::bad_gateway(502)]
    #[case::unavailable(503)]
    #[tokio::test]
    async fn test_retryable_status_falls_back(#[case] status: u16) {
        let mut seq = Sequence::new();
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .withf(|host, _| host == "rest.test")
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(HttpResponse::new(status, "")));
        client.expect_execute()
            .withf(|host, _| host == "fallback1.test")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(HttpResponse::new(200, "[2]")));

        let response = engine(client).execute(&time_request()).await.unwrap();
        assert_eq!(response.body.as_ref(), b"[2]");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(404, r#"{"error":{"code":40400,"statusCode":404,"message":"not found"}}"#)));

        let result = engine(client).execute(&time_request()).await;
        assert_eq!(result, Err(Error::Request { info: ErrorInfo::new(40400, 404, "not found"), retryable: false, attempts: 1 }));
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .times(3)
            .returning(|host, _| if host == "fallback2.test" {
                Err(anyhow::anyhow!("connection refused"))
            }
            else {
                Ok(HttpResponse::new(500, "boom"))
            });

        match engine(client).execute(&time_request()).await {
            Err(Error::Request { info, retryable, attempts }) => {
                assert!(retryable);
                assert_eq!(attempts, 3);
                assert_eq!(info.code, codes::CONNECTION_FAILED);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempts_limited_by_retry_count() {
        let mut options = test_options();
        options.http_max_retry_count = 1;
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .times(2)
            .returning(|_, _| Ok(HttpResponse::new(503, "")));
        let engine = RequestEngine::new(&options, Arc::new(client), Arc::new(KeyAuthenticator::new("app.key:secret")));

        assert!(matches!(engine.execute(&time_request()).await, Err(Error::Request { attempts: 2, .. })));
    }

    /// hangs for the primary host, answers immediately for all others
    struct SlowPrimary {}

    #[async_trait::async_trait]
    impl HttpClient for SlowPrimary {
        async fn execute(&self, host: &str, _request: &HttpRequest) -> anyhow::Result<HttpResponse> {
            if host == "rest.test" {
                return std::future::pending().await;
            }
            Ok(HttpResponse::new(200, "fallback"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let engine = RequestEngine::new(&test_options(), Arc::new(SlowPrimary {}), Arc::new(KeyAuthenticator::new("app.key:secret")));
        let response = engine.execute(&time_request()).await.unwrap();
        assert_eq!(response.body.as_ref(), b"fallback");
    }

    #[tokio::test]
    async fn test_sticky_fallback() {
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .withf(|host, _| host == "rest.test")
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("unreachable")));
        client.expect_execute()
            .withf(|host, _| host == "fallback1.test")
            .times(2)
            .returning(|_, _| Ok(HttpResponse::new(200, "[]")));
        let engine = engine(client);

        engine.execute(&time_request()).await.unwrap();
        // the second request goes to the fallback host right away
        engine.execute(&time_request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_sticky_fallback_after_two_failures() {
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .withf(|host, _| host == "rest.test")
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(503, "")));
        client.expect_execute()
            .withf(|host, _| host == "fallback1.test")
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("connection reset")));
        client.expect_execute()
            .withf(|host, _| host == "fallback2.test")
            .times(2)
            .returning(|_, _| Ok(HttpResponse::new(200, "[3]")));
        let engine = engine(client);

        assert_eq!(engine.execute(&time_request()).await.unwrap().body.as_ref(), b"[3]");
        // neither failed host is tried again
        assert_eq!(engine.execute(&time_request()).await.unwrap().body.as_ref(), b"[3]");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_does_not_make_host_preferred() {
        const NOT_FOUND: &str = r#"{"error":{"code":40400,"statusCode":404,"message":"not found"}}"#;
        let mut options = test_options();
        options.fallback_retry_timeout = Duration::from_secs(10);

        let mut client = MockHttpClient::new();
        let mut primary_calls = 0;
        client.expect_execute()
            .withf(|host, _| host == "rest.test")
            .times(2)
            .returning(move |_, _| {
                primary_calls += 1;
                if primary_calls == 1 {
                    Err(anyhow::anyhow!("unreachable"))
                }
                else {
                    Ok(HttpResponse::new(200, "primary"))
                }
            });
        let mut fallback_calls = 0;
        client.expect_execute()
            .withf(|host, _| host == "fallback1.test")
            .times(2)
            .returning(move |_, _| {
                fallback_calls += 1;
                let status = if fallback_calls == 1 { 404 } else { 500 };
                Ok(HttpResponse::new(status, NOT_FOUND))
            });
        client.expect_execute()
            .withf(|host, _| host == "fallback2.test")
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(404, NOT_FOUND)));
        let engine = RequestEngine::new(&options, Arc::new(client), Arc::new(KeyAuthenticator::new("app.key:secret")));

        // rest.test fails, fallback1.test answers 404
        assert!(matches!(engine.execute(&time_request()).await, Err(Error::Request { retryable: false, .. })));

        // fallback1.test fails, fallback2.test answers 404
        time::advance(Duration::from_secs(5)).await;
        assert!(matches!(engine.execute(&time_request()).await, Err(Error::Request { retryable: false, .. })));

        // rest.test is healthy again and fallback2.test was not made sticky by its 404
        time::advance(Duration::from_secs(6)).await;
        assert_eq!(engine.execute(&time_request()).await.unwrap().body.as_ref(), b"primary");
    }

    #[tokio::test]
    async fn test_token_refresh_once() {
        let mut authenticator = MockAuthenticator::new();
        authenticator.expect_current_credential()
            .returning(|| CredentialState::Valid(Credential::Token("old".to_string())));
        authenticator.expect_refresh()
            .times(1)
            .returning(|| Ok(Credential::Token("new".to_string())));

        let mut client = MockHttpClient::new();
        client.expect_execute()
            .withf(|_, request| request.header("authorization") == Some("Bearer b2xk"))
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(401, r#"{"error":{"code":40142,"statusCode":401,"message":"expired"}}"#)));
        client.expect_execute()
            .withf(|_, request| request.header("authorization") == Some("Bearer bmV3"))
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(200, "[]")));

        engine_with(client, Arc::new(authenticator)).execute(&time_request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_key_is_auth_error() {
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(401, r#"{"error":{"code":40101,"statusCode":401,"message":"invalid key"}}"#)));

        assert_eq!(engine(client).execute(&time_request()).await, Err(Error::Auth(ErrorInfo::new(40101, 401, "invalid key"))));
    }

    #[rstest]
    #[case::json_body(r#"{"error":{"code":40160,"statusCode":401,"message":"denied"}}"#, 401, ErrorInfo::new(40160, 401, "denied"))]
    #[case::plain_text("gateway timeout", 504, ErrorInfo::new(50400, 504, "gateway timeout"))]
    #[case::empty("", 500, ErrorInfo::new(50000, 500, "HTTP status 500"))]
    fn test_error_info(#[case] body: &'static str, #[case] status: u16, #[case] expected: ErrorInfo) {
        assert_eq!(error_info(&HttpResponse::new(status, body)), expected);
    }
}
