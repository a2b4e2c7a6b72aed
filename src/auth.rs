use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
#[cfg(test)] use mockall::automock;

use crate::error::{codes, ErrorInfo};

#[derive(Clone, Eq, PartialEq)]
pub enum Credential {
    /// API key `key_name:key_secret`
    Key(String),
    Token(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Key(key) => write!(f, "Key({}:***)", key.split(':').next().unwrap_or("")),
            Credential::Token(_) => write!(f, "Token(***)"),
        }
    }
}

impl Credential {
    pub fn authorization_header(&self) -> String {
        match self {
            Credential::Key(key) => format!("Basic {}", STANDARD.encode(key.as_bytes())),
            Credential::Token(token) => format!("Bearer {}", STANDARD.encode(token.as_bytes())),
        }
    }

    /// query parameter used to authenticate the realtime connection
    pub fn connect_param(&self) -> (&'static str, String) {
        match self {
            Credential::Key(key) => ("key", key.clone()),
            Credential::Token(token) => ("access_token", token.clone()),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CredentialState {
    Valid(Credential),
    NeedsRefresh,
}

/// Supplies credentials for both the realtime connection and REST requests. The connection
///  manager and the request engine call `refresh()` when the service rejects a credential, and
///  retry exactly once with the refreshed credential.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    fn current_credential(&self) -> CredentialState;

    async fn refresh(&self) -> Result<Credential, ErrorInfo>;
}

/// Basic authentication with an API key. A key cannot be refreshed, so a rejected key is a
///  permanent failure.
pub struct KeyAuthenticator {
    key: String,
}
impl KeyAuthenticator {
    pub fn new(key: impl Into<String>) -> KeyAuthenticator {
        KeyAuthenticator { key: key.into() }
    }
}

#[async_trait]
impl Authenticator for KeyAuthenticator {
    fn current_credential(&self) -> CredentialState {
        CredentialState::Valid(Credential::Key(self.key.clone()))
    }

    async fn refresh(&self) -> Result<Credential, ErrorInfo> {
        Err(ErrorInfo::new(codes::UNAUTHORIZED, 401, "API key was rejected and cannot be refreshed"))
    }
}
