use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::auth::{Authenticator, KeyAuthenticator};
use crate::channel::Channels;
use crate::config::ClientOptions;
use crate::connection::manager;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::http::paginated::PaginatedResult;
use crate::http::HttpClient;
use crate::rest::Rest;
use crate::transport::Transport;

/// The realtime client: one connection to the service, the channels multiplexed over it, and
///  the REST API.
///
/// Creating a client spawns its connection manager, so this must happen inside a Tokio runtime.
///  The manager terminates when the client and all handles obtained from it are dropped.
#[derive(Clone)]
pub struct Realtime {
    connection: Connection,
    channels: Channels,
    rest: Rest,
}

impl Realtime {
    /// A client authenticating with `options.key`
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>, http: Arc<dyn HttpClient>) -> Result<Realtime> {
        let key = options.key.clone()
            .ok_or_else(|| Error::Config("an API key is required unless an authenticator is passed".to_string()))?;
        Self::with_authenticator(options, transport, http, Arc::new(KeyAuthenticator::new(key)))
    }

    pub fn with_authenticator(options: ClientOptions, transport: Arc<dyn Transport>, http: Arc<dyn HttpClient>, authenticator: Arc<dyn Authenticator>) -> Result<Realtime> {
        options.validate()
            .map_err(|e| Error::Config(format!("{:#}", e)))?;

        let rest = Rest::new(&options, http, authenticator.clone());
        let auto_connect = options.auto_connect;
        info!("starting realtime client for {} (codec {:?})", options.realtime_host, options.codec);

        let (commands, connection) = manager::start(Arc::new(options), transport, authenticator);
        let channels = Channels::new(commands, rest.clone());
        if auto_connect {
            connection.connect();
        }

        Ok(Realtime {
            connection,
            channels,
            rest,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn rest(&self) -> &Rest {
        &self.rest
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub async fn time(&self) -> Result<i64> {
        self.rest.time().await
    }

    pub async fn stats(&self, params: &[(&str, &str)]) -> Result<PaginatedResult<Value>> {
        self.rest.stats(params).await
    }
}
