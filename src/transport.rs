//! The streaming socket the connection manager drives. Implementations (WebSocket or similar)
//!  live outside this crate; they push inbound frames and the close notification into the
//!  [TransportSink] they are handed when the transport is opened.

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::manager::LoopEvent;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectRequest {
    pub host: String,
    pub params: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn url(&self) -> String {
        let query = self.params.iter()
            .map(|(k, v)| format!("{}={}", utf8_percent_encode(k, NON_ALPHANUMERIC), utf8_percent_encode(v, NON_ALPHANUMERIC)))
            .collect::<Vec<_>>()
            .join("&");
        format!("wss://{}/?{}", self.host, query)
    }
}

/// Callback side of an open transport. Every sink is tagged with the id of the transport it
///  belongs to, so that late events from a transport the manager already abandoned are
///  recognized and dropped.
#[derive(Debug, Clone)]
pub struct TransportSink {
    id: u64,
    sender: mpsc::UnboundedSender<LoopEvent>,
}

impl TransportSink {
    pub(crate) fn new(id: u64, sender: mpsc::UnboundedSender<LoopEvent>) -> TransportSink {
        TransportSink { id, sender }
    }

    pub fn on_message(&self, buf: Bytes) {
        trace!("transport #{}: received {} bytes", self.id, buf.len());
        let _ = self.sender.send(LoopEvent::Inbound { transport_id: self.id, buf });
    }

    pub fn on_close(&self, reason: impl Into<String>) {
        let _ = self.sender.send(LoopEvent::TransportClosed { transport_id: self.id, reason: reason.into() });
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes a transport to `request.host`. The returned connection is used for outbound
    ///  frames, everything inbound goes to `sink`.
    async fn open(&self, request: ConnectRequest, sink: TransportSink) -> anyhow::Result<Box<dyn TransportConnection>>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()>;

    /// Closes the transport. Implementations need not call `TransportSink::on_close` for a close
    ///  initiated through this method.
    async fn close(&self);
}
