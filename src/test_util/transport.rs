//! In-memory [Transport]: every transport the client opens shows up as a [FakeServerConnection]
//!  through which a test plays the part of the service.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::config::CodecKind;
use crate::error::ErrorInfo;
use crate::protocol::codec::{codec_for, Codec};
use crate::protocol::{ConnectionDetails, ProtocolMessage};
use crate::transport::{ConnectRequest, Transport, TransportConnection, TransportSink};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpenBehavior {
    Accept,
    Refuse,
    /// never completes, for testing handshake timeouts
    Hang,
}

pub struct FakeTransport {
    codec: Arc<dyn Codec>,
    scripted: Mutex<FxHashMap<String, VecDeque<OpenBehavior>>>,
    default_behavior: Mutex<OpenBehavior>,
    requests: Mutex<Vec<ConnectRequest>>,
    connections: mpsc::UnboundedSender<FakeServerConnection>,
}

impl FakeTransport {
    pub fn new(codec: CodecKind) -> (Arc<FakeTransport>, FakeService) {
        let (connections, recv) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport {
            codec: codec_for(codec),
            scripted: Default::default(),
            default_behavior: Mutex::new(OpenBehavior::Accept),
            requests: Default::default(),
            connections,
        });
        (transport, FakeService { connections: recv })
    }

    /// behaviors for the next attempts to open a transport to `host`, after which the default
    ///  behavior applies
    pub fn script(&self, host: &str, behaviors: impl IntoIterator<Item = OpenBehavior>) {
        self.scripted.lock().unwrap_or_else(|e| e.into_inner())
            .entry(host.to_string())
            .or_default()
            .extend(behaviors);
    }

    pub fn set_default(&self, behavior: OpenBehavior) {
        *self.default_behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// all connect requests so far, in order
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_behavior(&self, host: &str) -> OpenBehavior {
        let scripted = self.scripted.lock().unwrap_or_else(|e| e.into_inner())
            .get_mut(host)
            .and_then(|behaviors| behaviors.pop_front());
        scripted.unwrap_or_else(|| *self.default_behavior.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, request: ConnectRequest, sink: TransportSink) -> anyhow::Result<Box<dyn TransportConnection>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        match self.next_behavior(&request.host) {
            OpenBehavior::Refuse => Err(anyhow!("connection to {} refused", request.host)),
            OpenBehavior::Hang => std::future::pending().await,
            OpenBehavior::Accept => {
                let (frames_send, frames) = mpsc::unbounded_channel();
                let _ = self.connections.send(FakeServerConnection {
                    request,
                    sink,
                    frames,
                    codec: self.codec.clone(),
                });
                Ok(Box::new(FakeClientConnection { frames: frames_send }))
            }
        }
    }
}

enum ClientFrame {
    Data(Bytes),
    Closed,
}

struct FakeClientConnection {
    frames: mpsc::UnboundedSender<ClientFrame>,
}

#[async_trait]
impl TransportConnection for FakeClientConnection {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()> {
        self.frames.send(ClientFrame::Data(buf))
            .map_err(|_| anyhow!("transport closed"))
    }

    async fn close(&self) {
        let _ = self.frames.send(ClientFrame::Closed);
    }
}

/// Receives the transports the client opened
pub struct FakeService {
    connections: mpsc::UnboundedReceiver<FakeServerConnection>,
}

impl FakeService {
    pub async fn next_connection(&mut self) -> FakeServerConnection {
        self.connections.recv().await
            .expect("the transport is owned by the client")
    }

    /// the next transport, answered with CONNECTED for a fresh connection
    pub async fn accept(&mut self, connection_id: &str) -> FakeServerConnection {
        let connection = self.next_connection().await;
        connection.send_connected(connection_id, -1);
        connection
    }
}

/// The service's end of a transport
pub struct FakeServerConnection {
    pub request: ConnectRequest,
    sink: TransportSink,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
    codec: Arc<dyn Codec>,
}

impl FakeServerConnection {
    pub fn send(&self, msg: ProtocolMessage) {
        let buf = self.codec.encode(&msg)
            .expect("test frames are encodable");
        self.sink.on_message(buf);
    }

    pub fn send_raw(&self, buf: Bytes) {
        self.sink.on_message(buf);
    }

    /// CONNECTED with key `<connection_id>-key` and default details
    pub fn send_connected(&self, connection_id: &str, connection_serial: i64) {
        self.send_connected_with(connection_id, connection_serial, ConnectionDetails::default(), None);
    }

    pub fn send_connected_with(&self, connection_id: &str, connection_serial: i64, details: ConnectionDetails, error: Option<ErrorInfo>) {
        self.send(ProtocolMessage::Connected {
            connection_id: connection_id.to_string(),
            connection_key: format!("{}-key", connection_id),
            connection_serial,
            details,
            error,
        });
    }

    /// simulates the network dropping the transport
    pub fn drop_connection(&self, reason: &str) {
        self.sink.on_close(reason);
    }

    /// the next frame from the client, `None` once the client closed the transport
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        match self.frames.recv().await {
            Some(ClientFrame::Data(buf)) => Some(self.decode(&buf)),
            Some(ClientFrame::Closed) | None => None,
        }
    }

    pub async fn expect_frame(&mut self) -> ProtocolMessage {
        self.recv().await
            .expect("transport was closed by the client")
    }

    /// a frame the client already sent, if any
    pub fn try_recv(&mut self) -> Option<ProtocolMessage> {
        match self.frames.try_recv() {
            Ok(ClientFrame::Data(buf)) => Some(self.decode(&buf)),
            _ => None,
        }
    }

    /// waits until the client closes the transport, skipping frames
    pub async fn expect_closed(&mut self) {
        while self.recv().await.is_some() {}
    }

    fn decode(&self, buf: &[u8]) -> ProtocolMessage {
        self.codec.decode(buf)
            .expect("client frames are decodable")
    }
}
