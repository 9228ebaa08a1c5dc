//! nanomsg scalability-protocol sockets over `nng`.
//!
//! `nng` calls block, so every receive and send runs on the blocking pool
//! against a clone of the socket handle.

use super::{Connector, RawSocket, SocketKind};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use nng::options::protocol::pubsub::Subscribe;
use nng::options::{Options, RecvTimeout};
use nng::{Protocol, Socket};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn protocol(kind: SocketKind) -> Protocol {
    match kind {
        SocketKind::Subscribe => Protocol::Sub0,
        SocketKind::Reply => Protocol::Rep0,
        SocketKind::Request => Protocol::Req0,
    }
}

/// `tcp://` is implied when the endpoint carries no scheme.
fn endpoint_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("tcp://{}", endpoint)
    }
}

pub struct NngSocket {
    socket: Socket,
}

impl NngSocket {
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Socket) -> Result<T> + Send + 'static,
    {
        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || op(socket))
            .await
            .map_err(CourierError::receive)?
    }
}

#[async_trait]
impl RawSocket for NngSocket {
    async fn dial(&self, endpoint: &str) -> Result<()> {
        let url = endpoint_url(endpoint);
        debug!(url = %url, "Dialing");
        self.blocking(move |socket| socket.dial(&url).map_err(CourierError::connect))
            .await
    }

    async fn listen(&self, endpoint: &str) -> Result<()> {
        let url = endpoint_url(endpoint);
        debug!(url = %url, "Listening");
        self.blocking(move |socket| socket.listen(&url).map_err(CourierError::connect))
            .await
    }

    async fn subscribe(&self, topic: &[u8]) -> Result<()> {
        self.socket
            .set_opt::<Subscribe>(topic.to_vec())
            .map_err(CourierError::setup)
    }

    async fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        self.socket
            .set_opt::<RecvTimeout>(Some(timeout))
            .map_err(CourierError::setup)
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.blocking(|socket| {
            socket
                .recv()
                .map(|message| message.as_slice().to_vec())
                .map_err(CourierError::receive)
        })
        .await
    }

    async fn send(&self, body: &[u8]) -> Result<()> {
        let body = body.to_vec();
        self.blocking(move |socket| {
            socket
                .send(body.as_slice())
                .map_err(|(_, e)| CourierError::publish(e))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.socket.close();
        Ok(())
    }
}

/// Opens a fresh socket of the requested pattern.
pub struct NngConnector;

#[async_trait]
impl Connector<SocketKind, dyn RawSocket> for NngConnector {
    async fn connect(&self, kind: &SocketKind) -> Result<Arc<dyn RawSocket>> {
        let socket = Socket::new(protocol(*kind)).map_err(CourierError::connect)?;
        Ok(Arc::new(NngSocket { socket }))
    }
}
