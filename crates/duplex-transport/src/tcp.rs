use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::codec::MessageConfig;
use crate::error::{Result, TransportError};
use crate::traits::{framed_with_config, MessageStream};

/// One end of a TCP connection.
pub type TcpTransport = MessageStream<TcpStream>;

/// TCP listener producing message transports.
pub struct TcpMessageListener {
    listener: TcpListener,
    config: MessageConfig,
}

impl TcpMessageListener {
    /// Bind to a socket address (e.g. `127.0.0.1:8001`).
    pub async fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let label = format!("{addr:?}");
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                endpoint: label,
                source,
            })?;
        info!(addr = ?listener.local_addr().ok(), "listening on tcp");
        Ok(Self {
            listener,
            config: MessageConfig::default(),
        })
    }

    /// Override the message configuration applied to accepted transports.
    pub fn with_config(mut self, config: MessageConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> Result<(TcpTransport, SocketAddr)> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%remote, "accepted tcp connection");
        Ok((framed_with_config(stream, self.config.clone()), remote))
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Connect to a TCP listener.
pub async fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<TcpTransport> {
    connect_with_config(addr, MessageConfig::default()).await
}

/// Connect with explicit message configuration.
pub async fn connect_with_config(
    addr: impl ToSocketAddrs + std::fmt::Debug,
    config: MessageConfig,
) -> Result<TcpTransport> {
    let label = format!("{addr:?}");
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect {
            endpoint: label.clone(),
            source,
        })?;
    stream.set_nodelay(true)?;
    debug!(addr = %label, "connected over tcp");
    Ok(framed_with_config(stream, config))
}
