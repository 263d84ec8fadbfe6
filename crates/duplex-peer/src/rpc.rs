use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use duplex_transport::Transport;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::codec::{Codec, JsonCodec};
use crate::error::Result;
use crate::peer::{Peer, PeerConfig, Role};

/// A registered method implementation.
///
/// The channel is the handler's only handle to the call: it reads the
/// request with [`Channel::recv`] and replies with [`Channel::send`].
pub type Handler<C> = Arc<dyn Fn(Channel<C>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Method table snapshot shared by a peer's read loop.
pub(crate) type Handlers<C> = Arc<HashMap<String, Handler<C>>>;

/// Method registry and peer factory.
///
/// Register every method first, then `accept` or `connect`. Each peer
/// takes a snapshot of the table, so later registrations only affect
/// peers created afterwards.
///
/// ```no_run
/// use duplex_peer::{Channel, Rpc};
///
/// # async fn demo(transport: duplex_transport::memory::MemoryTransport) {
/// let mut rpc = Rpc::json();
/// rpc.register("echo", |ch: Channel| async move {
///     let (value, _last): (serde_json::Value, bool) = ch.recv().await?;
///     ch.send(&value, true)
/// });
/// let peer = rpc.accept(transport);
/// peer.close_notify().await;
/// # }
/// ```
pub struct Rpc<C: Codec = JsonCodec> {
    codec: C,
    config: PeerConfig,
    handlers: HashMap<String, Handler<C>>,
}

impl Rpc<JsonCodec> {
    /// A registry speaking JSON payloads.
    pub fn json() -> Self {
        Self::new(JsonCodec)
    }
}

impl Default for Rpc<JsonCodec> {
    fn default() -> Self {
        Self::json()
    }
}

impl<C: Codec> Rpc<C> {
    pub fn new(codec: C) -> Self {
        Self::with_config(codec, PeerConfig::default())
    }

    pub fn with_config(codec: C, config: PeerConfig) -> Self {
        Self {
            codec,
            config,
            handlers: HashMap::new(),
        }
    }

    /// Associate `method` with `handler`, replacing any previous handler.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Channel<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let method = method.into();
        let handler: Handler<C> = Arc::new(move |channel| handler(channel).boxed());
        if self.handlers.insert(method.clone(), handler).is_some() {
            debug!(%method, "handler replaced");
        }
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Serve the accepting side of `transport`.
    pub fn accept<T: Transport>(&self, transport: T) -> Peer<C> {
        self.start(transport, Role::Acceptor)
    }

    /// Serve the connecting side of `transport`.
    pub fn connect<T: Transport>(&self, transport: T) -> Peer<C> {
        self.start(transport, Role::Connector)
    }

    fn start<T: Transport>(&self, transport: T, role: Role) -> Peer<C> {
        Peer::start(
            transport,
            role,
            self.codec.clone(),
            self.config.clone(),
            Arc::new(self.handlers.clone()),
        )
    }
}

/// Run `handler` for an inbound channel on its own task.
///
/// `Ok` ends the channel with an empty Last frame if the handler did not;
/// `Err` and panics are reported to the far end as an Error frame.
pub(crate) fn spawn_handler<C: Codec>(handler: Handler<C>, channel: Channel<C>) {
    tokio::spawn(async move {
        let invoke = {
            let channel = channel.clone();
            async move { handler(channel).await }
        };
        match AssertUnwindSafe(invoke).catch_unwind().await {
            Ok(Ok(())) => channel.close(None),
            Ok(Err(err)) => {
                debug!(channel = channel.id(), method = channel.method(), error = %err, "handler failed");
                channel.close(Some(&err.to_string()));
            }
            Err(_) => {
                warn!(channel = channel.id(), method = channel.method(), "handler panicked");
                channel.close(Some("handler panicked"));
            }
        }
    });
}
