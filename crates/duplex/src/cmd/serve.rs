use duplex_peer::{Channel, Peer, Rpc, RpcError};
use duplex_transport::tcp::TcpMessageListener;
use duplex_transport::Transport;
use serde_json::Value;
use tracing::{info, warn};

use crate::cmd::{runtime, Endpoint, ServeArgs};
use crate::exit::{transport_error, CliResult, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let rpc = builtin_rpc(args.max_count);
    runtime()?.block_on(serve(&rpc, &args.endpoint))
}

/// Registry with the methods `duplex serve` answers.
///
/// - `echo` replies with each request value it receives, ending when the
///   caller ends its stream.
/// - `ping` replies `"pong"`.
/// - `count` streams `0..n` and then ends the channel.
pub fn builtin_rpc(max_count: u64) -> Rpc {
    let mut rpc = Rpc::json();
    rpc.register("echo", |ch: Channel| async move {
        loop {
            let (value, last): (Value, bool) = ch.recv().await?;
            ch.send(&value, last)?;
            if last {
                return Ok(());
            }
        }
    })
    .register("ping", |ch: Channel| async move {
        let _: (Value, bool) = ch.recv().await?;
        ch.send("pong", true)
    })
    .register("count", move |ch: Channel| async move {
        let (n, _): (u64, bool) = ch.recv().await?;
        if n > max_count {
            return Err(RpcError::handler(format!(
                "count {n} exceeds limit {max_count}"
            )));
        }
        for i in 0..n {
            ch.send(&i, false)?;
        }
        Ok(())
    });
    rpc
}

async fn serve(rpc: &Rpc, endpoint: &Endpoint) -> CliResult<i32> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut peers: Vec<Peer> = Vec::new();

    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let listener = duplex_transport::uds::UnixMessageListener::bind(path)
                .map_err(|err| transport_error("bind failed", err))?;
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    accepted = listener.accept() => match accepted {
                        Ok(transport) => {
                            peers.retain(|peer| !peer.is_closed());
                            peers.push(spawn_peer(rpc, transport, path.display().to_string()));
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                }
            }
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => {
            return Err(crate::exit::CliError::new(
                crate::exit::USAGE,
                "unix endpoints are not supported on this platform",
            ));
        }
        Endpoint::Tcp(addr) => {
            let listener = TcpMessageListener::bind(addr.as_str())
                .await
                .map_err(|err| transport_error("bind failed", err))?;
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    accepted = listener.accept() => match accepted {
                        Ok((transport, remote)) => {
                            peers.retain(|peer| !peer.is_closed());
                            peers.push(spawn_peer(rpc, transport, remote.to_string()));
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                }
            }
        }
    }

    info!(peers = peers.len(), "shutting down");
    for peer in &peers {
        peer.close();
    }
    Ok(SUCCESS)
}

fn spawn_peer<T: Transport>(rpc: &Rpc, transport: T, remote: String) -> Peer {
    let peer = rpc.accept(transport);
    info!(%remote, "peer connected");
    let watched = peer.clone();
    tokio::spawn(async move {
        watched.close_notify().await;
        match watched.close_reason() {
            Some(RpcError::TransportClosed) | None => info!(%remote, "peer disconnected"),
            Some(reason) => warn!(%remote, %reason, "peer closed"),
        }
    });
    peer
}
