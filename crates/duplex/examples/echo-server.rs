//! Minimal echo server on a Unix socket.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- call unix:/tmp/duplex-echo-example.sock \
//!     echo --json '{"hello":"world"}'

use duplex::peer::{Channel, Rpc};
use duplex::transport::uds::UnixMessageListener;
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_path = std::env::temp_dir().join("duplex-echo-example.sock");

    let mut rpc = Rpc::json();
    rpc.register("echo", |ch: Channel| async move {
        let (value, _last): (Value, bool) = ch.recv().await?;
        eprintln!("channel {} echoing {value}", ch.id());
        ch.send(&value, true)
    });

    let listener = UnixMessageListener::bind(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let peer = rpc.accept(accepted?);
                tokio::spawn(async move {
                    peer.close_notify().await;
                    eprintln!("Peer disconnected: {:?}", peer.close_reason());
                });
            }
        }
    }

    Ok(())
}
