//! Many calls and a stream sharing one in-process connection, with the
//! server calling back into the client.
//!
//! Run with:
//!   cargo run --example multiplex

use std::time::Duration;

use duplex::peer::{Channel, Rpc, RpcError};
use duplex::transport::memory;

#[tokio::main]
async fn main() -> Result<(), RpcError> {
    let mut server = Rpc::json();
    server
        .register("square", |ch: Channel| async move {
            let (n, _): (u64, bool) = ch.recv().await?;
            tokio::time::sleep(Duration::from_millis(10 * (5 - n.min(5)))).await;
            ch.send(&(n * n), true)
        })
        .register("ticks", |ch: Channel| async move {
            let (n, _): (u32, bool) = ch.recv().await?;
            for tick in 0..n {
                ch.send(&format!("tick {tick}"), tick + 1 == n)?;
            }
            Ok(())
        })
        .register("greet", |ch: Channel| async move {
            let (name, _): (String, bool) = ch.recv().await?;
            // Ask the caller for its locale over a fresh channel.
            let locale: String = ch.call("locale", &()).await?;
            ch.send(&format!("[{locale}] hello, {name}"), true)
        });

    let mut client = Rpc::json();
    client.register("locale", |ch: Channel| async move {
        let _: ((), bool) = ch.recv().await?;
        ch.send("en-GB", true)
    });

    let (a, b) = memory::pair();
    let _server = server.accept(a);
    let peer = client.connect(b);

    // Replies arrive out of order; each lands on its own channel.
    let calls = (1..=5u64).map(|n| {
        let peer = peer.clone();
        tokio::spawn(async move { peer.call::<_, u64>("square", &n).await })
    });
    for handle in calls.collect::<Vec<_>>() {
        let squared = handle
            .await
            .map_err(|err| RpcError::handler(format!("task failed: {err}")))??;
        println!("square -> {squared}");
    }

    let ticks = peer.open("ticks")?;
    ticks.send(&3u32, true)?;
    loop {
        let (tick, last): (String, bool) = ticks.recv().await?;
        println!("stream -> {tick}");
        if last {
            break;
        }
    }

    let greeting: String = peer.call("greet", "ada").await?;
    println!("{greeting}");

    peer.close();
    Ok(())
}
