use std::time::{Duration, Instant};

use duplex_frame::Headers;
use duplex_peer::{Channel, JsonCodec, Peer, PeerConfig, Rpc, RpcError};
use duplex_transport::tcp;
use serde_json::Value;
use tracing::debug;

use crate::cmd::{parse_duration, runtime, CallArgs, Endpoint};
use crate::exit::{
    rpc_error, transport_error, CliError, CliResult, DATA_INVALID, SUCCESS, TIMEOUT, USAGE,
};
use crate::output::{print_response, OutputFormat, Response};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let request = request_value(&args)?;
    let headers = parse_headers(&args.headers)?;

    runtime()?.block_on(async move {
        let peer = connect(&args.endpoint, timeout).await?;
        let result = if args.stream || !headers.is_empty() {
            exchange(&peer, &args.method, headers, &request, args.stream, timeout, format).await
        } else {
            unary(&peer, &args.method, &request, format).await
        };
        peer.close();
        result
    })
}

fn request_value(args: &CallArgs) -> CliResult<Value> {
    if let Some(json) = &args.json {
        return serde_json::from_str(json)
            .map_err(|err| CliError::new(DATA_INVALID, format!("invalid --json value: {err}")));
    }
    Ok(args
        .data
        .as_ref()
        .map(|text| Value::String(text.clone()))
        .unwrap_or(Value::Null))
}

fn parse_headers(raw: &[String]) -> CliResult<Headers> {
    raw.iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(CliError::new(
                USAGE,
                format!("invalid header '{entry}': expected KEY=VALUE"),
            )),
        })
        .collect()
}

async fn connect(endpoint: &Endpoint, timeout: Duration) -> CliResult<Peer> {
    let rpc = Rpc::with_config(
        JsonCodec,
        PeerConfig {
            call_timeout: Some(timeout),
            ..PeerConfig::default()
        },
    );
    let timed_out = || CliError::new(TIMEOUT, format!("connect to {endpoint} timed out"));

    let peer = match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let transport = tokio::time::timeout(timeout, duplex_transport::uds::connect(path))
                .await
                .map_err(|_| timed_out())?
                .map_err(|err| transport_error("connect failed", err))?;
            rpc.connect(transport)
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => {
            return Err(CliError::new(
                USAGE,
                "unix endpoints are not supported on this platform",
            ));
        }
        Endpoint::Tcp(addr) => {
            let transport = tokio::time::timeout(timeout, tcp::connect(addr.as_str()))
                .await
                .map_err(|_| timed_out())?
                .map_err(|err| transport_error("connect failed", err))?;
            rpc.connect(transport)
        }
    };
    debug!(%endpoint, "connected");
    Ok(peer)
}

async fn unary(
    peer: &Peer,
    method: &str,
    request: &Value,
    format: OutputFormat,
) -> CliResult<i32> {
    let started = Instant::now();
    let result: Value = peer
        .call(method, request)
        .await
        .map_err(|err| rpc_error("call failed", err))?;
    print_response(&Response::new(method, &result, started.elapsed()), format);
    Ok(SUCCESS)
}

/// Open a channel with headers and read replies until the far end ends its
/// stream. Without `stream` exactly one final reply is accepted.
async fn exchange(
    peer: &Peer,
    method: &str,
    headers: Headers,
    request: &Value,
    stream: bool,
    timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    let started = Instant::now();
    let channel = peer
        .open_with_headers(method, headers)
        .map_err(|err| rpc_error("open failed", err))?;
    channel
        .send(request, true)
        .map_err(|err| rpc_error("send failed", err))?;

    let mut seq = 0usize;
    loop {
        let (value, last) = receive(&channel, timeout).await?;
        if !stream && !last {
            channel.close(Some("unexpected continuation"));
            return Err(rpc_error("call failed", RpcError::UnexpectedContinuation));
        }
        // An empty final frame only marks the end of a stream.
        if stream && last && value.is_null() && seq > 0 {
            break;
        }

        let response = Response::new(method, &value, started.elapsed());
        if stream {
            print_response(&response.with_seq(seq), format);
        } else {
            print_response(&response, format);
        }
        seq += 1;
        if last {
            break;
        }
    }
    Ok(SUCCESS)
}

async fn receive(channel: &Channel, timeout: Duration) -> CliResult<(Value, bool)> {
    channel
        .recv_timeout(timeout)
        .await
        .map_err(|err| rpc_error("receive failed", err))
}
