use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the built-in methods (echo, ping, count).
    Serve(ServeArgs),
    /// Call a method and print the response.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Where to listen or connect: `unix:PATH` or `HOST:PORT`.
///
/// A bare value containing `/` is taken as a socket path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if let Some(path) = input.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("unix endpoint needs a socket path".to_string());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = input.strip_prefix("tcp:") {
            return parse_host_port(addr);
        }
        if input.contains('/') {
            return Ok(Self::Unix(PathBuf::from(input)));
        }
        parse_host_port(input)
    }
}

fn parse_host_port(input: &str) -> Result<Endpoint, String> {
    let Some((host, port)) = input.rsplit_once(':') else {
        return Err(format!(
            "invalid endpoint '{input}': expected unix:PATH or HOST:PORT"
        ));
    };
    if host.is_empty() {
        return Err(format!("invalid endpoint '{input}': missing host"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("invalid endpoint '{input}': bad port '{port}'"))?;
    Ok(Endpoint::Tcp(input.to_string()))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => f.write_str(addr),
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to listen on (unix:PATH or HOST:PORT).
    #[arg(env = "DUPLEX_ENDPOINT")]
    pub endpoint: Endpoint,
    /// Largest `n` accepted by the `count` method.
    #[arg(long, default_value = "10000")]
    pub max_count: u64,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Endpoint to connect to (unix:PATH or HOST:PORT).
    #[arg(env = "DUPLEX_ENDPOINT")]
    pub endpoint: Endpoint,
    /// Method name.
    pub method: String,
    /// JSON request value.
    #[arg(long, conflicts_with = "data")]
    pub json: Option<String>,
    /// String request value.
    #[arg(long, conflicts_with = "json")]
    pub data: Option<String>,
    /// Header for the Open frame (KEY=VALUE, repeatable).
    #[arg(long = "header", short = 'H', value_name = "KEY=VALUE")]
    pub headers: Vec<String>,
    /// Read a streamed reply until the far end ends it.
    #[arg(long)]
    pub stream: bool,
    /// Connect and call timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Runtime for the async commands.
pub fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
