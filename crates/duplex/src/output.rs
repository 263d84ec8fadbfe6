use std::io::{IsTerminal, Write};
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One response value produced by `duplex call`.
#[derive(Serialize, Debug)]
pub struct Response<'a> {
    pub method: &'a str,
    /// Position within a streamed reply; absent for unary calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<usize>,
    pub result: &'a Value,
    pub elapsed_ms: u128,
}

impl<'a> Response<'a> {
    pub fn new(method: &'a str, result: &'a Value, elapsed: Duration) -> Self {
        Self {
            method,
            seq: None,
            result,
            elapsed_ms: elapsed.as_millis(),
        }
    }

    pub fn with_seq(mut self, seq: usize) -> Self {
        self.seq = Some(seq);
        self
    }
}

pub fn print_response(response: &Response<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(response).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "SEQ", "ELAPSED", "RESULT"])
                .add_row(vec![
                    response.method.to_string(),
                    response
                        .seq
                        .map(|seq| seq.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    format!("{}ms", response.elapsed_ms),
                    compact(response.result),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let body = serde_json::to_string_pretty(response.result)
                .unwrap_or_else(|_| compact(response.result));
            match response.seq {
                Some(seq) => println!("{}[{seq}] => {body}", response.method),
                None => println!("{} => {body}", response.method),
            }
        }
        OutputFormat::Raw => {
            let mut line = raw_text(response.result);
            line.push('\n');
            print_raw(line.as_bytes());
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Strings print bare; every other value prints as compact JSON.
fn raw_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => compact(other),
    }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
