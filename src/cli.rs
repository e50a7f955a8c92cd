use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::ResponseType;

#[derive(Debug, Clone, Parser)]
#[command(name = "fetchcache", about = "Origin-scoped HTTP response cache")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./fetchcache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print Prometheus metrics after the command completes.
    #[arg(long)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Store a response for a request URL.
    Put(PutArgs),
    /// Look up the stored response for a request.
    Match(MatchArgs),
    /// Remove the entry stored for a URL.
    Delete {
        #[arg(long)]
        url: String,
    },
    /// List the stored requests.
    Keys {
        #[arg(long)]
        json: bool,
    },
    /// Report entry count and memory-backed size.
    Size,
}

#[derive(Debug, Clone, Args)]
pub struct PutArgs {
    #[arg(long)]
    pub url: String,
    #[arg(long, default_value = "GET")]
    pub method: String,
    #[arg(long, default_value_t = 200)]
    pub status: u16,
    #[arg(long, default_value = "OK")]
    pub status_text: String,
    #[arg(long = "type", default_value = "default")]
    pub response_type: ResponseType,
    /// Response header as `Name: value`. Repeatable.
    #[arg(long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
    /// Request header as `Name: value`. Repeatable.
    #[arg(long = "request-header", value_parser = parse_header)]
    pub request_headers: Vec<(String, String)>,
    /// File whose contents become the response body.
    #[arg(long)]
    pub body: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct MatchArgs {
    #[arg(long)]
    pub url: String,
    #[arg(long = "request-header", value_parser = parse_header)]
    pub request_headers: Vec<(String, String)>,
    /// Write the body here instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let Some((name, value)) = raw.split_once(':') else {
        return Err(format!("expected `Name: value`, got {raw:?}"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
