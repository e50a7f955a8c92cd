use std::fmt;
use std::time::Duration;

use anyhow::{Result, anyhow};
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt as subscriber_fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => subscriber_fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => subscriber_fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Put,
    Match,
    Delete,
    Keys,
}

impl CacheOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOp::Put => "put",
            CacheOp::Match => "match",
            CacheOp::Delete => "delete",
            CacheOp::Keys => "keys",
        }
    }
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CacheOpEvent {
    pub operation: CacheOp,
    pub origin: String,
    pub url: Option<String>,
    pub result: String,
    pub body_bytes: u64,
    pub entries: Option<usize>,
    pub deferred: bool,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct CacheOpBuilder {
    event: CacheOpEvent,
}

impl CacheOpBuilder {
    pub fn new(operation: CacheOp, origin: impl Into<String>) -> Self {
        Self {
            event: CacheOpEvent {
                operation,
                origin: origin.into(),
                url: None,
                result: String::from("unknown"),
                body_bytes: 0,
                entries: None,
                deferred: false,
                elapsed: Duration::ZERO,
            },
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.event.url = Some(url.into());
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.event.result = result.into();
        self
    }

    pub fn body_bytes(mut self, bytes: u64) -> Self {
        self.event.body_bytes = bytes;
        self
    }

    pub fn entries(mut self, count: usize) -> Self {
        self.event.entries = Some(count);
        self
    }

    pub fn deferred(mut self, deferred: bool) -> Self {
        self.event.deferred = deferred;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed = elapsed;
        self
    }

    pub fn build(self) -> CacheOpEvent {
        self.event
    }

    pub fn log(self) {
        log_cache_op(self.build());
    }
}

pub fn log_cache_op(event: CacheOpEvent) {
    let CacheOpEvent {
        operation,
        origin,
        url,
        result,
        body_bytes,
        entries,
        deferred,
        elapsed,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let elapsed_us = elapsed.as_micros();
    tracing::info!(
        target = "cache_op",
        ts,
        operation = operation.as_str(),
        origin,
        url = url.as_deref(),
        result,
        body_bytes,
        entries,
        deferred,
        elapsed_us
    );

    crate::metrics::record_operation(operation.as_str(), &result, elapsed);
}
