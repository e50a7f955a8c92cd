pub mod backend;
pub mod blob;
pub mod cache;
pub mod cli;
pub mod init_gate;
pub mod logging;
pub mod metrics;
pub mod quota;
pub mod settings;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use http::{Method, Uri};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::{
    blob::MemoryBlobStorage,
    cache::{CacheError, CacheRequest, CacheResponse, Collaborators, HeaderList, OriginCache},
    cli::{Cli, Command, MatchArgs, PutArgs},
    quota::UsageLedger,
    settings::Settings,
};

pub async fn run(cli: Cli, settings: Settings) -> Result<()> {
    let blobs = Arc::new(MemoryBlobStorage::new());
    let ledger = Arc::new(UsageLedger::new());
    let cache = OriginCache::with_factory(
        settings.origin.clone(),
        Arc::new(settings.backend_config()),
        Collaborators::new().with_quota(&ledger).with_blobs(&blobs),
    );

    let outcome = match cli.command {
        Command::Put(args) => put(&cache, &settings, &blobs, &ledger, args).await,
        Command::Match(args) => match_request(&cache, &settings, args).await,
        Command::Delete { url } => {
            let url = parse_url(&settings, &url)?;
            cache
                .delete(&CacheRequest::get(url.clone()))
                .await
                .map_err(|err| anyhow!("delete {url}: {err}"))?;
            println!("deleted {url}");
            Ok(())
        }
        Command::Keys { json } => keys(&cache, json).await,
        Command::Size => {
            let entries = cache.keys().await.context("failed to enumerate entries")?;
            let bytes = cache.memory_backed_size().await;
            println!("{} entries, {bytes} bytes held in memory", entries.len());
            Ok(())
        }
    };
    cache.close();

    if cli.metrics {
        print!("{}", metrics::encode()?);
    }
    outcome
}

fn parse_url(settings: &Settings, raw: &str) -> Result<Uri> {
    let url: Uri = raw
        .parse()
        .with_context(|| format!("invalid url {raw:?}"))?;
    settings.check_url(&url)?;
    Ok(url)
}

fn request_from(method: Method, url: Uri, headers: Vec<(String, String)>) -> CacheRequest {
    let mut request = CacheRequest::new(method, url);
    request.headers = headers.into_iter().collect();
    request
}

async fn put(
    cache: &OriginCache,
    settings: &Settings,
    blobs: &MemoryBlobStorage,
    ledger: &UsageLedger,
    args: PutArgs,
) -> Result<()> {
    let url = parse_url(settings, &args.url)?;
    let method = Method::from_bytes(args.method.as_bytes())
        .with_context(|| format!("invalid method {:?}", args.method))?;
    let request = request_from(method, url.clone(), args.request_headers);

    let mut response = CacheResponse::new(args.status, args.status_text).with_type(args.response_type);
    response.headers = args.headers.into_iter().collect();
    if let Some(path) = &args.body {
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read body from {}", path.display()))?;
        response = response.with_blob(&blobs.put_bytes(body));
    }

    let stored = cache
        .put(request, response)
        .await
        .map_err(|err| anyhow!("put {url}: {err}"))?;
    println!(
        "stored {url} ({} body bytes, origin usage {} bytes)",
        stored.response.body_size(),
        ledger.usage(cache.origin())
    );
    Ok(())
}

async fn match_request(cache: &OriginCache, settings: &Settings, args: MatchArgs) -> Result<()> {
    let url = parse_url(settings, &args.url)?;
    let request = request_from(Method::GET, url.clone(), args.request_headers);

    let cached = match cache.match_request(request).await {
        Ok(cached) => cached,
        Err(CacheError::NotFound) => {
            println!("miss {url}");
            return Ok(());
        }
        Err(err) => return Err(anyhow!("match {url}: {err}")),
    };

    let response = &cached.response;
    println!(
        "{} {} ({})",
        response.status, response.status_text, response.response_type
    );
    for (name, value) in response.headers.iter() {
        println!("{name}: {value}");
    }

    let Some(blob) = &cached.blob else {
        return Ok(());
    };
    let body = blob.read_to_vec().await.context("failed to read body blob")?;
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &body)
                .await
                .with_context(|| format!("failed to write body to {}", path.display()))?;
        }
        None => {
            println!();
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&body).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct KeyView<'a> {
    method: &'a str,
    url: String,
    headers: &'a HeaderList,
}

async fn keys(cache: &OriginCache, json: bool) -> Result<()> {
    let requests = cache.keys().await.context("failed to enumerate entries")?;
    if json {
        let views: Vec<KeyView<'_>> = requests
            .iter()
            .map(|request| KeyView {
                method: request.method.as_str(),
                url: request.url.to_string(),
                headers: &request.headers,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else {
        for request in &requests {
            println!("{} {}", request.method, request.url);
        }
    }
    Ok(())
}
