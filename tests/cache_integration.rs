mod support;

use std::sync::Arc;

use anyhow::Result;
use fetchcache::backend::{Backend, DiskBackend, MemoryBackend, StreamIndex};
use fetchcache::cache::{CacheError, CacheRequest, CacheResponse, ResponseBody, ResponseType};
use http::Method;
use tempfile::TempDir;

use support::*;

async fn round_trip(fixture: &Fixture) -> Result<()> {
    let body = b"<html>cached</html>";
    let response = fixture
        .response(203, body)
        .with_type(ResponseType::Cors)
        .with_header("Content-Type", "text/html")
        .with_header("X-Trace", "1")
        .with_header("x-trace", "2");
    let stored = fixture.cache.put(get("/page"), response).await?;
    assert_eq!(stored.response.body_size(), body.len() as u64);
    assert_eq!(body_of(&stored).await, body);

    let matched = fixture.cache.match_request(get("/page")).await?;
    let response = &matched.response;
    assert_eq!(response.status, 203);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.response_type, ResponseType::Cors);
    assert_eq!(response.url, Some(url("/page")));
    let headers: Vec<_> = response.headers.iter().collect();
    assert_eq!(
        headers,
        vec![
            ("Content-Type", "text/html"),
            ("X-Trace", "1"),
            ("x-trace", "2")
        ]
    );
    assert_eq!(body_of(&matched).await, body);
    let Some(blob) = &matched.blob else {
        panic!("matched response should carry a blob");
    };
    assert_eq!(
        response.body,
        ResponseBody::Blob {
            id: blob.id(),
            size: body.len() as u64
        }
    );
    Ok(())
}

#[tokio::test]
async fn put_then_match_round_trips_in_memory() -> Result<()> {
    round_trip(&Fixture::memory()).await
}

#[tokio::test]
async fn put_then_match_round_trips_on_disk() -> Result<()> {
    let dir = TempDir::new()?;
    round_trip(&Fixture::persistent(dir.path())).await
}

#[tokio::test]
async fn empty_body_yields_no_blob() -> Result<()> {
    let fixture = Fixture::memory();
    let stored = fixture
        .cache
        .put(get("/empty"), CacheResponse::new(204, "No Content"))
        .await?;
    assert!(stored.blob.is_none());

    let matched = fixture.cache.match_request(get("/empty")).await?;
    assert!(matched.blob.is_none());
    assert_eq!(matched.response.body, ResponseBody::Empty);
    assert_eq!(matched.response.status, 204);
    Ok(())
}

#[tokio::test]
async fn zero_status_opaque_response_is_stored() -> Result<()> {
    let fixture = Fixture::memory();
    let response = CacheResponse::new(0, "").with_type(ResponseType::Opaque);
    fixture.cache.put(get("/opaque"), response).await?;

    let matched = fixture.cache.match_request(get("/opaque")).await?;
    assert_eq!(matched.response.status, 0);
    assert_eq!(matched.response.response_type, ResponseType::Opaque);
    Ok(())
}

#[tokio::test]
async fn later_put_replaces_earlier_one() -> Result<()> {
    let fixture = Fixture::memory();
    fixture.store("/a", b"first").await;
    fixture.store("/a", b"second version").await;

    let matched = fixture.cache.match_request(get("/a")).await?;
    assert_eq!(body_of(&matched).await, b"second version");
    assert_eq!(fixture.cache.keys().await?.len(), 1);
    Ok(())
}

async fn replace_then_delete(fixture: &Fixture) -> Result<()> {
    fixture.store("/a", b"first body").await;
    fixture.store("/a", b"second").await;
    let events = fixture.quota.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].1, -events[0].1);
    assert_eq!(fixture.quota.total(), events[2].1);

    fixture.cache.delete(&get("/a")).await?;
    assert_eq!(fixture.quota.total(), 0);
    Ok(())
}

#[tokio::test]
async fn replacing_an_entry_keeps_quota_balanced_in_memory() -> Result<()> {
    let fixture = Fixture::memory();
    replace_then_delete(&fixture).await?;
    assert_eq!(fixture.cache.memory_backed_size().await, 0);
    Ok(())
}

#[tokio::test]
async fn replacing_an_entry_keeps_quota_balanced_on_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = Fixture::persistent(dir.path());
    replace_then_delete(&fixture).await
}

#[tokio::test]
async fn failed_replacement_still_releases_old_entry() -> Result<()> {
    let fixture = Fixture::memory();
    fixture.store("/r", b"old body").await;
    let source = fixture.blobs.put_custom(Arc::new(FailingBlob {
        size: 4096,
        good_bytes: 10,
    }));
    let response = CacheResponse::new(200, "OK").with_blob(&source);

    assert_eq!(
        fixture.cache.put(get("/r"), response).await.unwrap_err(),
        CacheError::Storage
    );
    assert_eq!(
        fixture.cache.match_request(get("/r")).await.unwrap_err(),
        CacheError::NotFound
    );
    assert_eq!(fixture.quota.events().len(), 2);
    assert_eq!(fixture.quota.total(), 0);
    assert_eq!(fixture.cache.memory_backed_size().await, 0);
    Ok(())
}

#[tokio::test]
async fn match_misses_unknown_url() {
    let fixture = Fixture::memory();
    fixture.store("/known", b"x").await;
    assert_eq!(
        fixture.cache.match_request(get("/unknown")).await.unwrap_err(),
        CacheError::NotFound
    );
}

#[tokio::test]
async fn delete_removes_entry_and_releases_quota() -> Result<()> {
    let fixture = Fixture::memory();
    fixture.store("/a", b"abcdef").await;
    let after_put = fixture.quota.total();
    assert!(after_put > 6);

    fixture.cache.delete(&get("/a")).await?;
    assert_eq!(
        fixture.cache.match_request(get("/a")).await.unwrap_err(),
        CacheError::NotFound
    );
    assert_eq!(
        fixture.cache.delete(&get("/a")).await.unwrap_err(),
        CacheError::NotFound
    );

    let events = fixture.quota.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|(origin, _)| origin == ORIGIN));
    assert_eq!(events[0].1, after_put);
    assert_eq!(events[1].1, -after_put);
    Ok(())
}

#[tokio::test]
async fn metadata_only_put_reports_header_bytes() -> Result<()> {
    let fixture = Fixture::memory();
    fixture
        .cache
        .put(get("/h"), CacheResponse::new(200, "OK"))
        .await?;
    let events = fixture.quota.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1 as u64, fixture.cache.memory_backed_size().await);
    Ok(())
}

#[tokio::test]
async fn vary_selects_on_request_headers() -> Result<()> {
    let fixture = Fixture::memory();
    let request = get("/v").with_header("Accept", "text/html");
    let response = fixture.response(200, b"html").with_header("Vary", "accept");
    fixture.cache.put(request, response).await?;

    let same = get("/v").with_header("ACCEPT", "text/html");
    assert!(fixture.cache.match_request(same).await.is_ok());

    let other = get("/v").with_header("Accept", "application/json");
    assert_eq!(
        fixture.cache.match_request(other).await.unwrap_err(),
        CacheError::NotFound
    );
    assert_eq!(
        fixture.cache.match_request(get("/v")).await.unwrap_err(),
        CacheError::NotFound
    );
    Ok(())
}

#[tokio::test]
async fn wildcard_vary_is_never_served() -> Result<()> {
    let fixture = Fixture::memory();
    let response = fixture.response(200, b"x").with_header("Vary", "*");
    fixture.cache.put(get("/star"), response).await?;
    assert_eq!(
        fixture.cache.match_request(get("/star")).await.unwrap_err(),
        CacheError::NotFound
    );
    Ok(())
}

#[tokio::test]
async fn keys_lists_stored_requests() -> Result<()> {
    let fixture = Fixture::memory();
    let mut post = CacheRequest::new(Method::POST, url("/b"));
    post.headers.append("X-Token", "abc");
    fixture
        .cache
        .put(post, fixture.response(200, b"posted"))
        .await?;
    fixture.store("/a", b"").await;

    let keys = fixture.cache.keys().await?;
    let summary: Vec<_> = keys
        .iter()
        .map(|request| (request.method.clone(), request.url.to_string()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Method::GET, format!("{ORIGIN}/a")),
            (Method::POST, format!("{ORIGIN}/b")),
        ]
    );
    assert_eq!(keys[1].headers.get("x-token"), Some("abc"));

    fixture.cache.delete(&get("/b")).await?;
    assert_eq!(fixture.cache.keys().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn keys_dooms_undecodable_entries() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new(u64::MAX));
    let fixture = Fixture::with_factory(CountingFactory::new(backend.clone()));
    fixture.store("/good", b"ok").await;

    let bogus = backend.create_entry(&format!("{ORIGIN}/bogus")).await?;
    bogus
        .write(StreamIndex::Metadata, 0, b"not metadata", true)
        .await?;
    bogus.commit().await?;
    drop(bogus);
    assert_eq!(backend.entry_count(), 2);

    let keys = fixture.cache.keys().await?;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].url, url("/good"));
    assert_eq!(backend.entry_count(), 1);
    Ok(())
}

#[tokio::test]
async fn undecodable_entry_fails_match_with_storage() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new(u64::MAX));
    let fixture = Fixture::with_factory(CountingFactory::new(backend.clone()));

    let entry = backend.create_entry(&format!("{ORIGIN}/broken")).await?;
    entry.write(StreamIndex::Metadata, 0, b"FCM", true).await?;
    entry.commit().await?;

    assert_eq!(
        fixture.cache.match_request(get("/broken")).await.unwrap_err(),
        CacheError::Storage
    );
    Ok(())
}

#[tokio::test]
async fn put_collides_with_in_flight_writer() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new(u64::MAX));
    let fixture = Fixture::with_factory(CountingFactory::new(backend.clone()));
    let _writer = backend.create_entry(&format!("{ORIGIN}/busy")).await?;

    let err = fixture
        .cache
        .put(get("/busy"), fixture.response(200, b"x"))
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::Exists);
    assert!(fixture.quota.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn failing_body_source_leaves_no_entry() -> Result<()> {
    let fixture = Fixture::memory();
    let source = fixture.blobs.put_custom(Arc::new(FailingBlob {
        size: 4096,
        good_bytes: 100,
    }));
    let response = CacheResponse::new(200, "OK").with_blob(&source);

    assert_eq!(
        fixture.cache.put(get("/f"), response).await.unwrap_err(),
        CacheError::Storage
    );
    assert_eq!(
        fixture.cache.match_request(get("/f")).await.unwrap_err(),
        CacheError::NotFound
    );
    assert!(fixture.quota.events().is_empty());
    assert_eq!(fixture.cache.memory_backed_size().await, 0);
    Ok(())
}

#[tokio::test]
async fn unresolvable_blob_fails_before_backend_creation() {
    let factory = CountingFactory::memory();
    let fixture = Fixture::with_factory(factory.clone());
    let response = CacheResponse {
        body: ResponseBody::Blob {
            id: uuid::Uuid::new_v4(),
            size: 3,
        },
        ..CacheResponse::new(200, "OK")
    };

    assert_eq!(
        fixture.cache.put(get("/x"), response).await.unwrap_err(),
        CacheError::Storage
    );
    assert_eq!(factory.calls(), 0);
    assert!(!fixture.cache.is_initialized());
}

#[tokio::test]
async fn large_body_spans_several_chunks_on_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = Fixture::persistent(dir.path());
    let body: Vec<u8> = (0..1_300_000u32).map(|i| (i % 251) as u8).collect();
    fixture.store("/big", &body).await;

    let matched = fixture.cache.match_request(get("/big")).await?;
    assert_eq!(matched.response.body_size(), body.len() as u64);
    assert_eq!(body_of(&matched).await, body);
    Ok(())
}

#[tokio::test]
async fn disk_entries_survive_a_new_cache() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let fixture = Fixture::persistent(dir.path());
        fixture.store("/kept", b"persisted body").await;
        fixture.cache.close();
    }

    let fixture = Fixture::persistent(dir.path());
    let matched = fixture.cache.match_request(get("/kept")).await?;
    assert_eq!(body_of(&matched).await, b"persisted body");
    assert_eq!(fixture.cache.memory_backed_size().await, 0);
    Ok(())
}

#[tokio::test]
async fn memory_backed_size_sums_both_streams() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new(u64::MAX));
    let fixture = Fixture::with_factory(CountingFactory::new(backend.clone()));
    assert_eq!(fixture.cache.memory_backed_size().await, 0);

    fixture.store("/a", b"12345").await;
    fixture.store("/b", b"").await;
    assert_eq!(fixture.cache.memory_backed_size().await, backend.bytes_in_use());
    assert_eq!(
        fixture.cache.memory_backed_size().await as i64,
        fixture.quota.total()
    );
    Ok(())
}

#[tokio::test]
async fn disk_backend_reports_no_memory_size() -> Result<()> {
    let dir = TempDir::new()?;
    let backend = Arc::new(DiskBackend::open(dir.path().to_path_buf(), 1 << 20).await?);
    let fixture = Fixture::with_factory(CountingFactory::new(backend));
    fixture.store("/a", b"body").await;
    assert_eq!(fixture.cache.memory_backed_size().await, 0);
    Ok(())
}

#[tokio::test]
async fn closed_cache_fails_with_storage() {
    let fixture = Fixture::memory();
    fixture.store("/a", b"x").await;
    fixture.cache.close();

    assert_eq!(
        fixture.cache.match_request(get("/a")).await.unwrap_err(),
        CacheError::Storage
    );
    assert_eq!(fixture.cache.keys().await.unwrap_err(), CacheError::Storage);
    assert_eq!(fixture.cache.memory_backed_size().await, 0);
}

#[tokio::test]
async fn dropped_quota_client_is_skipped() -> Result<()> {
    let fixture = Fixture::memory();
    let Fixture {
        cache,
        quota,
        blobs,
    } = fixture;
    let weak = Arc::downgrade(&quota);
    drop(quota);
    assert!(weak.upgrade().is_none());

    let response = CacheResponse::new(200, "OK").with_blob(&blobs.put_bytes("data"));
    cache.put(get("/q"), response).await?;
    cache.delete(&get("/q")).await?;
    Ok(())
}

#[tokio::test]
async fn dropped_blob_storage_fails_body_match() -> Result<()> {
    let fixture = Fixture::memory();
    fixture.store("/b", b"body").await;
    fixture.store("/h", b"").await;
    let Fixture { cache, blobs, .. } = fixture;
    drop(blobs);

    assert_eq!(
        cache.match_request(get("/b")).await.unwrap_err(),
        CacheError::Storage
    );
    assert!(cache.match_request(get("/h")).await?.blob.is_none());
    Ok(())
}

#[tokio::test]
async fn clones_share_one_backend() -> Result<()> {
    let factory = CountingFactory::memory();
    let fixture = Fixture::with_factory(factory.clone());
    let other = fixture.cache.clone();

    fixture.store("/shared", b"one").await;
    let matched = other.match_request(get("/shared")).await?;
    assert_eq!(body_of(&matched).await, b"one");
    assert_eq!(factory.calls(), 1);
    Ok(())
}
