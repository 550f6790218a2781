use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use url::form_urlencoded;

use crate::cache::CacheStore;
use crate::error::internal_error;

pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Caches successful read responses by request path and query, and drops
/// them by key pattern when the underlying data changes. With no store
/// configured every request runs the handler.
#[derive(Clone, Default)]
pub struct ResponseCache {
    store: Option<Arc<dyn CacheStore>>,
}

impl ResponseCache {
    pub fn new(store: Option<Arc<dyn CacheStore>>) -> Self {
        Self { store }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// `cache:{prefix}:{path}` with `:{query}` appended when a query is
    /// present. Query pairs are sorted so equivalent requests share a key.
    pub fn key(prefix: &str, path: &str, query: Option<&str>) -> String {
        let mut key = format!("cache:{prefix}:{path}");
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.sort();
            let canonical = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            key.push(':');
            key.push_str(&canonical);
        }
        key
    }

    pub async fn wrap<F, Fut>(&self, key: &str, ttl: Duration, handler: F) -> Response
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response>,
    {
        let Some(store) = &self.store else {
            return handler().await;
        };

        match store.get(key).await {
            Ok(Some(body)) => {
                tracing::debug!(key, "response cache hit");
                return cached_response(body, "HIT");
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(key, error = %err, "response cache read failed"),
        }

        let response = handler().await;
        if response.status() != StatusCode::OK {
            return response;
        }

        let (parts, body) = response.into_parts();
        let bytes = match to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => return internal_error(err).into_response(),
        };
        match std::str::from_utf8(&bytes) {
            Ok(text) => {
                if let Err(err) = store.set_ex(key, text, ttl).await {
                    tracing::warn!(key, error = %err, "response cache write failed");
                }
            }
            Err(_) => tracing::debug!(key, "skipping cache for non-utf8 body"),
        }

        let mut response = Response::from_parts(parts, Body::from(bytes));
        response
            .headers_mut()
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
        response
    }

    /// Deletes every cached response matching `pattern`. Failures are
    /// logged and reported as zero deletions.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.delete_pattern(pattern).await {
            Ok(count) => {
                tracing::info!(pattern, deleted = count, "invalidated cached responses");
                count
            }
            Err(err) => {
                tracing::warn!(pattern, error = %err, "cache invalidation failed");
                0
            }
        }
    }
}

fn cached_response(body: String, status: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(status));
    response
}

/// Per-route caching parameters for [`cache_stage`].
#[derive(Clone)]
pub struct CacheRule {
    pub cache: ResponseCache,
    pub ttl: Duration,
    pub prefix: &'static str,
}

/// Final request stage before the handler: serves or stores the response
/// under the request's cache key.
pub async fn cache_stage(State(rule): State<CacheRule>, request: Request, next: Next) -> Response {
    let key = ResponseCache::key(rule.prefix, request.uri().path(), request.uri().query());
    rule.cache
        .wrap(&key, rule.ttl, move || next.run(request))
        .await
}
