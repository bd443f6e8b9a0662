//! Tracing for outgoing HTTP calls.

use std::time::Instant;

use axum::http;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use tracing::{debug, warn};

/// Emits one `debug!` line per outgoing request with method, path, status and
/// elapsed time. Headers are never logged since they carry the API token.
pub struct ApiLogMiddleware {
    service: &'static str,
}

impl ApiLogMiddleware {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Middleware for ApiLogMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let method = req.method().clone();
        let path = req.url().path().to_string();
        let started = Instant::now();

        let response = next.run(req, extensions).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &response {
            Ok(resp) => debug!(
                service = self.service,
                %method,
                path = %path,
                status = resp.status().as_u16(),
                elapsed_ms,
                "outgoing request"
            ),
            Err(err) => warn!(
                service = self.service,
                %method,
                path = %path,
                elapsed_ms,
                error = %err,
                "outgoing request failed"
            ),
        }

        response
    }
}
