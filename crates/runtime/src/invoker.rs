//! HTTP invocation of job targets.
//!
//! One invoker (and one pooled `reqwest` client) per process. Any received
//! response is returned to the caller, whatever its status code; errors are
//! reserved for transport failures. The invoker never retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::Semaphore;

use crate::types::{HttpMethod, InvokeError, Job};

/// Idle connections retained per host by the pooled transport.
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// One HTTP call to perform: the job envelope plus a deadline.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl From<&Job> for HttpCall {
    fn from(job: &Job) -> Self {
        Self {
            method: job.method,
            url: job.url.clone(),
            headers: job.headers.clone(),
            query_params: job.query_params.clone(),
            body: job.body.clone(),
            timeout: Duration::from_millis(job.per_attempt_timeout_ms),
        }
    }
}

/// A response received from the target, whatever its status code.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Seam for the execution driver; implemented by [`HttpInvoker`] and by test
/// stubs.
#[async_trait]
pub trait HttpInvoke: Send + Sync {
    async fn invoke(&self, call: &HttpCall) -> Result<HttpResponse, InvokeError>;
}

/// Process-wide HTTP invoker with a pooled transport and a per-host ceiling
/// on concurrently open sockets.
pub struct HttpInvoker {
    client: reqwest::Client,
    host_limits: DashMap<String, Arc<Semaphore>>,
    max_sockets_per_host: usize,
}

impl HttpInvoker {
    pub fn new(max_sockets_per_host: usize) -> Result<Self, InvokeError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| InvokeError::RequestInvalid(format!("client build failed: {e}")))?;

        Ok(Self {
            client,
            host_limits: DashMap::new(),
            max_sockets_per_host,
        })
    }

    fn host_permit(&self, host: &str) -> Arc<Semaphore> {
        self.host_limits
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_sockets_per_host)))
            .clone()
    }
}

#[async_trait]
impl HttpInvoke for HttpInvoker {
    async fn invoke(&self, call: &HttpCall) -> Result<HttpResponse, InvokeError> {
        let url = reqwest::Url::parse(&call.url)
            .map_err(|e| InvokeError::RequestInvalid(format!("{}: {e}", call.url)))?;
        let host = url.host_str().unwrap_or("").to_string();

        let limiter = self.host_permit(&host);
        let _permit = limiter
            .acquire_owned()
            .await
            .map_err(|e| InvokeError::RequestInvalid(format!("host limiter closed: {e}")))?;

        let mut request = self
            .client
            .request(call.method.as_reqwest(), url)
            .timeout(call.timeout);

        if !call.query_params.is_empty() {
            request = request.query(&call.query_params);
        }

        let has_content_type = call
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            request = request.header(CONTENT_TYPE, "application/json");
        }
        for (name, value) in &call.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &call.body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(InvokeError::Timeout {
                    url: call.url.clone(),
                    timeout_ms: call.timeout.as_millis() as u64,
                })
            }
            Err(e) if e.is_builder() || e.is_request() => {
                return Err(InvokeError::RequestInvalid(e.to_string()))
            }
            Err(e) => {
                return Err(InvokeError::NoResponse {
                    url: call.url.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                InvokeError::Timeout {
                    url: call.url.clone(),
                    timeout_ms: call.timeout.as_millis() as u64,
                }
            } else {
                InvokeError::NoResponse {
                    url: call.url.clone(),
                    reason: format!("body read failed: {e}"),
                }
            }
        })?;

        Ok(HttpResponse { status, body })
    }
}
