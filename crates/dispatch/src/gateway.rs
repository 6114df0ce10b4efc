//! Front end for raw client connections
//!
//! [`Gateway`] puts the fast path in front of a [`WorkerPool`]: rate-limited
//! or oversized requests are answered on the spot, everything else is
//! serialized into a
//! [`SerialRequest`], assigned to a worker, and the worker's
//! [`SerialResponse`] is written back to the same connection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::fastpath::{
    AdmissionLimits, FastPathResponder, RateLimiter, RawResponse, Rejection, RequestSizes,
    ResponseError,
};
use crate::pool::WorkerPool;
use crate::work::{Connection, WorkItem};

/// Request shape sent to workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialRequest {
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    /// Client identity used for rate limiting, e.g. the peer address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

impl SerialRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: Vec::new(),
            body: String::new(),
            client: None,
        }
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Path part of the URI, without the query string
    pub fn path(&self) -> &str {
        self.uri
            .split_once('?')
            .map_or(self.uri.as_str(), |(path, _)| path)
    }

    /// Sizes as they appeared on the wire
    ///
    /// Each header counts as `name: value\r\n`.
    pub fn sizes(&self) -> RequestSizes {
        RequestSizes {
            uri: self.uri.len(),
            headers: self
                .headers
                .iter()
                .map(|(name, value)| name.len() + value.len() + 4)
                .sum(),
            payload: self.body.len(),
        }
    }
}

/// Response shape returned by workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

impl SerialResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    fn into_raw(self) -> RawResponse {
        RawResponse {
            status: self.status,
            headers: self.headers,
            body: Some(self.body.into_bytes()),
        }
    }
}

/// Gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Response(#[from] ResponseError),

    /// The pool did not hand the connection back
    #[error("connection lost before the response was written")]
    ConnectionLost,
}

/// Fast path plus worker pool behind one entry point
#[derive(Debug, Clone)]
pub struct Gateway {
    pool: WorkerPool,
    limits: AdmissionLimits,
    rate_limiter: Option<Arc<RateLimiter>>,
    responder: FastPathResponder,
}

impl Gateway {
    pub fn new(pool: WorkerPool, limits: AdmissionLimits) -> Self {
        let rate_limiter = limits.rate_limit.map(|limit| Arc::new(RateLimiter::new(limit)));
        Self {
            pool,
            limits,
            rate_limiter,
            responder: FastPathResponder::new().with_default_header("Connection", "close"),
        }
    }

    pub fn with_responder(mut self, responder: FastPathResponder) -> Self {
        self.responder = responder;
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    /// Answer one request on `connection`, returning the status written
    ///
    /// The connection is shut down afterwards.
    #[instrument(skip_all, fields(method = %request.method, uri = %request.path()))]
    pub async fn handle(
        &self,
        request: SerialRequest,
        mut connection: Connection,
    ) -> Result<u16, GatewayError> {
        if let Err(rejection) = self.admit(&request) {
            info!(
                reason = %rejection.reason,
                limit = rejection.limit,
                actual = rejection.actual,
                "request rejected on fast path"
            );
            self.responder.reject(&mut connection, rejection.status).await?;
            close(connection).await;
            return Ok(rejection.status);
        }

        let payload = serde_json::to_value(&request)?;
        let completion = self
            .pool
            .assign(WorkItem::new(payload).with_connection(connection))
            .await;
        let mut connection = completion.connection.ok_or(GatewayError::ConnectionLost)?;

        let status = match completion.result {
            Ok(output) => self.write_output(&mut connection, output).await?,
            Err(e) => {
                debug!(error = %e, "assignment failed");
                let status = e.status();
                self.responder.reject(&mut connection, status).await?;
                status
            }
        };
        close(connection).await;
        Ok(status)
    }

    /// Rate first, then sizes
    ///
    /// Requests without a client identity are not rate limited.
    fn admit(&self, request: &SerialRequest) -> Result<(), Rejection> {
        if let (Some(limiter), Some(client)) = (&self.rate_limiter, request.client.as_deref()) {
            limiter
                .check(client)
                .map_err(|exceeded| self.limits.rate_rejection(exceeded))?;
        }
        self.limits.check(request.sizes())
    }

    async fn write_output(
        &self,
        connection: &mut Connection,
        output: Value,
    ) -> Result<u16, GatewayError> {
        let response = match serde_json::from_value::<SerialResponse>(output) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "worker returned a malformed response");
                self.responder.reject(connection, 502).await?;
                return Ok(502);
            }
        };

        let status = response.status;
        match self.responder.respond(connection, &response.into_raw()).await {
            Ok(()) => Ok(status),
            Err(ResponseError::InvalidHeader(name)) => {
                warn!(header = %name, "worker returned an unsafe header");
                self.responder.reject(connection, 502).await?;
                Ok(502)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn close(mut connection: Connection) {
    if let Err(e) = connection.shutdown().await {
        debug!(error = %e, "connection shutdown failed");
    }
}
