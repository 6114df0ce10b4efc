//! Request routing for the reference worker

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use switchyard_dispatch::gateway::{SerialRequest, SerialResponse};
use switchyard_dispatch::unit::{Handler, HandlerError, WorkerContext, WorkerKind};
use tracing::{debug, info, warn};

/// Store scope used by `/count/<key>`
pub const COUNTER_SCOPE: &str = "counters";

/// Exit code of a process worker asked to crash
pub const CRASH_EXIT_CODE: i32 = 70;

/// Longest delay `/sleep/<ms>` accepts
pub const MAX_SLEEP_MS: u64 = 60_000;

/// Recognised request paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Echo,
    Fail,
    Sleep(u64),
    Count(String),
    Crash,
    Settings,
    NotFound,
}

impl Route {
    pub fn parse(path: &str) -> Self {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["echo"] => Route::Echo,
            ["fail"] => Route::Fail,
            ["crash"] => Route::Crash,
            ["settings"] => Route::Settings,
            ["sleep", ms] => match ms.parse() {
                Ok(ms) if ms <= MAX_SLEEP_MS => Route::Sleep(ms),
                _ => Route::NotFound,
            },
            ["count", key] if !key.is_empty() => Route::Count((*key).to_string()),
            _ => Route::NotFound,
        }
    }
}

/// Handler serving [`SerialRequest`] payloads
///
/// Broadcasts are kept as local settings, newest last.
#[derive(Debug, Default)]
pub struct ReferenceHandler {
    settings: Mutex<Vec<Value>>,
}

impl ReferenceHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcasts received so far
    pub fn settings(&self) -> Vec<Value> {
        self.settings.lock().clone()
    }

    async fn route(
        &self,
        request: SerialRequest,
        ctx: &WorkerContext,
    ) -> Result<SerialResponse, HandlerError> {
        match Route::parse(request.path()) {
            Route::Echo => {
                let content_type = request
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                    .map_or("text/plain", |(_, value)| value.as_str());
                Ok(SerialResponse::new(200)
                    .with_header("Content-Type", content_type)
                    .with_body(request.body))
            }
            Route::Fail => Err(HandlerError::new("failure requested by client")),
            Route::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(SerialResponse::new(200).with_body(format!("slept {ms}ms")))
            }
            Route::Count(key) => {
                let value = ctx.increment(COUNTER_SCOPE, &key, 1).await?;
                Ok(SerialResponse::new(200)
                    .with_header("Content-Type", "application/json")
                    .with_body(value.to_string()))
            }
            Route::Crash => crash(ctx),
            Route::Settings => Ok(SerialResponse::new(200)
                .with_header("Content-Type", "application/json")
                .with_body(Value::Array(self.settings()).to_string())),
            Route::NotFound => Ok(SerialResponse::new(404)),
        }
    }
}

#[async_trait]
impl Handler for ReferenceHandler {
    async fn init(&self, ctx: &WorkerContext) -> Result<(), HandlerError> {
        info!(worker_id = ctx.worker_id(), kind = %ctx.kind(), "reference worker ready");
        Ok(())
    }

    async fn handle(&self, payload: Value, ctx: WorkerContext) -> Result<Value, HandlerError> {
        let request: SerialRequest = serde_json::from_value(payload)
            .map_err(|e| HandlerError::new(format!("malformed request: {e}")).with_status(400))?;
        debug!(worker_id = ctx.worker_id(), method = %request.method, uri = %request.uri, "handling request");

        let response = self.route(request, &ctx).await?;
        serde_json::to_value(response).map_err(|e| HandlerError::new(e.to_string()))
    }

    async fn on_broadcast(&self, data: Value, ctx: &WorkerContext) {
        info!(worker_id = ctx.worker_id(), %data, "settings updated");
        self.settings.lock().push(data);
    }
}

fn crash(ctx: &WorkerContext) -> Result<SerialResponse, HandlerError> {
    match ctx.kind() {
        WorkerKind::Process => {
            warn!(worker_id = ctx.worker_id(), "crash requested, exiting");
            std::process::exit(CRASH_EXIT_CODE)
        }
        // Exiting would take the whole front end down with it.
        WorkerKind::Thread => Err(HandlerError::new("crash is not supported by thread workers")
            .with_status(501)),
    }
}
