//! Sample channels served by the host.
//!
//! Every operation that produces a result is an `Invoke` channel; pushed
//! state goes out on `main-process-update`; `log-message` is the only
//! fire-and-forget channel.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tether_core::{ChannelRegistry, ChannelSpec, Controller, HandlerError, RequestContext, Shape};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::settings::AppSettings;

pub const APP_GET_INFO: &str = "app:get-info";
pub const ASYNC_GET_DATA: &str = "async-get-data";
pub const API_REQUEST: &str = "api-request";
pub const OPERATION_WITH_ERROR: &str = "operation-with-error";
pub const PROCESS_LARGE_DATA: &str = "process-large-data";
pub const LOG_MESSAGE: &str = "log-message";
pub const MAIN_PROCESS_UPDATE: &str = "main-process-update";

/// Simulated latency of `async-get-data`.
const ASYNC_WORK_DELAY: Duration = Duration::from_millis(250);

pub fn build_registry() -> tether_core::error::Result<ChannelRegistry> {
    ChannelRegistry::new()
        .with(ChannelSpec::invoke(APP_GET_INFO).returns(Shape::object([
            ("name", Shape::String),
            ("version", Shape::String),
            ("platform", Shape::String),
        ])))?
        .with(
            ChannelSpec::invoke(ASYNC_GET_DATA)
                .param("input", Shape::String)
                .returns(Shape::object([
                    ("success", Shape::Bool),
                    ("data", Shape::String),
                    ("timestamp", Shape::String),
                ])),
        )?
        .with(
            ChannelSpec::invoke(API_REQUEST).param(
                "request",
                Shape::object([
                    ("endpoint", Shape::String),
                    ("params", Shape::optional(Shape::Object(Vec::new()))),
                ]),
            ),
        )?
        .with(
            ChannelSpec::invoke(OPERATION_WITH_ERROR)
                .param("shouldFail", Shape::optional(Shape::Bool))
                .returns(Shape::object([
                    ("success", Shape::Bool),
                    ("result", Shape::String),
                ])),
        )?
        .with(
            ChannelSpec::invoke(PROCESS_LARGE_DATA)
                .param("items", Shape::array(Shape::String))
                .returns(Shape::object([
                    ("count", Shape::Integer),
                    ("data", Shape::array(Shape::Any)),
                ])),
        )?
        .with(ChannelSpec::send(LOG_MESSAGE).param("message", Shape::String))?
        .with(ChannelSpec::event(
            MAIN_PROCESS_UPDATE,
            Shape::object([("counter", Shape::Integer), ("timestamp", Shape::String)]),
        ))
}

#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
}

/// Endpoints reachable through `api-request`. Unknown endpoints fail
/// deserialization and surface as `SHAPE_MISMATCH`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "endpoint", content = "params", rename_all = "kebab-case")]
pub enum ApiEndpoint {
    GetUserInfo {},
    SaveSettings(Map<String, Value>),
}

#[derive(Debug, Deserialize)]
struct ApiRequestArgs {
    request: ApiEndpoint,
}

#[derive(Debug, Deserialize)]
struct GetDataArgs {
    input: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationArgs {
    should_fail: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LargeDataArgs {
    items: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LogArgs {
    message: String,
}

#[derive(Debug, Serialize)]
struct ProcessedItem {
    id: usize,
    original: String,
    processed: String,
    timestamp: i64,
}

fn api_response(endpoint: ApiEndpoint) -> Value {
    match endpoint {
        ApiEndpoint::GetUserInfo {} => json!({
            "user": { "id": 1, "name": "Test User" },
            "permissions": ["read", "write"],
        }),
        ApiEndpoint::SaveSettings(values) => json!({
            "success": true,
            "message": "settings saved",
            "saved": values.len(),
        }),
    }
}

fn process_items(items: Vec<String>) -> Vec<ProcessedItem> {
    let now = Utc::now().timestamp_millis();
    items
        .into_iter()
        .enumerate()
        .map(|(id, original)| ProcessedItem {
            id,
            processed: original.to_uppercase(),
            original,
            timestamp: now,
        })
        .collect()
}

/// Attach a handler to every sample channel.
pub fn register_handlers(
    controller: &Controller,
    settings: &AppSettings,
) -> tether_core::error::Result<()> {
    let info = AppInfo {
        name: settings.app_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
    };
    controller.handle_typed(APP_GET_INFO, move |_req: RequestContext, _args: Value| {
        let info = info.clone();
        async move { Ok::<_, HandlerError>(info) }
    })?;

    controller.handle_typed(ASYNC_GET_DATA, |_req: RequestContext, args: GetDataArgs| async move {
        tokio::time::sleep(ASYNC_WORK_DELAY).await;
        Ok::<_, HandlerError>(json!({
            "success": true,
            "data": format!("processed: {}", args.input),
            "timestamp": Utc::now().to_rfc3339(),
        }))
    })?;

    controller.handle_typed(API_REQUEST, |req: RequestContext, args: ApiRequestArgs| async move {
        info!(context = %req.context, endpoint = ?args.request, "api request");
        Ok::<_, HandlerError>(api_response(args.request))
    })?;

    controller.handle_typed(
        OPERATION_WITH_ERROR,
        |_req: RequestContext, args: OperationArgs| async move {
            if args.should_fail.unwrap_or(false) {
                return Err(HandlerError::new(
                    "OPERATION_FAILED",
                    "operation failed on purpose",
                ));
            }
            Ok(json!({ "success": true, "result": "operation completed" }))
        },
    )?;

    let limit = settings.large_data_limit;
    controller.handle_typed(
        PROCESS_LARGE_DATA,
        move |req: RequestContext, args: LargeDataArgs| async move {
            if args.items.len() > limit {
                return Err(HandlerError::new(
                    "TOO_LARGE",
                    format!("{} items exceeds the limit of {limit}", args.items.len()),
                ));
            }
            info!(context = %req.context, records = args.items.len(), "processing large data");
            let data = process_items(args.items);
            Ok(json!({ "count": data.len(), "data": data }))
        },
    )?;

    controller.listen_typed(LOG_MESSAGE, |req: RequestContext, args: LogArgs| {
        info!(target: "tether::renderer", context = %req.context, "{}", args.message);
    })?;

    Ok(())
}

/// Broadcast `main-process-update` every `interval` until shutdown.
pub fn spawn_ticker(controller: Controller, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticks.tick().await;
        let mut counter: u64 = 0;
        loop {
            ticks.tick().await;
            if controller.is_shutting_down() {
                break;
            }
            let payload = json!({ "counter": counter, "timestamp": Utc::now().to_rfc3339() });
            match controller.broadcast(MAIN_PROCESS_UPDATE, payload) {
                Ok(_) => counter += 1,
                Err(e) => warn!("ticker broadcast rejected: {e}"),
            }
        }
    })
}
