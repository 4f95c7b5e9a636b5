//! In-process UI context that walks through every sample channel, the way a
//! renderer page would.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tether_core::{Bridge, TetherError};
use tracing::{info, warn};

use crate::channels::{
    API_REQUEST, APP_GET_INFO, ASYNC_GET_DATA, LOG_MESSAGE, MAIN_PROCESS_UPDATE,
    OPERATION_WITH_ERROR, PROCESS_LARGE_DATA,
};

/// Run the walkthrough, then wait for `updates` ticker events.
pub async fn run(bridge: &Bridge, updates: u64) -> anyhow::Result<()> {
    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    let subscription = bridge.on(MAIN_PROCESS_UPDATE, move |payload: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        info!(counter = %payload["counter"], "main process update");
    });

    bridge.send(LOG_MESSAGE, vec![json!("renderer ready")]);

    let info = bridge
        .invoke(APP_GET_INFO, vec![])
        .await
        .context("app:get-info")?;
    info!(%info, "app info");

    let data = bridge
        .invoke(ASYNC_GET_DATA, vec![json!("test data")])
        .await
        .context("async-get-data")?;
    info!(%data, "async result");

    let user = bridge
        .invoke(
            API_REQUEST,
            vec![json!({ "endpoint": "get-user-info", "params": {} })],
        )
        .await
        .context("api-request get-user-info")?;
    info!(%user, "user info");

    let saved = bridge
        .invoke(
            API_REQUEST,
            vec![json!({ "endpoint": "save-settings", "params": { "theme": "dark" } })],
        )
        .await
        .context("api-request save-settings")?;
    info!(%saved, "settings saved");

    match bridge
        .invoke(OPERATION_WITH_ERROR, vec![json!(true)])
        .await
    {
        Err(TetherError::HandlerFailure { code, message }) => {
            info!(%code, %message, "expected failure caught");
        }
        other => warn!(?other, "operation-with-error did not fail"),
    }

    let items: Vec<Value> = (0..1_000).map(|i| json!(format!("item {i}"))).collect();
    let processed = bridge
        .invoke(PROCESS_LARGE_DATA, vec![Value::Array(items)])
        .await
        .context("process-large-data")?;
    info!(count = %processed["count"], "large data processed");

    // Unregistered channels are refused by the allow-list.
    if let Err(e) = bridge.invoke("fs:read-file", vec![json!("/etc/passwd")]).await {
        info!(code = e.code(), "unauthorized channel rejected");
    }

    while received.load(Ordering::SeqCst) < updates {
        if bridge.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    subscription.unsubscribe();
    Ok(())
}
