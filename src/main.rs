use brokerage_webhook_engine::contact::RecordContactResolver;
use brokerage_webhook_engine::listener::{ChangeNotice, ChannelFeed, FeedPayload};
use brokerage_webhook_engine::records::MemoryRecordSource;
use brokerage_webhook_engine::store::{DeliveryLog, FileConfigStore};
use brokerage_webhook_engine::{
    ChangeType, Collection, EngineConfig, EngineHandle, SessionUser, WebhookEngine,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Every method answers with its raw result or a JSON-RPC error.
fn respond(id: Value, result: Result<Value, String>) -> JsonRpcResponse {
    match result {
        Ok(data) => JsonRpcResponse {
            jsonrpc: "2.0",
            result: Some(data),
            error: None,
            id,
        },
        Err(message) => err_response(id, -32000, message),
    }
}

fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

// ─── Shared app state ────────────────────────────────────────────────────────

struct AppState {
    engine: Option<WebhookEngine>,
    /// Present while the session's listeners are running.
    listeners: Option<EngineHandle>,
    session: Option<SessionUser>,
    feed: Arc<ChannelFeed>,
    records: Arc<MemoryRecordSource>,
}

impl AppState {
    fn new() -> Self {
        Self {
            engine: None,
            listeners: None,
            session: None,
            feed: Arc::new(ChannelFeed::default()),
            records: Arc::new(MemoryRecordSource::new()),
        }
    }

    fn engine(&self) -> Result<&WebhookEngine, String> {
        self.engine.as_ref().ok_or_else(|| "engine not initialized".to_string())
    }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let state: Arc<RwLock<AppState>> = Arc::new(RwLock::new(AppState::new()));
    let state_clone = state.clone();
    let handle = tokio::runtime::Handle::current();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let resp =
                        err_response(Value::Number(0.into()), -32700, format!("Parse error: {e}"));
                    emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";
            let response = handle.block_on(handle_request(&request, &state_clone));
            emit_line(&mut out, &response);

            if is_shutdown {
                break;
            }
        }
    })
    .await?;

    // Host closed stdin without a shutdown call.
    shutdown(&state).await;
    Ok(())
}

fn emit_line(out: &mut impl Write, resp: &JsonRpcResponse) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => error!(error = %e, "failed to serialize response"),
    }
}

// ─── Request dispatch ─────────────────────────────────────────────────────────

async fn handle_request(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let result = match req.method.as_str() {
        "initialize" => handle_initialize(&req.params, state).await,
        "shutdown" => {
            shutdown(state).await;
            Ok(serde_json::json!({}))
        }
        "feed.publish" => handle_feed_publish(&req.params, state).await,
        "records.upsert" => handle_records_upsert(&req.params, state).await,
        "execute" => handle_execute(&req.params, state).await,
        _ => {
            return err_response(req.id.clone(), -32601, format!("Unknown method: {}", req.method))
        }
    };
    respond(req.id.clone(), result)
}

async fn handle_initialize(params: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let data_dir = params
        .get("data_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let session: SessionUser = params
        .get("session")
        .cloned()
        .ok_or("missing required field: session")
        .and_then(|v| serde_json::from_value(v).map_err(|_| "invalid session"))?;

    let config = EngineConfig::load(&data_dir).map_err(|e| e.to_string())?;
    let deliveries = Arc::new(DeliveryLog::persistent(data_dir.clone(), config.delivery_history));
    if let Err(e) = deliveries.load() {
        warn!(error = %e, "failed to load delivery history");
    }

    let mut st = state.write().await;
    if let Some(listeners) = st.listeners.take() {
        listeners.stop().await;
    }

    let records = st.records.clone();
    let engine = WebhookEngine::new(
        &config,
        Arc::new(FileConfigStore::new(data_dir)),
        records.clone(),
        Arc::new(RecordContactResolver::new(records)),
        deliveries,
    )
    .map_err(|e| e.to_string())?;

    st.listeners = engine.start(&session, st.feed.clone());
    let listening = st.listeners.is_some();
    st.engine = Some(engine);
    st.session = Some(session);

    Ok(serde_json::json!({ "ready": true, "listening": listening }))
}

async fn shutdown(state: &Arc<RwLock<AppState>>) {
    let mut st = state.write().await;
    if let Some(listeners) = st.listeners.take() {
        listeners.stop().await;
    }
    if let Some(engine) = &st.engine {
        if let Err(e) = engine.deliveries().save() {
            warn!(error = %e, "failed to persist delivery history");
        }
    }
}

fn parse_collection(params: &Value) -> Result<Collection, String> {
    let raw = params
        .get("collection")
        .cloned()
        .ok_or("missing required field: collection")?;
    serde_json::from_value(raw).map_err(|_| "unknown collection".to_string())
}

async fn handle_feed_publish(params: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let collection = parse_collection(params)?;
    let id = params
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or("missing required field: id")?
        .to_string();
    let change: ChangeType = params
        .get("change_type")
        .cloned()
        .ok_or("missing required field: change_type")
        .and_then(|v| serde_json::from_value(v).map_err(|_| "invalid change_type"))?;

    let (feed, records) = {
        let st = state.read().await;
        (st.feed.clone(), st.records.clone())
    };

    let payload = match params.get("snapshot").filter(|v| v.is_object()) {
        Some(snapshot) => {
            if change != ChangeType::Removed {
                records
                    .upsert_raw(collection.as_str(), &id, snapshot.clone())
                    .map_err(|e| e.to_string())?;
            }
            FeedPayload::Full(snapshot.clone())
        }
        None => FeedPayload::Partial,
    };
    if change == ChangeType::Removed {
        records.remove(collection, &id);
    }

    let accepted = feed
        .publish(collection, ChangeNotice { id, change, payload })
        .await;
    Ok(serde_json::json!({ "accepted": accepted }))
}

async fn handle_records_upsert(
    params: &Value,
    state: &Arc<RwLock<AppState>>,
) -> Result<Value, String> {
    let collection = params
        .get("collection")
        .and_then(|v| v.as_str())
        .ok_or("missing required field: collection")?;
    let record = params
        .get("record")
        .cloned()
        .ok_or("missing required field: record")?;
    // An explicit id wins over the one embedded in the record.
    let id = params
        .get("id")
        .or_else(|| record.get("id"))
        .and_then(|v| v.as_str())
        .ok_or("missing required field: id")?
        .to_string();

    let st = state.read().await;
    st.records
        .upsert_raw(collection, &id, record)
        .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "stored": true }))
}

// ─── Execute handler ──────────────────────────────────────────────────────────

async fn handle_execute(params: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let operation = params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = params
        .get("input")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    match operation {
        "list_subscribers" => op_list_subscribers(state).await,
        "refresh_subscribers" => op_refresh_subscribers(state).await,
        "get_recent_deliveries" => op_get_recent_deliveries(&input, state).await,
        "get_status" => op_get_status(state).await,
        _ => Err(format!("Unknown operation: {operation}")),
    }
}

// ─── Operations ───────────────────────────────────────────────────────────────

async fn op_list_subscribers(state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let st = state.read().await;
    let subscribers = st.engine()?.registry().all_subscribers().await;
    // Secrets stay inside the engine.
    let items: Vec<Value> = subscribers
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "name": s.name,
                "url": s.url,
                "enabled": s.enabled,
                "eventMatrix": s.event_matrix,
                "throttle": s.throttle,
            })
        })
        .collect();
    Ok(serde_json::json!({ "subscribers": items, "count": items.len() }))
}

async fn op_refresh_subscribers(state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let st = state.read().await;
    let registry = st.engine()?.registry();
    registry.invalidate();
    let count = registry.all_subscribers().await.len();
    info!(count, "subscriber configs refreshed");
    Ok(serde_json::json!({ "count": count }))
}

async fn op_get_recent_deliveries(
    input: &Value,
    state: &Arc<RwLock<AppState>>,
) -> Result<Value, String> {
    let subscriber_id = input
        .get("subscriber_id")
        .and_then(|v| v.as_str())
        .ok_or("missing required field: subscriber_id")?;

    let st = state.read().await;
    let deliveries: Vec<Value> = st
        .engine()?
        .deliveries()
        .recent(subscriber_id)
        .into_iter()
        .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
        .collect();
    Ok(serde_json::json!({ "deliveries": deliveries }))
}

async fn op_get_status(state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let st = state.read().await;
    let engine = st.engine()?;
    Ok(serde_json::json!({
        "listening": st.listeners.is_some(),
        "session": st.session,
        "tracked": {
            "clients": engine.tracked_entities(Collection::Clients),
            "proposals": engine.tracked_entities(Collection::Proposals),
        },
        "subscribers_with_history": engine.deliveries().subscriber_ids(),
    }))
}
