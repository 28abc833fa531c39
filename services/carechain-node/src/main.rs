use anyhow::{bail, Context};
use carechain_anchor::{AnchorOutcome, AnchorService, MemoryLedger};
use carechain_core::{logging, AnchorConfig, EntityRef, EventCategory, ReceiptStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NodeConfig {
    /// SQLite receipt database; in-memory when unset
    receipt_db: Option<PathBuf>,
    log_format: LogFormat,
    drain_timeout_ms: u64,
    anchor: AnchorConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            receipt_db: None,
            log_format: LogFormat::Text,
            drain_timeout_ms: 30_000,
            anchor: AnchorConfig::default(),
        }
    }
}

impl NodeConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&raw)?;
        config.anchor.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Mode {
    Direct,
    Batched,
}

/// One stdin line
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRequest {
    mode: Mode,
    category: EventCategory,
    entity_type: String,
    entity_id: String,
    payload: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => NodeConfig::load(&path)?,
        None => NodeConfig::default(),
    };

    match config.log_format {
        LogFormat::Text => logging::init(),
        LogFormat::Json => logging::init_json(),
    }

    let store = match &config.receipt_db {
        Some(path) => ReceiptStore::open(path)?,
        None => ReceiptStore::open_in_memory()?,
    };
    let store = Arc::new(store);
    let ledger = Arc::new(MemoryLedger::new());
    let service = AnchorService::new(config.anchor.clone(), ledger, Arc::clone(&store))?;

    info!(
        receipt_db = ?config.receipt_db,
        "carechain-node started, reading events from stdin"
    );

    let mut batched = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: EventRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event line");
                emit(&json!({ "error": format!("malformed event: {}", e) }))?;
                continue;
            }
        };

        let entity = EntityRef::new(request.entity_type, request.entity_id);
        match request.mode {
            Mode::Direct => {
                match service
                    .anchor_direct(request.category, entity.clone(), &request.payload)
                    .await
                {
                    Ok(AnchorOutcome::Anchored(receipt)) => {
                        emit(&json!({ "entity": entity, "status": "anchored", "receipt": receipt }))?
                    }
                    Ok(AnchorOutcome::Queued { entry_id, digest }) => emit(&json!({
                        "entity": entity,
                        "status": "queued",
                        "entryId": entry_id,
                        "digest": digest
                    }))?,
                    Err(e) => emit(&json!({ "entity": entity, "error": e.to_string() }))?,
                }
            }
            Mode::Batched => {
                match service
                    .anchor_batched(request.category, entity.clone(), &request.payload)
                    .await
                {
                    Ok(ticket) => {
                        emit(&json!({
                            "entity": entity,
                            "status": "pending",
                            "digest": ticket.digest,
                            "index": ticket.index
                        }))?;
                        batched.push(entity);
                    }
                    Err(e) => emit(&json!({ "entity": entity, "error": e.to_string() }))?,
                }
            }
        }
    }

    service
        .shutdown(Duration::from_millis(config.drain_timeout_ms))
        .await?;

    for entity in &batched {
        match store.get(entity)? {
            Some(row) => emit(&json!({
                "entity": entity,
                "status": row.status,
                "receipt": row.receipt,
                "lastError": row.last_error
            }))?,
            None => emit(&json!({ "entity": entity, "status": "unanchored" }))?,
        }
    }

    eprintln!("{}", serde_json::to_string(&service.stats())?);
    Ok(())
}

fn emit(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            bail!("--config was provided without a path");
        }
    }
    Ok(None)
}
