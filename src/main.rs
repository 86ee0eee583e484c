use std::env;

use mediator_contracts::{contracts_manifest_v1, IngestRequest};
use mediator_pipeline::observability::{init_logging, LogFormat};
use mediator_pipeline::{open_store, Clock, GateConfig, IdempotencyGate, SystemClock};
use serde_json::json;

const USAGE: &str = "Usage: mediator ingest --config <path> --events <jsonl>\n       mediator contracts";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();

    let mut config_path = String::from("./config/example-config.yaml");
    let mut events_path: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = args.next() {
                    config_path = v;
                }
            }
            "--events" => events_path = args.next(),
            _ => {}
        }
    }

    match cmd.as_str() {
        "contracts" => print_contracts(),
        "ingest" => {
            let Some(events_path) = events_path else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            if let Err(e) = ingest(&config_path, &events_path).await {
                eprintln!("ingest failed: {e}");
                std::process::exit(1);
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

fn print_contracts() {
    let manifest = contracts_manifest_v1();
    let schemas: Vec<_> = manifest
        .schemas
        .iter()
        .map(|s| json!({ "path": s.path, "title": s.title, "sha256": s.sha256 }))
        .collect();
    let body = json!({
        "contractVersion": manifest.contract_version,
        "contractsSetSha256": manifest.contracts_set_sha256,
        "generatedAt": manifest.generated_at,
        "schemas": schemas,
    });
    println!("{body}");
}

/// Runs every line of a JSONL file through the idempotency gate and prints
/// one outcome per line.
async fn ingest(config_path: &str, events_path: &str) -> Result<(), String> {
    let cfg = mediator_config::load_and_validate(config_path)
        .map_err(|e| format!("failed to load config: {e}"))?;
    init_logging(LogFormat::from_config(&cfg.logging.format));

    let store = open_store(&cfg).map_err(|e| e.to_string())?;
    let gate = IdempotencyGate::new(store, GateConfig::from_config(&cfg.gate));
    let clock = SystemClock;

    let events = std::fs::read_to_string(events_path)
        .map_err(|e| format!("failed to read {events_path}: {e}"))?;
    for (idx, line) in events.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let request: IngestRequest = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(line = idx + 1, error = %e, "skipping malformed ingest line");
                println!("{}", json!({ "line": idx + 1, "error": e.to_string() }));
                continue;
            }
        };
        let outcome = gate
            .evaluate(&request, clock.now_ms())
            .await
            .map_err(|e| format!("line {}: {e}", idx + 1))?;
        let rendered = serde_json::to_string(&outcome).map_err(|e| e.to_string())?;
        println!("{rendered}");
    }
    Ok(())
}
