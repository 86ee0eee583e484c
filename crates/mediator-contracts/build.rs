use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const CONTRACT_SET: &str = "contracts/v1";

/// One embedded schema: repo-relative path, `title`, sha256 and body.
struct SchemaRow {
    path: String,
    title: String,
    sha256: String,
    body: String,
}

fn main() {
    let manifest_dir =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let repo_root = manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("repo root")
        .to_path_buf();
    let contracts_dir = repo_root.join(CONTRACT_SET);

    println!("cargo:rerun-if-changed={}", contracts_dir.display());

    let mut schema_paths: Vec<PathBuf> = fs::read_dir(&contracts_dir)
        .unwrap_or_else(|e| panic!("failed to read {CONTRACT_SET}: {e}"))
        .filter_map(|entry| entry.ok().map(|v| v.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".schema.json"))
        })
        .collect();
    schema_paths.sort();

    let rows: Vec<SchemaRow> = schema_paths
        .iter()
        .map(|path| {
            println!("cargo:rerun-if-changed={}", path.display());
            load_schema(&repo_root, path)
        })
        .collect();
    check_unique_titles(&rows);

    // The set digest covers path, title and body of every schema, in path order.
    let mut set_hasher = Sha256::new();
    for row in &rows {
        for part in [&row.path, &row.title, &row.body] {
            set_hasher.update(part.as_bytes());
            set_hasher.update([0]);
        }
    }
    let contracts_set_sha = hex(&set_hasher.finalize());
    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut out = String::new();
    out.push_str(&format!(
        "pub const GENERATED_CONTRACTS_SET_SHA256: &str = {contracts_set_sha:?};\n"
    ));
    out.push_str(&format!(
        "pub const GENERATED_AT_RFC3339: &str = {generated_at:?};\n"
    ));
    out.push_str("pub const GENERATED_CONTRACT_SCHEMAS: &[(&str, &str, &str, &str)] = &[\n");
    for row in &rows {
        out.push_str(&format!(
            "    ({:?}, {:?}, {:?}, {:?}),\n",
            row.path, row.title, row.sha256, row.body
        ));
    }
    out.push_str("];\n");

    let out_path = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));
    fs::write(out_path.join("generated_contracts.rs"), out).expect("write generated_contracts.rs");
}

/// Reads one schema and refuses to embed it unless it is a JSON object whose
/// `$id` names its own repo path and which carries a `title`.
fn load_schema(repo_root: &Path, path: &Path) -> SchemaRow {
    let bytes = fs::read(path).unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
    let body = String::from_utf8(bytes)
        .unwrap_or_else(|e| panic!("schema is not valid utf-8 {}: {e}", path.display()));
    let rel = path
        .strip_prefix(repo_root)
        .unwrap_or_else(|e| panic!("failed to strip repo root from {}: {e}", path.display()))
        .to_string_lossy()
        .replace('\\', "/");

    let parsed: Value = serde_json::from_str(&body)
        .unwrap_or_else(|e| panic!("schema is not valid JSON {rel}: {e}"));
    let id = parsed.get("$id").and_then(Value::as_str);
    if id != Some(rel.as_str()) {
        panic!("schema {rel} has $id {id:?}; expected {rel:?}");
    }
    let title = parsed
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| panic!("schema {rel} has no title"))
        .to_string();

    SchemaRow {
        sha256: hex(&Sha256::digest(body.as_bytes())),
        path: rel,
        title,
        body,
    }
}

fn check_unique_titles(rows: &[SchemaRow]) {
    for (i, row) in rows.iter().enumerate() {
        if let Some(dup) = rows[i + 1..].iter().find(|other| other.title == row.title) {
            panic!(
                "schemas {} and {} share the title {:?}",
                row.path, dup.path, row.title
            );
        }
    }
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
