//! Purpose: JSON rendering of chunk inspection results for the CLI.
//! Exports: `inspect_chunk`.
//! Role: Keep the inspect envelope shape in one place.
//! Invariants: Stable key names; `constants` is emitted only when requested.
//! Invariants: Times are RFC 3339 strings derived from entry nanosecond timestamps.
use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use ckpool::api::{ChunkSummary, ConstantTable, Error, MappedChunk, ThreadRecord, TypeId};

pub(crate) fn inspect_chunk(path: &Path, constants: bool) -> Result<Value, Error> {
    let chunk = MappedChunk::open(path)?;
    let bytes = chunk.bytes();
    let summary = ChunkSummary::scan(bytes).map_err(|err| err.with_path(path))?;

    let mut map = Map::new();
    map.insert("path".to_string(), json!(path.display().to_string()));
    map.insert("sha256".to_string(), json!(sha256_hex(bytes)));
    map.insert("summary".to_string(), summary_json(&summary));
    if constants {
        let table = ConstantTable::from_chunk(bytes).map_err(|err| err.with_path(path))?;
        map.insert("constants".to_string(), constants_json(&table)?);
    }
    Ok(Value::Object(map))
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn format_ns(ns: u64) -> Option<String> {
    let ts = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ns)).ok()?;
    ts.format(&Rfc3339).ok()
}

fn summary_json(summary: &ChunkSummary) -> Value {
    let types: Map<String, Value> = summary
        .types
        .iter()
        .map(|(type_id, count)| {
            (
                type_name(*type_id),
                json!({ "segments": count.segments, "constants": count.constants }),
            )
        })
        .collect();
    json!({
        "bytes": summary.bytes,
        "entries": summary.entries,
        "flushpoints": summary.flushpoints,
        "checkpoints": summary.checkpoints,
        "segments": summary.segments,
        "constants": summary.constants,
        "types": types,
        "first_start": summary.first_start.and_then(format_ns),
        "last_end": summary.last_end.and_then(format_ns),
    })
}

fn type_name(type_id: TypeId) -> String {
    use ckpool::api::{
        TYPE_CLASS, TYPE_STACK_FRAME, TYPE_SYMBOL, TYPE_THREAD, TYPE_THREAD_GROUP,
        TYPE_THREAD_STATE,
    };
    match type_id {
        TYPE_THREAD => "thread".to_string(),
        TYPE_THREAD_GROUP => "thread_group".to_string(),
        TYPE_THREAD_STATE => "thread_state".to_string(),
        TYPE_CLASS => "class".to_string(),
        TYPE_SYMBOL => "symbol".to_string(),
        TYPE_STACK_FRAME => "stack_frame".to_string(),
        other => format!("type_{other}"),
    }
}

fn thread_json(record: &ThreadRecord) -> Value {
    json!({
        "id": record.id,
        "os_id": record.os_id,
        "name": record.name,
        "group_id": record.group_id,
        "virtual": record.is_virtual,
        "carrier": record.carrier,
    })
}

fn constants_json(table: &ConstantTable) -> Result<Value, Error> {
    let threads: Vec<Value> = table.threads()?.iter().map(thread_json).collect();
    let mut by_type: BTreeMap<TypeId, (u64, u64)> = BTreeMap::new();
    for (type_id, _, value) in table.iter() {
        let totals = by_type.entry(type_id).or_default();
        totals.0 += 1;
        totals.1 += value.len() as u64;
    }
    let types: Map<String, Value> = by_type
        .into_iter()
        .map(|(type_id, (count, value_bytes))| {
            (
                type_name(type_id),
                json!({ "count": count, "value_bytes": value_bytes }),
            )
        })
        .collect();
    Ok(json!({
        "distinct": table.len(),
        "types": types,
        "threads": threads,
    }))
}
