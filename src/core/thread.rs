//! Purpose: Thread identity model, host collaborator trait, and thread relation encoding.
//! Exports: `ThreadInfo`, `ThreadRecord`, `Host`, `LocalHost`, relation builders.
//! Role: Feeds `write_threads`, thread blobs, and (simplified) virtual-thread checkpoints.
//! Invariants: THREAD values share one field layout; simplified records leave name/os id empty.
//! Invariants: Every virtual thread refers to the shared `VIRTUAL_GROUP_ID` group.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::core::buffer::TraceId;
use crate::core::error::Error;
use crate::core::relation::{
    RelationWriter, TYPE_THREAD, TYPE_THREAD_GROUP, ValueReader, ValueWriter,
};
use crate::core::typeset::ClassId;

pub const VIRTUAL_GROUP_ID: u64 = 1;
pub const VIRTUAL_GROUP_NAME: &str = "VirtualThreads";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadInfo {
    pub id: TraceId,
    pub os_id: u64,
    pub name: String,
    pub group_id: u64,
    pub group_name: String,
    pub is_virtual: bool,
}

impl ThreadInfo {
    pub fn carrier(
        id: TraceId,
        name: impl Into<String>,
        group_id: u64,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            os_id: id,
            name: name.into(),
            group_id,
            group_name: group_name.into(),
            is_virtual: false,
        }
    }

    pub fn virtual_thread(id: TraceId, name: impl Into<String>) -> Self {
        Self {
            id,
            os_id: 0,
            name: name.into(),
            group_id: VIRTUAL_GROUP_ID,
            group_name: VIRTUAL_GROUP_NAME.to_string(),
            is_virtual: true,
        }
    }
}

/// Decoded THREAD relation value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadRecord {
    pub id: TraceId,
    pub os_id: u64,
    pub name: String,
    pub group_id: u64,
    pub is_virtual: bool,
    pub carrier: Option<TraceId>,
}

impl ThreadRecord {
    pub fn decode(key: u64, value: &[u8]) -> Result<Self, Error> {
        let mut reader = ValueReader::new(value);
        let os_id = reader.u64()?;
        let name = reader.str()?.to_string();
        let group_id = reader.u64()?;
        let is_virtual = reader.bool()?;
        let carrier = match reader.u64()? {
            0 => None,
            id => Some(id),
        };
        Ok(Self {
            id: key,
            os_id,
            name,
            group_id,
            is_virtual,
            carrier,
        })
    }
}

fn thread_value(
    os_id: u64,
    name: &str,
    group_id: u64,
    is_virtual: bool,
    carrier: Option<TraceId>,
) -> Vec<u8> {
    ValueWriter::new()
        .u64(os_id)
        .str(name)
        .u64(group_id)
        .bool(is_virtual)
        .u64(carrier.unwrap_or(0))
        .finish()
}

fn group_value(name: &str) -> Vec<u8> {
    ValueWriter::new().u64(0).str(name).finish()
}

/// THREAD and THREAD_GROUP relations describing one identity.
pub fn identity_relations(
    info: &ThreadInfo,
    id: TraceId,
    carrier: Option<TraceId>,
) -> Vec<RelationWriter> {
    let mut threads = RelationWriter::new(TYPE_THREAD);
    threads.add(
        id,
        &thread_value(info.os_id, &info.name, info.group_id, info.is_virtual, carrier),
    );
    let mut groups = RelationWriter::new(TYPE_THREAD_GROUP);
    groups.add(info.group_id, &group_value(&info.group_name));
    vec![threads, groups]
}

/// THREAD relation for a virtual thread carrying only its id and the shared group.
pub fn simplified_vthread_relation(vtid: TraceId) -> RelationWriter {
    let mut threads = RelationWriter::new(TYPE_THREAD);
    threads.add(vtid, &thread_value(0, "", VIRTUAL_GROUP_ID, true, None));
    threads
}

/// Live-thread table: one THREAD relation plus the distinct groups.
pub fn thread_table_relations(threads: &[ThreadInfo]) -> Vec<RelationWriter> {
    let mut table = RelationWriter::new(TYPE_THREAD);
    let mut groups = BTreeMap::new();
    for info in threads {
        table.add(
            info.id,
            &thread_value(info.os_id, &info.name, info.group_id, info.is_virtual, None),
        );
        groups.entry(info.group_id).or_insert(info.group_name.as_str());
    }
    let mut group_relation = RelationWriter::new(TYPE_THREAD_GROUP);
    for (group_id, name) in groups {
        group_relation.add(group_id, &group_value(name));
    }
    vec![table, group_relation]
}

/// Runtime collaborators consulted by the manager.
pub trait Host: Send + Sync {
    /// Snapshot of the thread registry.
    fn live_threads(&self) -> Vec<ThreadInfo>;

    /// Classes whose metadata is about to be purged.
    fn unloading_classes(&self) -> Vec<ClassId>;
}

/// In-process host registry used by the CLI and tests.
#[derive(Debug, Default)]
pub struct LocalHost {
    threads: Mutex<BTreeMap<TraceId, ThreadInfo>>,
    unloading: Mutex<BTreeSet<ClassId>>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, info: ThreadInfo) {
        if let Ok(mut threads) = self.threads.lock() {
            threads.insert(info.id, info);
        }
    }

    pub fn detach(&self, id: TraceId) -> Option<ThreadInfo> {
        self.threads.lock().ok().and_then(|mut threads| threads.remove(&id))
    }

    pub fn mark_unloading(&self, classes: impl IntoIterator<Item = ClassId>) {
        if let Ok(mut unloading) = self.unloading.lock() {
            unloading.extend(classes);
        }
    }

    pub fn finish_unloading(&self) {
        if let Ok(mut unloading) = self.unloading.lock() {
            unloading.clear();
        }
    }
}

impl Host for LocalHost {
    fn live_threads(&self) -> Vec<ThreadInfo> {
        self.threads
            .lock()
            .map(|threads| threads.values().cloned().collect())
            .unwrap_or_default()
    }

    fn unloading_classes(&self) -> Vec<ClassId> {
        self.unloading
            .lock()
            .map(|unloading| unloading.iter().copied().collect())
            .unwrap_or_default()
    }
}
