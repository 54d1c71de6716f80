//! Persistence
//!
//! Two stores back a project:
//!
//! - **Snapshots** capture the whole arena — networks, instances with
//!   their value trees, connections, and in-flight commands — in one
//!   MessagePack document. Writes are atomic (tmp file + rename) and
//!   retried with backoff; reads are fatal on failure. Serialization is
//!   deterministic, so two equal arenas produce byte-identical files.
//! - **Scratch** is a small append-only key/value log instances can use
//!   for data that must survive restarts but does not belong in a value
//!   tree (e.g. accumulated measurements). Each put appends one record;
//!   open replays the log, last write per key winning.
//!
//! Callbacks never see either store directly; they get a persistent
//! directory and the engine checkpoints around them.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::engine::command::{CommandId, Completion, DispatchedCommand};
use crate::error::{Error, Result};
use crate::func::FunctionRegistry;
use crate::net::{
    ActiveConnection, ActiveInstance, ActiveNetwork, ConnId, FiringState, InstanceId,
    NetworkArena, NetworkId,
};
use crate::value::{Value, Version};

/// One instance as stored in a snapshot. Identical to [`ActiveInstance`]
/// except that the function definition is referenced by name and rebound
/// against the registry on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub name: String,
    pub network: NetworkId,
    pub function: String,
    pub inputs: Value,
    pub outputs: Value,
    pub sub_inputs: Option<Value>,
    pub sub_outputs: Option<Value>,
    pub state: FiringState,
    pub last_fired: Version,
    pub fire_count: u64,
    pub persistent_dir: PathBuf,
    pub outstanding: Vec<CommandId>,
    pub inbox: VecDeque<Completion>,
    pub last_error: Option<String>,
    pub last_warning: Option<String>,
    pub subnet: Option<NetworkId>,
    pub created: u64,
    pub outgoing: Vec<ConnId>,
}

impl InstanceSnapshot {
    pub fn from_instance(inst: &ActiveInstance) -> Self {
        Self {
            id: inst.id,
            name: inst.name.clone(),
            network: inst.network,
            function: inst.def.name().to_string(),
            inputs: inst.inputs.clone(),
            outputs: inst.outputs.clone(),
            sub_inputs: inst.sub_inputs.clone(),
            sub_outputs: inst.sub_outputs.clone(),
            state: inst.state,
            last_fired: inst.last_fired,
            fire_count: inst.fire_count,
            persistent_dir: inst.persistent_dir.clone(),
            outstanding: inst.outstanding.clone(),
            inbox: inst.inbox.clone(),
            last_error: inst.last_error.clone(),
            last_warning: inst.last_warning.clone(),
            subnet: inst.subnet,
            created: inst.created,
            outgoing: inst.outgoing.clone(),
        }
    }

    fn into_instance(self, funcs: &FunctionRegistry) -> Result<ActiveInstance> {
        let def = funcs.lookup(&self.function)?;
        Ok(ActiveInstance {
            id: self.id,
            name: self.name,
            network: self.network,
            def,
            inputs: self.inputs,
            outputs: self.outputs,
            sub_inputs: self.sub_inputs,
            sub_outputs: self.sub_outputs,
            state: self.state,
            last_fired: self.last_fired,
            fire_count: self.fire_count,
            persistent_dir: self.persistent_dir,
            outstanding: self.outstanding,
            inbox: self.inbox,
            last_error: self.last_error,
            last_warning: self.last_warning,
            subnet: self.subnet,
            created: self.created,
            outgoing: self.outgoing,
        })
    }
}

/// A full checkpoint of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub clock: Version,
    pub root: NetworkId,
    pub networks: Vec<ActiveNetwork>,
    pub instances: Vec<InstanceSnapshot>,
    pub connections: Vec<ActiveConnection>,
    /// In-flight commands by owning instance; reissued on restore.
    pub pending: Vec<(InstanceId, DispatchedCommand)>,
    pub next_cmd: u64,
}

impl Snapshot {
    /// Rebuild an arena in place. Every function named in the snapshot
    /// must exist in the registry; a missing one fails the restore.
    pub fn restore_arena(&self, funcs: &FunctionRegistry, arena: &mut NetworkArena) -> Result<()> {
        arena.networks = self.networks.clone();
        arena.connections = self.connections.clone();
        arena.instances = self
            .instances
            .iter()
            .cloned()
            .map(|snap| snap.into_instance(funcs))
            .collect::<Result<Vec<_>>>()?;
        arena.restore_created_counter();
        Ok(())
    }
}

/// Serialize a snapshot to its on-disk byte form.
pub fn snapshot_bytes(snapshot: &Snapshot) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(snapshot)?)
}

const WRITE_ATTEMPTS: u32 = 3;

/// Write a snapshot atomically: serialize, write a sibling tmp file,
/// rename over the target. Transient failures are retried with backoff.
pub fn write_snapshot(path: &FsPath, snapshot: &Snapshot) -> Result<()> {
    let bytes = snapshot_bytes(snapshot)?;
    let tmp = path.with_extension("tmp");

    let mut last_err = None;
    for attempt in 0..WRITE_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
        }
        match try_write(&tmp, path, &bytes) {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(attempt, error = %err, "snapshot write failed; retrying");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Persistence("snapshot write failed".to_string())))
}

fn try_write(tmp: &FsPath, path: &FsPath, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

/// Read a snapshot back. Any failure here is fatal to the restore.
pub fn read_snapshot(path: &FsPath) -> Result<Snapshot> {
    let bytes = fs::read(path)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

/// One record of the scratch log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScratchRecord {
    key: String,
    value: Value,
}

/// An append-only key/value log, replayed on open.
pub struct Scratch {
    path: PathBuf,
    entries: IndexMap<String, Value>,
}

impl Scratch {
    /// Open or create a scratch log. Existing records are replayed in
    /// order; the last write per key wins.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = IndexMap::new();
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            loop {
                match rmp_serde::decode::from_read::<_, ScratchRecord>(&mut reader) {
                    Ok(record) => {
                        entries.insert(record.key, record.value);
                    }
                    Err(rmp_serde::decode::Error::InvalidMarkerRead(ref io))
                        if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(Self { path, entries })
    }

    /// Append one record and update the in-memory view.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let record = ScratchRecord {
            key: key.into(),
            value,
        };
        let bytes = rmp_serde::to_vec(&record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&bytes)?;
        self.entries.insert(record.key, record.value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.log");

        let mut scratch = Scratch::open(&path).unwrap();
        assert!(scratch.is_empty());
        scratch.put("count", Value::int(1)).unwrap();
        scratch.put("label", Value::string("tune")).unwrap();
        scratch.put("count", Value::int(2)).unwrap();
        drop(scratch);

        let scratch = Scratch::open(&path).unwrap();
        assert_eq!(scratch.len(), 2);
        assert_eq!(
            scratch.get("count").and_then(|v| v.payload()),
            Some(&crate::value::Payload::Int(2))
        );
        assert_eq!(
            scratch.get("label").and_then(|v| v.payload()),
            Some(&crate::value::Payload::Str("tune".to_string()))
        );
    }

    #[test]
    fn snapshot_write_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.snapshot");
        let snap = Snapshot {
            clock: Version(7),
            root: NetworkId(0),
            networks: Vec::new(),
            instances: Vec::new(),
            connections: Vec::new(),
            pending: Vec::new(),
            next_cmd: 1,
        };

        write_snapshot(&path, &snap).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let back = read_snapshot(&path).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn equal_snapshots_serialize_identically() {
        let snap = Snapshot {
            clock: Version(3),
            root: NetworkId(0),
            networks: Vec::new(),
            instances: Vec::new(),
            connections: Vec::new(),
            pending: Vec::new(),
            next_cmd: 1,
        };
        assert_eq!(
            snapshot_bytes(&snap).unwrap(),
            snapshot_bytes(&snap.clone()).unwrap()
        );
    }

    #[test]
    fn missing_snapshot_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_snapshot(&dir.path().join("absent.snapshot"));
        assert!(matches!(err, Err(Error::Persistence(_))));
    }
}
