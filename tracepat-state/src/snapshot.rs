//! Store snapshots.
//!
//! A snapshot is the full interval history of every written attribute,
//! serialized as JSON. A metadata sidecar (`<file>.meta.json`) carries the
//! CRC32C of the snapshot bytes and is checked on load.

use crate::error::StateError;
use crate::store::{Interval, MemoryStateStore, Quark, StateStore};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// History of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSnapshot {
    pub path: Vec<String>,
    pub intervals: Vec<Interval>,
}

/// A point-in-time copy of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub start_time: i64,
    pub end_time: i64,
    pub attributes: Vec<AttributeSnapshot>,
    /// Creation timestamp (Unix millis).
    pub created_at: i64,
}

/// Snapshot metadata stored alongside the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub attribute_count: usize,
    pub end_time: i64,
    pub created_at: i64,
    pub size_bytes: u64,
    pub checksum: String,
}

impl StoreSnapshot {
    /// Copies every written attribute of `store`, depth first in name order.
    pub fn capture<S: StateStore + ?Sized>(store: &S) -> Result<Self, StateError> {
        let mut attributes = Vec::new();
        let mut stack: Vec<(Quark, Vec<String>)> = vec![(Quark::ROOT, Vec::new())];

        while let Some((quark, path)) = stack.pop() {
            let intervals = store.query_history(quark)?;
            if !intervals.is_empty() {
                attributes.push(AttributeSnapshot {
                    path: path.clone(),
                    intervals,
                });
            }
            for child in store.sub_attributes(quark)?.into_iter().rev() {
                let mut child_path = path.clone();
                child_path.push(store.attribute_name(child)?);
                stack.push((child, child_path));
            }
        }

        Ok(Self {
            start_time: store.start_time(),
            end_time: store.current_end_time(),
            attributes,
            created_at: now_millis(),
        })
    }

    /// Rebuilds an in-memory store from the snapshot.
    pub fn restore(&self) -> Result<MemoryStateStore, StateError> {
        MemoryStateStore::from_parts(
            self.start_time,
            self.end_time,
            self.attributes
                .iter()
                .map(|a| (a.path.clone(), a.intervals.clone())),
        )
    }

    /// Writes the snapshot and its metadata sidecar.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<SnapshotMeta, StateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(self)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&data));

        let mut file = File::create(path)?;
        file.write_all(&data)?;
        file.sync_all()?;

        let meta = SnapshotMeta {
            attribute_count: self.attributes.len(),
            end_time: self.end_time,
            created_at: self.created_at,
            size_bytes: data.len() as u64,
            checksum,
        };

        let writer = BufWriter::new(File::create(meta_path(path))?);
        serde_json::to_writer_pretty(writer, &meta)?;

        tracing::info!(
            "Saved store snapshot to {} ({} attributes, end time {})",
            path.display(),
            meta.attribute_count,
            meta.end_time
        );

        Ok(meta)
    }

    /// Loads a snapshot, verifying its checksum when a sidecar is present.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let sidecar = meta_path(path);
        if sidecar.exists() {
            let meta: SnapshotMeta = serde_json::from_reader(BufReader::new(File::open(&sidecar)?))?;
            let actual = format!("{:08x}", crc32c::crc32c(&data));
            if actual != meta.checksum {
                return Err(StateError::Corruption(format!(
                    "snapshot {} checksum mismatch (expected {}, got {})",
                    path.display(),
                    meta.checksum,
                    actual
                )));
            }
        } else {
            tracing::warn!(
                "No metadata for snapshot {}, skipping checksum verification",
                path.display()
            );
        }

        Ok(serde_json::from_slice(&data)?)
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
