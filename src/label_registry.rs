//! Endpoint label registry: maps the `name_hash` a worker stamps onto a
//! `RequestMetric` back to a human-readable `EndpointLabel`, and resolves
//! hash collisions between distinct names.
//!
//! Workers register a label the first time they hit a new endpoint and
//! thereafter only ever send the hash; the aggregator is the only reader of
//! the registry's name side. Registration flows through a bounded MPSC
//! channel rather than shared memory, since labels are registered rarely
//! (once per distinct endpoint, not once per request) and never need the
//! ring buffer's throughput.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::metrics_model::{fnv1a_hash, EndpointLabel, Method};

/// Channel capacity for label registrations. Endpoint counts are expected to
/// stay in the tens to low hundreds for any one scenario, so this is
/// generous headroom rather than a tuned value.
pub const LABEL_CHANNEL_CAPACITY: usize = 1024;

pub fn label_channel() -> (mpsc::Sender<EndpointLabel>, mpsc::Receiver<EndpointLabel>) {
    mpsc::channel(LABEL_CHANNEL_CAPACITY)
}

/// Registers `(name, method)` pairs by their FNV-1a hash, and tracks the rare
/// collision between two distinct names: the first registrant wins the bare
/// hash, the colliding name is suffixed with `#<n>`, and a
/// `label_collisions` counter is incremented.
#[derive(Debug, Default)]
pub struct LabelRegistry {
    by_hash: HashMap<u64, EndpointLabel>,
    by_name: HashMap<String, u64>,
    collisions: u64,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` for `method`, returning the (possibly suffixed) hash
    /// to use from here on. Idempotent: re-registering the same
    /// `(name, method)` pair returns the same hash without recording a new
    /// collision.
    pub fn register(&mut self, name: &str, method: Method) -> u64 {
        if let Some(&hash) = self.by_name.get(&Self::key(name, method)) {
            return hash;
        }

        let mut hash = fnv1a_hash(name);
        let mut candidate_name = name.to_string();
        let mut suffix = 1u32;
        while let Some(existing) = self.by_hash.get(&hash) {
            if existing.name == candidate_name && existing.method == method {
                break;
            }
            self.collisions += 1;
            candidate_name = format!("{name}#{suffix}");
            hash = fnv1a_hash(&candidate_name);
            suffix += 1;
        }

        self.by_hash.insert(
            hash,
            EndpointLabel {
                hash,
                name: candidate_name.clone(),
                method,
            },
        );
        self.by_name.insert(Self::key(name, method), hash);
        hash
    }

    pub fn resolve(&self, hash: u64) -> Option<&EndpointLabel> {
        self.by_hash.get(&hash)
    }

    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    fn key(name: &str, method: Method) -> String {
        format!("{}:{name}", method.as_u8())
    }

    /// Drains any pending registrations off `receiver` without blocking,
    /// applying each to this registry. Used by the aggregator once per tick,
    /// before building a `MetricSnapshot`.
    pub fn drain(&mut self, receiver: &mut mpsc::Receiver<EndpointLabel>) {
        while let Ok(label) = receiver.try_recv() {
            // A label arriving here was already hash-resolved by whichever
            // worker first saw it; trust it unless the hash is already
            // claimed by a different name, in which case re-run collision
            // resolution under this registry's view.
            match self.by_hash.get(&label.hash) {
                Some(existing) if existing.name == label.name && existing.method == label.method => {}
                Some(_) => {
                    self.register(&label.name, label.method);
                }
                None => {
                    self.by_hash.insert(label.hash, label.clone());
                    self.by_name
                        .insert(Self::key(&label.name, label.method), label.hash);
                }
            }
        }
    }
}

/// Derives the label mailbox path for a worker's ring buffer file, by
/// swapping its extension. Labels are rare (at most a few hundred per run)
/// and don't need the ring buffer's throughput, so a newline-delimited JSON
/// file sitting next to the mmap region is enough of a cross-process
/// channel without a second shared-memory layout.
pub fn label_mailbox_path(ring_path: &Path) -> PathBuf {
    ring_path.with_extension("labels")
}

/// Worker-side handle: appends one JSON line per newly-registered label.
pub struct LabelMailboxWriter {
    file: File,
}

impl LabelMailboxWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn write(&mut self, label: &EndpointLabel) -> io::Result<()> {
        let line = serde_json::to_string(label).unwrap_or_default();
        writeln!(self.file, "{line}")?;
        self.file.flush()
    }
}

/// Aggregator-side handle: tails the mailbox file, returning only lines
/// appended since the last poll.
pub struct LabelMailboxReader {
    path: PathBuf,
    offset: u64,
}

impl LabelMailboxReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            offset: 0,
        }
    }

    /// Reads any complete lines appended since the last call. Missing file
    /// (worker hasn't registered a label yet) is treated as "nothing new".
    pub fn poll(&mut self) -> Vec<EndpointLabel> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            return Vec::new();
        }

        // Only consume complete lines; a partial trailing line is re-read
        // on the next poll once the writer finishes it.
        let last_newline = match buf.rfind('\n') {
            Some(idx) => idx,
            None => return Vec::new(),
        };
        self.offset += (last_newline + 1) as u64;

        buf[..=last_newline]
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}
