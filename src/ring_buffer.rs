//! Shared-memory SPSC ring buffer: the only channel between a worker
//! process and the coordinator/aggregator. One file-backed `mmap` region per
//! worker carries three things: a header, a 64-byte command block the
//! coordinator writes and the worker reads, and a fixed ring of 32-byte
//! request-metric slots the worker writes and the aggregator reads.
//!
//! Built on `memmap2`'s `MmapMut` plus the atomic-counter producer/consumer
//! idiom; backed by an anonymous `tempfile` rather than `shm_open`, so the
//! implementation stays portable across platforms.
//!
//! The producer never reads `read_index` and never blocks: on overflow it
//! simply keeps overwriting the oldest unread slots. Detecting the loss is
//! entirely the consumer's job, from the gap between its own `read_index`
//! and the producer's `write_index` — there is no producer-side drop
//! counter in shared memory, since the producer has no way to know what the
//! consumer has or hasn't read yet.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::errors::ErrorCategory;
use crate::metrics_model::{Method, RequestMetric};

/// Number of request slots per worker's ring. At 32 bytes/slot this is a
/// 2 MiB ring, generous relative to the 1 Hz drain cadence.
pub const RING_CAPACITY: u64 = 65_536;

/// Wire size of one `RequestMetric`.
pub const SLOT_SIZE: usize = 32;

const HEADER_SIZE: usize = 64;
const COMMAND_BLOCK_SIZE: usize = 64;
const RING_BYTES: usize = RING_CAPACITY as usize * SLOT_SIZE;
const REGION_SIZE: usize = HEADER_SIZE + COMMAND_BLOCK_SIZE + RING_BYTES;

#[repr(C)]
struct Header {
    write_idx: AtomicU64,
    heartbeat_unix_ms: AtomicU64,
    worker_id: AtomicU32,
    capacity: AtomicU32,
    /// Live virtual-user count this worker is currently running, kept
    /// current by the worker as virtual users spawn and wind down.
    active_users: AtomicU32,
    _padding: [u8; HEADER_SIZE - 8 - 8 - 4 - 4 - 4],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// The coordinator-to-worker command channel, packed into the same region as
/// the metrics ring: the only shared mutable memory is this block plus the
/// ring buffer and heartbeat slot, kept as a second fixed block in the same
/// mapping rather than a separate IPC primitive.
#[repr(C)]
struct CommandBlock {
    target_concurrency: AtomicU32,
    stop_requested: AtomicBool,
    _pad0: [u8; 3],
    generation: AtomicU32,
    _padding: [u8; COMMAND_BLOCK_SIZE - 4 - 4 - 4],
}

const _: () = assert!(std::mem::size_of::<CommandBlock>() == COMMAND_BLOCK_SIZE);

fn header_ptr(mmap: &MmapMut) -> *const Header {
    mmap.as_ptr() as *const Header
}

fn command_ptr(mmap: &MmapMut) -> *const CommandBlock {
    unsafe { mmap.as_ptr().add(HEADER_SIZE) as *const CommandBlock }
}

fn slot_ptr(mmap: &MmapMut, index: u64) -> *mut u8 {
    let offset = HEADER_SIZE + COMMAND_BLOCK_SIZE + (index % RING_CAPACITY) as usize * SLOT_SIZE;
    unsafe { mmap.as_ptr().add(offset) as *mut u8 }
}

// Binary layout, network byte order (big-endian): 0:timestamp(8)
// 8:latency_ms(4) 12:status_code(2) 14:content_length(4) 18:name_hash(8)
// 26:worker_id(1) 27:error_category(1) 28:method_code(1) 29:reserved(3).
fn encode_slot(buf: &mut [u8; SLOT_SIZE], metric: &RequestMetric) {
    buf[0..8].copy_from_slice(&metric.timestamp.to_be_bytes());
    buf[8..12].copy_from_slice(&metric.latency_ms.to_be_bytes());
    buf[12..14].copy_from_slice(&metric.status_code.to_be_bytes());
    buf[14..18].copy_from_slice(&metric.content_length.to_be_bytes());
    buf[18..26].copy_from_slice(&metric.name_hash.to_be_bytes());
    buf[26] = metric.worker_id;
    buf[27] = metric.error_category.as_u8();
    buf[28] = metric.method.as_u8();
    // bytes 29..32 reserved/padding
}

fn decode_slot(buf: &[u8; SLOT_SIZE]) -> RequestMetric {
    RequestMetric {
        timestamp: f64::from_be_bytes(buf[0..8].try_into().unwrap()),
        latency_ms: f32::from_be_bytes(buf[8..12].try_into().unwrap()),
        status_code: u16::from_be_bytes(buf[12..14].try_into().unwrap()),
        content_length: u32::from_be_bytes(buf[14..18].try_into().unwrap()),
        name_hash: u64::from_be_bytes(buf[18..26].try_into().unwrap()),
        worker_id: buf[26],
        error_category: ErrorCategory::from_u8(buf[27]),
        method: Method::from_u8(buf[28]),
    }
}

/// The worker-side handle: creates and owns the backing file, writes
/// records, and reads commands.
pub struct RingBufferProducer {
    mmap: MmapMut,
}

/// The coordinator/aggregator-side handle: opens an existing region by
/// path, reads records, and writes commands. Keeps its own `read_idx` in
/// process memory rather than shared state.
pub struct RingBufferConsumer {
    mmap: MmapMut,
    read_idx: u64,
}

// SAFETY: the header, command block, and slots are only ever accessed
// through their atomic fields (`AtomicU64`/`AtomicU32`/`AtomicBool`), which
// are `Send + Sync` by construction; the raw byte payload within a slot is
// only read after an `Acquire` load observes the producer's `Release` store
// of `write_idx`, establishing a happens-before edge across the process
// boundary exactly as it would across threads.
unsafe impl Send for RingBufferProducer {}
unsafe impl Send for RingBufferConsumer {}

impl RingBufferProducer {
    /// Creates a new backing file at `path`, sized and zeroed for one ring
    /// region, and maps it.
    pub fn create(path: &Path, worker_id: u8) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(REGION_SIZE as u64)?;
        let mmap = unsafe { MmapOptions::new().len(REGION_SIZE).map_mut(&file)? };

        let producer = Self { mmap };
        let header = unsafe { &*header_ptr(&producer.mmap) };
        header.worker_id.store(worker_id as u32, Ordering::Relaxed);
        header.capacity.store(RING_CAPACITY as u32, Ordering::Relaxed);
        Ok(producer)
    }

    fn header(&self) -> &Header {
        unsafe { &*header_ptr(&self.mmap) }
    }

    fn command(&self) -> &CommandBlock {
        unsafe { &*command_ptr(&self.mmap) }
    }

    /// Writes one record and release-stores `write_idx + 1`. Never blocks,
    /// never reads `read_idx`: on a full ring this simply overwrites the
    /// oldest unread slot.
    pub fn push(&self, metric: &RequestMetric) {
        let header = self.header();
        let write_idx = header.write_idx.load(Ordering::Relaxed);

        let mut buf = [0u8; SLOT_SIZE];
        encode_slot(&mut buf, metric);
        let ptr = slot_ptr(&self.mmap, write_idx);
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, SLOT_SIZE) };

        header.write_idx.store(write_idx.wrapping_add(1), Ordering::Release);
    }

    pub fn heartbeat(&self, unix_ms: u64) {
        self.header().heartbeat_unix_ms.store(unix_ms, Ordering::Relaxed);
    }

    /// Publishes this worker's current count of running virtual users, so
    /// the coordinator can sum live concurrency across the fleet instead of
    /// just counting healthy worker processes.
    pub fn set_active_users(&self, count: u32) {
        self.header().active_users.store(count, Ordering::Relaxed);
    }

    /// Reads the coordinator's current command, if the generation has
    /// advanced since `last_seen_generation`.
    pub fn poll_command(&self, last_seen_generation: u32) -> Option<(u32, bool, u32)> {
        let cmd = self.command();
        let generation = cmd.generation.load(Ordering::Acquire);
        if generation == last_seen_generation {
            return None;
        }
        Some((
            cmd.target_concurrency.load(Ordering::Relaxed),
            cmd.stop_requested.load(Ordering::Relaxed),
            generation,
        ))
    }
}

impl RingBufferConsumer {
    /// Opens an existing region written by a `RingBufferProducer`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().len(REGION_SIZE).map_mut(&file)? };
        Ok(Self { mmap, read_idx: 0 })
    }

    fn header(&self) -> &Header {
        unsafe { &*header_ptr(&self.mmap) }
    }

    fn command(&self) -> &CommandBlock {
        unsafe { &*command_ptr(&self.mmap) }
    }

    /// Drains every record the producer has written since the last drain.
    /// If the gap between `write_idx` and this consumer's `read_idx` exceeds
    /// `RING_CAPACITY`, the ring has wrapped past what was read: the lost
    /// span is skipped and its size returned as the drop count.
    pub fn drain(&mut self) -> (Vec<RequestMetric>, u64) {
        let write_idx = self.header().write_idx.load(Ordering::Acquire);
        let gap = write_idx.wrapping_sub(self.read_idx);

        let dropped = if gap > RING_CAPACITY {
            let skipped = gap - RING_CAPACITY;
            self.read_idx = write_idx.wrapping_sub(RING_CAPACITY);
            skipped
        } else {
            0
        };

        let mut out = Vec::with_capacity((write_idx.wrapping_sub(self.read_idx)) as usize);
        while self.read_idx != write_idx {
            let ptr = slot_ptr(&self.mmap, self.read_idx);
            let mut buf = [0u8; SLOT_SIZE];
            unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), SLOT_SIZE) };
            out.push(decode_slot(&buf));
            self.read_idx = self.read_idx.wrapping_add(1);
        }

        (out, dropped)
    }

    pub fn heartbeat_unix_ms(&self) -> u64 {
        self.header().heartbeat_unix_ms.load(Ordering::Relaxed)
    }

    pub fn worker_id(&self) -> u8 {
        self.header().worker_id.load(Ordering::Relaxed) as u8
    }

    /// This worker's most recently published count of running virtual
    /// users.
    pub fn active_users(&self) -> u32 {
        self.header().active_users.load(Ordering::Relaxed)
    }

    /// Publishes a new target concurrency and/or stop request, bumping the
    /// generation so the worker's next poll observes it.
    pub fn send_command(&self, target_concurrency: u32, stop_requested: bool) {
        let cmd = self.command();
        cmd.target_concurrency.store(target_concurrency, Ordering::Relaxed);
        cmd.stop_requested.store(stop_requested, Ordering::Relaxed);
        cmd.generation.fetch_add(1, Ordering::Release);
    }
}
