//! Chunked append-only store.
//!
//! A store is a single file addressed by 40-bit offsets, mapped (or heap
//! allocated, for tests) in fixed-size chunks. Allocation only ever moves
//! forward; once `alloc` returns, the bytes at that offset are valid for the
//! life of the file. The only in-place mutation allowed after publication is
//! the file header (magic and size field), via [`Stor::write`].
//!
//! Block framing:
//! ```text
//! [len:2|3][payload][crc32c:4]
//! ```
//! The length prefix is 2 bytes for payloads under 32 KiB, else 3 bytes
//! (high bit of the 16-bit prefix marks the long form). The checksum covers
//! the prefix and payload.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};

use crate::cksum;

/// Default chunk size: 64 MiB.
pub const CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Allocations are aligned to 8 bytes.
pub const ALIGN: u64 = 8;

/// Offsets are stored on disk in 5 bytes (40 bits).
pub const SMALL_OFFSET_LEN: usize = 5;

const MAX_SIZED: usize = (1 << 23) - 1;

#[derive(Debug, thiserror::Error)]
pub enum StorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store corrupt: {0}")]
    Corrupt(&'static str),
}

enum Chunk {
    Heap(Box<[u8]>),
    Map(MmapMut),
    MapRo(Mmap),
}

impl Chunk {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Chunk::Heap(b) => b.as_ptr(),
            Chunk::Map(m) => m.as_ptr(),
            Chunk::MapRo(m) => m.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Chunk::Heap(b) => b.len(),
            Chunk::Map(m) => m.len(),
            Chunk::MapRo(m) => m.len(),
        }
    }
}

enum Backing {
    Heap,
    File(File),
}

/// Append-only chunked store.
///
/// Safety model: a chunk's memory address is stable from the moment the
/// chunk is created until [`Stor::close`] (boxed slices and mmap regions do
/// not move when the chunk vector reallocates). A region returned by `alloc`
/// is exclusively owned by the caller until it is published (its offset
/// handed to another component), and published regions are never written
/// again. That discipline is what makes the `&self` slice handouts below
/// sound.
pub struct Stor {
    chunk_size: u64,
    backing: Backing,
    read_only: bool,
    chunks: RwLock<Vec<Chunk>>,
    size: AtomicU64,
    alloc_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Stor {
    /// In-memory store for tests, with a reduced chunk size.
    pub fn heap(chunk_size: usize) -> Self {
        Stor {
            chunk_size: chunk_size as u64,
            backing: Backing::Heap,
            read_only: false,
            chunks: RwLock::new(vec![Chunk::Heap(
                vec![0u8; chunk_size].into_boxed_slice(),
            )]),
            size: AtomicU64::new(0),
            alloc_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a new store file. Fails if the file already has content.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(CHUNK_SIZE as u64)?;
        let chunk = unsafe { MmapOptions::new().len(CHUNK_SIZE).map_mut(&file)? };
        Ok(Stor {
            chunk_size: CHUNK_SIZE as u64,
            backing: Backing::File(file),
            read_only: false,
            chunks: RwLock::new(vec![Chunk::Map(chunk)]),
            size: AtomicU64::new(0),
            alloc_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Open an existing store file.
    ///
    /// The logical size starts as the file length; callers that discover a
    /// more trustworthy size (header field or recovery scan) adjust it with
    /// [`Stor::set_size`].
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self, StorError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Err(StorError::Corrupt("empty file"));
        }
        let cs = CHUNK_SIZE as u64;
        let nchunks = file_len.div_ceil(cs).max(1);
        let mut chunks = Vec::with_capacity(nchunks as usize);
        if read_only {
            for i in 0..nchunks {
                let len = (file_len - i * cs).min(cs) as usize;
                let m = unsafe {
                    MmapOptions::new().offset(i * cs).len(len).map(&file)?
                };
                chunks.push(Chunk::MapRo(m));
            }
        } else {
            file.set_len(nchunks * cs)?;
            for i in 0..nchunks {
                let m = unsafe {
                    MmapOptions::new()
                        .offset(i * cs)
                        .len(cs as usize)
                        .map_mut(&file)?
                };
                chunks.push(Chunk::Map(m));
            }
        }
        Ok(Stor {
            chunk_size: cs,
            backing: Backing::File(file),
            read_only,
            chunks: RwLock::new(chunks),
            size: AtomicU64::new(file_len),
            alloc_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Current logical size; also the offset the next allocation starts at
    /// (modulo alignment).
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Rewind or advance the logical size. Used when the header size field
    /// or a recovery scan overrides the file length.
    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Allocate `n` bytes, returning the offset and a writable slice.
    ///
    /// Allocations are 8-byte aligned and never span a chunk boundary; the
    /// tail of a chunk that cannot fit `n` is dead space.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc(&self, n: usize) -> (u64, &mut [u8]) {
        assert!(n > 0, "alloc of zero bytes");
        assert!((n as u64) <= self.chunk_size, "alloc larger than a chunk");
        assert!(!self.read_only, "alloc on read-only store");
        assert!(!self.closed.load(Ordering::Acquire), "store closed");

        let _guard = self.alloc_lock.lock();
        let mut off = self.size().div_ceil(ALIGN) * ALIGN;
        let cs = self.chunk_size;
        if off / cs != (off + n as u64 - 1) / cs {
            off = (off / cs + 1) * cs;
        }
        let chunk_idx = (off / cs) as usize;
        {
            let mut chunks = self.chunks.write();
            while chunks.len() <= chunk_idx {
                let next = chunks.len() as u64;
                match &self.backing {
                    Backing::Heap => chunks.push(Chunk::Heap(
                        vec![0u8; cs as usize].into_boxed_slice(),
                    )),
                    Backing::File(file) => {
                        file.set_len((next + 1) * cs).expect("grow store file");
                        let m = unsafe {
                            MmapOptions::new()
                                .offset(next * cs)
                                .len(cs as usize)
                                .map_mut(file)
                                .expect("map store chunk")
                        };
                        chunks.push(Chunk::Map(m));
                    }
                }
            }
        }
        self.size.store(off + n as u64, Ordering::Release);

        let chunks = self.chunks.read();
        let base = chunks[chunk_idx].as_ptr() as *mut u8;
        let start = (off % cs) as usize;
        // Sound per the struct-level safety model: this region was never
        // handed out before and the chunk memory is address-stable.
        let buf = unsafe { std::slice::from_raw_parts_mut(base.add(start), n) };
        (off, buf)
    }

    /// Unbounded view starting at `off`, extending to the end of its chunk.
    /// Callers read a length-delimited region.
    pub fn data(&self, off: u64) -> &[u8] {
        assert!(!self.closed.load(Ordering::Acquire), "store closed");
        let cs = self.chunk_size;
        let chunk_idx = (off / cs) as usize;
        let start = (off % cs) as usize;
        let chunks = self.chunks.read();
        assert!(chunk_idx < chunks.len(), "offset beyond store");
        let chunk = &chunks[chunk_idx];
        assert!(start < chunk.len(), "offset beyond chunk");
        let base = chunk.as_ptr();
        unsafe { std::slice::from_raw_parts(base.add(start), chunk.len() - start) }
    }

    /// Overwrite already-written bytes. Restricted to the file header.
    pub fn write(&self, off: u64, bytes: &[u8]) {
        assert!(!self.read_only, "write on read-only store");
        let cs = self.chunk_size;
        assert!(
            off / cs == (off + bytes.len() as u64 - 1) / cs,
            "write spans chunks"
        );
        let chunks = self.chunks.read();
        let chunk = &chunks[(off / cs) as usize];
        let start = (off % cs) as usize;
        let base = chunk.as_ptr() as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start), bytes.len());
        }
    }

    /// Write a length-prefixed, checksummed block; returns its offset.
    pub fn save_sized(&self, payload: &[u8]) -> u64 {
        assert!(payload.len() <= MAX_SIZED, "block too large");
        let prefix_len = if payload.len() < 0x8000 { 2 } else { 3 };
        let total = prefix_len + payload.len() + cksum::LEN;
        let (off, buf) = self.alloc(total);
        if prefix_len == 2 {
            buf[..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        } else {
            let lo = (payload.len() & 0x7fff) as u16 | 0x8000;
            buf[..2].copy_from_slice(&lo.to_le_bytes());
            buf[2] = (payload.len() >> 15) as u8;
        }
        buf[prefix_len..prefix_len + payload.len()].copy_from_slice(payload);
        cksum::update(buf);
        off
    }

    fn sized_parts(&self, off: u64) -> (usize, usize) {
        let data = self.data(off);
        let lo = u16::from_le_bytes(data[..2].try_into().unwrap());
        if lo & 0x8000 == 0 {
            (2, lo as usize)
        } else {
            (2 + 1, ((lo & 0x7fff) as usize) | ((data[2] as usize) << 15))
        }
    }

    /// Payload of a block written by [`Stor::save_sized`], without
    /// verifying the checksum (the hot read path).
    pub fn data_sized(&self, off: u64) -> &[u8] {
        let (prefix_len, len) = self.sized_parts(off);
        &self.data(off)[prefix_len..prefix_len + len]
    }

    /// Payload of a sized block after verifying its checksum.
    pub fn data_sized_ck(&self, off: u64) -> Result<&[u8], StorError> {
        let (prefix_len, len) = self.sized_parts(off);
        let data = self.data(off);
        let total = prefix_len + len + cksum::LEN;
        if total > data.len() || !cksum::check(&data[..total]) {
            return Err(StorError::Corrupt("block checksum mismatch"));
        }
        Ok(&data[prefix_len..prefix_len + len])
    }

    /// Size on disk of a block holding `payload_len` bytes.
    pub fn sized_len(payload_len: usize) -> usize {
        let prefix = if payload_len < 0x8000 { 2 } else { 3 };
        prefix + payload_len + cksum::LEN
    }

    /// Flush mapped chunks and truncate the file to `size`.
    ///
    /// The store is unusable afterwards; callers drop it next.
    pub fn close(&self, size: u64) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut chunks = self.chunks.write();
        for chunk in chunks.iter() {
            if let Chunk::Map(m) = chunk {
                let _ = m.flush();
            }
        }
        chunks.clear();
        if let (Backing::File(file), false) = (&self.backing, self.read_only) {
            let _ = file.set_len(size);
            let _ = file.sync_all();
        }
    }
}

impl std::fmt::Debug for Stor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stor")
            .field("size", &self.size())
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Write a 40-bit little-endian offset.
pub fn put5(buf: &mut [u8], v: u64) {
    debug_assert!(v < 1 << 40);
    buf[..SMALL_OFFSET_LEN].copy_from_slice(&v.to_le_bytes()[..SMALL_OFFSET_LEN]);
}

/// Read a 40-bit little-endian offset.
pub fn get5(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b[..SMALL_OFFSET_LEN].copy_from_slice(&buf[..SMALL_OFFSET_LEN]);
    u64::from_le_bytes(b)
}
