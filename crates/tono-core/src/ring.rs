//! Lock-free single-producer/single-consumer ring buffers.
//!
//! Two variants: a byte ring, and a PCM-frame view over it with
//! frame-aligned acquire/commit. The ring backs duplex capture→playback
//! coupling and any other audio-thread hand-off, so every operation here is
//! lock-free and allocation-free after construction; a cursor update is a
//! single CAS that only the one peer can delay.
//!
//! # Cursor encoding
//!
//! Both cursors live in one 64-bit word, each in `[0, 2 * capacity)`: the
//! low range addresses the buffer directly, the high range is the same
//! offsets with the wrap parity bit set. That one extra bit per cursor is
//! what disambiguates a completely full ring from a completely empty one
//! (`write == read` is empty, `write == read + capacity` is full), and it
//! keeps the fill count exact for any capacity, not just powers of two.
//! Packing the pair means every load is a consistent snapshot of both
//! cursors at once.
//!
//! # Overwrite and the grant fence
//!
//! [`write_overwrite`](ByteRingProducer::write_overwrite) implements
//! drop-oldest overflow for the duplex coupling path: when the incoming
//! bytes do not fit, the producer reclaims the oldest committed bytes by
//! advancing the read cursor itself. Bit 62 of the state word is the
//! consumer-grant fence: it is set while the consumer holds an
//! [`acquire_read`](ByteRingConsumer::acquire_read) grant and checked in
//! the same CAS that performs the reclaim, so the producer can never
//! overwrite bytes the consumer is actively reading. If the fence is up,
//! that one overwrite call falls back to writing what fits (dropping the
//! incoming excess instead); the caller still observes the overflow.
//!
//! # Ownership
//!
//! Construction hands back a producer half and a consumer half. Each half
//! may be moved to its own thread. The producer publishes with a Release
//! update that the consumer observes with an Acquire load, so committed
//! payload bytes are always visible before the frames that carry them.

#![allow(unsafe_code)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, sync::Arc, vec};
#[cfg(feature = "std")]
use std::sync::Arc;

use crate::format::SampleFormat;
use crate::result::{Error, Result};

/// Largest supported ring capacity in bytes; each parity-encoded cursor
/// must fit in 31 bits of the shared state word.
pub const MAX_RING_CAPACITY: usize = 1 << 30;

const CURSOR_MASK: u64 = (1 << 31) - 1;
const GRANT_BIT: u64 = 1 << 62;

#[inline]
fn pack(read: usize, write: usize, grant: bool) -> u64 {
    (read as u64) | ((write as u64) << 31) | if grant { GRANT_BIT } else { 0 }
}

#[inline]
fn unpack(state: u64) -> (usize, usize, bool) {
    (
        (state & CURSOR_MASK) as usize,
        ((state >> 31) & CURSOR_MASK) as usize,
        state & GRANT_BIT != 0,
    )
}

struct RingShared {
    data: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    /// Packed `(read, write, grant)`; see the module docs.
    state: AtomicU64,
}

// SAFETY: the producer half only writes bytes in the free region and the
// consumer half only reads bytes in the committed region; the regions are
// disjoint, every cursor update is a CAS on the shared state word, and the
// grant fence keeps producer-side reclaim away from any outstanding read
// grant.
unsafe impl Sync for RingShared {}
// SAFETY: u8 payload carries no thread affinity.
unsafe impl Send for RingShared {}

impl RingShared {
    fn advance(&self, cursor: usize, n: usize) -> usize {
        let c = cursor + n;
        if c >= 2 * self.capacity {
            c - 2 * self.capacity
        } else {
            c
        }
    }

    fn offset(&self, cursor: usize) -> usize {
        if cursor >= self.capacity {
            cursor - self.capacity
        } else {
            cursor
        }
    }

    fn fill(&self, write: usize, read: usize) -> usize {
        (write + 2 * self.capacity - read) % (2 * self.capacity)
    }

    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent) over u8.
        self.data.as_ptr().cast::<u8>().cast_mut()
    }

    fn snapshot(&self) -> (usize, usize, bool) {
        unpack(self.state.load(Ordering::Acquire))
    }
}

/// Producer half of a byte ring. See [`byte_ring`].
pub struct ByteRingProducer {
    shared: Arc<RingShared>,
    /// Bytes granted by the last `acquire_write`, not yet committed.
    pending: usize,
}

/// Consumer half of a byte ring. See [`byte_ring`].
pub struct ByteRingConsumer {
    shared: Arc<RingShared>,
    pending: usize,
}

/// Creates a byte ring of at least `min_capacity` bytes, rounded up to a
/// power of two, and returns its two halves.
pub fn byte_ring(min_capacity: usize) -> Result<(ByteRingProducer, ByteRingConsumer)> {
    if min_capacity == 0 || min_capacity > MAX_RING_CAPACITY {
        return Err(Error::InvalidArgs);
    }
    byte_ring_exact(min_capacity.next_power_of_two())
}

/// Creates a byte ring of exactly `capacity` bytes. The parity cursor
/// encoding works for any capacity; the PCM view uses this to keep the
/// buffer a whole number of frames.
fn byte_ring_exact(capacity: usize) -> Result<(ByteRingProducer, ByteRingConsumer)> {
    if capacity == 0 || capacity > MAX_RING_CAPACITY {
        return Err(Error::InvalidArgs);
    }
    let data: Box<[UnsafeCell<u8>]> = vec![0u8; capacity]
        .into_iter()
        .map(UnsafeCell::new)
        .collect();
    let shared = Arc::new(RingShared {
        data,
        capacity,
        state: AtomicU64::new(0),
    });
    Ok((
        ByteRingProducer {
            shared: Arc::clone(&shared),
            pending: 0,
        },
        ByteRingConsumer { shared, pending: 0 },
    ))
}

impl ByteRingProducer {
    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Bytes currently committed and unread.
    pub fn pointer_distance(&self) -> usize {
        let (read, write, _) = self.shared.snapshot();
        self.shared.fill(write, read)
    }

    /// Free space in bytes.
    pub fn available(&self) -> usize {
        self.shared.capacity - self.pointer_distance()
    }

    /// Grants a contiguous writable region of up to `n` bytes.
    ///
    /// The grant may be shorter than `n` when the free region wraps; call
    /// again after committing to obtain the remainder. Returns
    /// [`Error::Busy`] when the ring is full.
    pub fn acquire_write(&mut self, n: usize) -> Result<&mut [u8]> {
        // Acquire pairs with the consumer's commit: space it freed must be
        // fully read before we scribble over it.
        let (read, write, _) = self.shared.snapshot();
        let free = self.shared.capacity - self.shared.fill(write, read);
        if free == 0 && n > 0 {
            return Err(Error::Busy);
        }
        let off = self.shared.offset(write);
        let run = n.min(free).min(self.shared.capacity - off);
        self.pending = run;
        // SAFETY: `[off, off + run)` is within the buffer and inside the free
        // region, which only this producer touches until commit.
        Ok(unsafe { core::slice::from_raw_parts_mut(self.shared.base().add(off), run) })
    }

    /// Publishes `n` bytes of the last grant. `n` may be less than the
    /// grant; it must not exceed it.
    pub fn commit_write(&mut self, n: usize) -> Result<()> {
        if n > self.pending {
            return Err(Error::InvalidArgs);
        }
        self.pending = 0;
        let _ = self
            .shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let (read, write, grant) = unpack(s);
                Some(pack(read, self.shared.advance(write, n), grant))
            });
        Ok(())
    }

    /// Advances the write cursor by `delta` bytes without writing payload.
    /// The skipped bytes keep whatever they previously held.
    pub fn seek(&mut self, delta: usize) -> Result<()> {
        self.shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let (read, write, grant) = unpack(s);
                let free = self.shared.capacity - self.shared.fill(write, read);
                if delta > free {
                    return None;
                }
                Some(pack(read, self.shared.advance(write, delta), grant))
            })
            .map(|_| ())
            .map_err(|_| Error::InvalidArgs)
    }

    /// Copies as much of `src` as fits, wrapping across the boundary.
    /// Returns the number of bytes written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut written = 0;
        while written < src.len() {
            let Ok(region) = self.acquire_write(src.len() - written) else {
                break;
            };
            if region.is_empty() {
                break;
            }
            let n = region.len();
            region.copy_from_slice(&src[written..written + n]);
            written += n;
            // The grant length is always valid to commit.
            let _ = self.commit_write(n);
        }
        written
    }

    /// Copies all of `src`, reclaiming the oldest committed bytes when the
    /// ring would overflow. Returns `(written, dropped_oldest)`.
    ///
    /// When `src` exceeds the capacity outright, only its newest
    /// `capacity` bytes are kept (the skipped head counts as dropped).
    /// While the consumer holds an active read grant the reclaim is
    /// fenced off, and the call degrades to writing what fits.
    pub fn write_overwrite(&mut self, src: &[u8]) -> (usize, usize) {
        let capacity = self.shared.capacity;
        let mut dropped = 0usize;
        let src = if src.len() > capacity {
            dropped += src.len() - capacity;
            &src[src.len() - capacity..]
        } else {
            src
        };

        // Reclaim the deficit in the same CAS that checks the grant fence,
        // so the consumer can never be mid-read of the reclaimed bytes.
        let needed = src.len();
        let reclaimed = self
            .shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let (read, write, grant) = unpack(s);
                if grant {
                    return None;
                }
                let fill = self.shared.fill(write, read);
                let free = capacity - fill;
                if needed <= free {
                    return None;
                }
                let deficit = (needed - free).min(fill);
                Some(pack(self.shared.advance(read, deficit), write, false))
            });
        if let Ok(old) = reclaimed {
            let (read, write, _) = unpack(old);
            let free = capacity - self.shared.fill(write, read);
            dropped += needed - free;
        }

        (self.write(src), dropped)
    }
}

impl ByteRingConsumer {
    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Bytes currently committed and unread.
    pub fn pointer_distance(&self) -> usize {
        let (read, write, _) = self.shared.snapshot();
        self.shared.fill(write, read)
    }

    /// Grants a contiguous readable region of up to `n` bytes.
    ///
    /// The grant may be shorter than `n` when the filled region wraps; a
    /// second acquire after committing starts at offset zero. Returns
    /// [`Error::Busy`] when the ring is empty. The grant fence stays up
    /// until [`commit_read`](Self::commit_read) (or a seek), blocking
    /// producer-side overwrite of the granted bytes.
    pub fn acquire_read(&mut self, n: usize) -> Result<&[u8]> {
        if n == 0 {
            self.pending = 0;
            return Ok(&[]);
        }
        // Raising the fence and snapshotting the cursors is one atomic
        // update, so the producer's reclaim CAS either sees the fence or
        // happened entirely before this grant.
        let granted = self
            .shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let (read, write, _) = unpack(s);
                if self.shared.fill(write, read) == 0 {
                    return None;
                }
                Some(pack(read, write, true))
            });
        let Ok(old) = granted else {
            return Err(Error::Busy);
        };
        let (read, write, _) = unpack(old);
        let filled = self.shared.fill(write, read);
        let off = self.shared.offset(read);
        let run = n.min(filled).min(self.shared.capacity - off);
        self.pending = run;
        // SAFETY: `[off, off + run)` is inside the committed region; the
        // producer does not write committed bytes, and the grant fence
        // keeps its overwrite reclaim away until commit.
        Ok(unsafe { core::slice::from_raw_parts(self.shared.base().add(off), run) })
    }

    /// Releases `n` bytes of the last grant back to the producer and drops
    /// the grant fence.
    pub fn commit_read(&mut self, n: usize) -> Result<()> {
        if n > self.pending {
            return Err(Error::InvalidArgs);
        }
        self.pending = 0;
        let _ = self
            .shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let (read, write, _) = unpack(s);
                Some(pack(self.shared.advance(read, n), write, false))
            });
        Ok(())
    }

    /// Discards `delta` committed bytes without reading them.
    pub fn seek(&mut self, delta: usize) -> Result<()> {
        self.pending = 0;
        self.shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let (read, write, _) = unpack(s);
                if delta > self.shared.fill(write, read) {
                    return None;
                }
                Some(pack(self.shared.advance(read, delta), write, false))
            })
            .map(|_| ())
            .map_err(|_| Error::InvalidArgs)
    }

    /// Copies up to `dst.len()` committed bytes into `dst`, wrapping across
    /// the boundary. Returns the number of bytes read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < dst.len() {
            let Ok(region) = self.acquire_read(dst.len() - filled) else {
                break;
            };
            if region.is_empty() {
                break;
            }
            let n = region.len();
            dst[filled..filled + n].copy_from_slice(region);
            filled += n;
            let _ = self.commit_read(n);
        }
        filled
    }
}

/// Resets a ring to empty. Takes both halves, which proves no concurrent
/// access, and fails with [`Error::InvalidArgs`] if the halves belong to
/// different rings.
pub fn reset(producer: &mut ByteRingProducer, consumer: &mut ByteRingConsumer) -> Result<()> {
    if !Arc::ptr_eq(&producer.shared, &consumer.shared) {
        return Err(Error::InvalidArgs);
    }
    producer.pending = 0;
    consumer.pending = 0;
    producer.shared.state.store(0, Ordering::Relaxed);
    Ok(())
}

/// Producer half of a PCM-frame ring. See [`pcm_ring`].
pub struct PcmRingProducer {
    inner: ByteRingProducer,
    bytes_per_frame: usize,
}

/// Consumer half of a PCM-frame ring. See [`pcm_ring`].
pub struct PcmRingConsumer {
    inner: ByteRingConsumer,
    bytes_per_frame: usize,
}

/// Creates a PCM-frame ring holding at least `min_capacity_frames` frames
/// of the given format, rounded up to a power-of-two frame count.
///
/// The PCM variant is a thin view over the byte ring: the byte capacity is
/// an exact multiple of the frame size and all cursor movement happens in
/// whole frames, so grants (and overwrite reclaim) are always
/// frame-aligned.
pub fn pcm_ring(
    format: SampleFormat,
    channels: u16,
    min_capacity_frames: usize,
) -> Result<(PcmRingProducer, PcmRingConsumer)> {
    if channels == 0 || min_capacity_frames == 0 {
        return Err(Error::InvalidArgs);
    }
    let bytes_per_frame = format.bytes_per_frame(channels);
    let capacity_frames = min_capacity_frames.next_power_of_two();
    let (producer, consumer) = byte_ring_exact(capacity_frames * bytes_per_frame)?;
    Ok((
        PcmRingProducer {
            inner: producer,
            bytes_per_frame,
        },
        PcmRingConsumer {
            inner: consumer,
            bytes_per_frame,
        },
    ))
}

impl PcmRingProducer {
    /// Ring capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.inner.capacity() / self.bytes_per_frame
    }

    /// Size of one frame in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    /// Committed, unread frames.
    pub fn pointer_distance(&self) -> usize {
        self.inner.pointer_distance() / self.bytes_per_frame
    }

    /// Free space in frames.
    pub fn available_frames(&self) -> usize {
        self.inner.available() / self.bytes_per_frame
    }

    /// Grants a contiguous writable region of up to `frames` frames.
    /// The returned slice length is a whole number of frames.
    pub fn acquire_write(&mut self, frames: usize) -> Result<&mut [u8]> {
        self.inner.acquire_write(frames * self.bytes_per_frame)
    }

    /// Publishes `frames` frames of the last grant.
    pub fn commit_write(&mut self, frames: usize) -> Result<()> {
        self.inner.commit_write(frames * self.bytes_per_frame)
    }

    /// Advances the write cursor by `frames` without writing payload.
    pub fn seek(&mut self, frames: usize) -> Result<()> {
        self.inner.seek(frames * self.bytes_per_frame)
    }

    /// Copies whole frames from `src`, returning the frame count written.
    pub fn write_frames(&mut self, src: &[u8]) -> usize {
        debug_assert_eq!(src.len() % self.bytes_per_frame, 0);
        let writable = self.available_frames() * self.bytes_per_frame;
        self.inner.write(&src[..src.len().min(writable)]) / self.bytes_per_frame
    }

    /// Copies whole frames from `src`, dropping the oldest buffered frames
    /// when the ring would overflow. Returns
    /// `(frames_written, frames_dropped_oldest)`. Every commit is a whole
    /// number of frames, so the reclaim is frame-aligned by construction.
    pub fn write_frames_overwrite(&mut self, src: &[u8]) -> (usize, usize) {
        debug_assert_eq!(src.len() % self.bytes_per_frame, 0);
        let (written, dropped) = self.inner.write_overwrite(src);
        (written / self.bytes_per_frame, dropped / self.bytes_per_frame)
    }
}

impl PcmRingConsumer {
    /// Ring capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.inner.capacity() / self.bytes_per_frame
    }

    /// Size of one frame in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    /// Committed, unread frames.
    pub fn pointer_distance(&self) -> usize {
        self.inner.pointer_distance() / self.bytes_per_frame
    }

    /// Grants a contiguous readable region of up to `frames` frames.
    pub fn acquire_read(&mut self, frames: usize) -> Result<&[u8]> {
        self.inner.acquire_read(frames * self.bytes_per_frame)
    }

    /// Releases `frames` frames of the last grant.
    pub fn commit_read(&mut self, frames: usize) -> Result<()> {
        self.inner.commit_read(frames * self.bytes_per_frame)
    }

    /// Discards `frames` committed frames without reading them.
    pub fn seek(&mut self, frames: usize) -> Result<()> {
        self.inner.seek(frames * self.bytes_per_frame)
    }

    /// Copies whole frames into `dst`, returning the frame count read.
    pub fn read_frames(&mut self, dst: &mut [u8]) -> usize {
        debug_assert_eq!(dst.len() % self.bytes_per_frame, 0);
        self.inner.read(dst) / self.bytes_per_frame
    }
}

/// Resets a PCM ring to empty, with the same two-halves contract as
/// [`reset`].
pub fn pcm_reset(producer: &mut PcmRingProducer, consumer: &mut PcmRingConsumer) -> Result<()> {
    reset(&mut producer.inner, &mut consumer.inner)
}
