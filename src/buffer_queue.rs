//! Flow-control FIFO between the network path and the audio callback.
//!
//! The queue is split into a [`BufferWriter`] owned by the session task and a
//! [`BufferReader`] owned by the audio callback. Completed buffers travel
//! writer → reader through one SPSC ring; played buffers travel back through a
//! second ring so the reader neither allocates nor frees.
//!
//! `reset` runs on the writer side. It starts a new generation; buffers
//! stamped with an older one no longer count as ready and are recycled
//! unplayed when the reader reaches them. The bound on queued buffers applies
//! to the current generation only, so stale buffers still sitting in the ring
//! never push out a new session's audio.
//!
//! The ready count is derived from two counters, each written by one side
//! only: buffers pushed by the writer and buffers taken by the reader, both
//! tagged with the generation they belong to.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_MAX_QUEUED_BUFFERS: usize = 16;

/// One full buffer of normalized mono samples.
#[derive(Debug)]
pub struct AudioBuffer {
    generation: u32,
    samples: Box<[f32]>,
}

impl AudioBuffer {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

impl Deref for AudioBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.samples
    }
}

/// A generation in the high half and a count within it in the low half.
fn pack(generation: u32, count: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(count)
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

struct QueueShared {
    /// Writer only: current generation, buffers pushed during it
    pushed: AtomicU64,
    /// Reader only: generation of the last taken buffer, buffers taken during it
    taken: AtomicU64,
    dropped: AtomicU64,
}

impl QueueShared {
    fn generation(&self) -> u32 {
        unpack(self.pushed.load(Ordering::Acquire)).0
    }

    fn ready(&self) -> usize {
        let (generation, pushed) = unpack(self.pushed.load(Ordering::Acquire));
        let (taken_generation, taken) = unpack(self.taken.load(Ordering::Acquire));
        // The reader may pop a buffer just before the writer counts it
        if taken_generation == generation {
            pushed.saturating_sub(taken) as usize
        } else {
            pushed as usize
        }
    }
}

/// Create a queue of `buffer_size`-sample buffers holding at most
/// `max_queued` ready buffers.
pub fn channel(buffer_size: usize, max_queued: usize) -> (BufferWriter, BufferReader) {
    let buffer_size = buffer_size.max(1);
    let max_queued = max_queued.max(1);

    // Room for a full queue of stale buffers the reader has not drained yet
    // plus a full queue of current ones.
    let ring_capacity = 2 * max_queued;
    let (filled_tx, filled_rx) = HeapRb::<AudioBuffer>::new(ring_capacity).split();
    // Every buffer in circulation fits: the ring's, the writer's partial and
    // the one the reader is playing.
    let (recycled_tx, recycled_rx) = HeapRb::<AudioBuffer>::new(ring_capacity + 2).split();

    let shared = Arc::new(QueueShared {
        pushed: AtomicU64::new(pack(0, 0)),
        taken: AtomicU64::new(pack(0, 0)),
        dropped: AtomicU64::new(0),
    });

    let writer = BufferWriter {
        filled: filled_tx,
        recycled: recycled_rx,
        partial: Vec::with_capacity(buffer_size),
        spare: None,
        buffer_size,
        max_queued,
        shared: Arc::clone(&shared),
    };
    let reader = BufferReader {
        filled: filled_rx,
        recycled: recycled_tx,
        buffer_size,
        shared,
    };
    (writer, reader)
}

/// Producer half. Lives on the network path; the only place that allocates.
pub struct BufferWriter {
    filled: HeapProd<AudioBuffer>,
    recycled: HeapCons<AudioBuffer>,
    partial: Vec<f32>,
    spare: Option<Box<[f32]>>,
    buffer_size: usize,
    max_queued: usize,
    shared: Arc<QueueShared>,
}

impl BufferWriter {
    /// Copy samples into the partial buffer, queueing every buffer that fills.
    ///
    /// When the queue already holds its maximum, the newly completed buffer is
    /// dropped and counted in [`dropped_buffers`](Self::dropped_buffers).
    pub fn append(&mut self, samples: &[f32]) {
        let mut rest = samples;
        while !rest.is_empty() {
            let room = self.buffer_size - self.partial.len();
            let (head, tail) = rest.split_at(room.min(rest.len()));
            self.partial.extend_from_slice(head);
            rest = tail;

            if self.partial.len() == self.buffer_size {
                self.commit();
            }
        }
    }

    /// Discard everything queued and the partial buffer.
    pub fn reset(&mut self) {
        self.partial.clear();
        let generation = self.shared.generation().wrapping_add(1);
        self.shared
            .pushed
            .store(pack(generation, 0), Ordering::Release);
    }

    pub fn ready_count(&self) -> usize {
        self.shared.ready()
    }

    pub fn partial(&self) -> &[f32] {
        &self.partial
    }

    /// Samples waiting for the current buffer to fill
    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn dropped_buffers(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn commit(&mut self) {
        let next = self.fresh_partial();
        let full = std::mem::replace(&mut self.partial, next);
        let (generation, pushed) = unpack(self.shared.pushed.load(Ordering::Acquire));
        let buffer = AudioBuffer {
            generation,
            samples: full.into_boxed_slice(),
        };

        if self.shared.ready() >= self.max_queued {
            self.reject(buffer, "queue full");
            return;
        }
        match self.filled.try_push(buffer) {
            // Counted only once the reader can see it
            Ok(()) => self
                .shared
                .pushed
                .store(pack(generation, pushed + 1), Ordering::Release),
            // Only after repeated resets with no reader draining the ring
            Err(rejected) => self.reject(rejected, "ring full of stale buffers"),
        }
    }

    fn reject(&mut self, buffer: AudioBuffer, reason: &str) {
        let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "BufferQueue: {} ({} in ring), dropped incoming buffer ({} total)",
            reason,
            self.filled.occupied_len(),
            dropped
        );
        self.spare = Some(buffer.samples);
    }

    fn fresh_partial(&mut self) -> Vec<f32> {
        let reused = self
            .spare
            .take()
            .or_else(|| self.recycled.try_pop().map(|buffer| buffer.samples));

        match reused {
            Some(samples) => {
                let mut partial = samples.into_vec();
                partial.clear();
                partial
            }
            None => Vec::with_capacity(self.buffer_size),
        }
    }
}

/// Consumer half. Lives in the audio callback; never blocks or allocates.
pub struct BufferReader {
    filled: HeapCons<AudioBuffer>,
    recycled: HeapProd<AudioBuffer>,
    buffer_size: usize,
    shared: Arc<QueueShared>,
}

impl BufferReader {
    /// Remove the head buffer if one is ready.
    ///
    /// Buffers left over from before the last reset are recycled on the way.
    /// Hand the returned buffer back with [`recycle`](Self::recycle) once its
    /// samples have been copied out.
    pub fn take_one(&mut self) -> Option<AudioBuffer> {
        while let Some(buffer) = self.filled.try_pop() {
            // Checked after the pop so a reset racing with it is seen
            if self.is_current(&buffer) {
                let (taken_generation, taken) =
                    unpack(self.shared.taken.load(Ordering::Acquire));
                let taken = if taken_generation == buffer.generation {
                    taken + 1
                } else {
                    1
                };
                self.shared
                    .taken
                    .store(pack(buffer.generation, taken), Ordering::Release);
                return Some(buffer);
            }
            self.recycle(buffer);
        }
        None
    }

    /// False once the writer has reset since `buffer` was queued.
    pub fn is_current(&self, buffer: &AudioBuffer) -> bool {
        buffer.generation == self.shared.generation()
    }

    pub fn recycle(&mut self, buffer: AudioBuffer) {
        // Sized so this cannot fail; if it ever does the buffer is simply freed.
        let _ = self.recycled.try_push(buffer);
    }

    pub fn ready_count(&self) -> usize {
        self.shared.ready()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
