//! Fixed-count frame buffer pool for continuous preview delivery
//!
//! The driver fills caller-supplied buffers and must have the next one
//! queued before the current frame is processed. Buffers are lent to the
//! driver by moving a [`FrameBuffer`] out of its slot and come back the same
//! way, so a slot is either home (available) or in flight, never both.
//!
//! Rotation is strict round-robin over the slots: the counter advances once
//! per delivered frame and is only reset by [`FramePool::configure`].

use tracing::{debug, info};

use crate::error::PoolError;

/// Minimum number of slots; one in flight, one being consumed, plus slack.
pub const MIN_SLOTS: usize = 4;

/// A pool buffer lent out of its slot.
#[derive(Debug)]
pub struct FrameBuffer {
    slot: usize,
    generation: u64,
    data: Box<[u8]>,
}

impl FrameBuffer {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Driver-side access for filling the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug, Default)]
struct FrameSlot {
    /// `None` while the buffer is lent out.
    buffer: Option<Box<[u8]>>,
}

impl FrameSlot {
    fn in_use(&self) -> bool {
        self.buffer.is_none()
    }
}

#[derive(Debug, Default)]
pub struct FramePool {
    slots: Vec<FrameSlot>,
    buffer_size: usize,
    counter: u64,
    generation: u64,
}

impl FramePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)allocate `count` buffers of `buffer_size` bytes.
    ///
    /// Buffers still lent under the previous configuration become stale and
    /// are rejected by [`FramePool::submit`].
    pub fn configure(&mut self, buffer_size: usize, count: usize) -> Result<(), PoolError> {
        if count < MIN_SLOTS {
            return Err(PoolError::TooFewSlots {
                requested: count,
                minimum: MIN_SLOTS,
            });
        }

        self.generation += 1;
        self.counter = 0;
        self.buffer_size = buffer_size;
        self.slots = (0..count)
            .map(|_| FrameSlot {
                buffer: Some(vec![0u8; buffer_size].into_boxed_slice()),
            })
            .collect();

        info!(
            buffer_size,
            count,
            generation = self.generation,
            "Frame pool configured"
        );
        Ok(())
    }

    /// Free all buffers. Outstanding lent buffers become stale.
    pub fn release(&mut self) {
        if !self.slots.is_empty() {
            debug!(generation = self.generation, "Frame pool released");
        }
        self.slots.clear();
        self.buffer_size = 0;
        self.counter = 0;
        self.generation += 1;
    }

    pub fn is_configured(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of frames delivered since the last `configure`.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Slot the cursor currently points at.
    pub fn cursor(&self) -> usize {
        if self.slots.is_empty() {
            0
        } else {
            (self.counter % self.slots.len() as u64) as usize
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use()).count()
    }

    /// Whether `buffer` was lent by the current configuration.
    pub fn owns(&self, buffer: &FrameBuffer) -> bool {
        buffer.generation == self.generation && buffer.slot < self.slots.len()
    }

    /// Lend the slot under the cursor without advancing it. Used to prime
    /// the driver when streaming starts.
    pub fn acquire_for_driver(&mut self) -> Result<FrameBuffer, PoolError> {
        if self.slots.is_empty() {
            return Err(PoolError::NotConfigured);
        }
        self.lend(self.cursor())
    }

    /// Advance the cursor for one delivered frame and lend the next slot.
    ///
    /// The counter advances even when the next slot is still in flight, so
    /// the slot sequence stays aligned with the frame count.
    pub fn rotate(&mut self) -> Result<FrameBuffer, PoolError> {
        if self.slots.is_empty() {
            return Err(PoolError::NotConfigured);
        }
        self.counter += 1;
        self.lend(self.cursor())
    }

    /// Return a lent buffer to its slot.
    pub fn submit(&mut self, buffer: FrameBuffer) -> Result<(), PoolError> {
        if !self.owns(&buffer) {
            return Err(PoolError::StaleBuffer { slot: buffer.slot });
        }
        let slot = &mut self.slots[buffer.slot];
        if slot.buffer.is_some() {
            return Err(PoolError::StaleBuffer { slot: buffer.slot });
        }
        slot.buffer = Some(buffer.data);
        Ok(())
    }

    fn lend(&mut self, index: usize) -> Result<FrameBuffer, PoolError> {
        let data = self.slots[index]
            .buffer
            .take()
            .ok_or(PoolError::SlotInFlight { slot: index })?;
        Ok(FrameBuffer {
            slot: index,
            generation: self.generation,
            data,
        })
    }
}
