//! Ping-pong between two page buffers so one can be written to flash while the other fills.
//!
//! A swap hands out a [`FlushTicket`] for the buffer that just filled. The ticket can't be
//! cloned and is consumed by [`DoubleBuffer::complete_flush`], so a buffer can only be given to
//! the append engine once between resets.

use novafc_data_format::Record;
use serde::{Deserialize, Serialize};

use crate::error::ArbiterError;
use crate::page::{Append, BufferStatus, PageBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferId {
    A,
    B,
}

impl BufferId {
    pub const fn other(self) -> Self {
        match self {
            BufferId::A => BufferId::B,
            BufferId::B => BufferId::A,
        }
    }

    const fn index(self) -> usize {
        match self {
            BufferId::A => 0,
            BufferId::B => 1,
        }
    }
}

/// Permission to flush one buffer. Returned by [`DoubleBuffer::swap`]
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a flushing buffer stays unusable until its ticket is completed"]
pub struct FlushTicket {
    id: BufferId,
}

impl FlushTicket {
    pub fn id(&self) -> BufferId {
        self.id
    }
}

#[derive(Debug, Clone)]
pub struct DoubleBuffer {
    buffers: [PageBuffer; 2],
    active: BufferId,
    swaps: u64,
}

impl DoubleBuffer {
    /// Buffer A starts filling, B waits idle
    pub fn new() -> Self {
        let mut buffers = [PageBuffer::new(), PageBuffer::new()];
        buffers[BufferId::A.index()].reset();
        Self {
            buffers,
            active: BufferId::A,
            swaps: 0,
        }
    }

    /// The buffer appends go to
    pub fn active(&self) -> BufferId {
        self.active
    }

    pub fn buffer(&self, id: BufferId) -> &PageBuffer {
        &self.buffers[id.index()]
    }

    pub fn status(&self, id: BufferId) -> BufferStatus {
        self.buffer(id).status()
    }

    pub fn statuses(&self) -> [BufferStatus; 2] {
        [self.status(BufferId::A), self.status(BufferId::B)]
    }

    pub fn is_degraded(&self) -> bool {
        self.status(self.active) == BufferStatus::Degraded
    }

    /// Number of swaps since creation
    pub fn swaps(&self) -> u64 {
        self.swaps
    }

    pub fn append(&mut self, record: &Record) -> Result<Append, ArbiterError> {
        if self.is_degraded() {
            return Err(ArbiterError::Degraded);
        }
        Ok(self.buffers[self.active.index()].append(record)?)
    }

    /// Hands the active buffer over for flushing and switches appends to the other one.
    ///
    /// Fails with [`ArbiterError::Overrun`] if the other buffer's flush was never completed.
    pub fn swap(&mut self) -> Result<FlushTicket, ArbiterError> {
        let next = self.active.other();
        match self.status(next) {
            BufferStatus::Idle => {}
            BufferStatus::Flushing => return Err(ArbiterError::Overrun),
            BufferStatus::Degraded => return Err(ArbiterError::Degraded),
            // Only happens if both buffers were reset by hand, treat it as an overrun so no
            // data is dropped silently
            BufferStatus::Filling => return Err(ArbiterError::Overrun),
        }

        let full = self.active;
        self.buffers[full.index()].begin_flush()?;
        self.buffers[next.index()].reset();
        self.active = next;
        self.swaps += 1;
        Ok(FlushTicket { id: full })
    }

    /// The buffer a ticket refers to, for the append engine to write out
    pub fn flushing(&self, ticket: &FlushTicket) -> &PageBuffer {
        self.buffer(ticket.id)
    }

    /// Marks the ticket's buffer as written, so the next swap may reuse it
    pub fn complete_flush(&mut self, ticket: FlushTicket) -> Result<(), ArbiterError> {
        let buffer = &mut self.buffers[ticket.id.index()];
        if buffer.status() == BufferStatus::Degraded {
            return Err(ArbiterError::Degraded);
        }
        buffer.finish_flush()?;
        Ok(())
    }

    /// Permanently stops both buffers. Any pending ticket is worthless afterwards
    pub fn degrade(&mut self) {
        for buffer in &mut self.buffers {
            buffer.degrade();
        }
    }
}

impl Default for DoubleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use novafc_data_format::{Reading, TimeIndex};

    use super::*;

    fn accel(t: u32) -> Record {
        Record::new(TimeIndex::from_ticks(t), Reading::Accel([t as i16, 0, 0])).unwrap()
    }

    /// Appends until the active buffer is full, returning how many records went in
    fn fill(arbiter: &mut DoubleBuffer, start: u32) -> u32 {
        let mut t = start;
        while arbiter.append(&accel(t)).unwrap() == Append::Appended {
            t += 1;
        }
        t - start
    }

    #[test]
    fn starts_filling_a() {
        let arbiter = DoubleBuffer::new();
        assert_eq!(arbiter.active(), BufferId::A);
        assert_eq!(
            arbiter.statuses(),
            [BufferStatus::Filling, BufferStatus::Idle]
        );
    }

    #[test]
    fn swap_alternates_buffers() {
        let mut arbiter = DoubleBuffer::new();
        for round in 0..4u32 {
            let expected = if round % 2 == 0 { BufferId::A } else { BufferId::B };
            assert_eq!(fill(&mut arbiter, round * 100), 31);

            let ticket = arbiter.swap().unwrap();
            assert_eq!(ticket.id(), expected);
            assert_eq!(arbiter.active(), expected.other());
            assert_eq!(arbiter.status(expected), BufferStatus::Flushing);
            assert_eq!(arbiter.status(expected.other()), BufferStatus::Filling);
            assert_eq!(arbiter.flushing(&ticket).record_count(), 31);

            arbiter.complete_flush(ticket).unwrap();
            assert_eq!(arbiter.status(expected), BufferStatus::Idle);
        }
        assert_eq!(arbiter.swaps(), 4);
    }

    #[test]
    fn one_swap_per_overflow() {
        let mut arbiter = DoubleBuffer::new();
        let mut flushed = Vec::new();
        for t in 0..200 {
            let record = accel(t);
            if arbiter.append(&record).unwrap() == Append::Full {
                let ticket = arbiter.swap().unwrap();
                flushed.push(arbiter.flushing(&ticket).record_count());
                arbiter.complete_flush(ticket).unwrap();
                assert_eq!(arbiter.append(&record).unwrap(), Append::Appended);
            }
        }
        // 200 records at 31 per page: 6 full pages and 14 still filling
        assert_eq!(flushed, vec![31; 6]);
        assert_eq!(arbiter.swaps(), 6);
        assert_eq!(arbiter.buffer(arbiter.active()).record_count(), 14);
    }

    #[test]
    fn overrun_when_flush_not_completed() {
        let mut arbiter = DoubleBuffer::new();
        fill(&mut arbiter, 0);
        let ticket = arbiter.swap().unwrap();
        fill(&mut arbiter, 100);

        assert_eq!(arbiter.swap(), Err(ArbiterError::Overrun));
        // Nothing moved
        assert_eq!(arbiter.active(), BufferId::B);
        assert_eq!(
            arbiter.statuses(),
            [BufferStatus::Flushing, BufferStatus::Filling]
        );

        arbiter.complete_flush(ticket).unwrap();
        assert!(arbiter.swap().is_ok());
    }

    #[test]
    fn degraded_refuses_everything() {
        let mut arbiter = DoubleBuffer::new();
        fill(&mut arbiter, 0);
        let ticket = arbiter.swap().unwrap();
        arbiter.degrade();

        assert_eq!(
            arbiter.statuses(),
            [BufferStatus::Degraded, BufferStatus::Degraded]
        );
        assert_eq!(arbiter.append(&accel(0)), Err(ArbiterError::Degraded));
        assert_eq!(arbiter.swap(), Err(ArbiterError::Degraded));
        assert_eq!(arbiter.complete_flush(ticket), Err(ArbiterError::Degraded));
    }
}
