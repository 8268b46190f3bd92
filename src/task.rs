//! The logging task: the single consumer of the sensor queues and the only writer of the log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver};
use log::{debug, error, info, trace, warn};
use novafc_data_format::{encode, Record, SensorSample};

use crate::arbiter::{DoubleBuffer, FlushTicket};
use crate::clock::SampleClock;
use crate::engine::FlashAppendEngine;
use crate::error::{ArbiterError, BufferError, Error};
use crate::flash::Flash;
use crate::page::{Append, BufferStatus};
use crate::queue::{QueueKind, QueueReceivers};
use crate::stats::{bump, RecorderStats};

/// Everything the logging task needs, built by the supervisor once the boot scan has run
pub struct LoggingContext<F: Flash> {
    pub queues: QueueReceivers,
    pub engine: FlashAppendEngine<F>,
    pub clock: Arc<SampleClock>,
    pub stats: Arc<RecorderStats>,
    /// Set to ask the task to flush what it has and exit
    pub stop: Arc<AtomicBool>,
    pub recv_timeout: Duration,
}

/// Why the logging task stopped
#[derive(Debug)]
pub enum TaskExit {
    Stopped,
    /// Every producer hung up
    Disconnected,
    /// Writing to flash failed for good, the buffers are degraded
    Degraded(Error),
}

/// Final state of the logging task
#[derive(Debug)]
pub struct TaskOutcome {
    pub exit: TaskExit,
    pub buffers: [BufferStatus; 2],
    pub write_cursor: u32,
}

/// What happened to a single sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Logged,
    Dropped,
}

/// Result of one iteration of the task loop
#[derive(Debug)]
pub enum Step {
    Logged(QueueKind),
    Dropped(QueueKind),
    /// Nothing arrived before the receive timeout
    Idle,
    Exit(TaskExit),
    /// The task already exited
    Done,
}

enum Event {
    Sample(QueueKind, SensorSample),
    Closed(QueueKind),
    Idle,
}

pub struct LoggingTask<F: Flash> {
    inertial: Receiver<SensorSample>,
    barometric: Receiver<SensorSample>,
    inertial_open: bool,
    barometric_open: bool,
    arbiter: DoubleBuffer,
    engine: FlashAppendEngine<F>,
    clock: Arc<SampleClock>,
    stats: Arc<RecorderStats>,
    stop: Arc<AtomicBool>,
    recv_timeout: Duration,
    done: bool,
}

impl<F: Flash> LoggingTask<F> {
    pub fn new(context: LoggingContext<F>) -> Self {
        Self {
            inertial: context.queues.inertial,
            barometric: context.queues.barometric,
            inertial_open: true,
            barometric_open: true,
            arbiter: DoubleBuffer::new(),
            engine: context.engine,
            clock: context.clock,
            stats: context.stats,
            stop: context.stop,
            recv_timeout: context.recv_timeout,
            done: false,
        }
    }

    pub fn arbiter(&self) -> &DoubleBuffer {
        &self.arbiter
    }

    pub fn engine(&self) -> &FlashAppendEngine<F> {
        &self.engine
    }

    /// Runs until stopped, disconnected or degraded
    pub fn run(mut self) -> TaskOutcome {
        info!("logging from {:#x}", self.engine.write_cursor());
        let exit = loop {
            if let Step::Exit(exit) = self.step() {
                break exit;
            }
        };
        self.outcome(exit)
    }

    pub fn outcome(&self, exit: TaskExit) -> TaskOutcome {
        TaskOutcome {
            exit,
            buffers: self.arbiter.statuses(),
            write_cursor: self.engine.write_cursor(),
        }
    }

    /// Waits for one sample and logs it
    pub fn step(&mut self) -> Step {
        if self.done {
            return Step::Done;
        }
        if self.stop.load(Ordering::Relaxed) {
            let exit = match self.drain() {
                Ok(()) => self.shutdown(TaskExit::Stopped),
                Err(err) => self.fail(err),
            };
            return self.exit(exit);
        }

        let timeout = self.recv_timeout;
        let event = select! {
            recv(self.inertial) -> msg => match msg {
                Ok(sample) => Event::Sample(QueueKind::Inertial, sample),
                Err(_) => Event::Closed(QueueKind::Inertial),
            },
            recv(self.barometric) -> msg => match msg {
                Ok(sample) => Event::Sample(QueueKind::Barometric, sample),
                Err(_) => Event::Closed(QueueKind::Barometric),
            },
            default(timeout) => Event::Idle,
        };

        match event {
            Event::Idle => Step::Idle,
            Event::Closed(kind) => {
                debug!("{kind:?} queue closed");
                // A closed receiver is always ready, swap it out so select keeps blocking
                match kind {
                    QueueKind::Inertial => {
                        self.inertial = channel::never();
                        self.inertial_open = false;
                    }
                    QueueKind::Barometric => {
                        self.barometric = channel::never();
                        self.barometric_open = false;
                    }
                }
                if self.inertial_open || self.barometric_open {
                    Step::Idle
                } else {
                    let exit = self.shutdown(TaskExit::Disconnected);
                    self.exit(exit)
                }
            }
            Event::Sample(kind, sample) => match self.log_sample(sample) {
                Ok(SampleOutcome::Logged) => Step::Logged(kind),
                Ok(SampleOutcome::Dropped) => Step::Dropped(kind),
                Err(err) => {
                    bump(&self.stats.dropped_samples);
                    let exit = self.fail(err);
                    self.exit(exit)
                }
            },
        }
    }

    /// Encodes `sample` at the current time and appends its records, flushing as pages fill
    pub fn log_sample(&mut self, sample: SensorSample) -> Result<SampleOutcome, Error> {
        let records = match encode(&sample, self.clock.now()) {
            Ok(records) => records,
            Err(err) => {
                warn!("dropping sample: {err}");
                bump(&self.stats.invalid_samples);
                bump(&self.stats.dropped_samples);
                return Ok(SampleOutcome::Dropped);
            }
        };
        for record in &records {
            if self.append(record)? == SampleOutcome::Dropped {
                bump(&self.stats.dropped_samples);
                return Ok(SampleOutcome::Dropped);
            }
        }
        bump(&self.stats.samples_logged);
        Ok(SampleOutcome::Logged)
    }

    fn append(&mut self, record: &Record) -> Result<SampleOutcome, Error> {
        if self.arbiter.append(record)? == Append::Appended {
            bump(&self.stats.records_written);
            return Ok(SampleOutcome::Logged);
        }

        let ticket = match self.arbiter.swap() {
            Ok(ticket) => ticket,
            // Only reachable if a flush ticket was never completed, see `overrun_drops_sample`
            Err(ArbiterError::Overrun) => {
                warn!("both page buffers are busy, dropping sample");
                bump(&self.stats.overruns);
                return Ok(SampleOutcome::Dropped);
            }
            Err(err) => return Err(err.into()),
        };
        self.flush(ticket)?;

        match self.arbiter.append(record)? {
            Append::Appended => {
                bump(&self.stats.records_written);
                Ok(SampleOutcome::Logged)
            }
            // The buffer was just reset, so this means the record is bigger than a page
            Append::Full => Err(BufferError::RecordTooLarge { len: record.len() }.into()),
        }
    }

    fn flush(&mut self, ticket: FlushTicket) -> Result<(), Error> {
        let address = self.engine.flush(self.arbiter.flushing(&ticket))?;
        trace!("flushed buffer {:?} to {address:#x}", ticket.id());
        self.arbiter.complete_flush(ticket)?;
        Ok(())
    }

    /// Logs everything queued until both queues are empty
    fn drain(&mut self) -> Result<(), Error> {
        while let Some(sample) = self.try_next() {
            if let Err(err) = self.log_sample(sample) {
                bump(&self.stats.dropped_samples);
                return Err(err);
            }
        }
        Ok(())
    }

    fn try_next(&self) -> Option<SensorSample> {
        self.inertial
            .try_recv()
            .or_else(|_| self.barometric.try_recv())
            .ok()
    }

    /// Counts whatever is still queued as dropped, then disconnects the producers so they count
    /// their own drops from here on
    fn close_queues(&mut self) {
        let mut dropped = 0u64;
        while self.try_next().is_some() {
            bump(&self.stats.dropped_samples);
            dropped += 1;
        }
        if dropped > 0 {
            warn!("dropped {dropped} queued samples on exit");
        }
        self.inertial = channel::never();
        self.barometric = channel::never();
        self.inertial_open = false;
        self.barometric_open = false;
    }

    /// Writes out the partially filled buffer
    fn shutdown(&mut self, exit: TaskExit) -> TaskExit {
        let active = self.arbiter.active();
        if !self.arbiter.buffer(active).is_empty() {
            let flushed = self
                .arbiter
                .swap()
                .map_err(Error::from)
                .and_then(|ticket| self.flush(ticket));
            if let Err(err) = flushed {
                return self.fail(err);
            }
        }
        self.engine.checkpoint();
        info!(
            "logging stopped ({exit:?}), log ends at {:#x}",
            self.engine.write_cursor()
        );
        exit
    }

    fn fail(&mut self, err: Error) -> TaskExit {
        self.arbiter.degrade();
        error!("logging degraded: {err}");
        TaskExit::Degraded(err)
    }

    fn exit(&mut self, exit: TaskExit) -> Step {
        self.done = true;
        self.close_queues();
        Step::Exit(exit)
    }
}
