//! Brings the recorder up in order: config first, then the boot scan, then logging.
//!
//! ```text
//! Booting -> Scanning -> Armed <-> Logging
//!    \           \                   /
//!     +-----------+--> Degraded <---+
//! ```
//!
//! A degraded recorder stops logging but keeps its [`PhaseHandle`] working, so recovery
//! decisions can still be persisted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use novafc_config_format::{ConfigRecord, FlightPhase};
use serde::{Deserialize, Serialize};

use crate::clock::{SampleClock, Ticker};
use crate::config::RecorderConfig;
use crate::engine::FlashAppendEngine;
use crate::error::{EngineError, StartupError};
use crate::flash::{Flash, PageArena, SharedFlash};
use crate::queue::{sample_queues, Producers};
use crate::stats::{bump, RecorderStats};
use crate::store::{ConfigStore, PhaseHandle, StoreHandle};
use crate::task::{LoggingContext, LoggingTask, TaskExit, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupervisorState {
    Booting,
    Scanning,
    Armed,
    Logging,
    Degraded,
}

/// Why the supervisor is degraded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Fault {
    /// Every page of the log was already written at boot
    FlashFull { pages: u32 },
    Startup { reason: String },
    /// The logging task gave up writing to flash
    LoggingFailed { reason: String },
}

/// What boot found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootReport {
    /// The config record as rewritten for this boot
    pub config: ConfigRecord,
    /// False if no record was found and defaults were written
    pub restored: bool,
    pub phase: FlightPhase,
    /// The write cursor that was checkpointed before the reset
    pub checkpoint: u32,
    /// Where the boot scan found the end of the log
    pub write_cursor: u32,
}

pub struct Supervisor<F: Flash + 'static> {
    config: RecorderConfig,
    state: SupervisorState,
    flash: SharedFlash<F>,
    stats: Arc<RecorderStats>,
    clock: Arc<SampleClock>,
    stop: Arc<AtomicBool>,
    store: Option<StoreHandle<F>>,
    engine: Option<FlashAppendEngine<F>>,
    task: Option<JoinHandle<TaskOutcome>>,
    outcome: Option<TaskOutcome>,
    ticker: Option<Ticker>,
    fault: Option<Fault>,
    boot: Option<BootReport>,
}

impl<F: Flash + 'static> Supervisor<F> {
    pub fn new(flash: SharedFlash<F>, config: RecorderConfig) -> Self {
        Self {
            config,
            state: SupervisorState::Booting,
            flash,
            stats: Arc::new(RecorderStats::new()),
            clock: Arc::new(SampleClock::new()),
            stop: Arc::new(AtomicBool::new(false)),
            store: None,
            engine: None,
            task: None,
            outcome: None,
            ticker: None,
            fault: None,
            boot: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn boot_report(&self) -> Option<&BootReport> {
        self.boot.as_ref()
    }

    pub fn stats(&self) -> Arc<RecorderStats> {
        Arc::clone(&self.stats)
    }

    pub fn clock(&self) -> Arc<SampleClock> {
        Arc::clone(&self.clock)
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Access to the persisted flight phase. Available once the config store has been read,
    /// even if the recorder later degrades
    pub fn phase_handle(&self) -> Option<PhaseHandle<F>> {
        self.store
            .as_ref()
            .map(|store| PhaseHandle::new(Arc::clone(store)))
    }

    /// Loads the config record and finds the end of the log. Must run before logging starts
    pub fn boot(&mut self) -> Result<BootReport, StartupError> {
        self.expect(SupervisorState::Booting)?;
        match self.try_boot() {
            Ok(report) => {
                self.boot = Some(report);
                self.state = SupervisorState::Armed;
                Ok(report)
            }
            Err(err) => {
                let fault = match &err {
                    StartupError::Engine(EngineError::FlashFull { pages }) => {
                        Fault::FlashFull { pages: *pages }
                    }
                    other => Fault::Startup {
                        reason: other.to_string(),
                    },
                };
                self.degrade(fault);
                Err(err)
            }
        }
    }

    fn try_boot(&mut self) -> Result<BootReport, StartupError> {
        let layout = self.config.layout;
        self.config.validate()?;
        let capacity = self.flash.lock().capacity();
        layout.validate_for(capacity)?;

        let mut store = ConfigStore::open(
            Arc::clone(&self.flash),
            &layout,
            self.config.device_id,
            self.config.sampling_rate_hz,
            Arc::clone(&self.stats),
        )?;
        let (mut record, restored) = store.load_or_init()?;
        if restored {
            info!(
                "restored config: phase {:?}, checkpointed cursor {:#x}, {} previous boots",
                record.phase(),
                record.write_cursor,
                record.boot_count
            );
        } else {
            info!("initialized config for device {:#x}", record.device_id);
        }
        let store = store.into_handle();
        self.store = Some(Arc::clone(&store));

        self.state = SupervisorState::Scanning;
        let checkpoint = record.write_cursor;
        let mut engine = FlashAppendEngine::new(
            Arc::clone(&self.flash),
            PageArena::log(&layout),
            &self.config,
            Arc::clone(&self.stats),
        );
        let write_cursor = engine.boot_scan(Some(checkpoint))?;
        info!("log ends at {write_cursor:#x}");

        record.write_cursor = write_cursor;
        record.boot_count = record.boot_count.wrapping_add(1);
        if let Err(err) = store.lock().save(&record) {
            warn!("failed to record boot in config: {err}");
            bump(&self.stats.checkpoint_failures);
        }
        self.engine = Some(engine.with_checkpoints(store));

        Ok(BootReport {
            config: record,
            restored,
            phase: record.phase(),
            checkpoint,
            write_cursor,
        })
    }

    /// Starts the logging task and returns the producers that feed it
    pub fn start_logging(&mut self) -> Result<Producers, StartupError> {
        self.expect(SupervisorState::Armed)?;
        let Some(engine) = self.engine.take() else {
            return Err(StartupError::InvalidState {
                expected: SupervisorState::Armed,
                actual: self.state,
            });
        };

        let (producers, queues) = sample_queues(
            self.config.queue_depth,
            self.config.send_timeout(),
            Arc::clone(&self.stats),
        );
        self.stop.store(false, Ordering::Relaxed);
        let context = LoggingContext {
            queues,
            engine,
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&self.stats),
            stop: Arc::clone(&self.stop),
            recv_timeout: self.config.recv_timeout(),
        };

        let spawned = thread::Builder::new()
            .name("logging".into())
            .spawn(move || LoggingTask::new(context).run());
        match spawned {
            Ok(handle) => {
                self.task = Some(handle);
                self.state = SupervisorState::Logging;
                Ok(producers)
            }
            Err(source) => {
                self.degrade(Fault::Startup {
                    reason: source.to_string(),
                });
                Err(StartupError::Spawn {
                    name: "logging",
                    source,
                })
            }
        }
    }

    /// Ticks the sample clock from a thread at the configured sampling rate
    pub fn start_clock(&mut self) -> Result<(), StartupError> {
        if self.ticker.is_some() {
            return Ok(());
        }
        let rate = self
            .boot
            .map_or(self.config.sampling_rate_hz, |boot| boot.config.sampling_rate_hz);
        self.ticker = Some(Ticker::spawn(Arc::clone(&self.clock), rate)?);
        Ok(())
    }

    /// Notices if the logging task has exited on its own
    pub fn poll(&mut self) -> SupervisorState {
        let finished = self.task.as_ref().is_some_and(|task| task.is_finished());
        if finished {
            self.join();
        }
        self.state
    }

    /// Stops the logging task, waiting for it to flush. Returns how it finished
    pub fn shutdown(&mut self) -> Option<TaskOutcome> {
        self.stop.store(true, Ordering::Relaxed);
        self.ticker = None;
        self.join();
        self.outcome.take()
    }

    /// The outcome of a logging task that exited without [`shutdown`](Self::shutdown)
    pub fn take_outcome(&mut self) -> Option<TaskOutcome> {
        self.outcome.take()
    }

    fn join(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let outcome = match task.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                self.degrade(Fault::LoggingFailed {
                    reason: "logging thread panicked".into(),
                });
                return;
            }
        };

        match &outcome.exit {
            TaskExit::Degraded(err) => self.degrade(Fault::LoggingFailed {
                reason: err.to_string(),
            }),
            TaskExit::Stopped | TaskExit::Disconnected => self.rearm(outcome.write_cursor),
        }
        self.outcome = Some(outcome);
    }

    /// Rebuilds the append engine after a clean stop so logging can be started again
    fn rearm(&mut self, write_cursor: u32) {
        let mut engine = FlashAppendEngine::new(
            Arc::clone(&self.flash),
            PageArena::log(&self.config.layout),
            &self.config,
            Arc::clone(&self.stats),
        );
        if let Some(store) = &self.store {
            engine = engine.with_checkpoints(Arc::clone(store));
        }
        match engine.boot_scan(Some(write_cursor)) {
            Ok(_) => {
                self.engine = Some(engine);
                self.state = SupervisorState::Armed;
            }
            Err(EngineError::FlashFull { pages }) => self.degrade(Fault::FlashFull { pages }),
            Err(err) => self.degrade(Fault::LoggingFailed {
                reason: err.to_string(),
            }),
        }
    }

    fn degrade(&mut self, fault: Fault) {
        error!("recorder degraded: {fault:?}");
        self.state = SupervisorState::Degraded;
        self.engine = None;
        self.fault = Some(fault);
    }

    fn expect(&self, expected: SupervisorState) -> Result<(), StartupError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(StartupError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}

impl<F: Flash + 'static> Drop for Supervisor<F> {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.stop.store(true, Ordering::Relaxed);
            self.join();
        }
    }
}
