//! Flies a synthetic flight against an in-memory flash and reports what was recorded.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use novafc_recorder::config_format::FlightPhase;
use novafc_recorder::data_format::{SensorSample, Tag, PAGE_SIZE};
use novafc_recorder::engine::FlashAppendEngine;
use novafc_recorder::error::EngineError;
use novafc_recorder::extract::read_log;
use novafc_recorder::task::TaskExit;
use novafc_recorder::{
    BootReport, Error, FlashLayout, PageArena, RecorderConfig, RecorderStats, SharedFlash,
    SimFlash, Supervisor, SupervisorState,
};

#[derive(Parser, Debug)]
#[command(about = "Simulates a flight against an in-memory NOR flash")]
struct Args {
    /// Pages in the log region
    #[arg(long, default_value_t = 64)]
    log_pages: u32,

    /// Erase sector size in bytes, also the size of each config sector
    #[arg(long, default_value_t = 4096)]
    sector_size: u32,

    /// Sampling ticks to simulate
    #[arg(long, default_value_t = 1000)]
    ticks: u32,

    /// Make every program of this log page fail
    #[arg(long)]
    fail_page: Option<u32>,

    /// Flush retries before the recorder gives up
    #[arg(long, default_value_t = 3)]
    retries: u8,

    /// Reboot on the same flash after the flight and report what was recovered
    #[arg(long, default_value_t = false)]
    reset: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let config = RecorderConfig {
        flush_retries: args.retries,
        layout: FlashLayout::new(args.log_pages, args.sector_size),
        ..Default::default()
    };
    config.validate()?;

    let mut device = SimFlash::for_layout(&config.layout);
    if let Some(page) = args.fail_page {
        let start = page.saturating_mul(PAGE_SIZE as u32);
        info!("injecting a write fault into page {page} ({start:#x})");
        device.fail_programs_in(start..start.saturating_add(PAGE_SIZE as u32));
    }
    let flash = device.into_shared();

    fly(&flash, &config, args.ticks)?;

    if args.reset {
        info!("simulating a reset");
        flash.lock().clear_faults();
        let mut supervisor = Supervisor::new(Arc::clone(&flash), config.clone());
        let report = supervisor.boot()?;
        print_boot(&report);
    }

    summarize_log(&flash, &config)?;
    info!("device: {:?}", flash.lock().stats());
    Ok(())
}

fn fly(flash: &SharedFlash<SimFlash>, config: &RecorderConfig, ticks: u32) -> Result<(), Error> {
    let mut supervisor = Supervisor::new(Arc::clone(flash), config.clone());
    print_boot(&supervisor.boot()?);
    let producers = supervisor.start_logging()?;
    let phase = supervisor.phase_handle();
    let clock = supervisor.clock();

    let milestones = [
        (ticks / 4, FlightPhase::PreApogee),
        (ticks / 2, FlightPhase::PostDrogue),
        (ticks / 4 * 3, FlightPhase::PostMain),
    ];
    let mut degraded = false;
    for tick in 0..ticks {
        clock.tick();
        let wobble = (tick % 200) as i16 - 100;
        producers.submit(SensorSample::Inertial {
            accel: [wobble, 3, 2048],
            gyro: [0, (tick % 64) as i16, -5],
        });
        producers.submit(SensorSample::Pressure {
            pressure: 101_325 - (tick as i32 % 20_000),
        });
        if tick % 10 == 0 {
            producers.submit(SensorSample::Temperature { temp: 2_150 });
        }

        for (at, next) in milestones {
            if at == tick {
                let saved = phase.as_ref().map(|phase| phase.save_phase(next));
                if let Some(Err(err)) = saved {
                    warn!("failed to persist {next:?}: {err}");
                }
            }
        }

        if !degraded && supervisor.poll() == SupervisorState::Degraded {
            warn!("recorder degraded at tick {tick}: {:?}", supervisor.fault());
            degraded = true;
        }
    }
    drop(producers);

    match supervisor.shutdown() {
        Some(outcome) => {
            match &outcome.exit {
                TaskExit::Degraded(err) => warn!("logging ended degraded: {err}"),
                exit => info!("logging ended: {exit:?}"),
            }
            info!(
                "buffers {:?}, log ends at {:#x}",
                outcome.buffers, outcome.write_cursor
            );
        }
        None => warn!("logging task produced no outcome"),
    }
    info!("counters: {:#?}", supervisor.stats().snapshot());
    Ok(())
}

fn print_boot(report: &BootReport) {
    info!(
        "boot {}: {} config, phase {:?}, checkpoint {:#x}, log ends at {:#x}",
        report.config.boot_count,
        if report.restored { "restored" } else { "new" },
        report.phase,
        report.checkpoint,
        report.write_cursor
    );
}

fn summarize_log(flash: &SharedFlash<SimFlash>, config: &RecorderConfig) -> Result<(), Error> {
    let arena = PageArena::log(&config.layout);
    let stats = Arc::new(RecorderStats::new());
    let mut engine = FlashAppendEngine::new(Arc::clone(flash), arena, config, Arc::clone(&stats));
    let end = match engine.boot_scan(None) {
        Ok(end) => end,
        Err(EngineError::FlashFull { .. }) => arena.end_address(),
        Err(err) => return Err(err.into()),
    };
    let report = read_log(&mut *flash.lock(), arena, end, &stats)?;

    let mut per_tag: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in report.records() {
        let name = match record.tag() {
            Tag::Accel => "accel",
            Tag::Gyro => "gyro",
            Tag::Pressure => "pressure",
            Tag::Temperature => "temperature",
        };
        *per_tag.entry(name).or_default() += 1;
    }
    info!(
        "log holds {} pages, {} records {:?}, {} damaged",
        report.pages.len(),
        report.record_count(),
        per_tag,
        report.damaged_pages().count()
    );
    for page in report.damaged_pages() {
        warn!(
            "page {:#x}: checksum {:?}, error {:?}",
            page.address, page.checksum, page.error
        );
    }
    Ok(())
}
