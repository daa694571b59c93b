use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use helm_rs::actuators::{self, ServoActuators, SharedActuators, VirtualActuators};
use helm_rs::autopilot::{Autopilot, AutopilotAction};
use helm_rs::calibration::{CalibrationEngine, CaptureRequests};
use helm_rs::config::{
    CONTROL_PERIOD_MS, DEFAULT_BIND_ADDR, DEFAULT_STORE_PATH, MAIN_LOOP_INTERVAL, SAMPLE_RATE_HZ,
    TELEMETRY_INTERVAL,
};
use helm_rs::estimator::{Estimator, MadgwickFusion};
use helm_rs::gpio_input::AutopilotButton;
use helm_rs::link::UdpLink;
use helm_rs::profile::SharedProfile;
use helm_rs::protocol::{Telemetry, TelemetrySink};
use helm_rs::sensor::{Disconnected, Lis3mdlSource, RawSample, SensorSource, StaticSource};
use helm_rs::state::HeadingCell;
use helm_rs::storage::{self, FileStore, MemoryStore, SharedStore};
use helm_rs::vessel::Vessel;

#[derive(Parser, Debug)]
#[command(name = "helm-rs", about = "Heading hold and launch autopilot for a small boat")]
struct Args {
    /// UDP address the remote client talks to
    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    bind: String,

    /// JSON file holding calibration and PID gains
    #[arg(long, default_value = DEFAULT_STORE_PATH)]
    store: PathBuf,

    /// Estimator rate (Hz)
    #[arg(long, default_value_t = SAMPLE_RATE_HZ)]
    sample_rate: u32,

    /// Heading controller period (ms)
    #[arg(long, default_value_t = CONTROL_PERIOD_MS)]
    control_period_ms: u64,

    /// Feed the estimator a level, north-facing synthetic sample
    #[arg(long)]
    mock_sensor: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn open_store(path: &Path) -> SharedStore {
    match FileStore::open(path) {
        Ok(store) => storage::shared(store),
        Err(e) => {
            log::warn!("Cannot open {} ({}), settings will not survive a restart", path.display(), e);
            storage::shared(MemoryStore::new())
        }
    }
}

fn open_actuators(trim: f32) -> SharedActuators {
    match ServoActuators::new(trim) {
        Ok(servos) => actuators::shared(servos),
        Err(e) => {
            log::warn!("PWM unavailable ({}), actuator commands are virtual", e);
            actuators::shared(VirtualActuators::default())
        }
    }
}

/// The sensor, or a reason it is missing.
fn open_sensor(mock: bool) -> (Box<dyn SensorSource>, Option<String>) {
    if mock {
        log::info!("Using synthetic sensor");
        return (Box::new(StaticSource(RawSample::level())), None);
    }

    match Lis3mdlSource::new() {
        Ok(sensor) => (Box::new(sensor), None),
        Err(e) => {
            log::warn!("Sensor init failed: {}. Running without heading.", e);
            (Box::new(Disconnected), Some(format!("Sensor init failed: {e}")))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    log::info!("Starting helm-rs...");

    let store = open_store(&args.store);
    let profile = Arc::new(SharedProfile::load(store));
    let trim = profile.snapshot().actuator_trim;

    let link = Arc::new(
        UdpLink::bind(&args.bind).with_context(|| format!("Cannot bind UDP {}", args.bind))?,
    );
    log::info!("Listening on {}", link.local_addr()?);
    let sink: Arc<dyn TelemetrySink> = link.clone();

    let heading = Arc::new(HeadingCell::new());
    let captures = Arc::new(CaptureRequests::new());
    let actuators = open_actuators(trim);

    // Estimator with the calibration engine hooked into its sample stream
    let (source, sensor_fault) = open_sensor(args.mock_sensor);
    let mut engine = CalibrationEngine::new(profile.clone(), captures.clone(), sink.clone());
    Estimator::new(
        source,
        Box::new(MadgwickFusion::new(args.sample_rate)),
        profile.clone(),
        heading.clone(),
        sink.clone(),
    )
    .on_sample(move |_, raw| engine.on_sample(raw))
    .spawn(args.sample_rate)
    .context("Cannot start estimator")?;

    let mut vessel = Vessel::new(
        profile.clone(),
        heading,
        captures,
        actuators,
        sink.clone(),
        Duration::from_millis(args.control_period_ms),
    );
    // outputs start at neutral
    vessel.halt();

    let button = match AutopilotButton::new() {
        Ok(button) => Some(button),
        Err(e) => {
            log::warn!("Autopilot button unavailable: {}", e);
            None
        }
    };
    let mut autopilot = Autopilot::new(profile.snapshot().autopilot_max_speed);
    if button.as_ref().is_some_and(AutopilotButton::is_held) {
        autopilot.arm();
    }

    log::info!("Main control loop started");

    let mut next_telemetry = Instant::now();

    loop {
        for message in link.poll_incoming() {
            if let Err(e) = vessel.handle_packet(&message) {
                log::warn!("Dropped message: {}", e);
            }
        }

        // greet new clients with the current state
        if !link.take_joined().is_empty() {
            if let Some(fault) = &sensor_fault {
                sink.send(&Telemetry::Message(fault.clone()));
            }
            sink.send(&Telemetry::Coefficients(vessel.coefficients()));
        }

        let now = Instant::now();
        if now >= next_telemetry {
            vessel.send_heading();
            next_telemetry = now + TELEMETRY_INTERVAL;
        }

        let held = button.as_ref().is_some_and(AutopilotButton::is_held);
        autopilot.set_max_speed(vessel.profile().autopilot_max_speed);
        match autopilot.update(held, now) {
            AutopilotAction::None => {}
            AutopilotAction::Engage => vessel.engage(),
            AutopilotAction::Throttle(percent) => vessel.set_throttle(percent),
            AutopilotAction::Halt => break,
        }

        thread::sleep(MAIN_LOOP_INTERVAL);
    }

    vessel.halt();
    log::error!("Autopilot run complete. Control loop locked out until restart.");
    sink.send(&Telemetry::Message("Autopilot halted, restart required".into()));

    // Safety lockout: never return to the control loop
    loop {
        thread::park();
    }
}
