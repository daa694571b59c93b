use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use nalgebra::Vector3;

use helm_rs::config::DEFAULT_STORE_PATH;
use helm_rs::error::SensorError;
use helm_rs::profile::SharedProfile;
use helm_rs::sensor::Lis3mdlSource;
use helm_rs::storage::{self, FileStore};

#[derive(Parser, Debug)]
#[command(name = "calibrate", about = "Bench magnetometer hard-iron survey")]
struct Args {
    /// Samples to collect, one every 100 ms
    #[arg(long, default_value_t = 300)]
    samples: u32,

    /// Store to write the offsets into
    #[arg(long, default_value = DEFAULT_STORE_PATH)]
    store: PathBuf,

    /// Print the offsets without saving them
    #[arg(long)]
    dry_run: bool,
}

/// Running per-axis extremes of the field.
struct Survey {
    min: Vector3<f32>,
    max: Vector3<f32>,
    count: u32,
}

impl Survey {
    fn new() -> Self {
        Self {
            min: Vector3::repeat(f32::MAX),
            max: Vector3::repeat(f32::MIN),
            count: 0,
        }
    }

    fn add(&mut self, mag: &Vector3<f32>) {
        self.min = self.min.inf(mag);
        self.max = self.max.sup(mag);
        self.count += 1;
    }

    /// Center of the sphere traced by the field.
    fn offset(&self) -> Vector3<f32> {
        (self.min + self.max) / 2.0
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::builder().filter_level(LevelFilter::Info).parse_default_env().init();

    println!("╔══════════════════════════════════════════════════════╗");
    println!("║     Magnetometer Calibration Tool                    ║");
    println!("╚══════════════════════════════════════════════════════╝\n");

    println!("Instructions:");
    println!("1. Slowly turn the board through a FULL 360° circle, level");
    println!("2. Then roll it over and turn it again upside down");
    println!("3. Keep going until sampling ends ({} samples)\n", args.samples);

    println!("Starting in 5 seconds...\n");
    thread::sleep(Duration::from_secs(5));

    let mut sensor = Lis3mdlSource::new().context("Magnetometer not found")?;
    let mut survey = Survey::new();

    println!("Collecting samples... (ROTATE NOW!)");
    println!(
        "\n{:^8} | {:^18} | {:^18} | {:^18} | {:^24}",
        "Sample", "X Range", "Y Range", "Z Range", "Offset"
    );
    println!("{:-<8}-+-{:-<18}-+-{:-<18}-+-{:-<18}-+-{:-<24}", "", "", "", "", "");

    while survey.count < args.samples {
        match sensor.read_magnetometer() {
            Ok(mag) => {
                survey.add(&mag);

                // Print update every 10 samples
                if survey.count % 10 == 0 {
                    let offset = survey.offset();
                    println!(
                        "{:^8} | {:>7.1} to {:>7.1} | {:>7.1} to {:>7.1} | {:>7.1} to {:>7.1} | {:>7.1} {:>7.1} {:>7.1}",
                        survey.count,
                        survey.min.x,
                        survey.max.x,
                        survey.min.y,
                        survey.max.y,
                        survey.min.z,
                        survey.max.z,
                        offset.x,
                        offset.y,
                        offset.z
                    );
                }
            }
            Err(SensorError::NotReady) => {}
            Err(e) => log::warn!("Read failed: {}", e),
        }

        thread::sleep(Duration::from_millis(100));
    }

    let offset = survey.offset();
    println!(
        "\nHard-iron offset: ({:.2}, {:.2}, {:.2}) µT",
        offset.x, offset.y, offset.z
    );

    if args.dry_run {
        return Ok(());
    }

    let store = FileStore::open(&args.store)
        .with_context(|| format!("Cannot open {}", args.store.display()))?;
    let profile = SharedProfile::load(storage::shared(store));
    profile
        .update(|p| p.mag_bias = offset)
        .context("Cannot save offset")?;
    println!("Saved to {}", args.store.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_survey_offset_is_center_of_extremes() {
        let mut survey = Survey::new();
        survey.add(&Vector3::new(10.0, -20.0, 5.0));
        survey.add(&Vector3::new(30.0, 0.0, -15.0));
        survey.add(&Vector3::new(20.0, -10.0, 0.0));

        assert_eq!(survey.count, 3);
        assert_eq!(survey.offset(), Vector3::new(20.0, -10.0, -5.0));
    }
}
