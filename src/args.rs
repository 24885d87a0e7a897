//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::device::{bb60::Model, lookup, platform_names, x310::ClockRef};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
    /// Settings file (defaults to ~/.iq_slurper/config.toml)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture timestamped IQ data with the selected platform
    Capture {
        /// Center frequency in MHz
        #[clap(short, long, default_value_t = 2450.0)]
        center: f64,
        /// Bandwidth in MHz
        #[clap(short = 'w', long = "bw", default_value_t = 160.0, value_parser = positive)]
        bandwidth: f64,
        /// Capture size in GB
        #[clap(short, long, default_value_t = 4.0)]
        size: f64,
    },
    /// Select the hardware platform used by `capture`
    SetPlatform {
        #[clap(value_parser = known_platform)]
        name: String,
    },
    /// Set BB60 device configs
    #[clap(name = "bb60-config")]
    Bb60Config {
        /// Expected maximum input power in dBm
        #[clap(long, allow_hyphen_values = true)]
        ref_level: Option<f64>,
        /// Power of two between 1 and 8192
        #[clap(long, value_parser = clap::value_parser!(u32).range(1..))]
        decimation: Option<u32>,
        /// Open the unit with this serial number
        #[clap(long)]
        serial: Option<i32>,
        /// bb60a, bb60c or bb60d
        #[clap(long, value_parser = model)]
        model: Option<Model>,
    },
    /// Set X310 device configs
    #[clap(name = "x310-config")]
    X310Config {
        /// UHD device arguments
        #[clap(long)]
        args: Option<String>,
        /// Samples per capture unit
        #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
        spc: Option<u64>,
        /// RX frontend specification
        #[clap(long)]
        subdev: Option<String>,
        /// Clock source: internal, external or gpsdo
        #[clap(long = "ref", value_parser = clock_ref)]
        clock_ref: Option<ClockRef>,
        /// RX sample rate
        #[clap(long, value_parser = positive)]
        rate: Option<f64>,
        /// Overall RX gain
        #[clap(long)]
        gain: Option<f64>,
    },
    /// Set X310 stream arguments
    #[clap(name = "x310-stream-args")]
    X310StreamArgs {
        /// Samples per packet
        #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
        spp: Option<u64>,
    },
    /// Set simulated platform configs
    SimConfig {
        #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
        spc: Option<u64>,
        #[clap(long, value_parser = clap::value_parser!(u32).range(1..))]
        decimation: Option<u32>,
        #[clap(long, allow_hyphen_values = true)]
        ref_level: Option<f64>,
        /// Largest number of samples a single pull returns
        #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
        max_pull: Option<u64>,
        /// Tone offset from the center frequency in Hz
        #[clap(long, allow_hyphen_values = true)]
        tone_offset: Option<f64>,
    },
    /// Set recording replay configs
    FileConfig {
        /// Raw interleaved little endian f32 IQ file
        #[clap(long)]
        path: Option<PathBuf>,
        /// Sample rate the file was recorded at
        #[clap(long, value_parser = positive)]
        rate: Option<f64>,
        #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
        spc: Option<u64>,
        /// Rewind at end of file instead of failing
        #[clap(long)]
        repeat: Option<bool>,
    },
    /// Print the selected platform and its settings
    ShowConfig,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn known_platform(s: &str) -> Result<String, String> {
    lookup(s).map(|p| p.name.to_owned()).map_err(|_| {
        format!(
            "must be one of: {}",
            platform_names().collect::<Vec<_>>().join(", ")
        )
    })
}

fn positive(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(v) if v > 0.0 => Ok(v),
        Ok(_) => Err("must be positive".to_owned()),
        Err(e) => Err(e.to_string()),
    }
}

fn model(s: &str) -> Result<Model, String> {
    s.parse()
}

fn clock_ref(s: &str) -> Result<ClockRef, String> {
    s.parse()
}
