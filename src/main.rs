use anyhow::Context;
use clap::Parser;
use indicatif::MultiProgress;
use iq_slurper::{
    args::{convert_filter, Args, Command},
    capture::{CancelToken, CaptureEngine},
    config::{platform_section, ConfigStore, PLATFORM_KEY, PLATFORM_SECTION},
    device::{bb60, build_selected, file, sim, x310},
    monitoring::{RateMonitor, SuspendingWriter},
    resolve::keys,
};
use tracing::{info, warn};

fn set_opt(store: &mut ConfigStore, section: &str, key: &str, value: Option<impl ToString>) {
    if let Some(v) = value {
        store.set(section, key, v);
    }
}

fn capture(
    store: &ConfigStore,
    center_mhz: f64,
    bandwidth_mhz: f64,
    size_gb: f64,
    progress: Option<&MultiProgress>,
) -> anyhow::Result<()> {
    let platform = build_selected(store)?;
    let settings = store.section(&platform_section(platform.name()));

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || handler.cancel()).context("Failed to install Ctrl-C handler")?;

    let byte_budget = (size_gb * 1e9) as i64;
    let (monitor, reporter) = RateMonitor::spawn(progress);
    let mut engine = CaptureEngine::new(platform.as_ref(), settings)
        .with_reporter(reporter)
        .with_cancel(cancel);
    let session = engine.run_capture(center_mhz * 1e6, bandwidth_mhz * 1e6, byte_budget);
    // Hangs up the progress channel
    drop(engine);
    monitor.join();

    let units = session.outcome().map_err(|e| e.clone())?;
    if session.was_cancelled() {
        warn!(
            "Capture cancelled, {} of {} units filled",
            session.units_filled(),
            units.len()
        );
    } else {
        info!("Capture finished, {} units", units.len());
    }
    Ok(())
}

fn show_config(store: &ConfigStore) -> anyhow::Result<()> {
    if let Some(path) = store.path() {
        println!("# {}", path.display());
    }
    let platform = store.selected_platform()?;
    println!("platform: {platform}");
    let mut sections = vec![platform_section(platform)];
    if platform == x310::NAME {
        sections.push(x310::STREAM_SECTION.to_owned());
    }
    for name in sections {
        println!("[{name}]");
        for (k, v) in store.section(&name).iter() {
            println!("{k} = {v}");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = args.verbose.log_level_filter();
    let multi = MultiProgress::new();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(level))
        .with_writer(SuspendingWriter::new(multi.clone()))
        .init();

    let path = match args.config {
        Some(p) => p,
        None => ConfigStore::default_path()?,
    };
    let mut store = ConfigStore::load(&path)?;

    match args.command {
        Command::Capture {
            center,
            bandwidth,
            size,
        } => {
            let progress = (level >= log::LevelFilter::Info).then_some(&multi);
            return capture(&store, center, bandwidth, size, progress);
        }
        Command::ShowConfig => return show_config(&store),
        Command::SetPlatform { name } => {
            store.set(PLATFORM_SECTION, PLATFORM_KEY, &name);
            info!("Selected platform {name}");
        }
        Command::Bb60Config {
            ref_level,
            decimation,
            serial,
            model,
        } => {
            let s = platform_section(bb60::NAME);
            set_opt(&mut store, &s, keys::REF_LEVEL, ref_level);
            set_opt(&mut store, &s, keys::DECIMATION, decimation);
            set_opt(&mut store, &s, "serial", serial);
            set_opt(&mut store, &s, "model", model.map(|m| m.as_str()));
        }
        Command::X310Config {
            args,
            spc,
            subdev,
            clock_ref,
            rate,
            gain,
        } => {
            let s = platform_section(x310::NAME);
            set_opt(&mut store, &s, "args", args);
            set_opt(&mut store, &s, keys::SAMPLES_PER_UNIT, spc);
            set_opt(&mut store, &s, "subdev", subdev);
            set_opt(&mut store, &s, "ref", clock_ref.map(|c| c.as_str()));
            set_opt(&mut store, &s, "rate", rate);
            set_opt(&mut store, &s, keys::GAIN, gain);
        }
        Command::X310StreamArgs { spp } => {
            set_opt(&mut store, x310::STREAM_SECTION, "spp", spp);
        }
        Command::SimConfig {
            spc,
            decimation,
            ref_level,
            max_pull,
            tone_offset,
        } => {
            let s = platform_section(sim::NAME);
            set_opt(&mut store, &s, keys::SAMPLES_PER_UNIT, spc);
            set_opt(&mut store, &s, keys::DECIMATION, decimation);
            set_opt(&mut store, &s, keys::REF_LEVEL, ref_level);
            set_opt(&mut store, &s, "max-pull", max_pull);
            set_opt(&mut store, &s, "tone-offset", tone_offset);
        }
        Command::FileConfig {
            path,
            rate,
            spc,
            repeat,
        } => {
            let s = platform_section(file::NAME);
            set_opt(&mut store, &s, "path", path.map(|p| p.display().to_string()));
            set_opt(&mut store, &s, "rate", rate);
            set_opt(&mut store, &s, keys::SAMPLES_PER_UNIT, spc);
            set_opt(&mut store, &s, "repeat", repeat);
        }
    }
    store
        .save()
        .with_context(|| format!("Failed to save settings to {}", path.display()))?;
    Ok(())
}
