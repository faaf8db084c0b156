//! # pgp_daq_cli
//!
//! Part of the pgp_daq crate family.
//!
//! This is the command line front end for configuring PGP detector front ends and assembling
//! recorded lane data.
//!
//! ## Use
//!
//! ```bash
//! pgp_daq_cli -p config.yml new
//! pgp_daq_cli -p config.yml configure
//! pgp_daq_cli -p config.yml enable --target 0x100
//! pgp_daq_cli -p config.yml disable
//! pgp_daq_cli -p config.yml record --frames 1000
//! pgp_daq_cli -p config.yml assemble
//! pgp_daq_cli -p config.yml read --lane 0 --address 0x0
//! pgp_daq_cli -p config.yml write --lane 0 --address 0x3e --value 1
//! ```
//!
//! `new` writes a template configuration. `configure` runs the configure cycle on every lane
//! in parallel. `enable` starts every lane on a common fiducial and `disable` stops them.
//! `configure`, `enable` and `disable` drive the simulated front end only. `record` writes the
//! data payloads from the configured device into the lane recordings, and `assemble` turns the
//! lane recordings into an HDF5 file of frames. `read` and `write` access a single register on
//! the configured device. Library logs go to `./pgp_daq.log`.
use clap::{Arg, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use libpgp_daq::config::Config;
use libpgp_daq::constants::{DATA_FRAME_WORDS, ENABLE_POLL_INTERVAL, REGISTER_FRAME_WORDS};
use libpgp_daq::dma_device::DmaDevice;
use libpgp_daq::error::ProcessorError;
use libpgp_daq::process::{
    assemble_recordings, configure_lanes, disable_lanes, enable_lanes, read_register,
    record_lanes, simulated_configurators, write_register,
};
use libpgp_daq::sim::SimFrontEnd;
use libpgp_daq::transport::Transport;
use libpgp_daq::worker_status::{BarColor, WorkerStatus};

const LOG_FILE: &str = "./pgp_daq.log";

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = match serde_yaml::to_string(&config) {
        Ok(yaml) => yaml,
        Err(e) => {
            log::error!("Could not serialize template config: {e}");
            return;
        }
    };
    if let Err(e) = std::fs::write(path, yaml_str) {
        log::error!("Could not write template config: {e}");
    }
}

/// Send library logs to a file, like the terminal logs but without the progress bars
fn init_library_logger(verbose: bool) {
    let level = if verbose {
        spdlog::LevelFilter::All
    } else {
        spdlog::LevelFilter::MoreSevereEqual(spdlog::Level::Info)
    };
    let file_sink = match spdlog::sink::FileSink::builder()
        .path(PathBuf::from(LOG_FILE))
        .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
            spdlog::formatter::pattern!(
                "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
            ),
        )))
        .truncate(true)
        .build()
    {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            log::error!("Could not open {LOG_FILE}: {e}");
            return;
        }
    };
    match spdlog::Logger::builder()
        .level_filter(level)
        .flush_level_filter(spdlog::LevelFilter::All)
        .sink(file_sink)
        .build()
    {
        Ok(logger) => spdlog::set_default_logger(Arc::new(logger)),
        Err(e) => log::error!("Could not create library logger: {e}"),
    }
}

fn parse_number(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse::<u32>().ok(),
    }
}

fn register_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("lane")
                .short('l')
                .long("lane")
                .required(true)
                .help("Lane of the front end"),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .required(true)
                .help("Register address, decimal or 0x hex"),
        )
}

fn make_bar(pb_manager: &MultiProgress, color: &BarColor, prefix: String) -> ProgressBar {
    let color = match color {
        BarColor::CYAN => "cyan",
        BarColor::MAGENTA => "magenta",
        BarColor::RED => "red",
        BarColor::GREEN => "green",
    };
    let template = format!("{{prefix:>8}} [{{bar:40.{color}}}] {{percent:>3}}% {{msg}}");
    let pb = pb_manager.add(ProgressBar::new(100));
    if let Ok(style) = ProgressStyle::with_template(&template) {
        pb.set_style(style);
    }
    pb.set_prefix(prefix);
    pb
}

/// Poll the workers' status messages into progress bars until the task finishes
fn watch<T>(
    pb_manager: &MultiProgress,
    rx: Receiver<WorkerStatus>,
    handle: JoinHandle<Result<T, ProcessorError>>,
) -> Option<T> {
    let mut bars: Vec<Option<ProgressBar>> = Vec::new();
    loop {
        std::thread::sleep(Duration::from_millis(100));
        // checked before draining so the final statuses are never missed
        let finished = handle.is_finished();
        for status in rx.try_iter() {
            if bars.len() <= status.worker_id {
                bars.resize(status.worker_id + 1, None);
            }
            let pb = bars[status.worker_id].get_or_insert_with(|| {
                make_bar(pb_manager, &status.color, format!("lane {}", status.lane))
            });
            pb.set_position((status.progress * 100.0) as u64);
            if status.progress >= 1.0 {
                if let BarColor::RED = status.color {
                    let stage = status
                        .stage
                        .map(|s| s.name())
                        .unwrap_or("front end unreachable");
                    pb.abandon_with_message(format!("failed: {stage}"));
                } else {
                    pb.finish_with_message("done");
                }
            }
        }

        if finished {
            return match handle.join() {
                Ok(Ok(value)) => Some(value),
                Ok(Err(e)) => {
                    log::error!("Task failed with error: {e}");
                    None
                }
                Err(_) => {
                    log::error!("Failed to join worker task!");
                    None
                }
            };
        }
    }
}

/// Lane control needs card ioctls, which only the simulated front end provides
fn refuse_device(config: &Config, action: &str) -> bool {
    match &config.device_path {
        Some(device) => {
            log::error!(
                "Cannot {action} {}: card control through driver ioctls is not available. Remove device_path to use the simulated front end.",
                device.to_string_lossy()
            );
            true
        }
        None => false,
    }
}

fn run_configure(config: Config, pb_manager: &MultiProgress) {
    if refuse_device(&config, "configure") {
        return;
    }
    log::info!("Configuring lanes {:?} on the simulated front end...", config.lanes);
    let sim = SimFrontEnd::new();
    let mut configurators = match simulated_configurators(&config, &sim) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    let program = config.asic_program();
    let (tx, rx) = mpsc::channel();
    let handle =
        std::thread::spawn(move || configure_lanes(&mut configurators, &program, true, &tx));
    if let Some(result) = watch(pb_manager, rx, handle) {
        if result.is_success() {
            log::info!("Successfully configured all lanes!");
        } else {
            log::error!("Configure result {:#x}: {}", result.bits(), result);
        }
    }
}

fn run_enable(config: &Config, args: &ArgMatches) {
    if refuse_device(config, "enable") {
        return;
    }
    let target = match args.get_one::<String>("target").and_then(|t| parse_number(t)) {
        Some(target) => target,
        None => {
            log::error!("Target must be a number");
            return;
        }
    };
    let sim = SimFrontEnd::new();
    sim.state().fiducial_step = 1;
    let result = simulated_configurators(config, &sim)
        .and_then(|mut c| enable_lanes(&mut c, target, ENABLE_POLL_INTERVAL));
    match result {
        Ok(loaded) => log::info!("Lanes {:?} enabled at fiducial {loaded:#x}", config.lanes),
        Err(e) => log::error!("Enable failed: {e}"),
    }
}

fn run_disable(config: &Config) {
    if refuse_device(config, "disable") {
        return;
    }
    let sim = SimFrontEnd::new();
    let result = simulated_configurators(config, &sim).and_then(|mut c| disable_lanes(&mut c));
    match result {
        Ok(()) => log::info!("Lanes {:?} disabled", config.lanes),
        Err(e) => log::error!("Disable failed: {e}"),
    }
}

fn run_record(config: Config, args: &ArgMatches, pb_manager: &MultiProgress) {
    let frames = match args.get_one::<String>("frames").and_then(|f| f.parse::<u64>().ok()) {
        Some(frames) => frames,
        None => {
            log::error!("Frames must be a number");
            return;
        }
    };
    let device = match &config.device_path {
        Some(path) => match DmaDevice::open(path, DATA_FRAME_WORDS) {
            Ok(device) => device,
            Err(e) => {
                log::error!("{e}");
                return;
            }
        },
        None => {
            log::error!("Recording needs a device_path");
            return;
        }
    };
    log::info!(
        "Recording {frames} payloads into {} lane recordings...",
        config.recording_paths.len()
    );
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || record_lanes(device, &config, frames, &tx, 0));
    if let Some(recorded) = watch(pb_manager, rx, handle) {
        log::info!("Successfully recorded {recorded} payloads!");
    }
}

fn run_assemble(config: Config, pb_manager: &MultiProgress) {
    log::info!(
        "Assembling {} lane recordings into {}...",
        config.recording_paths.len(),
        config.hdf_path.to_string_lossy()
    );
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || assemble_recordings(&config, &tx, 0));
    if let Some(frames) = watch(pb_manager, rx, handle) {
        log::info!("Successfully assembled {frames} frames!");
    }
}

fn access<T: Transport>(
    transport: T,
    lane: u8,
    address: u32,
    value: Option<u32>,
) -> Result<Option<u32>, ProcessorError> {
    match value {
        Some(value) => {
            write_register(transport, lane, address, value)?;
            Ok(None)
        }
        None => Ok(Some(read_register(transport, lane, address)?)),
    }
}

fn run_register_access(config: &Config, args: &ArgMatches, write: bool) {
    let lane = args
        .get_one::<String>("lane")
        .and_then(|l| l.parse::<u8>().ok());
    let address = args.get_one::<String>("address").and_then(|a| parse_number(a));
    let value = args.get_one::<String>("value").and_then(|v| parse_number(v));
    let (lane, address) = match (lane, address) {
        (Some(lane), Some(address)) => (lane, address),
        _ => {
            log::error!("Lane and address must be numbers");
            return;
        }
    };
    if write && value.is_none() {
        log::error!("Value must be a number");
        return;
    }

    let result = match &config.device_path {
        Some(path) => match DmaDevice::open(path, REGISTER_FRAME_WORDS) {
            Ok(device) => access(device, lane, address, value),
            Err(e) => Err(e.into()),
        },
        None => {
            log::warn!("No device_path configured, using the simulated front end");
            access(SimFrontEnd::new().transport(), lane, address, value)
        }
    };
    match result {
        Ok(Some(read)) => log::info!("lane {lane} address {address:#x} = {read:#x} ({read})"),
        Ok(None) => log::info!("Wrote lane {lane} address {address:#x}"),
        Err(e) => log::error!("Register access failed: {e}"),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("pgp_daq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(Command::new("configure").about("Configure every lane in the config"))
        .subcommand(
            Command::new("enable")
                .about("Enable every lane on a common fiducial")
                .arg(
                    Arg::new("target")
                        .short('t')
                        .long("target")
                        .default_value("0")
                        .help("Fiducial to enable on, decimal or 0x hex"),
                ),
        )
        .subcommand(Command::new("disable").about("Disable every lane"))
        .subcommand(
            Command::new("record")
                .about("Record data payloads from the device into the lane recordings")
                .arg(
                    Arg::new("frames")
                        .short('n')
                        .long("frames")
                        .required(true)
                        .help("Number of payloads to record"),
                ),
        )
        .subcommand(Command::new("assemble").about("Assemble lane recordings into HDF5"))
        .subcommand(register_args(
            Command::new("read").about("Read a single register"),
        ))
        .subcommand(register_args(
            Command::new("write").about("Write a single register").arg(
                Arg::new("value")
                    .short('v')
                    .long("value")
                    .required(true)
                    .help("Value to write, decimal or 0x hex"),
            ),
        ))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the config file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .is_err()
    {
        eprintln!("Could not create logging/progress!");
        return;
    }
    log::set_max_level(log::LevelFilter::Info);

    // Parse the cli
    let config_path = match matches.get_one::<String>("path") {
        Some(p) => PathBuf::from(p),
        None => {
            log::error!("A config path is required");
            return;
        }
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    if let Err(e) = config.validate() {
        log::error!("{e}");
        return;
    }
    if config.is_verbose() {
        log::set_max_level(log::LevelFilter::Debug);
    }
    init_library_logger(config.is_verbose());
    log::info!("Config successfully loaded.");
    match &config.device_path {
        Some(device) => log::info!("Device: {}", device.to_string_lossy()),
        None => log::info!("Device: simulated"),
    }
    log::info!("Lanes: {:?} (offset {})", config.lanes, config.lane_offset);
    log::info!("Window capacity: {}", config.window_capacity);

    match matches.subcommand() {
        Some(("configure", _)) => run_configure(config, &pb_manager),
        Some(("enable", args)) => run_enable(&config, args),
        Some(("disable", _)) => run_disable(&config),
        Some(("record", args)) => run_record(config, args, &pb_manager),
        Some(("assemble", _)) => run_assemble(config, &pb_manager),
        Some(("read", args)) => run_register_access(&config, args, false),
        Some(("write", args)) => run_register_access(&config, args, true),
        _ => log::error!("Nothing to do, pick a subcommand"),
    }

    log::info!("Done.");
}
