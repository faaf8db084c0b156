//! # libpgp_daq
//!
//! libpgp_daq is the front end core of a PGP fiber linked detector data acquisition, written
//! in Rust. It configures pixel detector front ends over a register protocol carried on PGP
//! lanes, synchronizes trigger enables to the timing system's fiducial counter, and reassembles
//! the per-lane data payloads into a single detector image.
//!
//! ## Components
//!
//! - `wire_frame`: the register request/response frame codec and the data frame header
//! - `transport`: the `Transport` and `CardControl` traits at the hardware boundary, with
//! `dma_device` for a real DMA character device and `sim` for a simulated front end
//! - `register_client`: blocking register reads and fire and forget writes with response
//! matching and bounded retries
//! - `sync_window`: flow control that bounds the number of unacknowledged waiting writes
//! - `trigger`: fiducial synchronized lane enable and event code timing
//! - `config_shadow`: the in memory register set of a detector family, loaded from a YAML table
//! - `configurator`: the configure cycle for one lane, returning a `ConfigureResult` bitmask
//! - `reassembler`: scatters lane payloads into the detector image with calibration and
//! environmental rows
//! - `process`: multi-lane configure in parallel, common fiducial enable and disable, recording
//! of lane payloads from a transport, and assembly of lane recordings into HDF5
//!
//! Card control (the `CardControl` trait) is implemented by the simulated front end only; a
//! real card needs driver ioctls this crate does not provide.
//!
//! ## HDF5
//!
//! Before building, HDF5 must be installed. Typically this will be installed using a package
//! manager (homebrew, apt, etc), and the Rust libraries will auto detect the location of the
//! HDF install. If it lives somewhere custom, write the following snippet into the file
//! `.cargo/config.toml` in the repository:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! ## Configuration
//!
//! Configurations are YAML files. Use `pgp_daq_cli new -p config.yml` to write a template. A
//! `device_path` of `null` runs against the simulated front end, and a `register_map_path` of
//! `null` uses the bundled epix10ka register table.
//!
//! ### Register Table Format
//!
//! ```yml
//! family: epix10ka
//! registers:
//!   - { name: AsicMask, address: 0x0d, byte_offset: 116, mask: 0xf, default: 0xf, access: ReadWrite, display: Hex }
//! ```
//!
//! `access` is one of `ReadWrite` (written and verified), `ReadOnly` (read into the shadow),
//! `UseOnly` (software only) or `DoNotUse`.
//!
//! ### Run Time Config Additions
//!
//! An optional text file of hexadecimal `dest addr data` triples, one per line, written after
//! the ASIC registers. `dest` is `(lane << 2) | vc`.
//!
//! ## Output
//!
//! Frames assembled from lane recordings are written as:
//!
//! ```text
//! frames - min_frame, max_frame, damaged, version
//! |---- frame_# - frame_number, acq_count, damage
//! |    |---- pixels(dset)
//! |    |---- calibration(dset)
//! |    |---- environmental(dset)
//! ```
pub mod config;
pub mod config_shadow;
pub mod configurator;
pub mod constants;
pub mod destination;
pub mod dma_device;
pub mod error;
pub mod frame_writer;
pub mod lane_recording;
pub mod pixel_map;
pub mod process;
pub mod reassembler;
pub mod register_client;
pub mod run_time_config;
pub mod sim;
pub mod sync_window;
pub mod transport;
pub mod trigger;
pub mod wire_frame;
pub mod worker_status;
