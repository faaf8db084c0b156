use std::sync::mpsc::Sender;
use std::time::Duration;

use super::config::Config;
use super::configurator::{AsicProgram, ConfigureResult, Configurator};
use super::constants::{ENABLE_POLLS, POLL_INTERVAL};
use super::destination::{Destination, VirtualChannel};
use super::error::ProcessorError;
use super::frame_writer::FrameWriter;
use super::lane_recording::{LaneRecording, LaneRecordingWriter};
use super::reassembler::FrameReassembler;
use super::register_client::RegisterClient;
use super::sim::{SimCard, SimFrontEnd, SimTransport};
use super::sync_window::SyncWindow;
use super::transport::{CardControl, Transport};
use super::trigger::TriggerState;
use super::wire_frame::{words_to_bytes, DataFrameHeader};
use super::worker_status::{BarColor, WorkerStatus};

/// Every virtual channel on a lane
const ALL_VCS: u8 = 0xf;

/// Build one Configurator per configured lane on the simulated front end
pub fn simulated_configurators(
    config: &Config,
    sim: &SimFrontEnd,
) -> Result<Vec<Configurator<SimTransport, SimCard>>, ProcessorError> {
    config.validate()?;
    let shadow = config.load_shadow()?;
    let mut configurators = Vec::with_capacity(config.lanes.len());
    for lane in config.lanes.iter() {
        let mut card = sim.card();
        card.allocate_vc_mask(*lane, ALL_VCS)?;
        configurators.push(Configurator::new(
            sim.transport(),
            card,
            *lane,
            shadow.clone(),
            config.settings(),
        ));
    }
    Ok(configurators)
}

/// Configure every lane in parallel, one scoped worker per lane.
///
/// Each worker reports a WorkerStatus when it starts and when it finishes (green on success,
/// red with the first failed stage otherwise). The lane results are combined with a bitwise OR.
pub fn configure_lanes<T, C>(
    configurators: &mut [Configurator<T, C>],
    program: &AsicProgram,
    first: bool,
    tx: &Sender<WorkerStatus>,
) -> Result<ConfigureResult, ProcessorError>
where
    T: Transport + Send,
    C: CardControl + Send,
{
    let lanes: Vec<u8> = configurators.iter().map(|c| c.lane()).collect();
    std::thread::scope(|scope| {
        let handles: Vec<_> = configurators
            .iter_mut()
            .enumerate()
            .map(|(worker_id, configurator)| {
                let tx = tx.clone();
                scope.spawn(move || -> Result<ConfigureResult, ProcessorError> {
                    let lane = configurator.lane();
                    tx.send(WorkerStatus::new(0.0, lane, worker_id, BarColor::CYAN))?;
                    let result = configurator.configure(program, first);
                    let status = match result.failed_stages().first() {
                        Some(stage) => {
                            WorkerStatus::new(1.0, lane, worker_id, BarColor::RED)
                                .with_stage(*stage)
                        }
                        None if result.is_fatal() => {
                            WorkerStatus::new(1.0, lane, worker_id, BarColor::RED)
                        }
                        None => WorkerStatus::new(1.0, lane, worker_id, BarColor::GREEN),
                    };
                    tx.send(status)?;
                    Ok(result)
                })
            })
            .collect();

        let mut aggregate = ConfigureResult::success();
        for (handle, lane) in handles.into_iter().zip(lanes) {
            match handle.join() {
                Ok(result) => {
                    let result = result?;
                    spdlog::info!("Lane {} configure result: {}", lane, result);
                    aggregate |= result;
                }
                Err(_) => return Err(ProcessorError::WorkerPanicked(lane)),
            }
        }
        Ok(aggregate)
    })
}

/// Enable every lane on a common fiducial.
///
/// The first lane is armed on `target` (or a fresh target if that one already passed) and the
/// rest follow on the target it loaded. Each lane is then polled, sleeping `poll_interval`
/// between polls, until the hardware reports the enable. Returns the loaded target.
pub fn enable_lanes<T: Transport, C: CardControl>(
    configurators: &mut [Configurator<T, C>],
    target: u32,
    poll_interval: Duration,
) -> Result<u32, ProcessorError> {
    let mut loaded = target;
    for (idx, configurator) in configurators.iter_mut().enumerate() {
        let armed = configurator.trigger().arm(loaded)?;
        if idx == 0 {
            loaded = armed;
        }
    }
    for configurator in configurators.iter_mut() {
        configurator.trigger().enable()?;
    }
    spdlog::info!(
        "Enabling {} lanes at fiducial {:#x}",
        configurators.len(),
        loaded
    );
    for configurator in configurators.iter_mut() {
        let lane = configurator.lane();
        let mut polls = 0;
        while configurator.trigger().poll()? != TriggerState::Enabled {
            polls += 1;
            if polls >= ENABLE_POLLS {
                spdlog::error!("Lane {} was not enabled after {} polls", lane, polls);
                return Err(ProcessorError::EnableTimeout(lane, loaded, ENABLE_POLLS));
            }
            std::thread::sleep(poll_interval);
        }
        spdlog::info!("Lane {} enabled", lane);
    }
    Ok(loaded)
}

/// Disable every lane immediately
pub fn disable_lanes<T: Transport, C: CardControl>(
    configurators: &mut [Configurator<T, C>],
) -> Result<(), ProcessorError> {
    for configurator in configurators.iter_mut() {
        configurator.trigger().disable()?;
        spdlog::info!("Lane {} disabled", configurator.lane());
    }
    Ok(())
}

/// Record data payloads from a transport into the lane recordings.
///
/// Each payload goes to the recording of its lane: `recording_paths[lane - lane_offset]`.
/// Payloads too short for a data header, or from lanes without a recording, are dropped with
/// a warning. Stops after `frames` payloads or once the transport is quiet for a poll
/// interval. Returns the number of payloads recorded.
pub fn record_lanes<T: Transport>(
    mut transport: T,
    config: &Config,
    frames: u64,
    tx: &Sender<WorkerStatus>,
    worker_id: usize,
) -> Result<u64, ProcessorError> {
    let mut writers = config
        .recording_paths
        .iter()
        .map(|path| LaneRecordingWriter::create(path))
        .collect::<Result<Vec<_>, _>>()?;
    spdlog::info!(
        "Recording up to {} payloads into {} lane recordings",
        frames,
        writers.len()
    );
    tx.send(WorkerStatus::new(
        0.0,
        config.lane_offset,
        worker_id,
        BarColor::CYAN,
    ))?;
    let mut recorded: u64 = 0;
    let mut dropped: u64 = 0;
    let mut last_progress: f32 = 0.0;
    while recorded < frames {
        let words = match transport.poll(POLL_INTERVAL)? {
            Some(words) => words,
            None => {
                spdlog::info!("Transport quiet, stopping after {} payloads", recorded);
                break;
            }
        };
        let payload = words_to_bytes(&words);
        let header = match DataFrameHeader::decode(&payload) {
            Ok(header) => header,
            Err(e) => {
                spdlog::warn!("Dropping payload: {e}");
                dropped += 1;
                continue;
            }
        };
        let writer = header
            .lane
            .checked_sub(config.lane_offset)
            .and_then(|quad| writers.get_mut(quad as usize));
        match writer {
            Some(writer) => {
                writer.write_payload(&payload)?;
                recorded += 1;
            }
            None => {
                spdlog::warn!(
                    "Dropping frame {} from lane {}, which has no recording",
                    header.frame_number,
                    header.lane
                );
                dropped += 1;
                continue;
            }
        }

        let progress = recorded as f32 / frames as f32;
        if progress - last_progress > 0.01 {
            last_progress = progress;
            tx.send(WorkerStatus::new(
                progress,
                config.lane_offset,
                worker_id,
                BarColor::CYAN,
            ))?;
        }
    }
    for writer in writers {
        writer.close()?;
    }
    tx.send(WorkerStatus::new(
        1.0,
        config.lane_offset,
        worker_id,
        BarColor::CYAN,
    ))?;
    spdlog::info!("Recorded {} payloads, dropped {}", recorded, dropped);
    Ok(recorded)
}

/// Read one register, used as a link check from the command line
pub fn read_register<T: Transport>(
    transport: T,
    lane: u8,
    address: u32,
) -> Result<u32, ProcessorError> {
    let client = RegisterClient::new(transport);
    let destination = Destination::new(lane, VirtualChannel::Registers);
    Ok(client.register(destination, address).read()?)
}

/// Write one register and wait for the acknowledgment
pub fn write_register<T: Transport>(
    transport: T,
    lane: u8,
    address: u32,
    value: u32,
) -> Result<(), ProcessorError> {
    let client = RegisterClient::new(transport);
    let destination = Destination::new(lane, VirtualChannel::Registers);
    let mut window = SyncWindow::new(&client, destination, 1);
    window.take()?;
    client.register(destination, address).write_waiting(value)?;
    window.clear()?;
    Ok(())
}

/// Assemble frames from the lane recordings and write them to HDF5.
///
/// Reads one payload per lane per event until every recording is exhausted. A lane that runs
/// out early leaves its quad missing in the remaining frames. Returns the number of frames.
pub fn assemble_recordings(
    config: &Config,
    tx: &Sender<WorkerStatus>,
    worker_id: usize,
) -> Result<u64, ProcessorError> {
    let mut recordings = config
        .recording_paths
        .iter()
        .map(|path| LaneRecording::open(path))
        .collect::<Result<Vec<_>, _>>()?;
    let total_size: u64 = recordings.iter().map(|r| r.size_bytes()).sum();
    spdlog::info!(
        "Assembling {} lane recordings with total size: {}",
        recordings.len(),
        human_bytes::human_bytes(total_size as f64)
    );

    let mut reassembler = FrameReassembler::new(config.geometry, config.lane_offset);
    let mut writer = FrameWriter::new(&config.hdf_path)?;
    let flush_frac: f32 = 0.01;
    let mut last_progress: f32 = 0.0;
    let mut frame_counter: u64 = 0;
    tx.send(WorkerStatus::new(
        0.0,
        config.lane_offset,
        worker_id,
        BarColor::MAGENTA,
    ))?;
    loop {
        let mut payloads = Vec::with_capacity(recordings.len());
        for recording in recordings.iter_mut() {
            if let Some(payload) = recording.next_payload()? {
                payloads.push(payload);
            }
        }
        if payloads.is_empty() {
            break;
        }
        let frame = reassembler.assemble(payloads)?;
        writer.write_frame(&frame, frame_counter)?;
        frame_counter += 1;

        let progress = recordings.iter().map(|r| r.progress()).sum::<f32>()
            / recordings.len() as f32;
        if progress - last_progress > flush_frac {
            last_progress = progress;
            tx.send(WorkerStatus::new(
                progress,
                config.lane_offset,
                worker_id,
                BarColor::MAGENTA,
            ))?;
        }
    }
    writer.close()?;
    tx.send(WorkerStatus::new(
        1.0,
        config.lane_offset,
        worker_id,
        BarColor::MAGENTA,
    ))?;
    spdlog::info!("Assembled {} frames.", frame_counter);
    Ok(frame_counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurator::Stage;
    use crate::error::TransportError;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Hands back queued frames, then goes quiet
    struct Replay(VecDeque<Vec<u32>>);

    impl Transport for Replay {
        fn post(&mut self, _frame: &[u32]) -> Result<(), TransportError> {
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> Result<Option<Vec<u32>>, TransportError> {
            Ok(self.0.pop_front())
        }
    }

    fn data_frame(lane: u8, frame_number: u32) -> Vec<u32> {
        let header = DataFrameHeader {
            lane,
            vc: 0,
            tid: 0,
            acq_count: 0,
            op_code: 0,
            element_id: 0,
            frame_number,
            ticks: 0,
            fiducials: 0,
            board_temperatures: [0; 4],
            frame_type: 0,
        };
        let mut words = header.encode().to_vec();
        words.extend_from_slice(&[frame_number; 4]);
        words
    }

    #[test]
    fn test_configure_lanes_in_parallel() {
        let sim = SimFrontEnd::new();
        let mut config = Config::default();
        config.lanes = vec![0, 1, 2, 3];
        let mut configurators = simulated_configurators(&config, &sim).unwrap();
        // every lane reads back a different value for one register
        sim.state().faults.stuck_values.insert(0x21, 1);
        let (tx, rx) = mpsc::channel();
        let result =
            configure_lanes(&mut configurators, &config.asic_program(), true, &tx).unwrap();
        assert!(result.stage_failed(Stage::Readback));
        assert!(!result.is_fatal());

        let statuses: Vec<WorkerStatus> = rx.try_iter().collect();
        assert_eq!(statuses.len(), 8);
        let state = sim.state();
        for lane in 0..4 {
            assert_eq!(state.lanes[lane].vc_mask, ALL_VCS);
            assert_eq!(state.lanes[lane].sequence_resets, 1);
        }
    }

    #[test]
    fn test_configure_lanes_success() {
        let sim = SimFrontEnd::new();
        let mut config = Config::default();
        config.lanes = vec![0, 1];
        let mut configurators = simulated_configurators(&config, &sim).unwrap();
        let (tx, rx) = mpsc::channel();
        let result =
            configure_lanes(&mut configurators, &config.asic_program(), false, &tx).unwrap();
        assert!(result.is_success(), "{result}");
        assert!(rx
            .try_iter()
            .filter(|s| s.progress == 1.0)
            .all(|s| matches!(s.color, BarColor::GREEN)));
    }

    #[test]
    fn test_enable_lanes_on_common_fiducial() {
        let sim = SimFrontEnd::new();
        sim.state().fiducial_step = 1;
        let mut config = Config::default();
        config.lanes = vec![0, 1];
        let mut configurators = simulated_configurators(&config, &sim).unwrap();

        let target = enable_lanes(&mut configurators, 20, Duration::ZERO).unwrap();
        assert_eq!(target, 20);
        {
            let state = sim.state();
            for lane in 0..2 {
                assert!(state.lanes[lane].enabled);
                assert_eq!(state.lanes[lane].fiducial_target, 20);
            }
            assert!(state.fiducial >= 20);
        }
        for configurator in configurators.iter_mut() {
            assert_eq!(configurator.trigger().state(), TriggerState::Enabled);
        }

        disable_lanes(&mut configurators).unwrap();
        let state = sim.state();
        assert!(!state.lanes[0].enabled && !state.lanes[1].enabled);
        drop(state);
        assert_eq!(configurators[1].trigger().state(), TriggerState::Disabled);
    }

    #[test]
    fn test_enable_lanes_rearms_passed_target() {
        let sim = SimFrontEnd::new();
        {
            let mut state = sim.state();
            state.fiducial = 500;
            state.fiducial_step = 1;
        }
        let mut configurators = simulated_configurators(&Config::default(), &sim).unwrap();
        let target = enable_lanes(&mut configurators, 100, Duration::ZERO).unwrap();
        assert_eq!(target, 504);
        assert!(sim.state().lanes[0].enabled);
    }

    #[test]
    fn test_enable_lanes_times_out() {
        let sim = SimFrontEnd::new();
        let mut configurators = simulated_configurators(&Config::default(), &sim).unwrap();
        // the fiducial counter never moves
        assert!(matches!(
            enable_lanes(&mut configurators, 20, Duration::ZERO),
            Err(ProcessorError::EnableTimeout(0, 20, ENABLE_POLLS))
        ));
    }

    #[test]
    fn test_record_lanes() {
        let dir = std::env::temp_dir();
        let mut config = Config::default();
        config.lane_offset = 4;
        config.lanes = vec![4, 5];
        config.recording_paths = vec![
            dir.join(format!("pgp_daq_record_{}_0.bin", std::process::id())),
            dir.join(format!("pgp_daq_record_{}_1.bin", std::process::id())),
        ];
        let frames = vec![
            data_frame(4, 1),
            data_frame(5, 1),
            // no recording for lane 7
            data_frame(7, 1),
            vec![0xdead],
            data_frame(4, 2),
            data_frame(5, 2),
        ];
        let (tx, rx) = mpsc::channel();
        let recorded = record_lanes(Replay(frames.into()), &config, 10, &tx, 0).unwrap();
        assert_eq!(recorded, 4);
        assert!(rx.try_iter().any(|s| s.progress == 1.0));

        let mut lane5 = LaneRecording::open(&config.recording_paths[1]).unwrap();
        let first = lane5.next_payload().unwrap().unwrap();
        assert_eq!(DataFrameHeader::decode(&first).unwrap().lane, 5);
        assert_eq!(first, words_to_bytes(&data_frame(5, 1)));
        assert!(lane5.next_payload().unwrap().is_some());
        assert!(lane5.next_payload().unwrap().is_none());

        // stops at the requested count
        let replay = Replay(vec![data_frame(4, 1), data_frame(4, 2)].into());
        assert_eq!(record_lanes(replay, &config, 1, &tx, 0).unwrap(), 1);
        for path in config.recording_paths.iter() {
            std::fs::remove_file(path).unwrap();
        }
    }

    #[test]
    fn test_single_register_access() {
        let sim = SimFrontEnd::new();
        write_register(sim.transport(), 3, 0x40, 0x55).unwrap();
        assert_eq!(read_register(sim.transport(), 3, 0x40).unwrap(), 0x55);
    }
}
