use motorbus::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A dispatcher ticking on its own thread, as a timer interrupt would.
struct Harness {
    handle: BusHandle,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<Dispatcher<SimBus>>,
}

impl Harness {
    fn start(engine: Engine, bus: SimBus) -> Self {
        let (handle, mut dispatcher) = split(engine, bus);
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::clone(&stop);
        let worker = thread::spawn(move || {
            while !running.load(Ordering::Acquire) {
                dispatcher.tick();
                thread::sleep(Duration::from_micros(50));
            }
            dispatcher
        });
        Self { handle, stop, worker }
    }

    fn finish(self) -> Dispatcher<SimBus> {
        self.stop.store(true, Ordering::Release);
        self.worker.join().unwrap()
    }
}

fn quiet_engine() -> Engine {
    Engine::new(EngineConfig {
        heartbeat: false,
        ..EngineConfig::default()
    })
}

/// Valid vector table followed by a byte ramp.
fn image_bytes(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|index| (index * 7) as u8).collect();
    data[..4].copy_from_slice(&0x2000_0400u32.to_le_bytes());
    data[4..8].copy_from_slice(&0x0000_0901u32.to_le_bytes());
    data
}

#[test]
fn test_enumerate_finds_every_controller() {
    let harness = Harness::start(quiet_engine(), SimBus::with_devices(&[3, 1, 2]));
    let present = harness.handle.enumerate().unwrap();
    assert_eq!(&present.devices()[..], &[1, 2, 3]);
    assert_eq!(harness.handle.presence(), present);
    harness.finish();
}

#[test]
fn test_select_restores_defaults_after_power_cycle() {
    let mut bus = SimBus::new();
    bus.add_peer(SimPeer::new(2).powered_on());
    let harness = Harness::start(quiet_engine(), bus);

    harness.handle.set_target_address(2).unwrap();
    assert_eq!(harness.handle.target(), 2);
    assert!(harness.handle.can_read());

    let dispatcher = harness.finish();
    let peer = dispatcher.bus().peer(2).unwrap();
    assert!(!peer.power_on_reset());
    assert_eq!(peer.parameter(api::VOLT_SET_RAMP).map(|p| &p[..]), Some(&[0x33, 0x03][..]));
    assert_eq!(peer.parameter(api::SPD_REF).map(|p| &p[..]), Some(&[0][..]));
    assert_eq!(peer.parameter(api::POS_REF).map(|p| &p[..]), Some(&[0][..]));
}

#[test]
fn test_select_leaves_running_controller_alone() {
    let harness = Harness::start(quiet_engine(), SimBus::with_devices(&[1]));
    harness.handle.set_target_address(1).unwrap();

    let dispatcher = harness.finish();
    let peer = dispatcher.bus().peer(1).unwrap();
    assert!(peer.parameter(api::VOLT_SET_RAMP).is_none());
}

#[test]
fn test_read_back_written_parameter() {
    let harness = Harness::start(quiet_engine(), SimBus::with_devices(&[1]));
    harness.handle.set_target_address(1).unwrap();

    harness.handle.send(&Command::SpeedPGainSet { gain: 0x0001_2345 }).unwrap();
    let value = harness.handle.read_parameter(api::SPD_PC).unwrap();
    assert_eq!(&value[..], &0x0001_2345i32.to_le_bytes());
    harness.finish();
}

#[test]
fn test_old_firmware_refuses_reads() {
    let mut bus = SimBus::new();
    bus.add_peer(SimPeer::new(1).with_firmware(3000));
    let harness = Harness::start(quiet_engine(), bus);

    harness.handle.set_target_address(1).unwrap();
    assert!(!harness.handle.can_read());
    assert_eq!(
        harness.handle.read_parameter(api::SPD_PC),
        Err(BusError::Read(ReadError::CapabilityDenied))
    );
    // Power status stays readable.
    assert!(harness.handle.read_parameter(api::STATUS_POWER).is_ok());
    harness.finish();
}

#[test]
fn test_absent_target_times_out() {
    let harness = Harness::start(quiet_engine(), SimBus::with_devices(&[1]));
    assert_eq!(
        harness.handle.set_target_address(9),
        Err(BusError::Read(ReadError::AckTimeout))
    );
    assert!(!harness.handle.can_read());
    harness.finish();
}

#[test]
fn test_invalid_target_is_rejected() {
    let harness = Harness::start(quiet_engine(), SimBus::new());
    assert_eq!(harness.handle.set_target_address(0), Err(BusError::InvalidAddress(0)));
    assert_eq!(harness.handle.set_target_address(64), Err(BusError::InvalidAddress(64)));
    harness.finish();
}

#[test]
fn test_firmware_update_programs_controller() {
    let harness = Harness::start(Engine::default(), SimBus::with_devices(&[1, 2]));
    harness.handle.set_target_address(1).unwrap();

    let data = image_bytes(100);
    let image = FirmwareImage::new(&data).unwrap();
    let mut reports = Vec::new();
    harness
        .handle
        .update_firmware(&image, |progress| reports.push(progress.sent))
        .unwrap();

    assert_eq!(reports.len(), 13);
    assert_eq!(reports.last(), Some(&100));
    assert!(harness.handle.can_read());

    let dispatcher = harness.finish();
    let bus = dispatcher.bus();
    assert_eq!(bus.peer(1).unwrap().last_image(), Some(&data[..]));
    assert_eq!(bus.peer(1).unwrap().mode(), sim::PeerMode::Application);
    // The reset left a power-on flag that selecting the target cleared.
    assert!(!bus.peer(1).unwrap().power_on_reset());
    assert!(bus.peer(2).unwrap().last_image().is_none());
}

#[test]
fn test_update_without_boot_loader_fails() {
    let harness = Harness::start(quiet_engine(), SimBus::with_devices(&[1]));
    harness.handle.with_engine(|engine| engine.set_target_address(5)).unwrap();

    let data = image_bytes(16);
    let image = FirmwareImage::new(&data).unwrap();
    let result = harness.handle.update_firmware(&image, |_| {});
    assert_eq!(result, Err(UpdateError::NoBootLoader));
    harness.finish();
}

#[test]
fn test_status_polling_fills_snapshot() {
    let harness = Harness::start(quiet_engine(), SimBus::with_devices(&[1]));
    harness.handle.set_target_address(1).unwrap();
    harness.handle.enable_status_polling();
    harness.handle.wait_ticks(100).unwrap();

    let snapshot = harness.handle.snapshot();
    assert_eq!(snapshot.target, 1);
    assert_eq!(snapshot.vbus_volts, Some(12.0));
    assert_eq!(snapshot.temperature_c, Some(25.0));
    assert_eq!(snapshot.firmware_version, Some(4000));
    harness.finish();
}

#[test]
fn test_heartbeat_reaches_every_controller() {
    let harness = Harness::start(Engine::default(), SimBus::with_devices(&[1, 2]));
    harness.handle.wait_ticks(200).unwrap();

    let dispatcher = harness.finish();
    for peer in dispatcher.bus().peers() {
        assert!(peer.heartbeats() >= 4);
    }
}

#[test]
fn test_assign_moves_pressed_controller() {
    let mut bus = SimBus::new();
    bus.add_peer(SimPeer::new(1));
    bus.add_peer(SimPeer::new(2));
    bus.peer_mut(2).unwrap().press_button();
    let config = EngineConfig {
        heartbeat: false,
        assign_window_ticks: 50,
        ..EngineConfig::default()
    };
    let harness = Harness::start(Engine::new(config), bus);

    let outcome = harness.handle.assign(7, &CancelToken::new()).unwrap();
    assert_eq!(outcome, AssignOutcome::Completed);
    let present = harness.handle.enumerate().unwrap();
    assert_eq!(&present.devices()[..], &[1, 7]);
    harness.finish();
}
