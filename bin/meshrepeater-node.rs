//! Entry point wiring [`meshrepeater_core::Core`] to host-side stand-ins for
//! the radio, bridge transport, and CLI (all external collaborators per the
//! core's own module docs). On real hardware these three traits are backed
//! by the platform's LoRa HAL, an MQTT client, and a serial text parser;
//! here they are minimal loopback/no-op implementations so the scheduler
//! can be exercised end-to-end from a single binary.

use embassy_executor::{Executor, Spawner};
use embassy_time::{Duration, Instant, Timer};
use log::{LevelFilter, info};
use meshrepeater_core::identity::{Identity, PUB_KEY_SIZE};
use meshrepeater_core::radio::{RadioDriver, RadioParams, TxRequest};
use meshrepeater_core::request_handler::CliBackend;
use meshrepeater_core::transport::BridgeTransport;
use meshrepeater_core::{Core, PersistPaths};
use std::path::PathBuf;
use std::thread;

/// Logs every transmission instead of keying a radio; airtime is estimated
/// from the current spreading factor the way the real driver would.
struct LoggingRadio {
    params: RadioParams,
}

impl RadioDriver for LoggingRadio {
    fn est_airtime(&self, byte_len: usize) -> Duration {
        let bits_per_symbol = self.params.spreading_factor.max(1) as u64;
        let symbols = (byte_len as u64 * 8).div_ceil(bits_per_symbol);
        let symbol_time_us = (1u64 << self.params.spreading_factor) * 1_000_000 / self.params.bandwidth_khz.max(1.0) as u64;
        Duration::from_micros(symbols * symbol_time_us)
    }

    fn enqueue_tx(&mut self, req: TxRequest) {
        info!("radio tx: {} bytes, release_at={}ms", req.payload.len(), req.release_at_ms);
    }

    fn current_params(&self) -> RadioParams {
        self.params
    }

    fn set_params(&mut self, params: RadioParams) {
        info!("radio params changed: {params:?}");
        self.params = params;
    }

    fn set_airtime_factor(&mut self, factor: f32) {
        info!("radio duty-cycle factor set to {factor}");
    }
}

/// No backhaul configured; every call is a cheap no-op. A real deployment
/// swaps this for an MQTT client built from `Prefs::mqtt_*`.
#[derive(Default)]
struct NoBridgeTransport;

impl BridgeTransport for NoBridgeTransport {
    fn publish(&mut self, _bytes: &[u8]) {}
    fn try_recv(&mut self) -> Option<Vec<u8>> {
        None
    }
    fn is_connected(&self) -> bool {
        false
    }
    fn disconnect(&mut self) {}
    fn connect(&mut self) -> bool {
        false
    }
}

/// The admin text-command parser lives outside this core; this stand-in
/// just reports that no CLI is wired up.
struct UnimplementedCli;

impl CliBackend for UnimplementedCli {
    fn handle(&mut self, _payload: &[u8]) -> Vec<u8> {
        b"Err - no CLI backend configured".to_vec()
    }
}

fn data_dir() -> PathBuf {
    std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

/// Loads the node's 32-byte public key from `identity.key` under the data
/// directory, generating and persisting a new one on first run.
fn load_or_create_identity(dir: &std::path::Path) -> Identity {
    let path = dir.join("identity.key");
    if let Ok(bytes) = std::fs::read(&path) {
        if bytes.len() == PUB_KEY_SIZE {
            let mut pk = [0u8; PUB_KEY_SIZE];
            pk.copy_from_slice(&bytes);
            return Identity::new(pk);
        }
    }
    let pk_vec = meshrepeater_core::clock::random_bytes(PUB_KEY_SIZE);
    let mut pk = [0u8; PUB_KEY_SIZE];
    pk.copy_from_slice(&pk_vec);
    let _ = std::fs::write(&path, pk);
    Identity::new(pk)
}

/// Drives one `Core` from the Embassy executor: a single cooperative task
/// that ticks the aggregate and sleeps for as long as it reports is safe,
/// the same shape as the teacher's per-node tasks in its simulation loop.
#[embassy_executor::task]
async fn core_task(mut core: Core, start: Instant) {
    info!("entering scheduler loop");
    loop {
        let now_ms = start.elapsed().as_millis();
        core.tick(now_ms);
        let sleep = if core.low_power_ok() { Duration::from_millis(50) } else { Duration::from_millis(1) };
        Timer::after(sleep).await;
    }
}

fn embassy_init(spawner: Spawner, core: Core, start: Instant) {
    let _ = spawner.spawn(core_task(core, start));
}

fn main() {
    env_logger::Builder::new().filter_level(LevelFilter::Info).filter(Some("meshrepeater_core"), LevelFilter::Debug).init();

    info!("starting up");

    let dir = data_dir();
    std::fs::create_dir_all(&dir).expect("failed to create data directory");
    let paths = PersistPaths { prefs: dir.join("prefs.toml"), acl: dir.join("acl.bin"), region: dir.join("region.bin") };
    let self_identity = load_or_create_identity(&dir);

    let radio = Box::new(LoggingRadio { params: RadioParams { freq_mhz: 868.0, bandwidth_khz: 125.0, spreading_factor: 9, coding_rate: 5 } });
    let transport = Box::new(NoBridgeTransport);
    let cli = Box::new(UnimplementedCli);

    let start = Instant::now();
    let core = Core::bootstrap(paths, self_identity, 0x01, radio, transport, cli, start.elapsed().as_millis());

    let embassy_handle = thread::Builder::new()
        .name("embassy-executor".to_string())
        .spawn(move || {
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| embassy_init(spawner, core, start));
        })
        .expect("failed to spawn embassy thread");

    embassy_handle.join().expect("embassy executor thread panicked");
}
