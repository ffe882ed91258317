use mhz19b_session::Registry;
use std::thread;
use std::time::Duration;

fn main() -> mhz19b_session::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let serial_path = std::env::args().nth(1).unwrap_or("/dev/ttyAMA0".into());
    let registry = Registry::serial();
    let sensor = registry.acquire(&serial_path);

    sensor.open()?;
    if let Err(e) = sensor.set_detection_range_5000() {
        log::warn!("caught - {}", e);
    }

    // Poll until killed; every failure is logged and the next read retried
    loop {
        match sensor.get_gas_concentration() {
            Ok(ppm) => log::info!("co2: {} ppm", ppm),
            Err(e) => log::warn!("caught - {}", e),
        }
        thread::sleep(Duration::from_secs(10));
    }
}
