use linux_embedded_hal::Serial;
use mhz19b_session::{HalTransport, Registry};
use std::sync::Mutex;
use std::time::Instant;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let serial_path = std::env::args().nth(1).unwrap_or("/dev/ttyUSB0".into());
    let serial = Serial::open(serial_path.clone()).unwrap();

    // The registry builds transports on demand; hand over the one port we opened
    let serial = Mutex::new(Some(serial));
    let registry = Registry::new(move |port: &str| {
        let serial = serial.lock().unwrap().take().expect("single port");
        HalTransport::new(port, serial, Instant::now())
    });
    let sensor = registry.acquire(&serial_path);
    sensor.open().unwrap();

    let probe_ok = sensor.probe().unwrap();
    println!("Probe: {:?}", probe_ok);
    if !probe_ok {
        return;
    }

    println!("CO2: {}", sensor.get_gas_concentration().unwrap());
    println!("detection range: {}", sensor.get_detection_range().unwrap());
    println!("analog bounds: {:?}", sensor.get_analog_bounds().unwrap());
    println!("fw version: {:?}", sensor.get_firmware_version().unwrap());

    sensor.close().unwrap();
}
