//! Winsen Infrared CO2 Module MH-Z19B driver with shared, long-lived port sessions.
//!
//! [MH-Z19B Datasheet](https://www.winsen-sensor.com/d/files/infrared-gas-sensor/mh-z19b-co2-ver1_0.pdf)
//!
//! A [`Registry`] hands out exactly one [`Session`] per port identifier, so a
//! polling process can open the port once, read repeatedly and close it cleanly
//! even when several parts of the program acquire the same sensor.
//!
//! ```no_run
//! # #[cfg(feature = "serial")]
//! # fn main() -> mhz19b_session::Result<()> {
//! use mhz19b_session::Registry;
//!
//! let registry = Registry::serial();
//! let sensor = registry.acquire("/dev/ttyAMA0");
//! sensor.open()?;
//! sensor.set_detection_range_5000()?;
//! println!("CO2: {} ppm", sensor.get_gas_concentration()?);
//! sensor.close()?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serial"))]
//! # fn main() {}
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;
pub mod frame;
mod registry;
mod session;
pub mod transport;

pub use crate::error::{Error, Result};
pub use crate::frame::{Command, Frame, Response};
pub use crate::registry::{Registry, DEFAULT_TIMEOUT};
pub use crate::session::Session;
pub use crate::transport::{HalTransport, LineSettings, MonotonicCounter, Parity, Transport};

#[cfg(feature = "serial")]
pub use crate::transport::SerialTransport;
