//! device-coap client library
//!
//! Reads and writes device resources over CoAP:
//! - [`Exchange`] correlates one confirmable request with its outcome
//! - [`CoapDriver`] runs GET and PUT commands across a device's resources
//!
//! # Example
//!
//! ```ignore
//! use devcoap_client::CoapDriver;
//!
//! let driver = CoapDriver::new(directory);
//! let readings = driver.get("thermostat", &["temperature"]).await?;
//! driver.put("thermostat", &[("setpoint", 21.5.into())]).await?;
//! ```

pub mod driver;
pub mod error;
pub mod exchange;

pub use driver::CoapDriver;
pub use error::{ClientError, Result};
pub use exchange::{Exchange, ExchangeOutcome, ExchangeState};
