pub mod config;
pub mod error;
pub mod host;
pub mod nes;

pub use config::EmulatorConfig;
pub use error::{CartridgeError, EmulatorError, StateError};
pub use host::{EmulatorHost, HostOutputs};
pub use nes::Emulator;
pub use nes::controller::Button;
