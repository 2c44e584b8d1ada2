#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::{LibgpiodBackend, LibgpiodChip};
pub use mock::{MockChip, MockGpioBackend};
