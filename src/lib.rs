pub mod alert;
pub mod backend;
pub mod board;
mod config;
mod error;
pub mod gpio;
pub mod line;
pub mod mapper;
pub mod pwm;
pub mod routes;
mod session;

pub use alert::{AlertRegistry, EdgeCallback};
pub use board::BoardInfo;
pub use config::{AppConfig, HttpConfig};
pub use error::GpioError;
pub use gpio::{Direction, Edge, EdgeEvent, GpioBackend, GpioChip, LineInfo, Pull};
pub use line::{LineController, LineState};
pub use mapper::{ChannelList, ChannelMapper, Levels, NumberingMode};
pub use pwm::{PwmHandle, SoftPwmController};
pub use routes::AppState;
pub use session::Session;

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
