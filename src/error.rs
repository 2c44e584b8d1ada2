use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Numbering mode not set: {0}")]
    ModeNotSet(String),
    #[error("Numbering mode conflict: {0}")]
    ModeConflict(String),
    #[error("Invalid numbering mode: {0}")]
    InvalidMode(String),
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Count mismatch: {0}")]
    CountMismatch(String),
    #[error("Line not claimed: {0}")]
    NotClaimed(String),
    #[error("Line not an input: {0}")]
    NotInput(String),
    #[error("Line not an output: {0}")]
    NotOutput(String),
    #[error("Conflicting watch: {0}")]
    ConflictingWatch(String),
    #[error("No active watch: {0}")]
    NoActiveWatch(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Device busy: {0}")]
    DeviceBusy(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

pub(crate) const MODE_NOT_SET: &str =
    "set the pin numbering mode to board or logical before using channels";

impl GpioError {
    pub(crate) fn mode_not_set() -> Self {
        GpioError::ModeNotSet(MODE_NOT_SET.into())
    }
}

impl ResponseError for GpioError {
    fn status_code(&self) -> StatusCode {
        match self {
            GpioError::InvalidChannel(_) => StatusCode::NOT_FOUND,
            GpioError::InvalidMode(_)
            | GpioError::InvalidArgument(_)
            | GpioError::CountMismatch(_) => StatusCode::BAD_REQUEST,
            GpioError::ModeNotSet(_)
            | GpioError::ModeConflict(_)
            | GpioError::NotClaimed(_)
            | GpioError::NotInput(_)
            | GpioError::NotOutput(_)
            | GpioError::ConflictingWatch(_)
            | GpioError::NoActiveWatch(_)
            | GpioError::AlreadyExists(_) => StatusCode::CONFLICT,
            GpioError::DeviceBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            GpioError::Config(_) | GpioError::Gpio(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
