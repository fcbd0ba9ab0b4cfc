use thiserror::Error;

/// Errors that can occur within the timer subsystem.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The construction parameters are out of range (e.g. zero slots).
    #[error("Invalid timer configuration: {0}")]
    InvalidConfig(String),

    /// The timer has been closed; no further registrations are accepted.
    #[error("Timer is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TimerError>;
