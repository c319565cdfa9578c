//! Typed result codes for the engine.
//!
//! Every fallible operation in tono returns [`Result`]. The taxonomy mirrors
//! the operational layers of the engine: argument validation, device
//! lifecycle, backend negotiation, and streaming. There is no global error
//! state; a failure is always visible at the call site that caused it.
//!
//! Transient codes ([`Error::Busy`], [`Error::Timeout`]) describe conditions
//! the next period is expected to clear. [`Error::AtEnd`] is only ever
//! returned together with zero frames produced.

/// Error codes returned by engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// An allocation failed.
    OutOfMemory,
    /// An argument was out of range or inconsistent with the others.
    InvalidArgs,
    /// The operation is not valid in the object's current state.
    InvalidOperation,
    /// The device has not been initialized.
    DeviceNotInitialized,
    /// The device is already initialized.
    DeviceAlreadyInitialized,
    /// The device must be started for this operation.
    DeviceNotStarted,
    /// The device must be stopped for this operation.
    DeviceNotStopped,
    /// The backend refused to open the requested device.
    FailedToOpenBackendDevice,
    /// The backend does not support the requested device role.
    DeviceTypeNotSupported,
    /// The backend does not support the requested sample format.
    FormatNotSupported,
    /// The backend does not support the requested share mode.
    ShareModeNotSupported,
    /// No backend in the priority list could be initialized.
    NoBackend,
    /// The operation did not complete within its deadline.
    Timeout,
    /// The end of the stream was reached; zero frames were produced.
    AtEnd,
    /// The resource has no space or data available right now.
    Busy,
    /// The operation was cancelled before completion.
    Cancelled,
    /// The resource exists but is currently unavailable.
    Unavailable,
}

impl Error {
    /// Whether the next attempt at the same operation is expected to succeed
    /// without any corrective action.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Busy | Self::Timeout)
    }

    /// Short stable name for log messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out-of-memory",
            Self::InvalidArgs => "invalid-args",
            Self::InvalidOperation => "invalid-operation",
            Self::DeviceNotInitialized => "device-not-initialized",
            Self::DeviceAlreadyInitialized => "device-already-initialized",
            Self::DeviceNotStarted => "device-not-started",
            Self::DeviceNotStopped => "device-not-stopped",
            Self::FailedToOpenBackendDevice => "failed-to-open-backend-device",
            Self::DeviceTypeNotSupported => "device-type-not-supported",
            Self::FormatNotSupported => "format-not-supported",
            Self::ShareModeNotSupported => "share-mode-not-supported",
            Self::NoBackend => "no-backend",
            Self::Timeout => "timeout",
            Self::AtEnd => "at-end",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Unavailable => "unavailable",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl core::error::Error for Error {}

/// Convenience result type used throughout the engine.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        assert!(Error::Busy.is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(!Error::AtEnd.is_transient());
        assert!(!Error::InvalidArgs.is_transient());
    }

    #[test]
    fn display_matches_name() {
        let err = Error::FormatNotSupported;
        assert_eq!(format!("{err}"), "format-not-supported");
    }
}
