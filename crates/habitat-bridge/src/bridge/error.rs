//! Bridge manager errors.
//!
//! Rejections from the command pipeline are turned into failed
//! [`CommandResult`](habitat_core::CommandResult)s using these messages, so
//! the `Display` text is part of the observable behavior.

use habitat_core::Protocol;
use thiserror::Error;

use crate::adapter::AdapterError;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Device not found")]
    DeviceNotFound,

    #[error("Protocol {0} is not configured or disabled")]
    ProtocolDisabled(Protocol),

    #[error("No adapter registered for protocol {0}")]
    AdapterNotRegistered(Protocol),

    #[error("Rate limited")]
    RateLimited,

    #[error("Circuit breaker open")]
    CircuitOpen,

    #[error("Queue overflow")]
    QueueOverflow,

    #[error("Bulkhead full: {0}")]
    BulkheadFull(Protocol),

    #[error("Bridge is shut down")]
    ShutDown,

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages() {
        assert_eq!(BridgeError::DeviceNotFound.to_string(), "Device not found");
        assert_eq!(BridgeError::RateLimited.to_string(), "Rate limited");
        assert_eq!(BridgeError::CircuitOpen.to_string(), "Circuit breaker open");
        assert_eq!(BridgeError::QueueOverflow.to_string(), "Queue overflow");
        assert_eq!(
            BridgeError::BulkheadFull(Protocol::Knx).to_string(),
            "Bulkhead full: knx"
        );
    }

    #[test]
    fn test_adapter_error_is_transparent() {
        let err: BridgeError = AdapterError::Timeout(500).into();
        assert_eq!(err.to_string(), "Operation timeout after 500ms");
    }
}
