/// Failure to read from the BMS.
///
/// Never fatal: the affected sample fields keep their previous values.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub enum AcquisitionError {
    #[error("BMS did not respond in time")]
    Timeout,

    #[error("Malformed BMS response")]
    Malformed,
}

/// The encoded payload would not fit in the serialization buffer.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
#[error("Payload exceeds the {capacity} byte serialization buffer")]
pub struct SerializationOverflow {
    pub capacity: usize,
}

/// Failure reported by the cloud transport.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub enum PublishError {
    #[error("Timeout")]
    Timeout,

    #[error("Transport error")]
    TransportError,
}

/// Outcome of the serialize and publish step of a cycle.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub enum CycleError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationOverflow),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}
