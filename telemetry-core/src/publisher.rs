use crate::{
    info, payload::serialize_into, sample::TelemetrySample, warn, CycleError, PublishError,
};
use core::time::Duration;

/// Message properties attached to every telemetry message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: &'static str,
    pub keep_alive: Duration,
}

pub const TELEMETRY_PROPERTIES: MessageProperties = MessageProperties {
    content_type: "application/json",
    keep_alive: Duration::from_secs(120),
};

/// A cloud telemetry endpoint.
///
/// Authentication, connection management and any transport level retry are the
/// implementation's concern.
#[allow(async_fn_in_trait)]
pub trait TelemetryTransport {
    async fn send_telemetry(
        &mut self,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError>;
}

pub struct Publisher<T> {
    transport: T,
}

impl<T: TelemetryTransport> Publisher<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send an encoded payload, exactly once.
    pub async fn publish(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        match self
            .transport
            .send_telemetry(payload, &TELEMETRY_PROPERTIES)
            .await
        {
            Ok(()) => {
                info!("Telemetry sent ({} bytes)", payload.len());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send telemetry: {}", e);
                Err(e)
            }
        }
    }

    /// Serialize `sample` into `buffer` and publish it.
    ///
    /// Nothing is sent if the payload does not fit in `buffer`. Returns the payload length.
    pub async fn publish_sample(
        &mut self,
        sample: &TelemetrySample,
        buffer: &mut [u8],
    ) -> Result<usize, CycleError> {
        let len = serialize_into(sample, buffer)?;
        self.publish(&buffer[..len]).await?;
        Ok(len)
    }
}
