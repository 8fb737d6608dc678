use bms_telemetry_core::{
    publisher::{MessageProperties, TelemetryTransport, TELEMETRY_PROPERTIES},
    PublishError,
};
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;

/// How long to wait for the client to accept a message.
const SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Only the current cycle's message may be waiting to go out.
const REQUEST_CAPACITY: usize = 1;

pub(crate) struct MqttConfig<'a> {
    pub(crate) broker: &'a str,
    pub(crate) port: u16,
    pub(crate) device_id: &'a str,
    pub(crate) credentials: Option<(&'a str, &'a str)>,
}

/// Device-to-cloud telemetry over MQTT, addressed the way IoT hubs expect.
///
/// Keep-alive is a property of the MQTT session, so it is fixed when the connection is set up
/// from [`TELEMETRY_PROPERTIES`]. Messages asking for a different keep-alive are still sent, with
/// a warning.
pub(crate) struct MqttTransport {
    client: AsyncClient,
    device_id: String,
    keep_alive: Duration,
    connected: watch::Receiver<bool>,
}

/// The broker connection backing an [`MqttTransport`].
pub(crate) struct Connection {
    eventloop: EventLoop,
    connected: watch::Sender<bool>,
}

fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.device_id, config.broker, config.port);
    options.set_keep_alive(TELEMETRY_PROPERTIES.keep_alive);
    if let Some((username, password)) = config.credentials {
        options.set_credentials(username, password);
    }
    options
}

impl MqttTransport {
    /// Nothing is sent until the returned connection is driven (see [`Connection::drive`]).
    pub(crate) fn new(config: &MqttConfig) -> (Self, Connection) {
        let options = mqtt_options(config);
        let keep_alive = options.keep_alive();

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);

        (
            Self {
                client,
                device_id: config.device_id.to_owned(),
                keep_alive,
                connected: connected_rx,
            },
            Connection {
                eventloop,
                connected: connected_tx,
            },
        )
    }
}

impl TelemetryTransport for MqttTransport {
    async fn send_telemetry(
        &mut self,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        if !*self.connected.borrow() {
            warn!("Not connected to broker, dropping telemetry");
            return Err(PublishError::TransportError);
        }

        if properties.keep_alive != self.keep_alive {
            warn!(
                "Requested keep-alive of {} s, session uses {} s",
                properties.keep_alive.as_secs(),
                self.keep_alive.as_secs()
            );
        }

        let topic = telemetry_topic(&self.device_id, properties);
        debug!("Publishing {} bytes to {topic}", payload.len());

        let publish = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec());

        match tokio::time::timeout(SEND_TIMEOUT, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("MQTT client error: {e}");
                Err(PublishError::TransportError)
            }
            Err(_) => Err(PublishError::Timeout),
        }
    }
}

/// Topic for device-to-cloud messages, with `properties` encoded as a property bag.
fn telemetry_topic(device_id: &str, properties: &MessageProperties) -> String {
    format!(
        "devices/{device_id}/messages/events/$.ct={}&$.ce=utf-8",
        properties.content_type.replace('/', "%2F")
    )
}

impl Connection {
    /// Poll the MQTT connection forever, reconnecting on failure.
    pub(crate) async fn drive(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to broker ({:?})", ack.code);
                    self.connected.send_replace(true);
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    debug!("Message {} acknowledged", ack.pkid);
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.send_replace(false) {
                        warn!("Lost connection to broker: {e}");
                    } else {
                        warn!("MQTT connection error: {e}");
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}
