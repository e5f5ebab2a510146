use rumqttc::{AsyncClient, QoS};

use powerstrip_common::TransportError;

/// Outbound delivery seam. Callers hand over an encoded payload and never
/// wait on the network.
pub trait Outbox: Send + Sync {
    fn deliver(&self, payload: String) -> Result<(), TransportError>;
}

/// Fire-and-forget delivery at QoS 0. A payload the client queue cannot
/// take right now is reported and dropped; nothing is retried.
pub struct AtMostOnceOutbox {
    client: AsyncClient,
    topic: String,
}

impl AtMostOnceOutbox {
    pub fn new(client: AsyncClient, topic: String) -> Self {
        Self { client, topic }
    }
}

impl Outbox for AtMostOnceOutbox {
    fn deliver(&self, payload: String) -> Result<(), TransportError> {
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
            .map_err(|err| TransportError::Publish(err.to_string()))
    }
}
