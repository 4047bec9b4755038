//! Broker link over rumqttc.
//! Each connect builds a fresh client and event loop; the loop is polled on
//! its own task until the connection fails or is closed. There is no
//! automatic reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::mqtt_config::{MqttConfig, QosLevel};
use crate::core::mqtt::transport::{BrokerEvent, BrokerLink, MqttError};

const CLIENT_ID_PREFIX: &str = "ble-mqtt-relay";
const KEEP_ALIVE_SECS: u64 = 30;
const REQUEST_CHANNEL_CAPACITY: usize = 64;
/// Time the event loop gets to flush a DISCONNECT before it is torn down.
const DISCONNECT_GRACE_MS: u64 = 500;

struct Session {
    client: AsyncClient,
    cancel_token: CancellationToken,
}

pub struct RumqttcLink {
    session: Mutex<Option<Session>>,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl RumqttcLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            session: Mutex::new(None),
            events,
        });
        (link, rx)
    }

    async fn client(&self) -> Result<AsyncClient, MqttError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(MqttError::NotConnected)
    }
}

fn to_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn build_options(config: &MqttConfig) -> MqttOptions {
    let client_id = format!("{}-{}", CLIENT_ID_PREFIX, Uuid::new_v4().simple());
    let mut options = MqttOptions::new(client_id, config.broker_address.clone(), config.broker_port);
    options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
    options.set_clean_session(true);
    if config.use_credentials {
        options.set_credentials(config.user_name.clone(), config.password.clone());
    }
    if config.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
    cancel_token: CancellationToken,
) {
    let mut connected = false;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        connected = true;
                        let _ = events.send(BrokerEvent::Connected);
                    } else {
                        let _ = events.send(BrokerEvent::ConnectFailed(format!("{:?}", ack.code)));
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = events.send(BrokerEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    let _ = events.send(BrokerEvent::ConnectionLost("broker closed the connection".to_string()));
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    let event = if connected {
                        BrokerEvent::ConnectionLost(e.to_string())
                    } else {
                        BrokerEvent::ConnectFailed(e.to_string())
                    };
                    let _ = events.send(event);
                    break;
                }
            }
        }
    }
    debug!("MQTT event loop finished");
}

#[async_trait]
impl BrokerLink for RumqttcLink {
    async fn connect(&self, config: &MqttConfig) -> Result<(), MqttError> {
        self.disconnect().await?;

        let (client, eventloop) = AsyncClient::new(build_options(config), REQUEST_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();
        tokio::spawn(drive_event_loop(eventloop, self.events.clone(), cancel_token.clone()));

        info!(
            "MQTT client created for {}://{}:{}",
            if config.use_tls { "ssl" } else { "tcp" },
            config.broker_address,
            config.broker_port
        );
        *self.session.lock().await = Some(Session { client, cancel_token });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = session.client.disconnect().await {
            debug!("Disconnect request not queued: {}", e);
            session.cancel_token.cancel();
            return Ok(());
        }
        let cancel_token = session.cancel_token;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(DISCONNECT_GRACE_MS)).await;
            cancel_token.cancel();
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MqttError> {
        let client = self.client().await?;
        client.subscribe(topic, to_qos(qos)).await.map_err(|e| {
            error!("Subscribe to {} failed: {}", topic, e);
            MqttError::Client(e.to_string())
        })
    }

    async fn publish(&self, topic: &str, qos: QosLevel, payload: &[u8]) -> Result<(), MqttError> {
        let client = self.client().await?;
        client
            .publish(topic, to_qos(qos), false, payload.to_vec())
            .await
            .map_err(|e| {
                warn!("Publish to {} failed: {}", topic, e);
                MqttError::Client(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_qos(QosLevel::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_qos(QosLevel::from_level(1)), QoS::AtLeastOnce);
        assert_eq!(to_qos(QosLevel::from_level(2)), QoS::ExactlyOnce);
    }

    #[test]
    fn test_options_follow_config() {
        let config = MqttConfig {
            broker_address: "mqtt.local".to_string(),
            broker_port: 8883,
            use_credentials: true,
            user_name: "relay".to_string(),
            password: "secret".to_string(),
            ..MqttConfig::default()
        };

        let options = build_options(&config);

        assert_eq!(options.broker_address(), ("mqtt.local".to_string(), 8883));
        assert!(options.client_id().starts_with("ble-mqtt-relay-"));
        assert_eq!(options.keep_alive(), Duration::from_secs(KEEP_ALIVE_SECS));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let (link, _events) = RumqttcLink::new();
        assert_eq!(
            link.publish("relay/up", QosLevel::AtMostOnce, &[0x01]).await,
            Err(MqttError::NotConnected)
        );
    }
}
