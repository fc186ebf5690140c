//! Pure routing of rumqttc events

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// What the poll loop should do with an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    ConnectionRefused(String),
    MessageReceived { topic: String, payload: Bytes },
    /// Broker sent DISCONNECT
    Disconnected,
    /// We sent DISCONNECT
    DisconnectSent,
    Other,
}

pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                EventRoute::ConnectionAcknowledged
            }
            Packet::ConnAck(ack) => EventRoute::ConnectionRefused(format!("{:?}", ack.code)),
            Packet::Publish(publish) => route_publish(publish),
            Packet::Disconnect(_) => EventRoute::Disconnected,
            _ => EventRoute::Other,
        },
        Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
        Event::Outgoing(_) => EventRoute::Other,
    }
}

fn route_publish(publish: &Publish) -> EventRoute {
    EventRoute::MessageReceived {
        topic: String::from_utf8_lossy(&publish.topic).to_string(),
        payload: publish.payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::ConnAck;
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_successful_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(route_mqtt_event(&event), EventRoute::ConnectionAcknowledged);
    }

    #[test]
    fn test_refused_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
            properties: None,
        }));
        assert!(matches!(
            route_mqtt_event(&event),
            EventRoute::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_publish_is_forwarded() {
        let publish = Publish::new("machines/5/status", QoS::AtLeastOnce, "online", None);
        let event = Event::Incoming(Packet::Publish(publish));
        assert_eq!(
            route_mqtt_event(&event),
            EventRoute::MessageReceived {
                topic: "machines/5/status".to_string(),
                payload: Bytes::from_static(b"online"),
            }
        );
    }

    #[test]
    fn test_broker_disconnect() {
        use rumqttc::v5::mqttbytes::v5::{Disconnect, DisconnectReasonCode};

        let event = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            properties: None,
        }));
        assert_eq!(route_mqtt_event(&event), EventRoute::Disconnected);
    }

    #[test]
    fn test_own_disconnect_is_recognised() {
        let outgoing = Event::Outgoing(Outgoing::Disconnect);
        assert_eq!(route_mqtt_event(&outgoing), EventRoute::DisconnectSent);
    }

    #[test]
    fn test_ping_is_ignored() {
        let event = Event::Outgoing(Outgoing::PingReq);
        assert_eq!(route_mqtt_event(&event), EventRoute::Other);
    }
}
