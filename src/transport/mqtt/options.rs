//! Pure translation of session connect options into rumqttc options

use crate::session::QoS;
use crate::transport::{ConnectOptions, TransportError};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use url::Url;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const MAX_PACKET_SIZE: u32 = 256 * 1024;

pub fn to_mqtt_qos(qos: QoS) -> mqttbytes::QoS {
    match qos {
        QoS::AtMostOnce => mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => mqttbytes::QoS::ExactlyOnce,
    }
}

/// True for schemes that need TLS
pub fn is_tls_scheme(scheme: &str) -> bool {
    matches!(scheme, "mqtts" | "ssl")
}

/// Split a broker URL into host, port and TLS flag
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), TransportError> {
    let url = Url::parse(broker_url)
        .map_err(|_| TransportError::InvalidOptions(format!("invalid broker URL: {broker_url}")))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        scheme if is_tls_scheme(scheme) => true,
        other => {
            return Err(TransportError::InvalidOptions(format!(
                "unsupported broker scheme '{other}'"
            )));
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidOptions(format!("broker URL has no host: {broker_url}")))?;
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

    Ok((host.to_string(), port, tls))
}

/// Build rumqttc options for one connect attempt
pub fn configure_mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, TransportError> {
    let (host, port, tls) = parse_broker_url(&options.broker_url)?;

    if options.client_id.is_empty() {
        return Err(TransportError::InvalidOptions(
            "client id must not be empty".to_string(),
        ));
    }

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_start(options.clean_session);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(will) = &options.last_will {
        let will = LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_mqtt_qos(will.qos),
            will.retained,
            None,
        );
        mqtt_options.set_last_will(will);
    }

    Ok(mqtt_options)
}
