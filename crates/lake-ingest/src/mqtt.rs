// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-backed bus implementation.
//!
//! Built on `rumqttc` (MQTT 3.1.1). TLS goes through rustls; server
//! certificates are validated against the webpki root set (plus an optional
//! private CA file) unless the configuration explicitly asks for
//! `insecure-skip-verify`.

use crate::bus::{BusConnector, BusError, BusMessage, BusSession};
use crate::config::{BrokerConfig, TlsMode};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::collections::VecDeque;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Capacity of the client request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Time allowed for a clean disconnect to reach the broker.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// MQTT connector: holds the endpoint, credentials and transport settings.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: BrokerConfig,
}

impl MqttConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn options(&self) -> Result<MqttOptions, BusError> {
        let config = &self.config;
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        match config.tls {
            TlsMode::Disabled => {
                tracing::warn!("TLS disabled: broker traffic is sent in clear text");
            }
            mode => {
                let tls = tls_configuration(mode, config.ca_file.as_deref())?;
                options.set_transport(Transport::tls_with_config(tls));
            }
        }

        Ok(options)
    }
}

/// Live MQTT session.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    qos: QoS,
    /// Publishes that arrived while waiting for a SUBACK
    pending: VecDeque<BusMessage>,
}

impl BusConnector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self) -> Result<MqttSession, BusError> {
        let options = self.options()?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        tracing::info!("Connecting to broker {}...", self.endpoint());

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop, self.endpoint()))
            .await
            .map_err(|_| BusError::Timeout(timeout))??;

        tracing::info!("Connected to MQTT broker {}", self.endpoint());

        Ok(MqttSession {
            client,
            eventloop,
            qos: qos_from_level(self.config.qos),
            pending: VecDeque::new(),
        })
    }

    fn endpoint(&self) -> String {
        self.config.endpoint()
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop, endpoint: String) -> Result<(), BusError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BusError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(BusError::Connect {
                    endpoint,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// What a polled event means to an open session.
#[derive(Debug, PartialEq)]
enum SessionEvent {
    Message(BusMessage),
    SubAck { accepted: bool },
    Closed(String),
    Other,
}

fn session_event(event: Event) -> SessionEvent {
    match event {
        Event::Incoming(Packet::Publish(publish)) => SessionEvent::Message(BusMessage {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }),
        Event::Incoming(Packet::SubAck(ack)) => SessionEvent::SubAck {
            accepted: !ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure)),
        },
        Event::Incoming(Packet::Disconnect) => {
            SessionEvent::Closed("broker closed the session".to_string())
        }
        _ => SessionEvent::Other,
    }
}

/// Feed one event to a subscription waiting for its SUBACK.
///
/// Returns the outcome once the subscription is settled. Publishes seen
/// before that are buffered in `pending`.
fn settle_subscription(
    event: SessionEvent,
    pattern: &str,
    pending: &mut VecDeque<BusMessage>,
) -> Option<Result<(), BusError>> {
    match event {
        SessionEvent::SubAck { accepted: true } => Some(Ok(())),
        SessionEvent::SubAck { accepted: false } => Some(Err(BusError::Subscribe {
            pattern: pattern.to_string(),
            reason: "rejected by broker".to_string(),
        })),
        SessionEvent::Message(msg) => {
            pending.push_back(msg);
            None
        }
        SessionEvent::Closed(reason) => Some(Err(BusError::ConnectionLost(reason))),
        SessionEvent::Other => None,
    }
}

impl BusSession for MqttSession {
    async fn subscribe(&mut self, pattern: &str) -> Result<(), BusError> {
        self.client
            .subscribe(pattern, self.qos)
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .map_err(|e| BusError::ConnectionLost(e.to_string()))?;

            let settled = settle_subscription(session_event(event), pattern, &mut self.pending);
            if let Some(result) = settled {
                if result.is_ok() {
                    tracing::info!("Subscribed to topic: {}", pattern);
                }
                return result;
            }
        }
    }

    async fn next_message(&mut self) -> Result<BusMessage, BusError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }

        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .map_err(|e| BusError::ConnectionLost(e.to_string()))?;

            match session_event(event) {
                SessionEvent::Message(msg) => return Ok(msg),
                SessionEvent::Closed(reason) => return Err(BusError::ConnectionLost(reason)),
                SessionEvent::SubAck { .. } | SessionEvent::Other => continue,
            }
        }
    }

    async fn disconnect(mut self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("Disconnect request not queued: {}", e);
            return;
        }

        // Drive the event loop until the DISCONNECT packet is written.
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
            tracing::debug!("Broker did not see DISCONNECT within {:?}", DISCONNECT_TIMEOUT);
        }
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn tls_configuration(mode: TlsMode, ca_file: Option<&Path>) -> Result<TlsConfiguration, BusError> {
    let config = match mode {
        TlsMode::InsecureSkipVerify => {
            tracing::warn!(
                "INSECURE: broker certificate validation is disabled (tls = insecure-skip-verify)"
            );
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth()
        }
        TlsMode::Verified | TlsMode::Disabled => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            if let Some(path) = ca_file {
                for cert in load_ca_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| BusError::Tls(format!("{}: {}", path.display(), e)))?;
                }
                tracing::info!("Trusting broker CA from {}", path.display());
            }

            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };

    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Read every certificate of a PEM bundle.
fn load_ca_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BusError> {
    let file = std::fs::File::open(path)
        .map_err(|e| BusError::Tls(format!("cannot open CA file {}: {}", path.display(), e)))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BusError::Tls(format!("cannot read CA file {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(BusError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Accepts any server certificate. Only reachable via `insecure-skip-verify`.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{PubAck, Publish, SubAck};
    use std::io::Write;

    const TEST_CA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/test-ca.pem");

    fn publish(topic: &str, payload: &str) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtLeastOnce,
            payload.as_bytes().to_vec(),
        )))
    }

    fn suback(code: SubscribeReasonCode) -> Event {
        Event::Incoming(Packet::SubAck(SubAck::new(1, vec![code])))
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[test]
    fn test_options_from_config() {
        let connector = MqttConnector::new(BrokerConfig {
            host: "broker.local".to_string(),
            port: 1883,
            username: Some("iot".to_string()),
            password: Some("secret".to_string()),
            tls: TlsMode::Disabled,
            ..BrokerConfig::default()
        });

        let options = connector.options().unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(
            options.credentials(),
            Some(("iot".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_options_fail_on_missing_ca_file() {
        let connector = MqttConnector::new(BrokerConfig {
            tls: TlsMode::Verified,
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..BrokerConfig::default()
        });

        assert!(matches!(connector.options(), Err(BusError::Tls(_))));
    }

    #[test]
    fn test_tls_modes_build() {
        assert!(matches!(
            tls_configuration(TlsMode::Verified, None),
            Ok(TlsConfiguration::Rustls(_))
        ));
        assert!(matches!(
            tls_configuration(TlsMode::InsecureSkipVerify, None),
            Ok(TlsConfiguration::Rustls(_))
        ));
    }

    #[test]
    fn test_private_ca_is_trusted() {
        assert_eq!(load_ca_certs(Path::new(TEST_CA)).unwrap().len(), 1);
        assert!(matches!(
            tls_configuration(TlsMode::Verified, Some(Path::new(TEST_CA))),
            Ok(TlsConfiguration::Rustls(_))
        ));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let err = tls_configuration(TlsMode::Verified, Some(file.path())).unwrap_err();
        assert!(matches!(err, BusError::Tls(_)));
    }

    #[test]
    fn test_session_event_mapping() {
        assert_eq!(
            session_event(publish("sensor/data/int", r#"{"value": 1}"#)),
            SessionEvent::Message(BusMessage::new("sensor/data/int", r#"{"value": 1}"#))
        );
        assert_eq!(
            session_event(Event::Incoming(Packet::Disconnect)),
            SessionEvent::Closed("broker closed the session".to_string())
        );
        assert_eq!(
            session_event(suback(SubscribeReasonCode::Success(QoS::AtLeastOnce))),
            SessionEvent::SubAck { accepted: true }
        );
        assert_eq!(
            session_event(suback(SubscribeReasonCode::Failure)),
            SessionEvent::SubAck { accepted: false }
        );
        assert_eq!(
            session_event(Event::Incoming(Packet::PubAck(PubAck::new(7)))),
            SessionEvent::Other
        );
        assert_eq!(session_event(Event::Outgoing(Outgoing::PingReq)), SessionEvent::Other);
    }

    #[test]
    fn test_publishes_before_suback_are_buffered() {
        let mut pending = VecDeque::new();
        let events = [
            publish("sensor/data/int", r#"{"value": 1}"#),
            Event::Incoming(Packet::PubAck(PubAck::new(7))),
            publish("sensor/data/float", r#"{"value": 2.5}"#),
        ];
        for event in events {
            assert!(settle_subscription(session_event(event), "#", &mut pending).is_none());
        }

        let settled = settle_subscription(
            session_event(suback(SubscribeReasonCode::Success(QoS::AtLeastOnce))),
            "#",
            &mut pending,
        );
        assert!(matches!(settled, Some(Ok(()))));

        let topics: Vec<_> = pending.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["sensor/data/int", "sensor/data/float"]);
    }

    #[test]
    fn test_subscription_rejected_or_closed() {
        let mut pending = VecDeque::new();

        let rejected = settle_subscription(
            session_event(suback(SubscribeReasonCode::Failure)),
            "sensor/#",
            &mut pending,
        );
        assert!(matches!(
            rejected,
            Some(Err(BusError::Subscribe { ref pattern, .. })) if pattern == "sensor/#"
        ));

        let closed = settle_subscription(
            session_event(Event::Incoming(Packet::Disconnect)),
            "sensor/#",
            &mut pending,
        );
        assert!(matches!(closed, Some(Err(BusError::ConnectionLost(_)))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let connector = MqttConnector::new(BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            tls: TlsMode::Disabled,
            connect_timeout_secs: 2,
            ..BrokerConfig::default()
        });

        assert!(connector.connect().await.is_err());
    }
}
