use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerAddress, MqttSettings};
use super::message_manager::{OutgoingMessage, PublishError, Sink};
use super::tls;
use crate::config::ConfigError;
use crate::pipeline::retry::RetryPolicy;

const DRIVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Broker link as seen by the event loop driver
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting(String),
    Failed(String),
}

#[derive(Clone, Debug, Default)]
struct MqttStatus {
    acknowledged: usize,
    last_ack: Option<DateTime<Local>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Invalid broker configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Connection to {0} was cancelled")]
    Cancelled(String),
}

type DeliveryResult = Result<(), PublishError>;

// The publish currently waiting for the broker
struct InFlight {
    qos: QoS,
    pkid: Option<u16>,
    done: oneshot::Sender<DeliveryResult>,
}

/// Hand-off between `publish` and the event loop driver.
///
/// The publisher sends one message at a time, so at most one delivery is
/// outstanding. It is bound to the next packet id the client writes and
/// completes on the final acknowledgement for its QoS: the write itself for
/// QoS 0, PubAck for QoS 1, PubComp for QoS 2.
#[derive(Clone, Default)]
struct InFlightSlot(Arc<Mutex<Option<InFlight>>>);

impl InFlightSlot {
    fn lock(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, qos: QoS) -> oneshot::Receiver<DeliveryResult> {
        let (done, delivered) = oneshot::channel();
        *self.lock() = Some(InFlight {
            qos,
            pkid: None,
            done,
        });
        delivered
    }

    /// The client wrote a publish packet
    fn sent(&self, pkid: u16) {
        let mut slot = self.lock();
        let complete = match slot.as_mut() {
            Some(in_flight) if in_flight.pkid.is_none() => {
                in_flight.pkid = Some(pkid);
                in_flight.qos == QoS::AtMostOnce
            }
            _ => false,
        };
        if complete {
            finish(&mut slot, Ok(()));
        }
    }

    /// The broker sent the final acknowledgement of `qos` for `pkid`
    fn acknowledged(&self, pkid: u16, qos: QoS) {
        let mut slot = self.lock();
        let matches = slot
            .as_ref()
            .is_some_and(|in_flight| in_flight.pkid == Some(pkid) && in_flight.qos == qos);
        if matches {
            finish(&mut slot, Ok(()));
        }
    }

    fn fail(&self, error: PublishError) {
        let mut slot = self.lock();
        if slot.is_some() {
            debug!("Failing unacknowledged publish: {}", error);
            finish(&mut slot, Err(error));
        }
    }
}

fn finish(slot: &mut Option<InFlight>, result: DeliveryResult) {
    if let Some(in_flight) = slot.take() {
        // The publish may have been cancelled in the meantime
        let _ = in_flight.done.send(result);
    }
}

/// MQTT sink backed by a `rumqttc` async client.
///
/// A background task drives the rumqttc event loop, publishes the link state
/// through a watch channel and reports broker acknowledgements back to the
/// waiting `publish`. A publish only succeeds once the broker has confirmed
/// it at the requested QoS; losing the link first makes it fail as
/// transient so the publisher sends it again.
pub struct MqttSink {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    in_flight: InFlightSlot,
    driver: Option<JoinHandle<()>>,
    server: String,
    status: MqttStatus,
}

impl MqttSink {
    /// Connects to the broker and waits for its ConnAck.
    ///
    /// The first connection attempt is not retried: any error is returned
    /// to the caller.
    pub async fn connect(
        settings: &MqttSettings,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self, SinkError> {
        let broker = BrokerAddress::parse(&settings.server)?;
        info!(
            "Connecting to MQTT broker {}:{} (tls: {}) as '{}'",
            broker.host, broker.port, broker.tls, settings.client_id
        );

        let mut mqtt_options =
            MqttOptions::new(settings.client_id.clone(), broker.host.clone(), broker.port);
        mqtt_options
            .set_clean_session(settings.clean_session)
            .set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        if broker.tls {
            debug!("Using TLS transport without certificate verification");
            mqtt_options.set_transport(tls::insecure_transport());
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, settings.request_capacity);

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(SinkError::Cancelled(settings.server.clone())),
                polled = eventloop.poll() => polled,
            };
            match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to {} ({:?})", settings.server, ack.code);
                    break;
                }
                Ok(event) => debug!("MQTT event before ConnAck: {:?}", event),
                Err(e) => {
                    error!("Unable to connect to {}: {}", settings.server, e);
                    return Err(SinkError::Connect {
                        server: settings.server.clone(),
                        source: e,
                    });
                }
            }
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let in_flight = InFlightSlot::default();
        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            state_tx,
            in_flight.clone(),
            retry.clone(),
        ));

        Ok(Self {
            client,
            state: state_rx,
            in_flight,
            driver: Some(driver),
            server: settings.server.clone(),
            status: MqttStatus::default(),
        })
    }
}

impl Sink for MqttSink {
    async fn publish(&mut self, message: &OutgoingMessage) -> Result<(), PublishError> {
        let state = self.state.borrow().clone();
        match state {
            ConnectionState::Connected => {}
            ConnectionState::Reconnecting(reason) => {
                return Err(PublishError::Transient(format!(
                    "broker link down: {}",
                    reason
                )))
            }
            ConnectionState::Failed(reason) => return Err(PublishError::Fatal(reason)),
        }

        let delivered = self.in_flight.register(message.qos);
        self.client
            .publish(
                message.topic.clone(),
                message.qos,
                message.retain,
                message.payload.clone().into_bytes(),
            )
            .await
            .map_err(|e| PublishError::Fatal(format!("MQTT client closed: {}", e)))?;
        debug!("Handed to MQTT client, awaiting acknowledgement: {}", message);

        let outcome = tokio::select! {
            delivered = delivered => delivered.unwrap_or_else(|_| {
                Err(PublishError::Fatal("MQTT event loop stopped".into()))
            }),
            reason = link_failed(&mut self.state) => Err(PublishError::Fatal(reason)),
        };
        outcome?;

        self.status.acknowledged += 1;
        self.status.last_ack = Some(Local::now());
        Ok(())
    }

    async fn close(&mut self) {
        info!("Disconnecting from {} ({:?})", self.server, self.status);
        if let Err(e) = self.client.try_disconnect() {
            warn!("Unable to request MQTT disconnect: {}", e);
        }

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DRIVER_SHUTDOWN_TIMEOUT, &mut driver)
                .await
                .is_err()
            {
                warn!("MQTT event loop did not stop in time, aborting it");
                driver.abort();
            }
        }
    }
}

// Resolves once the link is marked failed or the driver is gone
async fn link_failed(state: &mut watch::Receiver<ConnectionState>) -> String {
    loop {
        let failed = match &*state.borrow_and_update() {
            ConnectionState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        if let Some(reason) = failed {
            return reason;
        }
        if state.changed().await.is_err() {
            return "MQTT event loop stopped".into();
        }
    }
}

/// Splits event loop errors into ones a reconnect can fix and ones it can't
pub fn classify_connection_error(e: &ConnectionError) -> PublishError {
    match e {
        ConnectionError::Io(_)
        | ConnectionError::NetworkTimeout
        | ConnectionError::FlushTimeout
        | ConnectionError::MqttState(_) => PublishError::Transient(e.to_string()),
        _ => PublishError::Fatal(e.to_string()),
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    state: watch::Sender<ConnectionState>,
    in_flight: InFlightSlot,
    retry: RetryPolicy,
) {
    info!("MQTT event loop driver started");
    let mut failures: u32 = 0;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if failures > 0 {
                    info!("Reconnected to broker after {} failures ({:?})", failures, ack.code);
                }
                failures = 0;
                state.send_replace(ConnectionState::Connected);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => in_flight.sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                in_flight.acknowledged(ack.pkid, QoS::AtLeastOnce)
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                debug!("Broker completed delivery of packet {}", comp.pkid);
                in_flight.acknowledged(comp.pkid, QoS::ExactlyOnce)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => match classify_connection_error(&e) {
                PublishError::Transient(reason) => {
                    failures = failures.saturating_add(1);
                    let delay = retry.delay_for(failures);
                    warn!(
                        "MQTT connection error ({}), reconnecting in {:?}",
                        reason, delay
                    );
                    state.send_replace(ConnectionState::Reconnecting(reason.clone()));
                    // A clean session drops unacknowledged packets on reconnect
                    in_flight.fail(PublishError::Transient(format!(
                        "broker link lost before acknowledgement: {}",
                        reason
                    )));
                    tokio::time::sleep(delay).await;
                }
                PublishError::Fatal(reason) => {
                    error!("MQTT connection failed permanently: {}", reason);
                    state.send_replace(ConnectionState::Failed(reason.clone()));
                    in_flight.fail(PublishError::Fatal(reason));
                    break;
                }
            },
        }
    }

    in_flight.fail(PublishError::Fatal("MQTT event loop stopped".into()));
    info!("MQTT event loop driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::ConnectReturnCode;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const PAYLOAD: &str = "id=5 evt=down vel=80";
    const WAIT: Duration = Duration::from_secs(5);

    fn message(qos: QoS) -> OutgoingMessage {
        OutgoingMessage {
            topic: "akai".into(),
            payload: PAYLOAD.into(),
            qos,
            retain: true,
        }
    }

    fn local_settings(port: u16) -> MqttSettings {
        MqttSettings {
            server: format!("tcp://127.0.0.1:{}", port),
            ..MqttSettings::default()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            ..RetryPolicy::default()
        }
    }

    // Fixed header byte and body of the next MQTT packet
    async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    // Accepts one client and answers its CONNECT with `return_code`
    async fn accept_session(listener: &TcpListener, return_code: u8) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header >> 4, 1, "expected CONNECT");
        stream
            .write_all(&[0x20, 0x02, 0x00, return_code])
            .await
            .unwrap();
        stream
    }

    // Packet id of a QoS 1/2 PUBLISH body
    fn publish_pkid(body: &[u8]) -> [u8; 2] {
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        [body[2 + topic_len], body[3 + topic_len]]
    }

    async fn wait_for_state(sink: &MqttSink, wanted: fn(&ConnectionState) -> bool) {
        let mut state = sink.state.clone();
        tokio::time::timeout(WAIT, state.wait_for(wanted))
            .await
            .expect("link state did not change in time")
            .expect("event loop driver stopped");
    }

    fn offline_sink(state: ConnectionState) -> (MqttSink, watch::Sender<ConnectionState>, EventLoop) {
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("akai-test", "127.0.0.1", 1883), 10);
        let (state_tx, state_rx) = watch::channel(state);
        let sink = MqttSink {
            client,
            state: state_rx,
            in_flight: InFlightSlot::default(),
            driver: None,
            server: "tcp://127.0.0.1:1883".into(),
            status: MqttStatus::default(),
        };
        (sink, state_tx, eventloop)
    }

    #[test]
    fn network_errors_are_transient() {
        let io_error = ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(classify_connection_error(&io_error).is_retryable());
        assert!(classify_connection_error(&ConnectionError::NetworkTimeout).is_retryable());
        assert!(classify_connection_error(&ConnectionError::FlushTimeout).is_retryable());
    }

    #[test]
    fn refusals_are_fatal() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(!classify_connection_error(&refused).is_retryable());
        assert!(!classify_connection_error(&ConnectionError::RequestsDone).is_retryable());
    }

    #[test]
    fn in_flight_completes_on_matching_acknowledgement() {
        let slot = InFlightSlot::default();

        let mut delivered = slot.register(QoS::AtLeastOnce);
        slot.sent(7);
        slot.acknowledged(6, QoS::AtLeastOnce);
        slot.acknowledged(7, QoS::ExactlyOnce);
        assert!(delivered.try_recv().is_err());
        slot.acknowledged(7, QoS::AtLeastOnce);
        assert_eq!(delivered.try_recv().unwrap(), Ok(()));

        let mut delivered = slot.register(QoS::AtMostOnce);
        slot.sent(0);
        assert_eq!(delivered.try_recv().unwrap(), Ok(()));

        let mut delivered = slot.register(QoS::ExactlyOnce);
        slot.sent(8);
        slot.fail(PublishError::Transient("reset".into()));
        assert_eq!(
            delivered.try_recv().unwrap(),
            Err(PublishError::Transient("reset".into()))
        );
    }

    #[tokio::test]
    async fn unparsable_server_is_rejected_before_connecting() {
        let settings = MqttSettings {
            server: "ws://broker:80".into(),
            ..MqttSettings::default()
        };
        let result =
            MqttSink::connect(&settings, &RetryPolicy::default(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(SinkError::Config(_))));
    }

    #[tokio::test]
    async fn publish_follows_link_state() {
        let (mut sink, state, _eventloop) =
            offline_sink(ConnectionState::Reconnecting("connection reset".into()));

        let down = sink.publish(&message(QoS::ExactlyOnce)).await;
        assert!(matches!(down, Err(PublishError::Transient(_))));

        state.send_replace(ConnectionState::Failed("not authorized".into()));
        let failed = sink.publish(&message(QoS::ExactlyOnce)).await;
        assert_eq!(failed, Err(PublishError::Fatal("not authorized".into())));

        tokio::time::timeout(WAIT, sink.close()).await.unwrap();
    }

    #[tokio::test]
    async fn publish_waits_for_exactly_once_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener, 0).await;
            let (header, body) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header >> 4, 3, "expected PUBLISH");
            let pkid = publish_pkid(&body);
            stream.write_all(&[0x50, 0x02, pkid[0], pkid[1]]).await.unwrap();
            let (header, _) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header >> 4, 6, "expected PUBREL");
            stream.write_all(&[0x70, 0x02, pkid[0], pkid[1]]).await.unwrap();
            let (header, _) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header >> 4, 14, "expected DISCONNECT");
            body
        });

        let mut sink = MqttSink::connect(&local_settings(port), &fast_retry(), &CancellationToken::new())
            .await
            .unwrap();
        tokio::time::timeout(WAIT, sink.publish(&message(QoS::ExactlyOnce)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.status.acknowledged, 1);

        sink.close().await;
        let body = broker.await.unwrap();
        assert!(body.ends_with(PAYLOAD.as_bytes()));
    }

    #[tokio::test]
    async fn lost_link_fails_unacknowledged_publish_then_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            // First session goes away without acknowledging
            let mut stream = accept_session(&listener, 0).await;
            let (header, _) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header >> 4, 3, "expected PUBLISH");
            drop(stream);

            let mut stream = accept_session(&listener, 0).await;
            let (header, body) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header >> 4, 3, "expected PUBLISH");
            let pkid = publish_pkid(&body);
            stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();
            let (header, _) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header >> 4, 14, "expected DISCONNECT");
        });

        let mut sink = MqttSink::connect(&local_settings(port), &fast_retry(), &CancellationToken::new())
            .await
            .unwrap();

        let lost = tokio::time::timeout(WAIT, sink.publish(&message(QoS::AtLeastOnce)))
            .await
            .unwrap();
        assert!(matches!(lost, Err(PublishError::Transient(_))), "{:?}", lost);
        assert_eq!(sink.status.acknowledged, 0);

        wait_for_state(&sink, |s| *s == ConnectionState::Connected).await;
        tokio::time::timeout(WAIT, sink.publish(&message(QoS::AtLeastOnce)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.status.acknowledged, 1);

        sink.close().await;
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn refused_reconnect_marks_link_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            drop(accept_session(&listener, 0).await);
            // 5: not authorized
            drop(accept_session(&listener, 5).await);
        });

        let mut sink = MqttSink::connect(&local_settings(port), &fast_retry(), &CancellationToken::new())
            .await
            .unwrap();
        wait_for_state(&sink, |s| matches!(s, ConnectionState::Failed(_))).await;
        broker.await.unwrap();

        let refused = sink.publish(&message(QoS::ExactlyOnce)).await;
        assert!(matches!(refused, Err(PublishError::Fatal(_))), "{:?}", refused);

        // The driver is already gone, so close must not sit out its timeout
        tokio::time::timeout(Duration::from_millis(500), sink.close())
            .await
            .expect("close waited for a stopped driver");
    }
}
