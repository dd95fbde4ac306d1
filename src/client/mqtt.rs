//! MQTT Broker Client
//!
//! A [`MqttClient`] is a thin handle: the socket is owned by a background
//! connection task that reconnects with exponential backoff, answers
//! keep-alive and acknowledges QoS 1 deliveries. Operations are forwarded
//! to the task over a command channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, Subscribe, SubscribeReturnCode,
    Subscription,
};

use super::{BrokerClient, ClientError, ClientOptions, ClientStatus, InboundCallback};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const READ_BUFFER_SIZE: usize = 4096;

/// Message to send to the connection task
#[derive(Debug)]
enum ClientCommand {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Shutdown,
}

/// MQTT v3.1.1 client
pub struct MqttClient {
    client_id: String,
    status: watch::Receiver<ClientStatus>,
    command_tx: mpsc::Sender<ClientCommand>,
}

impl MqttClient {
    /// Spawn the connection task and return a handle to it.
    ///
    /// Messages delivered by the broker are passed to `callback`. Must be
    /// called from within a tokio runtime.
    pub fn spawn(options: ClientOptions, callback: Option<InboundCallback>) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(ClientStatus::Disconnected);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let client_id = options.client_id.clone();

        let connection = Connection {
            options,
            status: status_tx,
            commands: command_rx,
            callback,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            next_packet_id: 1,
            awaiting_pingresp: false,
        };
        tokio::spawn(connection.run());

        Arc::new(Self {
            client_id,
            status: status_rx,
            command_tx,
        })
    }

    /// Receiver for every status update.
    ///
    /// Unlike polling [`BrokerClient::status`], a receiver whose value was
    /// marked seen while connected reports a change even when the client
    /// has already reconnected.
    pub fn status_changes(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Send DISCONNECT and stop the connection task
    pub async fn disconnect(&self) {
        let _ = self.command_tx.send(ClientCommand::Shutdown).await;
    }

    async fn send_command(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    fn name(&self) -> &str {
        &self.client_id
    }

    fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| matches!(s, ClientStatus::Connected | ClientStatus::Closed))
            .await
            .map(|s| *s);

        match reached {
            Ok(ClientStatus::Connected) => Ok(()),
            _ => Err(ClientError::Closed),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        self.send_command(ClientCommand::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        })
        .await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        self.send_command(ClientCommand::Subscribe {
            filter: filter.to_string(),
            qos,
        })
        .await
    }
}

/// What woke the session loop
enum Event {
    Command(Option<ClientCommand>),
    Read(std::io::Result<usize>),
    KeepAlive,
}

/// State owned by the connection task
struct Connection {
    options: ClientOptions,
    status: watch::Sender<ClientStatus>,
    commands: mpsc::Receiver<ClientCommand>,
    callback: Option<InboundCallback>,
    encoder: Encoder,
    decoder: Decoder,
    next_packet_id: u16,
    awaiting_pingresp: bool,
}

impl Connection {
    fn set_status(&self, status: ClientStatus) {
        self.status.send_replace(status);
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Connection loop: connect, run the session, back off, repeat
    async fn run(mut self) {
        let mut retry_interval = self.options.reconnect_interval;

        loop {
            self.set_status(ClientStatus::Connecting);
            debug!(
                "MQTT '{}': Connecting to {}",
                self.options.client_id, self.options.address
            );

            let result = match self.connect().await {
                Ok((read_half, write_half, read_buf)) => {
                    retry_interval = self.options.reconnect_interval;
                    self.set_status(ClientStatus::Connected);
                    self.session(read_half, write_half, read_buf).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    info!("MQTT '{}': Disconnected gracefully", self.options.client_id);
                    self.set_status(ClientStatus::Closed);
                    return;
                }
                Err(e) => {
                    error!("MQTT '{}': Connection failed: {}", self.options.client_id, e);
                    self.set_status(ClientStatus::Backoff);

                    debug!(
                        "MQTT '{}': Reconnecting in {:?}",
                        self.options.client_id, retry_interval
                    );
                    if !self.backoff(retry_interval).await {
                        info!("MQTT '{}': Shutdown requested", self.options.client_id);
                        self.set_status(ClientStatus::Closed);
                        return;
                    }

                    // Exponential backoff
                    retry_interval =
                        std::cmp::min(retry_interval * 2, self.options.max_reconnect_interval);
                }
            }
        }
    }

    /// Sleep before the next attempt. Returns false if shutdown was requested.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let command = tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => command,
            };

            match command {
                None | Some(ClientCommand::Shutdown) => return false,
                Some(command) => warn!(
                    "MQTT '{}': Not connected, dropping {:?}",
                    self.options.client_id, command
                ),
            }
        }
    }

    /// Open the TCP connection and complete the CONNECT/CONNACK exchange
    async fn connect(
        &mut self,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, BytesMut), ClientError> {
        let (host, port) = self.options.host_port();

        let stream = timeout(
            self.options.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;

        debug!("MQTT '{}': TCP connected", self.options.client_id);

        let (mut read_half, mut write_half) = stream.into_split();

        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.options.client_id.clone(),
            clean_session: true,
            keep_alive: self.options.keepalive.as_secs().min(u16::MAX as u64) as u16,
            username: self.options.username.clone(),
            password: self
                .options
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
        }));
        self.write_packet(&mut write_half, &connect).await?;

        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let packet = timeout(
            self.options.connect_timeout,
            self.read_packet(&mut read_half, &mut read_buf),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        match packet {
            Packet::ConnAck(connack) if connack.return_code == ConnectReturnCode::Accepted => {
                info!(
                    "MQTT '{}': Connected to {}:{} (session_present={})",
                    self.options.client_id, host, port, connack.session_present
                );
            }
            Packet::ConnAck(connack) => {
                return Err(ClientError::Rejected(connack.return_code.to_string()));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected CONNACK, got {:?}",
                    other.packet_type()
                )));
            }
        }

        self.awaiting_pingresp = false;
        Ok((read_half, write_half, read_buf))
    }

    /// Message loop for one established connection.
    ///
    /// Returns `Ok` when shutdown was requested, `Err` when the connection
    /// was lost.
    async fn session(
        &mut self,
        mut read_half: OwnedReadHalf,
        mut write_half: OwnedWriteHalf,
        mut read_buf: BytesMut,
    ) -> Result<(), ClientError> {
        let keepalive_enabled = !self.options.keepalive.is_zero();
        let period = self.options.keepalive.max(Duration::from_secs(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Bytes may already hold whole packets (e.g. read along with CONNACK)
            while let Some(packet) = self.try_decode(&mut read_buf)? {
                self.handle_packet(packet, &mut write_half).await?;
            }

            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                result = read_half.read_buf(&mut read_buf) => Event::Read(result),
                _ = keepalive.tick(), if keepalive_enabled => Event::KeepAlive,
            };

            match event {
                Event::Command(Some(ClientCommand::Shutdown)) | Event::Command(None) => {
                    let _ = self.write_packet(&mut write_half, &Packet::Disconnect).await;
                    return Ok(());
                }
                Event::Command(Some(command)) => {
                    self.handle_command(command, &mut write_half).await?;
                }
                Event::Read(result) => {
                    if result? == 0 {
                        return Err(ClientError::ConnectionLost(
                            "Connection closed".to_string(),
                        ));
                    }
                }
                Event::KeepAlive => {
                    if self.awaiting_pingresp {
                        return Err(ClientError::ConnectionLost(
                            "Keep alive timeout".to_string(),
                        ));
                    }
                    self.write_packet(&mut write_half, &Packet::PingReq).await?;
                    self.awaiting_pingresp = true;
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: ClientCommand,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), ClientError> {
        match command {
            ClientCommand::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                let packet_id = if qos != QoS::AtMostOnce {
                    Some(self.next_packet_id())
                } else {
                    None
                };

                debug!(
                    "MQTT '{}': PUBLISH {} ({} bytes, id={:?})",
                    self.options.client_id,
                    topic,
                    payload.len(),
                    packet_id
                );

                let publish = Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain,
                    topic,
                    packet_id,
                    payload,
                });
                self.write_packet(writer, &publish).await
            }
            ClientCommand::Subscribe { filter, qos } => {
                let packet_id = self.next_packet_id();
                debug!(
                    "MQTT '{}': SUBSCRIBE {} (id={})",
                    self.options.client_id, filter, packet_id
                );

                let subscribe = Packet::Subscribe(Subscribe {
                    packet_id,
                    subscriptions: vec![Subscription { filter, qos }],
                });
                self.write_packet(writer, &subscribe).await
            }
            // Handled by the session loop
            ClientCommand::Shutdown => Ok(()),
        }
    }

    async fn handle_packet(
        &mut self,
        packet: Packet,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), ClientError> {
        match packet {
            Packet::Publish(publish) => {
                debug!(
                    "MQTT '{}': Received {} ({} bytes)",
                    self.options.client_id,
                    publish.topic,
                    publish.payload.len()
                );

                let ack = match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => Some(packet_id),
                    (QoS::ExactlyOnce, _) => {
                        warn!(
                            "MQTT '{}': QoS 2 delivery on {} is not acknowledged",
                            self.options.client_id, publish.topic
                        );
                        None
                    }
                    _ => None,
                };

                if let Some(ref callback) = self.callback {
                    callback(publish.topic, publish.payload);
                }

                if let Some(packet_id) = ack {
                    self.write_packet(writer, &Packet::PubAck(PubAck::new(packet_id)))
                        .await?;
                }
                Ok(())
            }
            Packet::PubAck(ack) => {
                debug!(
                    "MQTT '{}': PUBACK received (id={})",
                    self.options.client_id, ack.packet_id
                );
                Ok(())
            }
            Packet::SubAck(suback) => {
                for code in &suback.return_codes {
                    match code {
                        SubscribeReturnCode::Success(qos) => debug!(
                            "MQTT '{}': SUBACK id={} granted {:?}",
                            self.options.client_id, suback.packet_id, qos
                        ),
                        SubscribeReturnCode::Failure => warn!(
                            "MQTT '{}': Subscription id={} refused by broker",
                            self.options.client_id, suback.packet_id
                        ),
                    }
                }
                Ok(())
            }
            Packet::PingResp => {
                debug!("MQTT '{}': PINGRESP received", self.options.client_id);
                self.awaiting_pingresp = false;
                Ok(())
            }
            other => Err(ClientError::Protocol(format!(
                "unexpected {:?} packet",
                other.packet_type()
            ))),
        }
    }

    fn try_decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, ClientError> {
        match self.decoder.decode(&buf[..]) {
            Ok(Some((packet, len))) => {
                buf.advance(len);
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ClientError::Protocol(e.to_string())),
        }
    }

    async fn read_packet(
        &mut self,
        reader: &mut OwnedReadHalf,
        buf: &mut BytesMut,
    ) -> Result<Packet, ClientError> {
        loop {
            if let Some(packet) = self.try_decode(buf)? {
                return Ok(packet);
            }
            if reader.read_buf(buf).await? == 0 {
                return Err(ClientError::ConnectionLost(
                    "Connection closed".to_string(),
                ));
            }
        }
    }

    async fn write_packet(
        &self,
        writer: &mut OwnedWriteHalf,
        packet: &Packet,
    ) -> Result<(), ClientError> {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .map_err(|e| ClientError::Protocol(format!("Encode error: {}", e)))?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::ConnAck;

    const WAIT: Duration = Duration::from_secs(5);

    /// Broker side of one connection
    struct Peer {
        stream: TcpStream,
        buf: BytesMut,
        decoder: Decoder,
    }

    impl Peer {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            Self {
                stream,
                buf: BytesMut::new(),
                decoder: Decoder::new(),
            }
        }

        async fn recv(&mut self) -> Packet {
            loop {
                if let Some((packet, len)) = self.decoder.decode(&self.buf).unwrap() {
                    self.buf.advance(len);
                    return packet;
                }
                let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "client closed the connection");
            }
        }

        async fn send(&mut self, packet: Packet) {
            let mut buf = BytesMut::new();
            Encoder::new().encode(&packet, &mut buf).unwrap();
            self.stream.write_all(&buf).await.unwrap();
        }

        async fn connack(&mut self, return_code: ConnectReturnCode) -> Connect {
            let connect = match self.recv().await {
                Packet::Connect(connect) => *connect,
                other => panic!("expected CONNECT, got {:?}", other),
            };
            self.send(Packet::ConnAck(ConnAck {
                session_present: false,
                return_code,
            }))
            .await;
            connect
        }
    }

    async fn listener() -> (TcpListener, ClientOptions) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut options = ClientOptions::new("pub-test", listener.local_addr().unwrap().to_string());
        options.reconnect_interval = Duration::from_millis(20);
        options.max_reconnect_interval = Duration::from_millis(40);
        (listener, options)
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let (listener, mut options) = listener().await;
        options.username = Some("bridge".to_string());
        options.password = Some("secret".to_string());
        options.keepalive = Duration::from_secs(30);

        let client = MqttClient::spawn(options, None);
        let mut peer = Peer::accept(&listener).await;
        let connect = peer.connack(ConnectReturnCode::Accepted).await;

        assert_eq!(connect.client_id, "pub-test");
        assert!(connect.clean_session);
        assert_eq!(connect.keep_alive, 30);
        assert_eq!(connect.username.as_deref(), Some("bridge"));
        assert_eq!(connect.password, Some(Bytes::from_static(b"secret")));

        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
        assert_eq!(client.status(), ClientStatus::Connected);
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_packets() {
        let (listener, options) = listener().await;
        let client = MqttClient::spawn(options, None);
        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();

        client
            .publish("sensor/temp", Bytes::from_static(&[1, 2]), QoS::AtLeastOnce, false)
            .await
            .unwrap();
        client.subscribe("ctrl/fan", QoS::AtMostOnce).await.unwrap();

        match peer.recv().await {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, "sensor/temp");
                assert_eq!(publish.payload, Bytes::from_static(&[1, 2]));
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                assert!(!publish.retain);
                assert_eq!(publish.packet_id, Some(1));
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
        match peer.recv().await {
            Packet::Subscribe(subscribe) => {
                assert_eq!(subscribe.packet_id, 2);
                assert_eq!(
                    subscribe.subscriptions,
                    vec![Subscription {
                        filter: "ctrl/fan".to_string(),
                        qos: QoS::AtMostOnce,
                    }]
                );
            }
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delivery_invokes_callback_and_acks() {
        let (listener, options) = listener().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let callback: InboundCallback = Arc::new(move |topic: String, payload: Bytes| {
            sink.lock().push((topic, payload));
        });

        let client = MqttClient::spawn(options, Some(callback));
        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();

        peer.send(Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: "ctrl/fan".to_string(),
            packet_id: Some(7),
            payload: Bytes::from_static(&[0xFF]),
            ..Default::default()
        }))
        .await;

        assert_eq!(peer.recv().await, Packet::PubAck(PubAck::new(7)));
        assert_eq!(
            received.lock().clone(),
            vec![("ctrl/fan".to_string(), Bytes::from_static(&[0xFF]))]
        );
    }

    #[tokio::test]
    async fn test_rejected_connection_retries() {
        let (listener, options) = listener().await;
        let client = MqttClient::spawn(options, None);

        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::NotAuthorized).await;

        // Backs off, then tries again
        let mut peer = Peer::accept(&listener).await;
        assert!(!client.is_connected());
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        let (listener, options) = listener().await;
        let client = MqttClient::spawn(options, None);

        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
        drop(peer);

        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_changes_report_completed_reconnect() {
        let (listener, options) = listener().await;
        let client = MqttClient::spawn(options, None);
        let mut status = client.status_changes();

        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, status.wait_for(|s| *s == ClientStatus::Connected))
            .await
            .unwrap()
            .unwrap();
        drop(peer);

        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();

        // Connected again, yet the drop in between is still visible
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), ClientStatus::Connected);
    }

    #[tokio::test]
    async fn test_operations_fail_when_not_connected() {
        let (listener, options) = listener().await;
        let client = MqttClient::spawn(options, None);
        // Accepted but never answered: the client stays in Connecting
        let _peer = Peer::accept(&listener).await;

        let result = client
            .publish("a", Bytes::new(), QoS::AtLeastOnce, false)
            .await;
        assert!(matches!(result, Err(ClientError::NotConnected)));

        let result = client.subscribe("a", QoS::AtMostOnce).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_closes_client() {
        let (listener, options) = listener().await;
        let client = MqttClient::spawn(options, None);
        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();

        client.disconnect().await;
        assert_eq!(peer.recv().await, Packet::Disconnect);

        let mut status = client.status.clone();
        timeout(WAIT, status.wait_for(|s| *s == ClientStatus::Closed))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            client.wait_connected().await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_keepalive_ping() {
        let (listener, mut options) = listener().await;
        options.keepalive = Duration::from_secs(1);
        let client = MqttClient::spawn(options, None);
        let mut peer = Peer::accept(&listener).await;
        peer.connack(ConnectReturnCode::Accepted).await;
        timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();

        assert_eq!(peer.recv().await, Packet::PingReq);
        peer.send(Packet::PingResp).await;
        assert_eq!(peer.recv().await, Packet::PingReq);
        assert!(client.is_connected());
    }
}
