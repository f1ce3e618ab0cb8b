/*!
CONDUIT MODBUS TCP - connector for Modbus TCP devices (protocol code `mtc`)

ROLE:
One process per PLC link. The lifecycle machine drives it; this crate only
fills in the protocol hooks.

OPERATION:
- CONFIGURE: blocks become Modbus request groups (`unit_id`, `func_code`,
  `address`, `count` in the block properties)
- CONNECT: TCP stream to host:port within the connection timeout
- EXECUTE: peer-closure probe, then one read request per due group
- RECOVER: device exceptions resume on the same stream, anything else reconnects
*/

pub mod frame;
pub mod group;

use async_trait::async_trait;
use conduit_connector::{ConfigSnapshot, ConnectorError, ProtocolHooks, Recovery};
use conduit_core::ConnectionDescriptor;
use group::{ModbusGroup, Schedule};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

pub const PROTOCOL: &str = "mtc";

const FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ModbusTransport {
    stream: TcpStream,
    peer: SocketAddr,
    transaction: u16,
}

impl ModbusTransport {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction = self.transaction.wrapping_add(1);
        self.transaction
    }
}

#[derive(Default)]
pub struct ModbusTcpClient {
    schedule: Schedule,
    timeout: Duration,
    last_fault_device_side: bool,
}

impl ModbusTcpClient {
    pub fn new() -> Self {
        Self {
            timeout: FALLBACK_TIMEOUT,
            ..Default::default()
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = &ModbusGroup> {
        self.schedule.groups()
    }
}

fn effective_timeout(connection: &ConnectionDescriptor) -> Duration {
    let timeout = connection.timeout();
    if timeout.is_zero() {
        FALLBACK_TIMEOUT
    } else {
        timeout
    }
}

/// Detects a peer that closed the stream since the last cycle
fn probe_peer(stream: &TcpStream) -> Result<(), ConnectorError> {
    let mut buf = [0u8; 64];
    match stream.try_read(&mut buf) {
        Ok(0) => Err(ConnectorError::transport("connection closed by peer")),
        Ok(n) => {
            debug!("Discarding {} unsolicited bytes", n);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(ConnectorError::transport(e)),
    }
}

#[async_trait]
impl ProtocolHooks for ModbusTcpClient {
    type Transport = ModbusTransport;

    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn configure(&mut self, snapshot: &ConfigSnapshot) -> Result<(), ConnectorError> {
        let connection = &snapshot.connection;
        if connection.host.is_none() || connection.port.is_none() {
            return Err(ConnectorError::malformed(
                &connection.id,
                "Modbus TCP needs both host and port",
            ));
        }
        self.timeout = effective_timeout(connection);

        let groups = snapshot
            .enabled_blocks()
            .map(|b| ModbusGroup::from_block(b, snapshot.tags_for(&b.id).len()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConnectorError::malformed(&connection.id, e))?;
        info!(
            conn_id = %connection.id,
            "{} Modbus group(s), {} polled",
            groups.len(),
            groups.iter().filter(|g| g.polled).count()
        );
        self.schedule.replace(groups);
        Ok(())
    }

    async fn open_transport(
        &mut self,
        connection: &ConnectionDescriptor,
    ) -> Result<ModbusTransport, ConnectorError> {
        let (Some(host), Some(port)) = (connection.host.as_deref(), connection.port) else {
            return Err(ConnectorError::malformed(&connection.id, "missing host or port"));
        };
        let timeout = effective_timeout(connection);
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConnectorError::transport(format!("connect to {host}:{port} timed out")))?
            .map_err(|e| ConnectorError::transport(format!("connect to {host}:{port}: {e}")))?;
        let peer = stream.peer_addr().map_err(ConnectorError::transport)?;
        Ok(ModbusTransport {
            stream,
            peer,
            transaction: 0,
        })
    }

    async fn connect(&mut self, transport: &mut ModbusTransport) -> Result<(), ConnectorError> {
        transport
            .stream
            .set_nodelay(true)
            .map_err(ConnectorError::transport)?;
        debug!("Modbus session ready with {}", transport.peer);
        Ok(())
    }

    async fn execute(&mut self, transport: &mut ModbusTransport) -> Result<(), ConnectorError> {
        probe_peer(&transport.stream)?;

        for group in self.schedule.take_due(Instant::now()) {
            let transaction = transport.next_transaction();
            match frame::exchange(&mut transport.stream, transaction, &group, self.timeout).await {
                Ok(data) => {
                    debug!(
                        block = %group.block_id,
                        "fc{} @{} x{}: {} byte(s)",
                        group.func_code,
                        group.address,
                        group.count,
                        data.len()
                    );
                }
                Err(e) => {
                    self.last_fault_device_side = e.is_device_side();
                    return Err(if e.is_device_side() {
                        ConnectorError::execution(format!("block {}: {}", group.block_id, e))
                    } else {
                        ConnectorError::transport(format!("block {}: {}", group.block_id, e))
                    });
                }
            }
        }
        Ok(())
    }

    async fn recover(
        &mut self,
        transport: Option<&mut ModbusTransport>,
        fault: &ConnectorError,
    ) -> Recovery {
        let device_side =
            std::mem::take(&mut self.last_fault_device_side) && matches!(fault, ConnectorError::Execution(_));
        match transport {
            Some(_) if device_side => Recovery::Resume,
            _ => Recovery::Reconnect,
        }
    }

    async fn disconnect(&mut self, transport: Option<ModbusTransport>) {
        if let Some(mut transport) = transport {
            if let Err(e) = transport.stream.shutdown().await {
                debug!("Modbus stream shutdown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{BlockDescriptor, Direction, PropertyMap, TriggerMode};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn snapshot(port: u16, props: serde_json::Value) -> ConfigSnapshot {
        let properties = match props {
            serde_json::Value::Object(map) => map,
            _ => PropertyMap::new(),
        };
        ConfigSnapshot {
            connection: ConnectionDescriptor {
                id: "mtc-01".into(),
                protocol: PROTOCOL.into(),
                host: Some("127.0.0.1".into()),
                port: Some(port),
                timeout_s: 1.0,
                retry_s: 1.0,
                enabled: true,
                properties: PropertyMap::new(),
                updated_at: None,
            },
            blocks: vec![BlockDescriptor {
                id: "b1".into(),
                connection_id: "mtc-01".into(),
                enabled: true,
                direction: Direction::Read,
                trigger: TriggerMode::Cyclic,
                period_s: 1.0,
                properties,
            }],
            tags: BTreeMap::new(),
        }
    }

    /// Answers each read request with `reply(request)`
    async fn fake_device<F>(listener: TcpListener, reply: F)
    where
        F: Fn(&[u8; 12]) -> Vec<u8>,
    {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        while socket.read_exact(&mut request).await.is_ok() {
            socket.write_all(&reply(&request)).await.unwrap();
        }
    }

    fn register_reply(request: &[u8; 12]) -> Vec<u8> {
        // tid, proto 0, length 5, unit, fc, byte count 2, value 42
        vec![request[0], request[1], 0, 0, 0, 5, request[6], request[7], 2, 0, 42]
    }

    fn exception_reply(request: &[u8; 12]) -> Vec<u8> {
        vec![request[0], request[1], 0, 0, 0, 3, request[6], request[7] | 0x80, 2]
    }

    async fn connected(snapshot: &ConfigSnapshot) -> (ModbusTcpClient, ModbusTransport) {
        let mut client = ModbusTcpClient::new();
        client.configure(snapshot).await.unwrap();
        let mut transport = client.open_transport(&snapshot.connection).await.unwrap();
        client.connect(&mut transport).await.unwrap();
        (client, transport)
    }

    #[tokio::test]
    async fn test_poll_cycle_against_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_device(listener, register_reply));

        let snap = snapshot(port, json!({"unit_id": 3, "address": 100}));
        let (mut client, mut transport) = connected(&snap).await;
        client.execute(&mut transport).await.unwrap();
        assert_eq!(transport.transaction, 1);

        // not due again before its period
        client.execute(&mut transport).await.unwrap();
        assert_eq!(transport.transaction, 1);
    }

    #[tokio::test]
    async fn test_device_exception_resumes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_device(listener, exception_reply));

        let snap = snapshot(port, json!({}));
        let (mut client, mut transport) = connected(&snap).await;
        let err = client.execute(&mut transport).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Execution(_)));
        assert_eq!(client.recover(Some(&mut transport), &err).await, Recovery::Resume);
    }

    #[tokio::test]
    async fn test_peer_closure_is_a_transport_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let snap = snapshot(port, json!({}));
        let (mut client, mut transport) = connected(&snap).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = client.execute(&mut transport).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Transport(_)));
        assert_eq!(client.recover(Some(&mut transport), &err).await, Recovery::Reconnect);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let snap = snapshot(port, json!({}));
        let mut client = ModbusTcpClient::new();
        client.configure(&snap).await.unwrap();
        let err = client.open_transport(&snap.connection).await.err().unwrap();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_configure_rejects_bad_groups_and_missing_address() {
        let mut client = ModbusTcpClient::new();
        let err = client
            .configure(&snapshot(502, json!({"func_code": 9})))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ConfigurationMalformed { .. }));

        let mut snap = snapshot(502, json!({}));
        snap.connection.port = None;
        let err = client.configure(&snap).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
