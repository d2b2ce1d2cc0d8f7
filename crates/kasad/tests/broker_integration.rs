//! Integration tests for the broker and device daemons over real TCP.
//!
//! Each test binds a broker on `127.0.0.1:0`, registers one or more
//! daemons backed by simulated fleets and talks to them through
//! `BrokerClient`, exactly as the CLI does.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kasa_core::{BrokerConfig, DaemonConfig, ErrorCode, Identity, SessionConfig};
use kasa_protocol::{BrokerToClient, ClientMessage, ClientMessageType, ProtocolVersion};
use kasad::broker::{BrokerServer, RouterHandle};
use kasad::client::{BrokerClient, ClientError};
use kasad::daemon::{spawn_manager, BrokerLink, DaemonError, ManagerOptions};
use kasad::link::sim::SimFleet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for a daemon to appear in the broker's identity table
const REGISTER_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between identity table checks
const REGISTER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for any single request in these tests
const REQUEST_BOUND: Duration = Duration::from_secs(5);

const MAX_MESSAGE_SIZE: usize = 1_048_576;

// ============================================================================
// Test Helpers
// ============================================================================

/// Broker bound to ephemeral ports, shut down on drop.
struct TestBroker {
    client_addr: SocketAddr,
    daemon_addr: SocketAddr,
    router: RouterHandle,
    cancel_token: CancellationToken,
}

impl TestBroker {
    async fn spawn() -> Self {
        Self::spawn_with_timeout(Duration::from_secs(5)).await
    }

    async fn spawn_with_timeout(request_timeout: Duration) -> Self {
        let config = BrokerConfig {
            client_endpoint: "127.0.0.1:0".to_string(),
            daemon_endpoint: "127.0.0.1:0".to_string(),
            request_timeout_ms: request_timeout.as_millis() as u64,
            max_message_size: MAX_MESSAGE_SIZE,
        };
        let cancel_token = CancellationToken::new();
        let server = BrokerServer::bind(&config, cancel_token.clone())
            .await
            .expect("bind broker");

        let broker = Self {
            client_addr: server.client_addr().expect("client addr"),
            daemon_addr: server.daemon_addr().expect("daemon addr"),
            router: server.router(),
            cancel_token,
        };

        tokio::spawn(async move { server.run().await });
        broker
    }

    async fn client(&self) -> BrokerClient {
        BrokerClient::connect(&self.client_addr.to_string(), MAX_MESSAGE_SIZE)
            .await
            .expect("connect client")
    }

    fn daemon_config(&self, identity: &str) -> DaemonConfig {
        DaemonConfig {
            identity: identity.to_string(),
            broker_endpoint: self.daemon_addr.to_string(),
            auto_connect: false,
            reconnect_initial_delay_ms: 20,
            reconnect_max_delay_ms: 200,
            discovery_window_ms: 50,
        }
    }

    /// Starts a daemon for `identity` and waits until the broker lists it.
    async fn daemon(&self, identity: &str, fleet: &SimFleet) -> TestDaemon {
        self.daemon_with(self.daemon_config(identity), fleet).await
    }

    async fn daemon_with(&self, config: DaemonConfig, fleet: &SimFleet) -> TestDaemon {
        let daemon = TestDaemon::start(config, fleet);
        self.wait_registered(&daemon.identity).await;
        daemon
    }

    async fn wait_registered(&self, identity: &Identity) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < REGISTER_WAIT_TIMEOUT {
            if self.router.identities().await.contains(identity) {
                return;
            }
            sleep(REGISTER_POLL_INTERVAL).await;
        }
        panic!("daemon {identity} did not register within {REGISTER_WAIT_TIMEOUT:?}");
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// A running daemon (manager plus broker link).
struct TestDaemon {
    identity: Identity,
    cancel_token: CancellationToken,
    link: JoinHandle<Result<(), DaemonError>>,
}

impl TestDaemon {
    fn start(config: DaemonConfig, fleet: &SimFleet) -> Self {
        let cancel_token = CancellationToken::new();
        let options = ManagerOptions {
            links: Arc::new(fleet.clone()),
            discovery: Arc::new(fleet.clone()),
            session: fast_session(),
            auto_connect: config.auto_connect,
            discovery_window: config.discovery_window(),
        };
        let manager = spawn_manager(options, cancel_token.clone());
        let link = BrokerLink::new(&config, MAX_MESSAGE_SIZE, manager, cancel_token.clone());
        let identity = link.identity().clone();

        Self {
            identity,
            cancel_token: cancel_token.clone(),
            link: tokio::spawn(async move { link.run().await }),
        }
    }

    fn stop(&self) {
        self.cancel_token.cancel();
    }
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        idle_timeout_ms: 1_000,
        connect_retries: 3,
        connect_timeout_ms: 100,
        command_timeout_ms: 200,
        read_value_delay_ms: 10,
        max_read_value_delay_ms: 1_000,
        command_buffer: 16,
    }
}

async fn request(client: &mut BrokerClient, payload: &str) -> Result<String, ClientError> {
    timeout(REQUEST_BOUND, client.request(payload))
        .await
        .expect("request timed out")
}

fn remote_code(result: Result<String, ClientError>) -> ErrorCode {
    result
        .expect_err("expected a typed failure")
        .code()
        .expect("expected a remote failure")
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_request_reaches_only_its_daemon() {
    let broker = TestBroker::spawn().await;
    let gatt_fleet = SimFleet::with_devices(["AA:BB:CC:DD:EE:FF"]);
    let wemo_fleet = SimFleet::with_devices(["AA:BB:CC:DD:EE:FF"]);
    let _gatt = broker.daemon("GATT", &gatt_fleet).await;
    let _wemo = broker.daemon("WeMo", &wemo_fleet).await;

    let mut client = broker.client().await;
    let reply = request(&mut client, "GATT connect AA:BB:CC:DD:EE:FF").await;

    assert_eq!(reply.unwrap(), "ok");
    assert_eq!(gatt_fleet.connect_attempts("AA:BB:CC:DD:EE:FF"), 1);
    assert_eq!(wemo_fleet.connect_attempts("AA:BB:CC:DD:EE:FF"), 0);
}

#[tokio::test]
async fn test_replies_reach_originating_clients() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::new();
    for n in 0..8 {
        let key = format!("dev-{n}");
        fleet.add_device(&key);
        fleet.set_register(&key, "0x25", &format!("value-{n}"));
    }
    let _gatt = broker.daemon("GATT", &fleet).await;

    let mut tasks = Vec::new();
    for n in 0..8 {
        let mut client = broker.client().await;
        tasks.push(tokio::spawn(async move {
            request(&mut client, &format!("GATT connect dev-{n}"))
                .await
                .unwrap();
            let mut values = Vec::new();
            for _ in 0..5 {
                values.push(request(&mut client, &format!("GATT read dev-{n} 0x25")).await.unwrap());
            }
            (n, values)
        }));
    }

    for task in tasks {
        let (n, values) = task.await.unwrap();
        assert!(values.iter().all(|v| *v == format!("value-{n}")));
    }
}

#[tokio::test]
async fn test_unknown_identity_is_typed_error() {
    let broker = TestBroker::spawn().await;
    let mut client = broker.client().await;

    assert_eq!(
        remote_code(request(&mut client, "Hue on lamp").await),
        ErrorCode::UnknownIdentity
    );

    // The connection stays usable after a failure
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_empty_payload_is_invalid_request() {
    let broker = TestBroker::spawn().await;
    let mut client = broker.client().await;

    assert_eq!(
        remote_code(request(&mut client, "").await),
        ErrorCode::InvalidRequest
    );
}

// ============================================================================
// Session management over the wire
// ============================================================================

#[tokio::test]
async fn test_connect_twice_is_idempotent() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::with_devices(["AA:BB:CC:DD:EE:FF"]);
    fleet.fail_next_connects("AA:BB:CC:DD:EE:FF", 2);
    let _gatt = broker.daemon("GATT", &fleet).await;
    let mut client = broker.client().await;

    let first = request(&mut client, "GATT connect AA:BB:CC:DD:EE:FF").await.unwrap();
    let second = request(&mut client, "GATT connect AA:BB:CC:DD:EE:FF").await.unwrap();

    assert_eq!(first, "ok");
    assert_eq!(first, second);
    // Two failed attempts, one success, nothing for the second connect
    assert_eq!(fleet.connect_attempts("AA:BB:CC:DD:EE:FF"), 3);
    assert_eq!(
        request(&mut client, "GATT active").await.unwrap(),
        "AA:BB:CC:DD:EE:FF"
    );
}

#[tokio::test]
async fn test_connect_failure_reports_connect_failed() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::with_devices(["AA"]);
    fleet.set_reachable("AA", false);
    let _gatt = broker.daemon("GATT", &fleet).await;
    let mut client = broker.client().await;

    assert_eq!(
        remote_code(request(&mut client, "GATT connect AA").await),
        ErrorCode::ConnectFailed
    );
    assert_eq!(fleet.connect_attempts("AA"), 3);
}

#[tokio::test]
async fn test_disconnect_removes_key_from_active() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::with_devices(["AA", "BB"]);
    let _gatt = broker.daemon("GATT", &fleet).await;
    let mut client = broker.client().await;

    request(&mut client, "GATT connect AA").await.unwrap();
    request(&mut client, "GATT connect BB").await.unwrap();
    assert_eq!(request(&mut client, "GATT disconnect AA").await.unwrap(), "ok");

    let active = request(&mut client, "GATT list").await.unwrap();
    assert_eq!(active, "BB");
}

#[tokio::test]
async fn test_read_for_unknown_key_is_unknown_device() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::with_devices(["AA"]);
    let _gatt = broker.daemon("GATT", &fleet).await;
    let mut client = broker.client().await;

    assert_eq!(
        remote_code(request(&mut client, "GATT read 0x25").await),
        ErrorCode::UnknownDevice
    );
}

#[tokio::test]
async fn test_read_value_through_broker() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::new();
    fleet.add_sensor("TI", "0x29", "01", "0x25", "7f");
    let _gatt = broker.daemon("GATT", &fleet).await;
    let mut client = broker.client().await;

    request(&mut client, "GATT connect TI").await.unwrap();
    let reading = request(&mut client, "GATT read_value TI 0x29 0x25 01 00 0.05")
        .await
        .unwrap();

    assert_eq!(reading, "7f");
    assert_eq!(fleet.register("TI", "0x29"), Some("00".to_string()));
}

#[tokio::test]
async fn test_concurrent_switch_commands_both_serviced() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::new();
    fleet.add_switch("kitchen");
    let mut config = broker.daemon_config("WeMo");
    config.auto_connect = true;
    let _wemo = broker.daemon_with(config, &fleet).await;

    let mut on_client = broker.client().await;
    let mut off_client = broker.client().await;
    let on = tokio::spawn(async move { request(&mut on_client, "WeMo on kitchen").await });
    let off = tokio::spawn(async move { request(&mut off_client, "WeMo off kitchen").await });

    assert_eq!(on.await.unwrap().unwrap(), "ok");
    assert_eq!(off.await.unwrap().unwrap(), "ok");

    let mut client = broker.client().await;
    let state = request(&mut client, "WeMo state kitchen").await.unwrap();
    let expected = if fleet.power("kitchen") == Some(true) { "on" } else { "off" };
    assert_eq!(state, expected);
}

// ============================================================================
// Daemon lifecycle
// ============================================================================

#[tokio::test]
async fn test_duplicate_identity_rejected() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::with_devices(["AA"]);
    let _first = broker.daemon("GATT", &fleet).await;

    let second = TestDaemon::start(broker.daemon_config("GATT"), &fleet);
    let result = timeout(REQUEST_BOUND, second.link).await.unwrap().unwrap();

    assert!(matches!(result, Err(DaemonError::Rejected(_))));
    assert_eq!(broker.router.identities().await, vec![Identity::new("GATT")]);
}

#[tokio::test]
async fn test_daemon_leaving_fails_waiting_client() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::with_devices(["AA"]);
    fleet.set_hung("AA", true);
    let gatt = broker.daemon("GATT", &fleet).await;
    let mut client = broker.client().await;

    let pending = tokio::spawn(async move { request(&mut client, "GATT connect AA").await });
    sleep(Duration::from_millis(50)).await;
    gatt.stop();

    assert_eq!(
        remote_code(pending.await.unwrap()),
        ErrorCode::DaemonUnavailable
    );
}

#[tokio::test]
async fn test_slow_daemon_yields_timeout() {
    let broker = TestBroker::spawn_with_timeout(Duration::from_millis(100)).await;
    let fleet = SimFleet::with_devices(["AA"]);
    fleet.set_hung("AA", true);
    let _gatt = broker.daemon("GATT", &fleet).await;
    let mut client = broker.client().await;

    assert_eq!(
        remote_code(request(&mut client, "GATT connect AA").await),
        ErrorCode::Timeout
    );
    // A superseded reply does not leak into the next request
    assert_eq!(request(&mut client, "GATT active").await.unwrap(), "AA");
}

#[tokio::test]
async fn test_daemon_reregisters_after_broker_restart() {
    let broker = TestBroker::spawn().await;
    let fleet = SimFleet::with_devices(["AA"]);
    let _gatt = broker.daemon("GATT", &fleet).await;
    let daemon_addr = broker.daemon_addr;
    drop(broker);
    sleep(Duration::from_millis(50)).await;

    // A new broker on the same daemon port
    let config = BrokerConfig {
        client_endpoint: "127.0.0.1:0".to_string(),
        daemon_endpoint: daemon_addr.to_string(),
        request_timeout_ms: 5_000,
        max_message_size: MAX_MESSAGE_SIZE,
    };
    let cancel_token = CancellationToken::new();
    let server = BrokerServer::bind(&config, cancel_token.clone())
        .await
        .expect("rebind broker");
    let router = server.router();
    tokio::spawn(async move { server.run().await });

    let start = tokio::time::Instant::now();
    while !router.identities().await.contains(&Identity::new("GATT")) {
        assert!(start.elapsed() < REGISTER_WAIT_TIMEOUT, "daemon did not re-register");
        sleep(REGISTER_POLL_INTERVAL).await;
    }
    cancel_token.cancel();
}

// ============================================================================
// Client protocol
// ============================================================================

#[tokio::test]
async fn test_ping_pong_and_address() {
    let broker = TestBroker::spawn().await;
    let mut first = broker.client().await;
    let second = broker.client().await;

    assert_ne!(first.address(), second.address());
    first.ping().await.unwrap();
    first.ping().await.unwrap();
}

#[tokio::test]
async fn test_major_version_mismatch_rejected() {
    let broker = TestBroker::spawn().await;
    let stream = TcpStream::connect(broker.client_addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let hello = ClientMessage {
        protocol_version: ProtocolVersion::new(2, 0),
        message: ClientMessageType::Connect,
    };
    let mut line = serde_json::to_string(&hello).unwrap();
    line.push('\n');
    writer.write_all(line.as_bytes()).await.unwrap();

    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    let frame: BrokerToClient = serde_json::from_str(response.trim()).unwrap();

    assert!(matches!(frame, BrokerToClient::Rejected { .. }));
}
