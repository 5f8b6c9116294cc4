//! End-to-end tests against an in-process serial bridge.

use std::sync::Arc;
use std::time::Duration;

use hoodlink::constants::WIRE_TIME_FORMAT;
use hoodlink::gateway::IngestReport;
use hoodlink::wire::JsonStreamSplitter;
use hoodlink::{
    format_hex, DeviceClass, FieldValue, Gateway, GatewayConfig, GatewayError, ModbusCodec,
    StateStore,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

fn config(port: u16, inbound: &str) -> GatewayConfig {
    GatewayConfig::from_yaml_str(&format!(
        r#"
server:
  host: 127.0.0.1
  port: {port}
serial_ports:
  - {{ name: COM5, description: 3F, baudrate: 9600 }}
devices:
  COM5:
    "01": 301通风柜
    "02": 302通风柜
modbus:
  request_delay: 0.01
  round_interval: 0.05
  commands:
    - {{ serial: COM5, slave_adress: 1, function_code: 3, start_address: 2, quantity: 4 }}
transport:
  send_interval_ms: 1
  inbound: {inbound}
"#
    ))
    .unwrap()
}

/// Hood response: 状态=1, 开度=1, 报警=0, 高度=120, 阀门开度=45, 面风速=300, 排风速=600.
fn hood_response(device_id: u8) -> Vec<u8> {
    let mut payload = [0u8; 20];
    for (offset, raw) in [(0, 1u16), (6, 1), (10, 0), (12, 120), (14, 45), (16, 300), (18, 600)] {
        payload[offset..offset + 2].copy_from_slice(&raw.to_be_bytes());
    }
    let mut frame = vec![device_id, 0x03, payload.len() as u8];
    frame.extend_from_slice(&payload);
    let crc = ModbusCodec::compute_crc16(&frame);
    frame.extend_from_slice(&crc);
    frame
}

/// Read JSON values from the bridge side until `count` have arrived.
async fn read_values(
    socket: &mut TcpStream,
    splitter: &mut JsonStreamSplitter,
    count: usize,
) -> Vec<Value> {
    let mut values = Vec::new();
    let mut buffer = [0u8; 1024];
    while values.len() < count {
        let n = socket.read(&mut buffer).await.unwrap();
        assert!(n > 0, "gateway closed the connection");
        splitter.push(&buffer[..n]);
        while let Some(value) = splitter.next_value().unwrap() {
            values.push(value);
        }
    }
    values
}

async fn wait_for_update(store: &StateStore, name: &str) {
    timeout(Duration::from_secs(5), async {
        loop {
            let decoded = store
                .get(DeviceClass::VentilationHood, name)
                .and_then(|state| state.updated_at)
                .is_some();
            if decoded {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device state was never updated");
}

fn assert_hood_fields(store: &StateStore) {
    let state = store.get_by_channel_and_id("COM5", 1).unwrap();
    let fields = &state.fields;
    assert_eq!(fields.value("状态"), Some(FieldValue::Flag(true)));
    assert_eq!(fields.value("开度"), Some(FieldValue::Flag(true)));
    assert_eq!(fields.value("报警"), Some(FieldValue::Integer(0)));
    assert_eq!(fields.value("高度"), Some(FieldValue::Integer(120)));
    assert_eq!(fields.value("阀门开度"), Some(FieldValue::Integer(45)));
    assert_eq!(fields.value("面风速"), Some(FieldValue::Decimal(3.0)));
    assert_eq!(fields.value("排风速"), Some(FieldValue::Integer(600)));
}

#[tokio::test]
async fn test_poll_and_decode_over_json_bridge() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let gateway = Arc::new(Gateway::new(config(port, "{ mode: json }")).unwrap());
    let store = gateway.store();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.run_session(shutdown_rx).await })
    };

    let (mut socket, _) = listener.accept().await.unwrap();
    let mut splitter = JsonStreamSplitter::new();
    let values = read_values(&mut socket, &mut splitter, 2).await;

    // Channel announcement comes first
    assert_eq!(
        values[0],
        json!([{"name": "COM5", "description": "3F", "baudrate": 9600}])
    );

    // Then the read request
    let request = &values[1];
    assert_eq!(request["serial"], "COM5");
    assert_eq!(request["request"], "01 03 00 02 00 04 E5 C9");
    let time = request["time"].as_str().unwrap();
    assert!(chrono::NaiveDateTime::parse_from_str(time, WIRE_TIME_FORMAT).is_ok());

    // Seeded before any response
    let seeded = store.get(DeviceClass::VentilationHood, "301通风柜").unwrap();
    assert_eq!(seeded.fields.value("高度"), Some(FieldValue::Integer(0)));

    let reply = json!({
        "status": "success",
        "serial": "COM5",
        "request": request["request"],
        "response": format_hex(&hood_response(1)),
        "time": time,
    });
    socket.write_all(reply.to_string().as_bytes()).await.unwrap();

    wait_for_update(&store, "301通风柜").await;
    assert_hood_fields(&store);

    // The other hood was never answered
    let untouched = store.get(DeviceClass::VentilationHood, "302通风柜").unwrap();
    assert!(untouched.updated_at.is_none());

    let snapshot = serde_json::to_value(store.get_all()).unwrap();
    assert_eq!(snapshot["通风柜"]["301通风柜"]["面风速"]["value"], 3.0);
    assert_eq!(snapshot["通风柜"]["301通风柜"]["面风速"]["unit"], "m/s");

    shutdown_tx.send(true).unwrap();
    let report = timeout(Duration::from_secs(5), session)
        .await
        .expect("session did not stop on shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(report.applied, 1);
}

#[tokio::test]
async fn test_raw_frame_bridge_in_small_chunks() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let gateway = Arc::new(
        Gateway::new(config(port, "{ mode: raw_frames, channel: COM5 }")).unwrap(),
    );
    let store = gateway.store();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.run_session(shutdown_rx).await })
    };

    let (mut socket, _) = listener.accept().await.unwrap();
    let mut splitter = JsonStreamSplitter::new();
    read_values(&mut socket, &mut splitter, 2).await;

    // An unknown device first, then the hood, split mid-header and mid-body
    let mut stream = hood_response(9);
    stream.extend(hood_response(1));
    for chunk in stream.chunks(4) {
        socket.write_all(chunk).await.unwrap();
        socket.flush().await.unwrap();
        sleep(Duration::from_millis(2)).await;
    }

    wait_for_update(&store, "301通风柜").await;
    assert_hood_fields(&store);

    shutdown_tx.send(true).unwrap();
    let report = timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.dropped, 1);
}

#[tokio::test]
async fn test_session_ends_when_bridge_disconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let gateway = Arc::new(Gateway::new(config(port, "{ mode: json }")).unwrap());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.run_session(shutdown_rx).await })
    };

    let (mut socket, _) = listener.accept().await.unwrap();
    let mut splitter = JsonStreamSplitter::new();
    read_values(&mut socket, &mut splitter, 2).await;
    drop(socket);

    let report = timeout(Duration::from_secs(5), session)
        .await
        .expect("session kept running after the bridge left")
        .unwrap()
        .unwrap();
    assert_eq!(report.applied, 0);

    // Nobody reconnects on their own
    let accept = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(accept.is_err());
}

#[tokio::test]
async fn test_listen_only_session_ends_when_bridge_disconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = GatewayConfig::from_yaml_str(&format!(
        r#"
server: {{ host: 127.0.0.1, port: {port} }}
serial_ports:
  - {{ name: COM6, description: 2F, baudrate: 9600 }}
devices:
  COM6:
    "145": {{ name: 更衣室, class: clean_room }}
modbus:
  round_interval: 0.05
transport:
  send_interval_ms: 1
"#
    ))
    .unwrap();
    assert!(config.modbus.commands.is_empty());

    let gateway = Arc::new(Gateway::new(config).unwrap());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.run_session(shutdown_rx).await })
    };

    let (mut socket, _) = listener.accept().await.unwrap();
    let mut splitter = JsonStreamSplitter::new();
    let values = read_values(&mut socket, &mut splitter, 1).await;
    assert_eq!(values[0][0]["name"], "COM6");
    drop(socket);

    let report = timeout(Duration::from_secs(5), session)
        .await
        .expect("session kept running after the bridge left")
        .unwrap()
        .unwrap();
    assert_eq!(report, IngestReport::default());
}

#[tokio::test]
async fn test_unreachable_bridge_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let gateway = Gateway::new(config(port, "{ mode: json }")).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let err = gateway.run_session(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, GatewayError::Connect { .. }));
}
