//! Integration tests for the Modbus RTU bridge
//!
//! Every test runs a complete bridge on a loopback port against the simulated
//! RS-485 bus and talks to it through real TCP sockets.

use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use modbus_rtu_bridge::protocol::encode_rtu_frame;
use modbus_rtu_bridge::simulator::BusEventKind;
use modbus_rtu_bridge::*;

const SCENARIO_A: [u8; 12] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];

async fn start_bridge<F>(bus: SimulatedBus, tweak: F) -> ModbusBridge
where
    F: FnOnce(&mut BridgeConfig),
{
    utils::logging::init_test_logger();
    let mut config = BridgeConfig::default();
    config.server.bind_addresses = vec!["127.0.0.1:0".parse().unwrap()];
    config.serial.port = "simulator".to_string();
    tweak(&mut config);

    let mut bridge = ModbusBridge::new(config).unwrap();
    bridge.start_with_line(bus).await.unwrap();
    bridge
}

async fn connect(bridge: &ModbusBridge) -> TcpStream {
    TcpStream::connect(bridge.local_addrs()[0]).await.unwrap()
}

fn request(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        transaction_id,
        protocol_id: 0,
        length: (pdu.len() + 1) as u16,
        unit_id,
    };
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(pdu);
    frame
}

/// Read one complete Modbus-TCP frame
async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut frame = vec![0u8; 6];
    stream.read_exact(&mut frame).await.unwrap();
    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    frame.resize(6 + length, 0);
    stream.read_exact(&mut frame[6..]).await.unwrap();
    frame
}

async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Read holding registers: request in, three register values out
#[tokio::test]
async fn test_scenario_a_request_reaches_bus_with_direction_timing() {
    let bus = SimulatedBus::new(|request| {
        SimReply::Respond(encode_rtu_frame(request[0], &[0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]))
    });
    let mut bridge = start_bridge(bus.clone(), |config| config.serial.tx_delay_us = 500).await;

    let mut client = connect(&bridge).await;
    client.write_all(&SCENARIO_A).await.unwrap();
    let response = timeout(Duration::from_secs(2), read_frame(&mut client)).await.unwrap();

    assert_eq!(
        response,
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]
    );
    assert_eq!(bus.written(), vec![vec![0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]]);

    let events = bus.events();
    let at = |wanted: fn(&BusEventKind) -> bool| {
        events.iter().find(|event| wanted(&event.kind)).map(|event| event.at).unwrap()
    };
    let direction_on = at(|kind| matches!(kind, BusEventKind::DirectionOn));
    let first_write = at(|kind| matches!(kind, BusEventKind::Write(_)));
    let drained = at(|kind| matches!(kind, BusEventKind::Drained));
    let direction_off = at(|kind| matches!(kind, BusEventKind::DirectionOff));

    assert!(first_write.duration_since(direction_on) >= Duration::from_micros(500));
    assert!(direction_off.duration_since(drained) >= LineConfig::default().char_duration());
    assert!(!bus.is_transmitting());

    let stats = bridge.stats();
    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.responses_delivered, 1);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_scenario_b_bad_crc_is_not_delivered() {
    let bus = SimulatedBus::new(|request| {
        let mut reply = encode_rtu_frame(request[0], &[0x03, 0x02, 0x00, 0x2A]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        SimReply::Respond(reply)
    });
    let mut bridge = start_bridge(bus.clone(), |config| config.rtu.response_timeout_ms = 300).await;

    let mut client = connect(&bridge).await;
    client.write_all(&SCENARIO_A).await.unwrap();

    let mut byte = [0u8; 1];
    assert!(timeout(Duration::from_millis(500), client.read(&mut byte)).await.is_err());
    assert_eq!(bridge.stats().crc_mismatches, 1);

    // the bus is idle again and serves the next request
    bus.set_responder(|request| SimReply::Respond(request.to_vec()));
    let started = Instant::now();
    client.write_all(&request(2, 0x11, &[0x03, 0x00, 0x6B, 0x00, 0x03])).await.unwrap();
    let response = timeout(Duration::from_secs(1), read_frame(&mut client)).await.unwrap();
    assert_eq!(&response[..2], &[0x00, 0x02]);
    assert!(started.elapsed() < Duration::from_millis(300));

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_scenario_c_frame_pending_eviction_keeps_queue_intact() {
    let bus = SimulatedBus::new(|_| SimReply::Silent);
    let mut bridge = start_bridge(bus.clone(), |config| {
        config.rtu.response_timeout_ms = 1500;
        config.rtu.queue_capacity = TransactionQueue::entry_len(MAX_PDU_SIZE);
        config.server.frame_pending_timeout_ms = 200;
    })
    .await;

    // first big request occupies the bus, the second fills the queue
    let big_pdu: Vec<u8> = (0..MAX_PDU_SIZE).map(|i| i as u8).collect();
    let mut filler = connect(&bridge).await;
    filler.write_all(&request(1, 0x01, &big_pdu)).await.unwrap();
    filler.write_all(&request(2, 0x02, &big_pdu)).await.unwrap();
    assert!(wait_until(|| bus.written().len() == 1 && bridge.queued_bytes() > 0, Duration::from_secs(1)).await);

    let mut dribbler = connect(&bridge).await;
    for byte in request(3, 0x03, &[0x03, 0x00, 0x00, 0x00, 0x01]) {
        dribbler.write_all(&[byte]).await.unwrap();
        sleep(Duration::from_millis(10)).await;
    }

    let mut buf = [0u8; 8];
    let evicted = timeout(Duration::from_secs(1), dribbler.read(&mut buf)).await.unwrap();
    assert!(matches!(evicted, Ok(0) | Err(_)));
    assert_eq!(bridge.stats().connections_evicted, 1);
    assert_eq!(bridge.queued_transactions(), 1);
    assert_eq!(bridge.queued_bytes(), TransactionQueue::entry_len(MAX_PDU_SIZE));

    // the queued entry survives whole and goes out once the bus frees up
    assert!(wait_until(|| bus.written().len() == 2, Duration::from_secs(3)).await);
    assert_eq!(bus.written()[1], encode_rtu_frame(0x02, &big_pdu));
    assert!(bus.written().iter().all(|frame| frame[0] != 0x03));

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_single_flight_with_concurrent_clients() {
    let bus = SimulatedBus::new(|request| SimReply::Delayed(request.to_vec(), Duration::from_millis(20)));
    let mut bridge = start_bridge(bus.clone(), |_| {}).await;

    let mut tasks = Vec::new();
    for n in 0..4u8 {
        let address = bridge.local_addrs()[0];
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(address).await.unwrap();
            let pdu = [0x03, 0x00, n, 0x00, 0x01];
            client.write_all(&request(100 + n as u16, n + 1, &pdu)).await.unwrap();
            let response = timeout(Duration::from_secs(3), read_frame(&mut client)).await.unwrap();
            (n, response)
        }));
    }

    for task in tasks {
        let (n, response) = task.await.unwrap();
        assert_eq!(response, request(100 + n as u16, n + 1, &[0x03, 0x00, n, 0x00, 0x01]));
    }

    // direction changes strictly alternate: one frame on the wire at a time
    let toggles: Vec<bool> = bus
        .events()
        .iter()
        .filter_map(|event| match event.kind {
            BusEventKind::DirectionOn => Some(true),
            BusEventKind::DirectionOff => Some(false),
            _ => None,
        })
        .collect();
    assert_eq!(toggles.len(), 8);
    assert!(toggles.chunks(2).all(|pair| pair == [true, false]));
    assert_eq!(bus.written().len(), 4);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_cap_rejects_extra_clients() {
    let mut bridge = start_bridge(SimulatedBus::echo(), |config| config.server.max_connections = 2).await;

    let mut first = connect(&bridge).await;
    let _second = connect(&bridge).await;
    assert!(wait_until(|| bridge.clients().len() == 2, Duration::from_secs(1)).await);

    let mut third = connect(&bridge).await;
    let mut buf = [0u8; 4];
    let closed = timeout(Duration::from_secs(1), third.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));
    assert_eq!(bridge.stats().connections_rejected, 1);

    // admitted clients are unaffected
    first.write_all(&SCENARIO_A).await.unwrap();
    let response = timeout(Duration::from_secs(1), read_frame(&mut first)).await.unwrap();
    assert_eq!(&response[..2], &[0x00, 0x01]);

    let slots: Vec<u32> = bridge.clients().iter().map(|client| client.slot).collect();
    assert_eq!(slots, vec![0, 1]);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_is_sent_but_not_answered() {
    let bus = SimulatedBus::echo();
    let mut bridge = start_bridge(bus.clone(), |config| config.rtu.response_timeout_ms = 1000).await;

    let mut client = connect(&bridge).await;
    let started = Instant::now();
    client.write_all(&request(7, 0x00, &[0x06, 0x00, 0x01, 0x00, 0x03])).await.unwrap();
    client.write_all(&request(8, 0x01, &[0x06, 0x00, 0x01, 0x00, 0x03])).await.unwrap();

    let response = timeout(Duration::from_secs(2), read_frame(&mut client)).await.unwrap();
    assert_eq!(&response[..2], &[0x00, 0x08]);
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(bus.written()[0], encode_rtu_frame(0x00, &[0x06, 0x00, 0x01, 0x00, 0x03]));
    assert_eq!(bridge.stats().broadcasts, 1);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_gateway_exception_when_enabled() {
    let mut bridge = start_bridge(SimulatedBus::new(|_| SimReply::Silent), |config| {
        config.rtu.response_timeout_ms = 100;
        config.rtu.exception_on_failure = true;
    })
    .await;

    let mut client = connect(&bridge).await;
    client.write_all(&SCENARIO_A).await.unwrap();
    let response = timeout(Duration::from_secs(1), read_frame(&mut client)).await.unwrap();
    assert_eq!(response, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x11, 0x83, 0x0B]);
    assert_eq!(bridge.stats().rtu_timeouts, 1);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_live_reconfiguration_applies_before_next_transaction() {
    let bus = SimulatedBus::echo();
    let mut bridge = start_bridge(bus.clone(), |_| {}).await;

    let provider = bridge.config_provider();
    provider.set_from_raw("uart_baud", "9600").await.unwrap();
    provider.set_from_raw("uart_parity", "2").await.unwrap();
    assert!(provider.set_from_raw("uart_baud", "600").await.is_err());

    let mut client = connect(&bridge).await;
    client.write_all(&SCENARIO_A).await.unwrap();
    timeout(Duration::from_secs(2), read_frame(&mut client)).await.unwrap();

    let line = bus.line().unwrap();
    assert_eq!(line.baud_rate, 9600);
    assert_eq!(line.parity, Parity::Even);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_drops_only_that_client() {
    let mut bridge = start_bridge(SimulatedBus::echo(), |_| {}).await;

    let mut bad = connect(&bridge).await;
    let mut good = connect(&bridge).await;
    bad.write_all(&[0x00, 0x01, 0x00, 0x05, 0x00, 0x06, 0x11]).await.unwrap();

    let mut buf = [0u8; 4];
    let closed = timeout(Duration::from_secs(1), bad.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));
    assert_eq!(bridge.stats().malformed_frames, 1);

    good.write_all(&SCENARIO_A).await.unwrap();
    let response = timeout(Duration::from_secs(1), read_frame(&mut good)).await.unwrap();
    assert_eq!(&response[6..], &SCENARIO_A[6..]);
    bridge.stop().await.unwrap();
}
