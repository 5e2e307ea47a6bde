//! 模拟 Roboteq 从站的总线级测试
//!
//! 直接在 mock 总线上收发原始帧，验证从站模拟的 NMT / SDO / PDO 行为。

use panther_can::mock::{BootBehavior, MockCanAdapter, MockCanBus, RoboteqMock};
use panther_can::{CanAdapter, CanError, CanFrame};
use panther_protocol::{
    COMMAND_CHANNEL_2, Channel, CobKind, DEVICE_TYPE, Emergency, FeedbackPdo, NmtCommand,
    NmtState, SDO_ABORT_OBJECT_NOT_EXIST, SdoRequest, SdoResponse, TEMPERATURE, ObjectAddress,
    classify, nmt_frame, parse_heartbeat,
};
use std::time::{Duration, Instant};

/// 等待满足条件的帧
fn wait_for(
    adapter: &mut MockCanAdapter,
    timeout: Duration,
    mut predicate: impl FnMut(&CanFrame) -> bool,
) -> Option<CanFrame> {
    let deadline = Instant::now() + timeout;
    adapter.set_receive_timeout(Duration::from_millis(5));
    while Instant::now() < deadline {
        match adapter.receive() {
            Ok(frame) if predicate(&frame) => return Some(frame),
            Ok(_) | Err(CanError::Timeout) => continue,
            Err(e) => panic!("Unexpected bus error: {}", e),
        }
    }
    None
}

fn sdo_response(adapter: &mut MockCanAdapter, node_id: u8) -> Option<SdoResponse> {
    wait_for(adapter, Duration::from_millis(500), |f| {
        classify(f.id) == CobKind::SdoResponse { node_id }
    })
    .map(|frame| SdoResponse::parse(&frame).unwrap())
}

#[test]
fn test_reset_communication_answers_boot_up() {
    let bus = MockCanBus::new();
    let _mock = RoboteqMock::start(&bus, &[1, 2]).unwrap();
    let mut master = bus.connect();

    master
        .send(nmt_frame(NmtCommand::ResetCommunication, 2))
        .unwrap();
    let frame = wait_for(&mut master, Duration::from_millis(500), |f| {
        classify(f.id) == CobKind::Heartbeat { node_id: 2 }
    })
    .expect("boot-up from node 2");
    assert_eq!(parse_heartbeat(&frame).unwrap(), NmtState::BootUp);
}

#[test]
fn test_boot_emergency_behavior() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[1]).unwrap();
    mock.set_boot_behavior(1, BootBehavior::Emergency(0x5000));
    let mut master = bus.connect();

    master
        .send(nmt_frame(NmtCommand::ResetCommunication, 1))
        .unwrap();
    let frame = wait_for(&mut master, Duration::from_millis(500), |f| {
        classify(f.id) == CobKind::Emergency { node_id: 1 }
    })
    .expect("EMCY from node 1");
    let emcy = Emergency::try_from(frame).unwrap();
    assert_eq!(emcy.error_code, 0x5000);
}

#[test]
fn test_sdo_read_write() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[1]).unwrap();
    mock.set_temperature(1, 37);
    let mut master = bus.connect();

    master
        .send(SdoRequest::upload(TEMPERATURE).to_frame(1))
        .unwrap();
    let response = sdo_response(&mut master, 1).expect("upload response");
    assert_eq!(response.value::<i8>().unwrap(), 37);

    master
        .send(SdoRequest::download(COMMAND_CHANNEL_2, -250i32).to_frame(1))
        .unwrap();
    let response = sdo_response(&mut master, 1).expect("download ack");
    assert_eq!(
        response,
        SdoResponse::DownloadAck {
            address: COMMAND_CHANNEL_2
        }
    );
    assert_eq!(mock.command(1, Channel::Two), Some(-250));
    assert_eq!(mock.write_count(1, COMMAND_CHANNEL_2), 1);
}

#[test]
fn test_sdo_unknown_object_aborts() {
    let bus = MockCanBus::new();
    let _mock = RoboteqMock::start(&bus, &[1]).unwrap();
    let mut master = bus.connect();

    let address = ObjectAddress::new(0x3000, 1);
    master.send(SdoRequest::upload(address).to_frame(1)).unwrap();
    assert_eq!(
        sdo_response(&mut master, 1),
        Some(SdoResponse::Abort {
            address,
            code: SDO_ABORT_OBJECT_NOT_EXIST
        })
    );
}

#[test]
fn test_response_delay() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[1]).unwrap();
    mock.set_response_delay(1, DEVICE_TYPE, Duration::from_millis(50));
    let mut master = bus.connect();

    let start = Instant::now();
    master
        .send(SdoRequest::upload(DEVICE_TYPE).to_frame(1))
        .unwrap();
    assert!(sdo_response(&mut master, 1).is_some());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_pdo_only_when_operational() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[1]).unwrap();
    mock.set_position(1, Channel::One, 1600);
    mock.set_position(1, Channel::Two, -3200);
    let mut master = bus.connect();

    // PreOperational：没有 PDO
    let is_tpdo = |f: &CanFrame| matches!(classify(f.id), CobKind::Tpdo { .. });
    assert!(wait_for(&mut master, Duration::from_millis(50), is_tpdo).is_none());

    master.send(nmt_frame(NmtCommand::Start, 0)).unwrap();
    let frame = wait_for(&mut master, Duration::from_millis(500), |f| f.id == 0x181)
        .expect("TPDO1 from node 1");
    assert_eq!(
        FeedbackPdo::try_from(frame).unwrap(),
        FeedbackPdo::Position([1600, -3200])
    );
    assert_eq!(mock.nmt_state(1), Some(NmtState::Operational));

    master.send(nmt_frame(NmtCommand::Stop, 1)).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(mock.nmt_state(1), Some(NmtState::Stopped));
}
