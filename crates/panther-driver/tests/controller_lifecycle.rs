//! CANopen 控制器生命周期集成测试
//!
//! 使用 mock 总线和模拟 Roboteq 从站验证初始化、身份校验、boot 失败与反初始化。

use panther_can::mock::{BootBehavior, MockCanBus, RoboteqMock};
use panther_driver::{BootState, CanOpenController, CanOpenControllerBuilder, CanOpenSettings, DriverError};
use panther_protocol::{Channel, DEVICE_TYPE, NmtState, RESET_SCRIPT, VENDOR_ID};
use serial_test::serial;
use std::time::Duration;

const FRONT: u8 = 1;
const REAR: u8 = 2;

fn test_settings() -> CanOpenSettings {
    CanOpenSettings {
        sdo_operation_timeout: Duration::from_millis(50),
        boot_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn build_controller(bus: &MockCanBus, settings: CanOpenSettings) -> CanOpenController {
    let bus = bus.clone();
    CanOpenControllerBuilder::new()
        .settings(settings)
        .with_adapter_factory(move || Ok(bus.connect()))
        .build()
        .unwrap()
}

#[test]
#[serial]
fn test_initialize_deinitialize_initialize() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let controller = build_controller(&bus, test_settings());

    for _ in 0..2 {
        controller.initialize().unwrap();
        assert!(controller.is_initialized());
        let front = controller.front_driver().unwrap();
        let rear = controller.rear_driver().unwrap();
        assert_eq!(front.node_id(), FRONT);
        assert_eq!(rear.node_id(), REAR);
        assert_eq!(front.boot_state(), BootState::Booted);
        assert_eq!(mock.nmt_state(FRONT), Some(NmtState::Operational));
        assert_eq!(mock.nmt_state(REAR), Some(NmtState::Operational));

        controller.deinitialize();
        assert!(!controller.is_initialized());
        assert!(matches!(
            controller.front_driver(),
            Err(DriverError::NotInitialized)
        ));
        // 关闭时从站收到 NMT Stop
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(mock.nmt_state(FRONT), Some(NmtState::Stopped));
    }
}

#[test]
#[serial]
fn test_lifecycle_repeats_without_failures() {
    let bus = MockCanBus::new();
    let _mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let controller = build_controller(&bus, test_settings());

    // boot 握手不依赖 IO 线程的调度时机
    for cycle in 0..25 {
        if let Err(err) = controller.initialize() {
            panic!("initialize failed on cycle {}: {}", cycle, err);
        }
        controller.deinitialize();
    }
}

#[test]
#[serial]
fn test_initialize_is_idempotent() {
    let bus = MockCanBus::new();
    let _mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let controller = build_controller(&bus, test_settings());

    controller.initialize().unwrap();
    let first = controller.front_driver().unwrap();
    controller.initialize().unwrap();
    let second = controller.front_driver().unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}

#[test]
#[serial]
fn test_device_type_mismatch() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let controller = build_controller(&bus, test_settings());

    mock.set_device_type(REAR, 100_000);
    match controller.initialize() {
        Err(DriverError::IdentityMismatch {
            node_id,
            address,
            expected,
            actual,
        }) => {
            assert_eq!(node_id, REAR);
            assert_eq!(address, DEVICE_TYPE);
            assert_eq!(expected, 0);
            assert_eq!(actual, 100_000);
        },
        other => panic!("Expected IdentityMismatch, got {:?}", other),
    }
    assert!(!controller.is_initialized());

    mock.set_device_type(REAR, 0);
    controller.initialize().unwrap();
    assert!(controller.is_initialized());
}

#[test]
#[serial]
fn test_vendor_id_mismatch() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let controller = build_controller(&bus, test_settings());

    mock.set_vendor_id(FRONT, 100_000);
    assert!(matches!(
        controller.initialize(),
        Err(DriverError::IdentityMismatch { node_id: FRONT, address, .. }) if address == VENDOR_ID
    ));

    mock.set_vendor_id(FRONT, 0);
    controller.initialize().unwrap();
}

#[test]
#[serial]
fn test_expected_identity_is_configurable() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    for node in [FRONT, REAR] {
        mock.set_device_type(node, 0x0001_0192);
        mock.set_vendor_id(node, 0x0000_02E5);
    }
    let settings = CanOpenSettings {
        expected_device_type: 0x0001_0192,
        expected_vendor_id: 0x0000_02E5,
        ..test_settings()
    };
    let controller = build_controller(&bus, settings);
    controller.initialize().unwrap();
}

#[test]
#[serial]
fn test_identity_read_timeout() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let settings = CanOpenSettings {
        sdo_operation_timeout: Duration::from_millis(4),
        ..test_settings()
    };
    let controller = build_controller(&bus, settings);

    mock.set_response_delay(FRONT, DEVICE_TYPE, Duration::from_millis(100));
    assert!(matches!(
        controller.initialize(),
        Err(DriverError::OperationTimeout { node_id: FRONT, address }) if address == DEVICE_TYPE
    ));

    mock.clear_response_delays(FRONT);
    controller.initialize().unwrap();
}

#[test]
#[serial]
fn test_boot_failure_on_emergency() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    mock.set_boot_behavior(FRONT, BootBehavior::Emergency(0x5000));
    let controller = build_controller(&bus, test_settings());

    match controller.initialize() {
        Err(DriverError::BootFailure { node_id, reason }) => {
            assert_eq!(node_id, FRONT);
            assert!(reason.contains("0x5000"), "reason: {}", reason);
        },
        other => panic!("Expected BootFailure, got {:?}", other),
    }

    // 部分初始化后反初始化是安全的
    controller.deinitialize();
    mock.set_boot_behavior(FRONT, BootBehavior::Normal);
    controller.initialize().unwrap();
}

#[test]
#[serial]
fn test_boot_failure_on_silence() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    mock.set_boot_behavior(REAR, BootBehavior::Silent);
    let settings = CanOpenSettings {
        boot_timeout: Duration::from_millis(100),
        ..test_settings()
    };
    let controller = build_controller(&bus, settings);

    assert!(matches!(
        controller.initialize(),
        Err(DriverError::BootFailure { node_id: REAR, .. })
    ));
}

#[test]
#[serial]
fn test_deinitialize_without_initialize() {
    let bus = MockCanBus::new();
    let controller = build_controller(&bus, test_settings());
    controller.deinitialize();
    controller.deinitialize();
    assert!(!controller.is_initialized());
}

#[test]
#[serial]
fn test_activate_resets_scripts_and_zeroes_commands() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let controller = build_controller(&bus, test_settings());

    assert!(matches!(
        controller.activate(Duration::from_millis(1)),
        Err(DriverError::NotInitialized)
    ));

    controller.initialize().unwrap();
    controller.activate(Duration::from_millis(1)).unwrap();
    for node in [FRONT, REAR] {
        assert_eq!(mock.write_count(node, RESET_SCRIPT), 1);
        assert_eq!(mock.value::<u8>(node, RESET_SCRIPT), Some(2));
        assert_eq!(mock.command(node, Channel::One), Some(0));
        assert_eq!(mock.command(node, Channel::Two), Some(0));
    }
}
