//! 驱动系统控制周期集成测试

mod common;

use common::{
    FRONT, REAR, build_controller, release_with_fresh_feedback, start_system, test_config,
    wait_until,
};
use panther_can::mock::{BootBehavior, MockCanBus, RoboteqMock};
use panther_system::{
    DriveSystem, EStopStrategyKind, ErrorFilterId, GpioController, SystemError, Unit, VirtualGpio,
    WheelVelocities,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

#[test]
#[serial]
fn test_initialize_exhausts_attempts() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[1, 2]).unwrap();
    mock.set_boot_behavior(REAR, BootBehavior::Silent);

    let mut config = test_config(EStopStrategyKind::Software);
    config.canopen.boot_timeout_ms = 50;
    config.attempts.initialization = 2;
    let controller = build_controller(&bus, &config);
    let system = DriveSystem::new(
        config,
        controller,
        Arc::new(VirtualGpio::new()) as Arc<dyn GpioController>,
    );

    match system.initialize() {
        Err(SystemError::AttemptsExhausted {
            operation,
            attempts,
            last_error,
        }) => {
            assert_eq!(operation, "Initialization");
            assert_eq!(attempts, 2);
            assert!(last_error.contains("Boot"), "last error: {}", last_error);
        },
        other => panic!("Expected AttemptsExhausted, got {:?}", other),
    }
    assert!(!system.motors().is_initialized());

    mock.set_boot_behavior(REAR, BootBehavior::Normal);
    system.initialize().unwrap();
    assert!(system.motors().is_initialized());
    system.shutdown();
    assert!(!system.motors().is_initialized());
}

#[test]
#[serial]
fn test_read_requires_initialization() {
    let bus = MockCanBus::new();
    let config = test_config(EStopStrategyKind::Software);
    let controller = build_controller(&bus, &config);
    let system = DriveSystem::new(
        config,
        controller,
        Arc::new(VirtualGpio::new()) as Arc<dyn GpioController>,
    );
    assert!(matches!(system.read(), Err(SystemError::Controller(_))));
    assert!(matches!(
        system.write(WheelVelocities::ZERO),
        Err(SystemError::Controller(_))
    ));
}

#[test]
#[serial]
fn test_cycle_runs_and_commands_flow() {
    let fixture = start_system(test_config(EStopStrategyKind::Software));
    let system = &fixture.system;
    release_with_fresh_feedback(system);

    for _ in 0..10 {
        system.read().unwrap();
        system
            .write(WheelVelocities::new(0.5, 0.5, 0.5, 0.5))
            .unwrap();
    }
    assert!(!system.e_stop().is_triggered());
    assert!(!system.error_filter().is_error());
    assert!(fixture.mock.command(1, panther_protocol::Channel::One).unwrap() > 0);
}

#[test]
#[serial]
fn test_stale_feedback_triggers_e_stop() {
    let fixture = start_system(test_config(EStopStrategyKind::Hardware));
    let system = &fixture.system;
    release_with_fresh_feedback(system);

    fixture.mock.set_pdo_enabled(REAR, false);
    let tripped = wait_until(Duration::from_millis(1000), || {
        system.read().unwrap();
        system.e_stop().is_triggered()
    });
    assert!(tripped);
    assert!(
        system
            .error_filter()
            .is_filter_error(Unit::Rear, ErrorFilterId::ReadPdo)
    );
    assert!(system.unit_state(Unit::Rear).is_feedback_stale());

    // 反馈恢复后，复位加一次成功周期清除过滤器
    fixture.mock.set_pdo_enabled(REAR, true);
    assert!(wait_until(Duration::from_millis(500), || {
        system.read().is_ok() && !system.unit_state(Unit::Rear).is_feedback_stale()
    }));
    assert!(system.error_filter().is_error());

    system.reset_e_stop().unwrap();
    system.read().unwrap();
    assert!(!system.error_filter().is_error());
    assert!(!system.e_stop().is_triggered());
}

#[test]
#[serial]
fn test_cycle_before_first_feedback_counts_as_stale() {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    mock.set_pdo_enabled(REAR, false);
    let config = test_config(EStopStrategyKind::Hardware);
    let controller = build_controller(&bus, &config);
    let gpio = Arc::new(VirtualGpio::new());
    gpio.set_reset_duration(Duration::from_millis(5));
    let system = DriveSystem::new(config, controller, gpio as Arc<dyn GpioController>);
    system.initialize().unwrap();
    system.activate().unwrap();

    // 从未收到 TPDO1 的单元没有时间戳
    system.read().unwrap();
    assert!(system.unit_state(Unit::Rear).is_feedback_stale());
    assert!(
        system
            .error_filter()
            .is_filter_error(Unit::Rear, ErrorFilterId::ReadPdo)
    );
    assert!(system.e_stop().is_triggered());

    // 过滤器粘滞：反馈到达后仍需复位
    mock.set_pdo_enabled(REAR, true);
    release_with_fresh_feedback(&system);
    system.shutdown();
}

#[test]
#[serial]
fn test_write_failures_are_debounced() {
    let fixture = start_system(test_config(EStopStrategyKind::Hardware));
    let system = &fixture.system;
    system.write(WheelVelocities::ZERO).unwrap();

    fixture.bus.set_send_failure(true);
    system.write(WheelVelocities::ZERO).unwrap();
    assert!(
        !system
            .error_filter()
            .is_filter_error(Unit::Front, ErrorFilterId::WriteSdo)
    );

    system.write(WheelVelocities::ZERO).unwrap();
    assert!(
        system
            .error_filter()
            .is_filter_error(Unit::Front, ErrorFilterId::WriteSdo)
    );

    // 恢复后单次成功不清除粘滞故障
    fixture.bus.set_send_failure(false);
    assert!(wait_until(Duration::from_millis(500), || {
        system.motors().write_speed(0.0, 0.0, 0.0, 0.0).is_ok()
    }));
    system.write(WheelVelocities::ZERO).unwrap();
    assert!(
        system
            .error_filter()
            .is_filter_error(Unit::Front, ErrorFilterId::WriteSdo)
    );

    system.error_filter().set_clear_errors();
    system.write(WheelVelocities::ZERO).unwrap();
    assert!(
        !system
            .error_filter()
            .is_filter_error(Unit::Front, ErrorFilterId::WriteSdo)
    );
}
