//! 系统层集成测试的公共装置

#![allow(dead_code)]

use panther_can::mock::{MockCanBus, RoboteqMock};
use panther_driver::{CanOpenController, CanOpenControllerBuilder};
use panther_system::{
    DriveSystem, EStopStrategyKind, GpioController, MotorsController, SystemConfig, Unit,
    VirtualGpio,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const FRONT: u8 = 1;
pub const REAR: u8 = 2;

/// 放宽超时的配置（mock 从站 PDO 周期 10 ms）
pub fn test_config(strategy: EStopStrategyKind) -> SystemConfig {
    let mut config = SystemConfig::default();
    config.canopen.sdo_operation_timeout_ms = 50;
    config.canopen.boot_timeout_ms = 500;
    config.canopen.pdo_feedback_timeout_ms = 100;
    config.canopen.activate_settle_ms = 1;
    config.attempts.safety_stop = 3;
    config.e_stop.strategy = strategy;
    config
}

pub fn build_controller(bus: &MockCanBus, config: &SystemConfig) -> CanOpenController {
    let bus = bus.clone();
    CanOpenControllerBuilder::new()
        .settings(config.canopen.to_settings())
        .with_adapter_factory(move || Ok(bus.connect()))
        .build()
        .unwrap()
}

pub struct Fixture {
    pub bus: MockCanBus,
    pub mock: RoboteqMock,
    pub gpio: Arc<VirtualGpio>,
    pub system: DriveSystem,
}

/// 初始化并激活的驱动系统（急停仍处于触发状态）
pub fn start_system(config: SystemConfig) -> Fixture {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let gpio = Arc::new(VirtualGpio::new());
    gpio.set_reset_duration(Duration::from_millis(5));
    let controller = build_controller(&bus, &config);
    let system = DriveSystem::new(config, controller, gpio.clone() as Arc<dyn GpioController>);
    system.initialize().unwrap();
    system.activate().unwrap();
    Fixture {
        bus,
        mock,
        gpio,
        system,
    }
}

/// 已初始化的电机控制器
pub fn start_motors(config: &SystemConfig) -> (MockCanBus, RoboteqMock, MotorsController) {
    let bus = MockCanBus::new();
    let mock = RoboteqMock::start(&bus, &[FRONT, REAR]).unwrap();
    let motors = MotorsController::new(
        build_controller(&bus, config),
        config.drivetrain.to_settings(),
        config.canopen.activate_settle(),
    );
    motors.initialize().unwrap();
    (bus, mock, motors)
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// 等待两个单元都收到新鲜反馈，然后复位急停并跑一个成功周期
///
/// 收到第一帧 TPDO1 之前的周期按反馈过期处理，会置位 ReadPdo 过滤器；
/// 复位加一次成功读取把它清掉。
pub fn release_with_fresh_feedback(system: &DriveSystem) {
    assert!(wait_until(Duration::from_millis(500), || {
        system.read().is_ok()
            && Unit::ALL
                .iter()
                .all(|unit| !system.unit_state(*unit).is_feedback_stale())
    }));
    system.reset_e_stop().unwrap();
    system.read().unwrap();
    assert!(!system.error_filter().is_error());
    assert!(!system.e_stop().is_triggered());
}
