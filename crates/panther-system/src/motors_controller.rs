//! 电机控制器
//!
//! 组合 CANopen 控制器、两个单元状态和速度指令换算，提供控制周期和急停使用的操作。

use crate::converters::{DrivetrainSettings, UnitState, VelocityCommandConverter};
use crate::error::{SystemError, Unit};
use arc_swap::ArcSwap;
use panther_driver::{CanOpenController, DriverPair, RoboteqDriver};
use panther_protocol::Channel;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// 四个车轮的角速度（rad/s）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelVelocities {
    pub front_left: f64,
    pub front_right: f64,
    pub rear_left: f64,
    pub rear_right: f64,
}

impl WheelVelocities {
    pub const ZERO: WheelVelocities = WheelVelocities {
        front_left: 0.0,
        front_right: 0.0,
        rear_left: 0.0,
        rear_right: 0.0,
    };

    pub fn new(front_left: f64, front_right: f64, rear_left: f64, rear_right: f64) -> Self {
        Self {
            front_left,
            front_right,
            rear_left,
            rear_right,
        }
    }

    pub fn is_near_zero(&self) -> bool {
        [self.front_left, self.front_right, self.rear_left, self.rear_right]
            .iter()
            .all(|v| v.abs() < f64::EPSILON)
    }
}

/// 一次辅助状态轮询的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStateUpdate {
    /// 本次读取的单元
    pub unit: Unit,
    /// 是否完成了一整轮（8 步）
    pub cycle_complete: bool,
}

/// 辅助状态轮询步数：每个单元温度、电压、两路电池电流
const DRIVER_STATE_STEPS: usize = 8;

/// 电机控制器
pub struct MotorsController {
    canopen: CanOpenController,
    converter: VelocityCommandConverter,
    pdo_feedback_timeout: Duration,
    activate_settle: Duration,
    front_state: ArcSwap<UnitState>,
    rear_state: ArcSwap<UnitState>,
    driver_state_step: Mutex<usize>,
}

impl MotorsController {
    /// # 参数
    ///
    /// - `canopen`: 尚未初始化的 CANopen 控制器
    /// - `drivetrain`: 传动参数
    /// - `activate_settle`: 激活时每一步之后的等待时间
    pub fn new(
        canopen: CanOpenController,
        drivetrain: DrivetrainSettings,
        activate_settle: Duration,
    ) -> Self {
        let pdo_feedback_timeout = canopen.settings().pdo_feedback_timeout;
        Self {
            canopen,
            converter: VelocityCommandConverter::new(&drivetrain),
            pdo_feedback_timeout,
            activate_settle,
            front_state: ArcSwap::from_pointee(UnitState::new(&drivetrain)),
            rear_state: ArcSwap::from_pointee(UnitState::new(&drivetrain)),
            driver_state_step: Mutex::new(0),
        }
    }

    pub fn canopen(&self) -> &CanOpenController {
        &self.canopen
    }

    pub fn initialize(&self) -> Result<(), SystemError> {
        self.canopen.initialize()?;
        *self.driver_state_step.lock() = 0;
        Ok(())
    }

    pub fn deinitialize(&self) {
        self.canopen.deinitialize();
    }

    pub fn is_initialized(&self) -> bool {
        self.canopen.is_initialized()
    }

    /// 复位脚本并下发零指令
    pub fn activate(&self) -> Result<(), SystemError> {
        self.canopen.activate(self.activate_settle)?;
        info!("Motors controller activated");
        Ok(())
    }

    fn drivers(&self) -> Result<Arc<DriverPair>, SystemError> {
        Ok(self.canopen.drivers()?)
    }

    fn unit_driver(drivers: &DriverPair, unit: Unit) -> &RoboteqDriver {
        match unit {
            Unit::Front => drivers.front.as_ref(),
            Unit::Rear => drivers.rear.as_ref(),
        }
    }

    fn state_slot(&self, unit: Unit) -> &ArcSwap<UnitState> {
        match unit {
            Unit::Front => &self.front_state,
            Unit::Rear => &self.rear_state,
        }
    }

    fn check_bus_errors(drivers: &DriverPair) -> Result<(), SystemError> {
        for unit in Unit::ALL {
            if Self::unit_driver(drivers, unit).is_bus_error() {
                return Err(SystemError::CommunicationError { unit });
            }
        }
        Ok(())
    }

    // ============================================================
    // 周期反馈
    // ============================================================

    /// 拉取两个单元的反馈，计算过期并更新单元状态
    ///
    /// 状态总是先更新，然后再检查总线错误。
    ///
    /// # 错误
    ///
    /// - `CommunicationError`: 任一单元锁存了总线错误
    /// - `Controller(NotInitialized)`: 控制器未初始化
    pub fn update_system_feedback(&self) -> Result<(), SystemError> {
        let drivers = self.drivers()?;
        let now = Instant::now();

        for unit in Unit::ALL {
            let driver = Self::unit_driver(&drivers, unit);
            let feedback = driver.read_feedback();
            let stale = feedback.is_stale(now, self.pdo_feedback_timeout);
            let bus_error = driver.is_bus_error();

            let slot = self.state_slot(unit);
            let mut state = UnitState::clone(&slot.load());
            state.set_feedback(&feedback, stale);
            state.set_flags(
                feedback.fault_flags,
                feedback.script_flags,
                feedback.runtime_flags(Channel::One),
                feedback.runtime_flags(Channel::Two),
                bus_error,
            );
            slot.store(Arc::new(state));
        }

        Self::check_bus_errors(&drivers)
    }

    /// 最近一次更新中是否有单元反馈过期
    pub fn check_feedback_fresh(&self) -> Result<(), SystemError> {
        for unit in Unit::ALL {
            if self.state_slot(unit).load().is_feedback_stale() {
                return Err(SystemError::FeedbackStale { unit });
            }
        }
        Ok(())
    }

    /// 轮询一步辅助状态（每次调用一次 SDO 读）
    ///
    /// 顺序：前轴温度、电压、电池电流 1、电池电流 2，然后后轴相同。
    /// 读取失败时不前进，下次调用重试同一步。
    pub fn update_drivers_state(&self) -> Result<DriverStateUpdate, SystemError> {
        let drivers = self.drivers()?;
        let mut step = self.driver_state_step.lock();

        let unit = if *step < DRIVER_STATE_STEPS / 2 {
            Unit::Front
        } else {
            Unit::Rear
        };
        let driver = Self::unit_driver(&drivers, unit);
        let slot = self.state_slot(unit);
        let mut driver_state = *slot.load().driver_state();

        let to_error = SystemError::driver(unit);
        match *step % (DRIVER_STATE_STEPS / 2) {
            0 => driver_state.set_temperature(driver.read_temperature().map_err(to_error)?),
            1 => driver_state.set_voltage(driver.read_voltage().map_err(to_error)?),
            2 => {
                let current = driver.read_battery_current(Channel::One).map_err(to_error)?;
                driver_state.set_battery_current(Channel::One, current);
            },
            _ => {
                let current = driver.read_battery_current(Channel::Two).map_err(to_error)?;
                driver_state.set_battery_current(Channel::Two, current);
            },
        }

        let mut state = UnitState::clone(&slot.load());
        state.set_driver_state(driver_state);
        slot.store(Arc::new(state));

        *step += 1;
        let cycle_complete = *step >= DRIVER_STATE_STEPS;
        if cycle_complete {
            *step = 0;
        }
        drop(step);

        Self::check_bus_errors(&drivers)?;
        Ok(DriverStateUpdate {
            unit,
            cycle_complete,
        })
    }

    // ============================================================
    // 指令
    // ============================================================

    /// 换算并下发四个车轮的速度
    ///
    /// 通道 1 为右轮，通道 2 为左轮。
    pub fn write_speed(
        &self,
        front_left: f64,
        front_right: f64,
        rear_left: f64,
        rear_right: f64,
    ) -> Result<(), SystemError> {
        let drivers = self.drivers()?;
        drivers
            .front
            .send_command(
                self.converter.convert(front_right),
                self.converter.convert(front_left),
            )
            .map_err(SystemError::driver(Unit::Front))?;
        drivers
            .rear
            .send_command(
                self.converter.convert(rear_right),
                self.converter.convert(rear_left),
            )
            .map_err(SystemError::driver(Unit::Rear))?;
        Self::check_bus_errors(&drivers)
    }

    pub fn write_velocities(&self, velocities: &WheelVelocities) -> Result<(), SystemError> {
        self.write_speed(
            velocities.front_left,
            velocities.front_right,
            velocities.rear_left,
            velocities.rear_right,
        )
    }

    /// 对两个单元执行同一操作，全部尝试后返回第一个错误
    fn for_each_unit(
        &self,
        name: &str,
        operation: impl Fn(&RoboteqDriver) -> Result<(), panther_driver::DriverError>,
    ) -> Result<(), SystemError> {
        let drivers = self.drivers()?;
        let mut first_error = None;
        for unit in Unit::ALL {
            if let Err(err) = operation(Self::unit_driver(&drivers, unit)) {
                error!("{} on the {} unit failed: {}", name, unit, err);
                first_error.get_or_insert(SystemError::Driver { unit, source: err });
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                debug!("{} done on both units", name);
                Ok(())
            },
        }
    }

    pub fn turn_on_estop(&self) -> Result<(), SystemError> {
        self.for_each_unit("Turn on E-Stop", RoboteqDriver::turn_on_estop)
    }

    pub fn turn_off_estop(&self) -> Result<(), SystemError> {
        self.for_each_unit("Turn off E-Stop", RoboteqDriver::turn_off_estop)
    }

    /// 每个单元依次对通道 1、通道 2 触发安全停止
    pub fn turn_on_safety_stop(&self) -> Result<(), SystemError> {
        self.for_each_unit("Safety stop", |driver| {
            driver.turn_on_safety_stop(Channel::One)?;
            driver.turn_on_safety_stop(Channel::Two)
        })
    }

    // ============================================================
    // 状态读取
    // ============================================================

    pub fn unit_state(&self, unit: Unit) -> Arc<UnitState> {
        self.state_slot(unit).load_full()
    }

    pub fn front_state(&self) -> Arc<UnitState> {
        self.unit_state(Unit::Front)
    }

    pub fn rear_state(&self) -> Arc<UnitState> {
        self.unit_state(Unit::Rear)
    }

    /// 任一单元标志报错或反馈过期
    pub fn is_driver_error(&self) -> bool {
        Unit::ALL.iter().any(|unit| self.unit_state(*unit).is_error())
    }
}
