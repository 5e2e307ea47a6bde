//! 驱动系统（控制周期编排）
//!
//! 把电机控制器、错误过滤器和急停管理器组合成周期性的 `read` / `write`：
//!
//! ```text
//! read:  反馈 -> 单元状态 -> 错误过滤器 -> (有错误) 触发急停
//!        辅助状态轮询一步
//! write: 记录请求速度 -> 写锁 -> 急停时写零，否则写请求速度
//! ```
//!
//! 单周期的通信失败只进入错误过滤器，不会作为错误返回。

use crate::config::SystemConfig;
use crate::converters::UnitState;
use crate::e_stop::{EStopManager, EStopManagerResources};
use crate::error::{EStopError, SystemError, Unit};
use crate::error_filter::{ErrorFilterId, RoboteqErrorFilter};
use crate::gpio::GpioController;
use crate::motors_controller::{MotorsController, WheelVelocities};
use crate::utils::operation_with_attempts;
use panther_driver::{CanOpenController, CanOpenControllerBuilder};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 驱动系统
pub struct DriveSystem {
    config: SystemConfig,
    motors: Arc<MotorsController>,
    error_filter: Arc<RoboteqErrorFilter>,
    e_stop: EStopManager,
}

impl DriveSystem {
    /// 使用配置中的 SocketCAN 接口构建
    pub fn from_config(
        config: SystemConfig,
        gpio: Arc<dyn GpioController>,
    ) -> Result<Self, SystemError> {
        let controller = CanOpenControllerBuilder::new()
            .interface(config.canopen.interface.clone())
            .settings(config.canopen.to_settings())
            .build()?;
        Ok(Self::new(config, controller, gpio))
    }

    /// 使用已构建（未初始化）的 CANopen 控制器
    pub fn new(
        config: SystemConfig,
        controller: CanOpenController,
        gpio: Arc<dyn GpioController>,
    ) -> Self {
        let motors = Arc::new(MotorsController::new(
            controller,
            config.drivetrain.to_settings(),
            config.canopen.activate_settle(),
        ));
        let error_filter = Arc::new(RoboteqErrorFilter::new(config.error_filter.to_settings()));
        let resources = Arc::new(EStopManagerResources::new(
            gpio,
            motors.clone(),
            error_filter.clone(),
            config.attempts.safety_stop,
        ));
        let e_stop = EStopManager::new(resources, config.e_stop.strategy);

        Self {
            config,
            motors,
            error_filter,
            e_stop,
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn motors(&self) -> &Arc<MotorsController> {
        &self.motors
    }

    pub fn error_filter(&self) -> &Arc<RoboteqErrorFilter> {
        &self.error_filter
    }

    pub fn e_stop(&self) -> &EStopManager {
        &self.e_stop
    }

    pub fn unit_state(&self, unit: Unit) -> Arc<UnitState> {
        self.motors.unit_state(unit)
    }

    // ============================================================
    // 生命周期
    // ============================================================

    /// 启动 GPIO 并初始化 CANopen（失败时反初始化后重试）
    pub fn initialize(&self) -> Result<(), SystemError> {
        self.e_stop.resources().gpio().start()?;

        let attempts = self.config.attempts.initialization;
        operation_with_attempts(
            || self.motors.initialize(),
            attempts,
            || {
                self.motors.deinitialize();
                Ok(())
            },
        )
        .map_err(|err| SystemError::AttemptsExhausted {
            operation: "Initialization",
            attempts,
            last_error: err.to_string(),
        })?;
        info!("Drive system initialized");
        Ok(())
    }

    /// 解除控制器急停锁存、复位脚本并下发零指令，然后同步急停状态
    pub fn activate(&self) -> Result<(), SystemError> {
        let attempts = self.config.attempts.activation;
        operation_with_attempts(
            || {
                self.motors.turn_off_estop()?;
                self.motors.activate()
            },
            attempts,
            || Ok(()),
        )
        .map_err(|err| SystemError::AttemptsExhausted {
            operation: "Activation",
            attempts,
            last_error: err.to_string(),
        })?;

        if let Err(err) = self.e_stop.read_e_stop_state() {
            warn!("Failed to read E-Stop state after activation: {}", err);
        }
        info!(
            "Drive system activated (E-Stop {})",
            if self.e_stop.is_triggered() { "triggered" } else { "released" }
        );
        Ok(())
    }

    /// 触发急停并关闭通信
    pub fn shutdown(&self) {
        if self.motors.is_initialized() {
            if let Err(err) = self.e_stop.trigger_e_stop() {
                error!("Failed to trigger E-Stop during shutdown: {}", err);
            }
        }
        self.motors.deinitialize();
        info!("Drive system shut down");
    }

    // ============================================================
    // 控制周期
    // ============================================================

    /// 读取一个周期的反馈
    ///
    /// # 错误
    ///
    /// 只返回生命周期类错误（例如未初始化）；通信失败进入错误过滤器。
    pub fn read(&self) -> Result<(), SystemError> {
        if let Err(err) = self.motors.update_system_feedback() {
            if !err.is_cycle_fault() {
                return Err(err);
            }
            debug!("Feedback update reported: {}", err);
        }

        for unit in Unit::ALL {
            let state = self.motors.unit_state(unit);
            self.error_filter
                .update(unit, ErrorFilterId::ReadPdo, state.is_feedback_stale());
            self.error_filter
                .set_bus_error(unit, state.is_communication_error());
        }

        match self.motors.update_drivers_state() {
            Ok(update) => self.error_filter.update(update.unit, ErrorFilterId::ReadSdo, false),
            Err(err) => self.record_failure(ErrorFilterId::ReadSdo, err)?,
        }

        if let Err(err) = self.e_stop.read_e_stop_state() {
            warn!("Failed to read E-Stop state: {}", err);
        }
        if self.error_filter.is_error() && !self.e_stop.is_triggered() {
            warn!("Roboteq error filter reports an error, triggering E-Stop");
            for unit in Unit::ALL {
                let state = self.motors.unit_state(unit);
                if state.is_error() {
                    warn!("{} unit: {}", unit, state.error_log());
                }
            }
            if let Err(err) = self.e_stop.trigger_e_stop() {
                error!("Failed to trigger E-Stop: {}", err);
            }
        }
        Ok(())
    }

    /// 写入一个周期的速度指令
    ///
    /// 请求的速度总是被记录（急停复位前置条件依赖它）；急停时实际下发零。
    pub fn write(&self, velocities: WheelVelocities) -> Result<(), SystemError> {
        let resources = self.e_stop.resources();
        resources.set_velocity_commands(velocities);

        let result = {
            let _writes = resources.lock_writes();
            let commands = if resources.is_triggered() {
                WheelVelocities::ZERO
            } else {
                velocities
            };
            self.motors.write_velocities(&commands)
        };

        match result {
            Ok(()) => {
                for unit in Unit::ALL {
                    self.error_filter.update(unit, ErrorFilterId::WriteSdo, false);
                }
                Ok(())
            },
            Err(err) => self.record_failure(ErrorFilterId::WriteSdo, err),
        }
    }

    /// 触发急停（操作员接口）
    pub fn trigger_e_stop(&self) -> Result<(), EStopError> {
        self.e_stop.trigger_e_stop()
    }

    /// 复位急停（操作员接口）
    pub fn reset_e_stop(&self) -> Result<(), EStopError> {
        self.e_stop.reset_e_stop()
    }

    /// 周期性失败计入过滤器；生命周期类错误原样返回
    fn record_failure(&self, id: ErrorFilterId, err: SystemError) -> Result<(), SystemError> {
        if !err.is_cycle_fault() {
            return Err(err);
        }
        debug!("{:?} cycle failure: {}", id, err);
        match err.unit() {
            Some(unit) => self.error_filter.update(unit, id, true),
            None => {
                for unit in Unit::ALL {
                    self.error_filter.update(unit, id, true);
                }
            },
        }
        Ok(())
    }
}
