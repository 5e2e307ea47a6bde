//! 急停管理器
//!
//! 状态只有两个：运行（`triggered == false`）和急停（`triggered == true`）。
//! 初始状态为急停，只有复位成功才会进入运行。
//!
//! 具体的触发 / 复位 / 读取动作由可替换的策略实现：
//! - [`HardwareEStop`]：急停线由硬件驱动，软件通过看门狗和复位脉冲控制
//! - [`SoftwareEStop`]：没有硬件急停线，通过控制器的安全停止命令实现
//!
//! 指令写入与急停动作共用 [`EStopManagerResources::lock_writes`] 返回的写锁。
//!
//! 复位在等待写锁之前就登记为进行中；触发先递增触发计数再等待写锁。
//! 复位开始后只要计数变化，复位就以 `EStopResetInterrupted` 结束，
//! 无论触发先拿到写锁还是复位先拿到。

use crate::error::{EStopError, Unit};
use crate::error_filter::RoboteqErrorFilter;
use crate::gpio::{GpioController, GpioError, GpioPin};
use crate::motors_controller::{MotorsController, WheelVelocities};
use crate::utils::operation_with_attempts;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, warn};

// ============================================================================
// 共享资源
// ============================================================================

/// 管理器与当前策略共享的资源
pub struct EStopManagerResources {
    gpio: Arc<dyn GpioController>,
    motors: Arc<MotorsController>,
    error_filter: Arc<RoboteqErrorFilter>,
    write_lock: Mutex<()>,
    triggered: AtomicBool,
    /// 已登记但尚未结束的复位数
    resets_in_progress: AtomicU32,
    /// 每次触发请求递增
    trigger_epoch: AtomicU64,
    velocity_commands: Mutex<WheelVelocities>,
    safety_stop_attempts: u32,
}

impl EStopManagerResources {
    pub fn new(
        gpio: Arc<dyn GpioController>,
        motors: Arc<MotorsController>,
        error_filter: Arc<RoboteqErrorFilter>,
        safety_stop_attempts: u32,
    ) -> Self {
        Self {
            gpio,
            motors,
            error_filter,
            write_lock: Mutex::new(()),
            triggered: AtomicBool::new(true),
            resets_in_progress: AtomicU32::new(0),
            trigger_epoch: AtomicU64::new(0),
            velocity_commands: Mutex::new(WheelVelocities::ZERO),
            safety_stop_attempts,
        }
    }

    pub fn gpio(&self) -> &Arc<dyn GpioController> {
        &self.gpio
    }

    pub fn motors(&self) -> &Arc<MotorsController> {
        &self.motors
    }

    pub fn error_filter(&self) -> &Arc<RoboteqErrorFilter> {
        &self.error_filter
    }

    /// 指令写入与急停动作的互斥锁
    pub fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// 缓存的急停状态
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// 记录最近一次请求的车轮速度
    pub fn set_velocity_commands(&self, velocities: WheelVelocities) {
        *self.velocity_commands.lock() = velocities;
    }

    pub fn velocity_commands(&self) -> WheelVelocities {
        *self.velocity_commands.lock()
    }

    pub fn are_velocity_commands_near_zero(&self) -> bool {
        self.velocity_commands.lock().is_near_zero()
    }

    pub fn is_reset_in_progress(&self) -> bool {
        self.resets_in_progress.load(Ordering::Acquire) > 0
    }

    fn set_triggered(&self, triggered: bool) {
        let previous = self.triggered.swap(triggered, Ordering::AcqRel);
        if previous != triggered {
            info!(
                "E-Stop state changed: {}",
                if triggered { "stopped" } else { "running" }
            );
        }
    }

    /// 打断所有已登记的复位（在获取写锁之前调用）
    fn interrupt_reset(&self) {
        self.trigger_epoch.fetch_add(1, Ordering::AcqRel);
        self.gpio.interrupt_e_stop_reset();
    }

    /// 登记复位，必须在获取写锁之前调用
    fn begin_reset(&self) -> ResetGuard<'_> {
        self.resets_in_progress.fetch_add(1, Ordering::AcqRel);
        ResetGuard {
            resources: self,
            epoch: self.trigger_epoch.load(Ordering::Acquire),
        }
    }

    fn check_velocity_commands(&self) -> Result<(), EStopError> {
        if !self.are_velocity_commands_near_zero() {
            return Err(EStopError::EStopResetPrecondition(format!(
                "velocity commands are not zero ({:?})",
                self.velocity_commands()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for EStopManagerResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EStopManagerResources")
            .field("triggered", &self.is_triggered())
            .field("reset_in_progress", &self.is_reset_in_progress())
            .field("velocity_commands", &self.velocity_commands())
            .finish_non_exhaustive()
    }
}

/// 已登记的复位，离开作用域时注销
struct ResetGuard<'a> {
    resources: &'a EStopManagerResources,
    /// 登记时的触发计数
    epoch: u64,
}

impl ResetGuard<'_> {
    /// 登记之后是否有过触发请求
    fn is_interrupted(&self) -> bool {
        self.resources.trigger_epoch.load(Ordering::Acquire) != self.epoch
    }

    fn check_interrupted(&self) -> Result<(), EStopError> {
        if self.is_interrupted() {
            warn!("E-Stop reset interrupted by a trigger");
            return Err(EStopError::EStopResetInterrupted);
        }
        Ok(())
    }
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        self.resources
            .resets_in_progress
            .fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// 策略
// ============================================================================

/// 急停策略
pub trait EStopStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 独立重新推导急停状态并同步缓存
    fn read_e_stop_state(&self) -> Result<bool, EStopError>;

    /// 触发急停；动作失败时状态不变
    fn trigger_e_stop(&self) -> Result<(), EStopError>;

    /// 复位急停
    ///
    /// # 错误
    ///
    /// - `EStopResetPrecondition`: 速度指令非零或策略特定的条件不满足
    /// - `EStopResetInterrupted`: 复位过程中被触发打断
    /// - `EStopResetFailed`: 复位动作完成后仍处于急停
    fn reset_e_stop(&self) -> Result<(), EStopError>;
}

/// 策略类型（配置用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EStopStrategyKind {
    /// 硬件急停线（看门狗 + 复位脉冲）
    Hardware,
    /// 仅软件（控制器安全停止）
    #[default]
    Software,
}

impl EStopStrategyKind {
    pub fn build(self, resources: Arc<EStopManagerResources>) -> Arc<dyn EStopStrategy> {
        match self {
            EStopStrategyKind::Hardware => Arc::new(HardwareEStop::new(resources)),
            EStopStrategyKind::Software => Arc::new(SoftwareEStop::new(resources)),
        }
    }
}

/// 硬件急停策略
pub struct HardwareEStop {
    resources: Arc<EStopManagerResources>,
}

impl HardwareEStop {
    pub fn new(resources: Arc<EStopManagerResources>) -> Self {
        Self { resources }
    }

    /// 按急停线电平同步缓存状态
    fn sync_with_line(&self) -> Result<bool, EStopError> {
        let triggered = !self.resources.gpio.is_pin_active(GpioPin::EStopReset)?;
        if triggered {
            if !self.resources.is_triggered() {
                warn!("E-Stop line asserted outside of the manager");
            }
            // 其他设备触发的急停：关闭看门狗，防止自动恢复
            self.resources.gpio.e_stop_trigger()?;
        }
        self.resources.set_triggered(triggered);
        Ok(triggered)
    }
}

impl EStopStrategy for HardwareEStop {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn read_e_stop_state(&self) -> Result<bool, EStopError> {
        // 复位脉冲期间急停线尚未释放
        if self.resources.is_reset_in_progress() {
            return Ok(self.resources.is_triggered());
        }
        self.sync_with_line()
    }

    fn trigger_e_stop(&self) -> Result<(), EStopError> {
        self.resources.interrupt_reset();
        let _writes = self.resources.lock_writes();

        self.resources
            .gpio
            .e_stop_trigger()
            .map_err(|err| EStopError::EStopTriggerFailed(err.to_string()))?;
        self.resources.set_triggered(true);
        Ok(())
    }

    fn reset_e_stop(&self) -> Result<(), EStopError> {
        let reset = self.resources.begin_reset();
        let _writes = self.resources.lock_writes();
        reset.check_interrupted()?;
        self.resources.check_velocity_commands()?;

        match self.resources.gpio.e_stop_reset(&|| reset.is_interrupted()) {
            Ok(()) => {},
            Err(GpioError::ResetInterrupted) => return Err(EStopError::EStopResetInterrupted),
            Err(GpioError::ResetFailed(reason)) => return Err(EStopError::EStopResetFailed(reason)),
            Err(err) => return Err(err.into()),
        }
        reset.check_interrupted()?;

        self.resources.error_filter.set_clear_errors();
        let still_triggered = self.sync_with_line()?;
        reset.check_interrupted()?;
        if still_triggered {
            return Err(EStopError::EStopResetFailed(
                "E-Stop line still asserted after the reset".to_string(),
            ));
        }
        Ok(())
    }
}

/// 软件急停策略
pub struct SoftwareEStop {
    resources: Arc<EStopManagerResources>,
}

impl SoftwareEStop {
    pub fn new(resources: Arc<EStopManagerResources>) -> Self {
        Self { resources }
    }

    /// 需要急停的原因（功率级断电或驱动器报错）
    fn stop_reason(&self) -> Result<Option<String>, EStopError> {
        if !self.resources.gpio.is_pin_active(GpioPin::Stage2Input)? {
            return Ok(Some("motors are not powered".to_string()));
        }
        for unit in Unit::ALL {
            let state = self.resources.motors.unit_state(unit);
            if state.is_error() {
                return Ok(Some(format!(
                    "{} motor driver reports errors: {}",
                    unit,
                    state.error_log()
                )));
            }
        }
        Ok(None)
    }

    /// 运行状态下出现急停条件时触发急停，返回触发原因
    ///
    /// 调用方必须持有写锁。
    fn enforce_stop_conditions(&self) -> Result<Option<String>, EStopError> {
        if self.resources.is_triggered() {
            return Ok(None);
        }
        let reason = self.stop_reason()?;
        if let Some(reason) = &reason {
            warn!("Triggering E-Stop: {}", reason);
            self.trigger_locked()?;
        }
        Ok(reason)
    }

    /// 调用方必须持有写锁
    fn trigger_locked(&self) -> Result<(), EStopError> {
        let motors = &self.resources.motors;
        operation_with_attempts(
            || motors.turn_on_safety_stop(),
            self.resources.safety_stop_attempts,
            || Ok(()),
        )
        .map_err(|err| EStopError::EStopTriggerFailed(err.to_string()))?;
        self.resources.set_triggered(true);
        Ok(())
    }
}

impl EStopStrategy for SoftwareEStop {
    fn name(&self) -> &'static str {
        "software"
    }

    fn read_e_stop_state(&self) -> Result<bool, EStopError> {
        if self.resources.is_reset_in_progress() || self.resources.is_triggered() {
            return Ok(self.resources.is_triggered());
        }
        let _writes = self.resources.lock_writes();
        self.enforce_stop_conditions()?;
        Ok(self.resources.is_triggered())
    }

    fn trigger_e_stop(&self) -> Result<(), EStopError> {
        self.resources.interrupt_reset();
        let _writes = self.resources.lock_writes();
        self.trigger_locked()
    }

    fn reset_e_stop(&self) -> Result<(), EStopError> {
        let reset = self.resources.begin_reset();
        let _writes = self.resources.lock_writes();
        reset.check_interrupted()?;
        self.resources.check_velocity_commands()?;
        if let Some(reason) = self.stop_reason()? {
            return Err(EStopError::EStopResetPrecondition(reason));
        }
        reset.check_interrupted()?;

        self.resources.error_filter.set_clear_errors();
        self.resources.set_triggered(false);

        // 与 read_e_stop_state 相同的检查确认新状态
        if let Some(reason) = self.enforce_stop_conditions()? {
            return Err(EStopError::EStopResetFailed(reason));
        }
        Ok(())
    }
}

// ============================================================================
// 管理器
// ============================================================================

/// 急停管理器
///
/// # 示例
///
/// ```rust,no_run
/// # use panther_system::{EStopManager, EStopManagerResources, EStopStrategyKind};
/// # use std::sync::Arc;
/// # fn demo(resources: Arc<EStopManagerResources>) -> Result<(), panther_system::EStopError> {
/// let manager = EStopManager::new(resources, EStopStrategyKind::Software);
/// manager.trigger_e_stop()?;
/// assert!(manager.is_triggered());
/// manager.reset_e_stop()?;
/// # Ok(())
/// # }
/// ```
pub struct EStopManager {
    resources: Arc<EStopManagerResources>,
    strategy: RwLock<Arc<dyn EStopStrategy>>,
}

impl EStopManager {
    pub fn new(resources: Arc<EStopManagerResources>, kind: EStopStrategyKind) -> Self {
        let strategy = kind.build(resources.clone());
        Self::with_strategy(resources, strategy)
    }

    pub fn with_strategy(
        resources: Arc<EStopManagerResources>,
        strategy: Arc<dyn EStopStrategy>,
    ) -> Self {
        info!("E-Stop manager using the {} strategy", strategy.name());
        Self {
            resources,
            strategy: RwLock::new(strategy),
        }
    }

    /// 替换当前策略
    ///
    /// 调用方需要保证替换时没有进行中的触发或复位。
    pub fn set_strategy(&self, strategy: Arc<dyn EStopStrategy>) {
        info!("Switching E-Stop strategy to {}", strategy.name());
        *self.strategy.write() = strategy;
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.read().name()
    }

    fn strategy(&self) -> Arc<dyn EStopStrategy> {
        self.strategy.read().clone()
    }

    pub fn read_e_stop_state(&self) -> Result<bool, EStopError> {
        self.strategy().read_e_stop_state()
    }

    pub fn trigger_e_stop(&self) -> Result<(), EStopError> {
        debug!("E-Stop trigger requested");
        self.strategy().trigger_e_stop()
    }

    pub fn reset_e_stop(&self) -> Result<(), EStopError> {
        debug!("E-Stop reset requested");
        let result = self.strategy().reset_e_stop();
        match &result {
            Ok(()) => info!("E-Stop reset"),
            Err(err) => warn!("E-Stop reset failed: {}", err),
        }
        result
    }

    /// 缓存的急停状态
    pub fn is_triggered(&self) -> bool {
        self.resources.is_triggered()
    }

    pub fn resources(&self) -> &Arc<EStopManagerResources> {
        &self.resources
    }
}
