//! 数字 I/O 能力
//!
//! 急停硬件通路依赖的 GPIO 接口，以及不依赖硬件的 `VirtualGpio` 实现。

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// GPIO 引脚
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpioPin {
    /// 急停复位线（输入高电平表示急停未触发）
    EStopReset,
    /// 软件看门狗
    Watchdog,
    /// 功率级上电状态（输入）
    Stage2Input,
    /// 电机上电
    MotorOn,
    AuxPowerEnable,
    FanSwitch,
    VdigPowerEnable,
    ChargerEnable,
}

impl GpioPin {
    pub fn is_input(self) -> bool {
        matches!(self, GpioPin::EStopReset | GpioPin::Stage2Input)
    }
}

impl fmt::Display for GpioPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GpioPin::EStopReset => "E_STOP_RESET",
            GpioPin::Watchdog => "WATCHDOG",
            GpioPin::Stage2Input => "STAGE2_INPUT",
            GpioPin::MotorOn => "MOTOR_ON",
            GpioPin::AuxPowerEnable => "AUX_PW_EN",
            GpioPin::FanSwitch => "FAN_SW",
            GpioPin::VdigPowerEnable => "VDIG_OFF",
            GpioPin::ChargerEnable => "CHRG_DISABLE",
        };
        f.write_str(name)
    }
}

/// GPIO 错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpioError {
    #[error("GPIO controller not started")]
    NotStarted,

    #[error("Pin {0} is an input")]
    NotOutput(GpioPin),

    #[error("E-Stop reset interrupted")]
    ResetInterrupted,

    #[error("E-Stop reset failed: {0}")]
    ResetFailed(String),

    #[error("GPIO device error: {0}")]
    Device(String),
}

/// 数字 I/O 能力
///
/// 实现需要允许多个线程同时调用。复位是否被打断由调用方持有的标志决定，
/// `interrupt_e_stop_reset` 只负责唤醒正在等待的 `e_stop_reset` 重新检查该标志。
pub trait GpioController: Send + Sync {
    fn start(&self) -> Result<(), GpioError>;

    fn is_pin_active(&self, pin: GpioPin) -> Result<bool, GpioError>;

    fn set_pin(&self, pin: GpioPin, active: bool) -> Result<(), GpioError>;

    /// 关闭看门狗，使急停线保持触发
    fn e_stop_trigger(&self) -> Result<(), GpioError>;

    /// 启动看门狗并发出复位脉冲，阻塞直到复位完成、失败或 `interrupted()` 为真
    ///
    /// # 错误
    ///
    /// - `ResetInterrupted`: 等待期间 `interrupted()` 返回真
    /// - `ResetFailed`: 脉冲结束后急停线仍未释放
    fn e_stop_reset(&self, interrupted: &dyn Fn() -> bool) -> Result<(), GpioError>;

    /// 唤醒正在进行的 `e_stop_reset`
    fn interrupt_e_stop_reset(&self);

    fn motors_enable(&self, enable: bool) -> Result<(), GpioError> {
        self.set_pin(GpioPin::MotorOn, enable)
    }
}

#[derive(Debug)]
struct VirtualPins {
    started: bool,
    levels: HashMap<GpioPin, bool>,
    reset_blocked: bool,
    reset_duration: Duration,
}

/// 内存中的 GPIO（无硬件）
///
/// 模型：
/// - 看门狗运行且复位脉冲成功后急停释放（`E_STOP_RESET` 为高）
/// - `e_stop_trigger` 关闭看门狗并拉低 `E_STOP_RESET`
/// - `MOTOR_ON` 同步驱动 `STAGE2_INPUT`
///
/// ```rust
/// use panther_system::{GpioController, GpioPin, VirtualGpio};
///
/// let gpio = VirtualGpio::new();
/// gpio.start().unwrap();
/// assert!(!gpio.is_pin_active(GpioPin::EStopReset).unwrap());
/// gpio.e_stop_reset(&|| false).unwrap();
/// assert!(gpio.is_pin_active(GpioPin::EStopReset).unwrap());
/// ```
#[derive(Debug)]
pub struct VirtualGpio {
    pins: Mutex<VirtualPins>,
    wakeup: Condvar,
}

impl VirtualGpio {
    /// 默认复位脉冲时长
    pub const DEFAULT_RESET_DURATION: Duration = Duration::from_millis(20);

    /// 初始状态：急停触发、看门狗关闭、功率级上电
    pub fn new() -> Self {
        let mut levels = HashMap::new();
        levels.insert(GpioPin::EStopReset, false);
        levels.insert(GpioPin::Watchdog, false);
        levels.insert(GpioPin::Stage2Input, true);
        levels.insert(GpioPin::MotorOn, true);
        Self {
            pins: Mutex::new(VirtualPins {
                started: false,
                levels,
                reset_blocked: false,
                reset_duration: Self::DEFAULT_RESET_DURATION,
            }),
            wakeup: Condvar::new(),
        }
    }

    pub fn set_reset_duration(&self, duration: Duration) {
        self.pins.lock().reset_duration = duration;
    }

    /// 模拟复位被硬件拒绝（例如急停按钮仍被按下）
    pub fn set_reset_blocked(&self, blocked: bool) {
        self.pins.lock().reset_blocked = blocked;
    }

    /// 模拟外部设备（安全板、驱动器）触发急停
    pub fn force_e_stop(&self) {
        self.pins.lock().levels.insert(GpioPin::EStopReset, false);
    }

    /// 直接设置输入引脚电平
    pub fn simulate_input(&self, pin: GpioPin, active: bool) {
        self.pins.lock().levels.insert(pin, active);
    }

    pub fn is_watchdog_enabled(&self) -> bool {
        self.level(GpioPin::Watchdog)
    }

    fn level(&self, pin: GpioPin) -> bool {
        self.pins.lock().levels.get(&pin).copied().unwrap_or(false)
    }
}

impl Default for VirtualGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioController for VirtualGpio {
    fn start(&self) -> Result<(), GpioError> {
        self.pins.lock().started = true;
        info!("Virtual GPIO controller started");
        Ok(())
    }

    fn is_pin_active(&self, pin: GpioPin) -> Result<bool, GpioError> {
        let pins = self.pins.lock();
        if !pins.started {
            return Err(GpioError::NotStarted);
        }
        Ok(pins.levels.get(&pin).copied().unwrap_or(false))
    }

    fn set_pin(&self, pin: GpioPin, active: bool) -> Result<(), GpioError> {
        if pin.is_input() {
            return Err(GpioError::NotOutput(pin));
        }
        let mut pins = self.pins.lock();
        if !pins.started {
            return Err(GpioError::NotStarted);
        }
        pins.levels.insert(pin, active);
        if pin == GpioPin::MotorOn {
            pins.levels.insert(GpioPin::Stage2Input, active);
        }
        debug!("Set pin {} to {}", pin, active);
        Ok(())
    }

    fn e_stop_trigger(&self) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        if !pins.started {
            return Err(GpioError::NotStarted);
        }
        pins.levels.insert(GpioPin::Watchdog, false);
        pins.levels.insert(GpioPin::EStopReset, false);
        Ok(())
    }

    fn e_stop_reset(&self, interrupted: &dyn Fn() -> bool) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        if !pins.started {
            return Err(GpioError::NotStarted);
        }
        pins.levels.insert(GpioPin::Watchdog, true);

        let deadline = Instant::now() + pins.reset_duration;
        while !interrupted() {
            if self.wakeup.wait_until(&mut pins, deadline).timed_out() {
                break;
            }
        }
        if interrupted() {
            warn!("E-Stop reset pulse interrupted");
            pins.levels.insert(GpioPin::Watchdog, false);
            return Err(GpioError::ResetInterrupted);
        }

        if pins.reset_blocked {
            return Err(GpioError::ResetFailed(
                "E_STOP_RESET still inactive after the reset pulse".to_string(),
            ));
        }
        pins.levels.insert(GpioPin::EStopReset, true);
        Ok(())
    }

    fn interrupt_e_stop_reset(&self) {
        // 持锁通知：调用方先设置标志，复位线程要么在检查时看到标志，要么收到唤醒
        let _pins = self.pins.lock();
        self.wakeup.notify_all();
    }
}
