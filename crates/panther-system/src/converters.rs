//! 原始反馈到物理量的转换（状态聚合）
//!
//! 纯数据变换，不做 I/O。过期判定由电机控制器完成，这里只保存结果。
//!
//! 两个单元上通道 1 都是右侧车轮，通道 2 都是左侧车轮。

use panther_driver::{MotorChannelFeedback, UnitFeedback};
use panther_protocol::{
    Channel, FAULT_FLAG_NAMES, MAX_COMMAND, RUNTIME_FLAG_NAMES, RUNTIME_FLAGS_ERROR_MASK,
    SCRIPT_FLAG_NAMES,
};
use std::f64::consts::PI;

// ============================================================================
// 传动参数
// ============================================================================

/// 传动系统参数（默认值为 Panther 实车参数）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrivetrainSettings {
    /// 电机转矩常数（Nm/A）
    pub motor_torque_constant: f64,
    /// 减速比
    pub gear_ratio: f64,
    /// 减速箱效率
    pub gearbox_efficiency: f64,
    /// 编码器分辨率（每圈脉冲数）
    pub encoder_resolution: f64,
    /// 电机最大转速（rpm），对应指令 1000
    pub max_rpm_motor_speed: f64,
}

impl Default for DrivetrainSettings {
    fn default() -> Self {
        Self {
            motor_torque_constant: 0.11,
            gear_ratio: 30.08,
            gearbox_efficiency: 0.75,
            encoder_resolution: 1600.0,
            max_rpm_motor_speed: 3600.0,
        }
    }
}

// ============================================================================
// 指令转换
// ============================================================================

/// 车轮角速度（rad/s）到控制器指令单位的线性换算
///
/// ```rust
/// use panther_system::{DrivetrainSettings, VelocityCommandConverter};
///
/// let converter = VelocityCommandConverter::new(&DrivetrainSettings::default());
/// assert_eq!(converter.convert(0.0), 0);
/// // 超出范围的速度饱和到 1000
/// assert_eq!(converter.convert(1000.0), 1000);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct VelocityCommandConverter {
    factor: f64,
}

impl VelocityCommandConverter {
    pub fn new(settings: &DrivetrainSettings) -> Self {
        let factor =
            settings.gear_ratio / (2.0 * PI) * 60.0 * (MAX_COMMAND as f64 / settings.max_rpm_motor_speed);
        Self { factor }
    }

    /// 换算并饱和到 ±1000（NaN 视为 0）
    pub fn convert(&self, velocity: f64) -> i32 {
        let command = velocity * self.factor;
        if command.is_nan() {
            return 0;
        }
        // `as` 对超出 i32 的浮点数饱和
        (command as i32).clamp(-MAX_COMMAND, MAX_COMMAND)
    }
}

// ============================================================================
// 电机状态
// ============================================================================

/// 单个电机的物理量视图
#[derive(Debug, Clone, Copy)]
pub struct MotorState {
    raw: MotorChannelFeedback,
    position_factor: f64,
    velocity_factor: f64,
    torque_factor: f64,
}

impl MotorState {
    pub fn new(settings: &DrivetrainSettings) -> Self {
        Self {
            raw: MotorChannelFeedback::default(),
            position_factor: 1.0 / settings.encoder_resolution / settings.gear_ratio * 2.0 * PI,
            velocity_factor: 1.0 / settings.gear_ratio / 60.0 * 2.0 * PI,
            // 电流单位为 0.1 A
            torque_factor: 0.1
                * settings.motor_torque_constant
                * settings.gear_ratio
                * settings.gearbox_efficiency,
        }
    }

    pub fn set_feedback(&mut self, feedback: &MotorChannelFeedback) {
        self.raw = *feedback;
    }

    pub fn raw(&self) -> &MotorChannelFeedback {
        &self.raw
    }

    /// 车轮位置（rad）
    pub fn position(&self) -> f64 {
        self.raw.position as f64 * self.position_factor
    }

    /// 车轮角速度（rad/s）
    pub fn velocity(&self) -> f64 {
        self.raw.velocity as f64 * self.velocity_factor
    }

    /// 车轮转矩（Nm）
    pub fn torque(&self) -> f64 {
        self.raw.current as f64 * self.torque_factor
    }
}

// ============================================================================
// 标志位
// ============================================================================

/// 带屏蔽位的标志字节
#[derive(Debug, Clone, Copy)]
pub struct FlagError {
    flags: u8,
    error_mask: u8,
    names: &'static [&'static str],
}

impl FlagError {
    pub fn new(names: &'static [&'static str], error_mask: u8) -> Self {
        Self {
            flags: 0,
            error_mask,
            names,
        }
    }

    pub fn fault_flags() -> Self {
        Self::new(FAULT_FLAG_NAMES, 0xFF)
    }

    pub fn script_flags() -> Self {
        Self::new(SCRIPT_FLAG_NAMES, 0xFF)
    }

    /// 运行时标志屏蔽 `amps_limit_active` 与 `safety_stop_active`
    pub fn runtime_flags() -> Self {
        Self::new(RUNTIME_FLAG_NAMES, RUNTIME_FLAGS_ERROR_MASK)
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_error(&self) -> bool {
        self.flags & self.error_mask != 0
    }

    /// 计入错误的已置位标志名称
    pub fn active_errors(&self) -> Vec<&'static str> {
        self.names
            .iter()
            .enumerate()
            .filter(|(bit, _)| {
                let mask = 1u8 << bit;
                self.flags & self.error_mask & mask != 0
            })
            .map(|(_, name)| *name)
            .collect()
    }

    /// 人类可读的错误列表（每个名称后跟一个空格）
    pub fn error_log(&self) -> String {
        self.active_errors()
            .into_iter()
            .map(|name| format!("{} ", name))
            .collect()
    }
}

// ============================================================================
// 驱动器辅助状态
// ============================================================================

/// 温度、电压和电池电流（诊断用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverState {
    temperature: i16,
    voltage: u16,
    battery_current: [i16; 2],
}

impl DriverState {
    pub fn set_temperature(&mut self, celsius: i16) {
        self.temperature = celsius;
    }

    pub fn set_voltage(&mut self, deci_volts: u16) {
        self.voltage = deci_volts;
    }

    pub fn set_battery_current(&mut self, channel: Channel, deci_amps: i16) {
        let index = match channel {
            Channel::One => 0,
            Channel::Two => 1,
        };
        self.battery_current[index] = deci_amps;
    }

    /// 温度（°C）
    pub fn temperature(&self) -> f32 {
        self.temperature as f32
    }

    /// 电压（V）
    pub fn voltage(&self) -> f32 {
        self.voltage as f32 / 10.0
    }

    /// 两个通道电池电流之和（A）
    pub fn current(&self) -> f32 {
        (self.battery_current[0] as f32 + self.battery_current[1] as f32) / 10.0
    }
}

// ============================================================================
// 单元状态
// ============================================================================

/// 单个驱动单元面向使用方的状态
#[derive(Debug, Clone)]
pub struct UnitState {
    left: MotorState,
    right: MotorState,
    driver_state: DriverState,
    fault_flags: FlagError,
    script_flags: FlagError,
    left_runtime_flags: FlagError,
    right_runtime_flags: FlagError,
    feedback_stale: bool,
    communication_error: bool,
}

impl UnitState {
    pub fn new(settings: &DrivetrainSettings) -> Self {
        Self {
            left: MotorState::new(settings),
            right: MotorState::new(settings),
            driver_state: DriverState::default(),
            fault_flags: FlagError::fault_flags(),
            script_flags: FlagError::script_flags(),
            left_runtime_flags: FlagError::runtime_flags(),
            right_runtime_flags: FlagError::runtime_flags(),
            feedback_stale: false,
            communication_error: false,
        }
    }

    /// 保存换算后的反馈与过期标志
    pub fn set_feedback(&mut self, feedback: &UnitFeedback, is_stale: bool) {
        self.right.set_feedback(feedback.channel(Channel::One));
        self.left.set_feedback(feedback.channel(Channel::Two));
        self.feedback_stale = is_stale;
    }

    pub fn set_flags(
        &mut self,
        fault: u8,
        script: u8,
        runtime_channel_1: u8,
        runtime_channel_2: u8,
        bus_error: bool,
    ) {
        self.fault_flags.set_flags(fault);
        self.script_flags.set_flags(script);
        self.right_runtime_flags.set_flags(runtime_channel_1);
        self.left_runtime_flags.set_flags(runtime_channel_2);
        self.communication_error = bus_error;
    }

    pub fn set_driver_state(&mut self, driver_state: DriverState) {
        self.driver_state = driver_state;
    }

    pub fn left_motor(&self) -> &MotorState {
        &self.left
    }

    pub fn right_motor(&self) -> &MotorState {
        &self.right
    }

    pub fn driver_state(&self) -> &DriverState {
        &self.driver_state
    }

    pub fn fault_flags(&self) -> &FlagError {
        &self.fault_flags
    }

    pub fn script_flags(&self) -> &FlagError {
        &self.script_flags
    }

    pub fn left_runtime_flags(&self) -> &FlagError {
        &self.left_runtime_flags
    }

    pub fn right_runtime_flags(&self) -> &FlagError {
        &self.right_runtime_flags
    }

    pub fn is_feedback_stale(&self) -> bool {
        self.feedback_stale
    }

    pub fn is_communication_error(&self) -> bool {
        self.communication_error
    }

    /// 任一标志报错或反馈过期
    pub fn is_error(&self) -> bool {
        self.is_flag_error() || self.feedback_stale
    }

    pub fn is_flag_error(&self) -> bool {
        self.fault_flags.is_error()
            || self.script_flags.is_error()
            || self.left_runtime_flags.is_error()
            || self.right_runtime_flags.is_error()
    }

    pub fn error_log(&self) -> String {
        format!(
            "Fault flags: {}Script flags: {}Left motor runtime flags: {}Right motor runtime flags: {}Old data: {}",
            self.fault_flags.error_log(),
            self.script_flags.error_log(),
            self.left_runtime_flags.error_log(),
            self.right_runtime_flags.error_log(),
            self.feedback_stale
        )
    }
}
