//! Roboteq 对象字典地址
//!
//! 地址由 16-bit index 与 8-bit sub-index 组成，固件稳定，两台控制器相同。

use std::fmt;

/// 对象字典地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectAddress {
    pub index: u16,
    pub sub_index: u8,
}

impl ObjectAddress {
    pub const fn new(index: u16, sub_index: u8) -> Self {
        Self { index, sub_index }
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}/{}", self.index, self.sub_index)
    }
}

// ============================================================================
// 身份校验
// ============================================================================

/// 设备类型
pub const DEVICE_TYPE: ObjectAddress = ObjectAddress::new(0x1000, 0);

/// 厂商 ID（Identity object 0x1018 sub 1）
pub const VENDOR_ID: ObjectAddress = ObjectAddress::new(0x1018, 1);

// ============================================================================
// 指令
// ============================================================================

/// 通道 1 / 2 速度指令（i32，范围 ±[`MAX_COMMAND`]）
pub const COMMAND_CHANNEL_1: ObjectAddress = ObjectAddress::new(0x2000, 1);
pub const COMMAND_CHANNEL_2: ObjectAddress = ObjectAddress::new(0x2000, 2);

/// 重置 MicroBasic 脚本（u8，写入 [`RESET_SCRIPT_VALUE`]）
pub const RESET_SCRIPT: ObjectAddress = ObjectAddress::new(0x2018, 0);
pub const RESET_SCRIPT_VALUE: u8 = 2;

/// Cmd_ESTOP（u8，写 1）
pub const TURN_ON_ESTOP: ObjectAddress = ObjectAddress::new(0x200C, 0);

/// Cmd_MGO，释放 E-Stop（u8，写 1）
pub const TURN_OFF_ESTOP: ObjectAddress = ObjectAddress::new(0x200D, 0);

/// E-Stop 开关指令写入值
pub const ESTOP_COMMAND_VALUE: u8 = 1;

/// Cmd_SFT，通道安全停止（u8，写通道号 1 / 2）
pub const SAFETY_STOP: ObjectAddress = ObjectAddress::new(0x202C, 0);

/// 指令范围上限（对称）
pub const MAX_COMMAND: i32 = 1000;

// ============================================================================
// 周期性反馈（0x2106，由 TPDO 映射）
// ============================================================================

pub const FEEDBACK_INDEX: u16 = 0x2106;

pub const POSITION_CHANNEL_1: ObjectAddress = ObjectAddress::new(FEEDBACK_INDEX, 1);
pub const POSITION_CHANNEL_2: ObjectAddress = ObjectAddress::new(FEEDBACK_INDEX, 2);
pub const VELOCITY_CHANNEL_1: ObjectAddress = ObjectAddress::new(FEEDBACK_INDEX, 3);
pub const VELOCITY_CHANNEL_2: ObjectAddress = ObjectAddress::new(FEEDBACK_INDEX, 4);
pub const CURRENT_CHANNEL_1: ObjectAddress = ObjectAddress::new(FEEDBACK_INDEX, 5);
pub const CURRENT_CHANNEL_2: ObjectAddress = ObjectAddress::new(FEEDBACK_INDEX, 6);

/// 故障标志（byte 0）+ 脚本标志（byte 2）
pub const STATUS_FLAGS: ObjectAddress = ObjectAddress::new(FEEDBACK_INDEX, 7);

/// 运行时状态标志（byte 0 = 通道 1，byte 1 = 通道 2）
pub const RUNTIME_FLAGS: ObjectAddress = ObjectAddress::new(FEEDBACK_INDEX, 8);

// ============================================================================
// 辅助状态（SDO 读取，仅用于诊断）
// ============================================================================

/// 温度（i8，°C）
pub const TEMPERATURE: ObjectAddress = ObjectAddress::new(0x210F, 1);

/// 电池电压（u16，0.1 V）
pub const VOLTAGE: ObjectAddress = ObjectAddress::new(0x210D, 2);

/// 电池电流（i16，0.1 A）
pub const BATTERY_CURRENT_1: ObjectAddress = ObjectAddress::new(0x210C, 1);
pub const BATTERY_CURRENT_2: ObjectAddress = ObjectAddress::new(0x210C, 2);

/// 电机通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// 通道 1（右侧车轮）
    One,
    /// 通道 2（左侧车轮）
    Two,
}

impl Channel {
    /// 协议中的通道号
    pub const fn number(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }

    pub const fn command_address(self) -> ObjectAddress {
        match self {
            Channel::One => COMMAND_CHANNEL_1,
            Channel::Two => COMMAND_CHANNEL_2,
        }
    }

    pub const fn battery_current_address(self) -> ObjectAddress {
        match self {
            Channel::One => BATTERY_CURRENT_1,
            Channel::Two => BATTERY_CURRENT_2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", VENDOR_ID), "0x1018/1");
        assert_eq!(format!("{}", TURN_ON_ESTOP), "0x200C/0");
    }

    #[test]
    fn test_feedback_layout() {
        // 位置 1/2，速度 3/4，电流 5/6，标志 7/8
        assert_eq!(POSITION_CHANNEL_2.sub_index, 2);
        assert_eq!(VELOCITY_CHANNEL_1.sub_index, 3);
        assert_eq!(CURRENT_CHANNEL_2.sub_index, 6);
        assert_eq!(RUNTIME_FLAGS, ObjectAddress::new(0x2106, 8));
    }

    #[test]
    fn test_channel_addresses() {
        assert_eq!(Channel::One.number(), 1);
        assert_eq!(Channel::Two.command_address(), ObjectAddress::new(0x2000, 2));
        assert_eq!(
            Channel::Two.battery_current_address(),
            ObjectAddress::new(0x210C, 2)
        );
    }
}
