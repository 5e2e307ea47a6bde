//! 周期性反馈 PDO 与状态位域
//!
//! Roboteq 把对象 0x2106 的 8 个 32-bit 子索引映射到 4 个 TPDO，
//! 每帧两个小端字：
//!
//! | PDO | Byte 0-3 | Byte 4-7 |
//! |-----|----------|----------|
//! | TPDO1 (0x180+node) | 位置 ch1 | 位置 ch2 |
//! | TPDO2 (0x280+node) | 速度 ch1 | 速度 ch2 |
//! | TPDO3 (0x380+node) | 电流 ch1 | 电流 ch2 |
//! | TPDO4 (0x480+node) | 故障 / 脚本标志 | 运行时标志 |

use crate::ids::{
    FUNCTION_MASK, FUNCTION_TPDO1, FUNCTION_TPDO2, FUNCTION_TPDO3, FUNCTION_TPDO4, cob_id,
};
use crate::{CanFrame, ProtocolError, bytes_to_i32_le, bytes_to_u32_le, word_at};
use bilge::prelude::*;

// ============================================================================
// 状态位域
// ============================================================================

/// 故障标志（0x2106/7 byte 0）
///
/// bilge 默认 LSB first，Bit 0 对应第一个字段。
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct FaultFlags {
    pub overheat: bool,                         // Bit 0
    pub overvoltage: bool,                      // Bit 1
    pub undervoltage: bool,                     // Bit 2
    pub short_circuit: bool,                    // Bit 3
    pub emergency_stop: bool,                   // Bit 4
    pub motor_or_sensor_setup_fault: bool,      // Bit 5
    pub mosfet_failure: bool,                   // Bit 6
    pub default_config_loaded_at_startup: bool, // Bit 7
}

/// 脚本标志（0x2106/7 byte 2）
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct ScriptFlags {
    pub loop_error: bool,           // Bit 0
    pub encoder_disconnected: bool, // Bit 1
    pub amp_limiter: bool,          // Bit 2
    pub reserved: u5,               // Bit 3-7: 保留
}

/// 单通道运行时状态标志（0x2106/8 byte 0 / byte 1）
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct RuntimeFlags {
    pub amps_limit_active: bool,       // Bit 0
    pub motor_stall: bool,             // Bit 1
    pub loop_error: bool,              // Bit 2
    pub safety_stop_active: bool,      // Bit 3
    pub forward_limit_triggered: bool, // Bit 4
    pub reverse_limit_triggered: bool, // Bit 5
    pub amps_trigger_activated: bool,  // Bit 6
    pub reserved: u1,                  // Bit 7: 保留
}

/// 故障标志名称（按位序）
pub const FAULT_FLAG_NAMES: &[&str] = &[
    "overheat",
    "overvoltage",
    "undervoltage",
    "short_circuit",
    "emergency_stop",
    "motor_or_sensor_setup_fault",
    "mosfet_failure",
    "default_config_loaded_at_startup",
];

/// 脚本标志名称（按位序）
pub const SCRIPT_FLAG_NAMES: &[&str] = &["loop_error", "encoder_disconnected", "amp_limiter"];

/// 运行时标志名称（按位序）
pub const RUNTIME_FLAG_NAMES: &[&str] = &[
    "amps_limit_active",
    "motor_stall",
    "loop_error",
    "safety_stop_active",
    "forward_limit_triggered",
    "reverse_limit_triggered",
    "amps_trigger_activated",
];

/// 运行时标志中计入错误的位
///
/// 屏蔽 `amps_limit_active`（bit 0）和 `safety_stop_active`（bit 3）。
pub const RUNTIME_FLAGS_ERROR_MASK: u8 = 0b1111_0110;

// ============================================================================
// 反馈 PDO
// ============================================================================

/// 0x2106/7 中的故障标志字节
pub fn fault_flags_byte(status: u32) -> u8 {
    status.to_le_bytes()[0]
}

/// 0x2106/7 中的脚本标志字节
pub fn script_flags_byte(status: u32) -> u8 {
    status.to_le_bytes()[2]
}

/// 0x2106/8 中通道 1 / 2 的运行时标志字节
pub fn runtime_flags_bytes(runtime: u32) -> [u8; 2] {
    let bytes = runtime.to_le_bytes();
    [bytes[0], bytes[1]]
}

/// 单个反馈 PDO 的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackPdo {
    /// 编码器计数（ch1, ch2）
    Position([i32; 2]),
    /// 转速 RPM（ch1, ch2）
    Velocity([i32; 2]),
    /// 电流 0.1 A（ch1, ch2）
    Current([i32; 2]),
    /// 原始标志字（0x2106/7, 0x2106/8）
    Flags { status: u32, runtime: u32 },
}

impl FeedbackPdo {
    /// TPDO 序号（1..=4）
    pub fn number(&self) -> u8 {
        match self {
            FeedbackPdo::Position(_) => 1,
            FeedbackPdo::Velocity(_) => 2,
            FeedbackPdo::Current(_) => 3,
            FeedbackPdo::Flags { .. } => 4,
        }
    }

    /// 解析 `number` 号 TPDO 的 8 字节数据
    pub fn parse(number: u8, frame: &CanFrame) -> Result<Self, ProtocolError> {
        frame.require_len(8)?;
        let low = word_at(&frame.data, 0);
        let high = word_at(&frame.data, 4);
        let pair = [bytes_to_i32_le(low), bytes_to_i32_le(high)];

        match number {
            1 => Ok(FeedbackPdo::Position(pair)),
            2 => Ok(FeedbackPdo::Velocity(pair)),
            3 => Ok(FeedbackPdo::Current(pair)),
            4 => Ok(FeedbackPdo::Flags {
                status: bytes_to_u32_le(low),
                runtime: bytes_to_u32_le(high),
            }),
            _ => Err(ProtocolError::InvalidCanId { id: frame.id }),
        }
    }

    /// 编码为 `node_id` 发出的 TPDO 帧
    pub fn to_frame(&self, node_id: u8) -> CanFrame {
        let (function, low, high) = match *self {
            FeedbackPdo::Position([a, b]) => (FUNCTION_TPDO1, a.to_le_bytes(), b.to_le_bytes()),
            FeedbackPdo::Velocity([a, b]) => (FUNCTION_TPDO2, a.to_le_bytes(), b.to_le_bytes()),
            FeedbackPdo::Current([a, b]) => (FUNCTION_TPDO3, a.to_le_bytes(), b.to_le_bytes()),
            FeedbackPdo::Flags { status, runtime } => {
                (FUNCTION_TPDO4, status.to_le_bytes(), runtime.to_le_bytes())
            },
        };
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&low);
        data[4..].copy_from_slice(&high);
        CanFrame::new_standard(cob_id(function, node_id) as u16, &data)
    }
}

impl TryFrom<CanFrame> for FeedbackPdo {
    type Error = ProtocolError;

    fn try_from(frame: CanFrame) -> Result<Self, Self::Error> {
        let number = match frame.id & FUNCTION_MASK {
            FUNCTION_TPDO1 => 1,
            FUNCTION_TPDO2 => 2,
            FUNCTION_TPDO3 => 3,
            FUNCTION_TPDO4 => 4,
            _ => return Err(ProtocolError::InvalidCanId { id: frame.id }),
        };
        Self::parse(number, &frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_flags_bit_order() {
        let flags = FaultFlags::from(u8::new(0b0001_0001));
        assert!(flags.overheat());
        assert!(flags.emergency_stop());
        assert!(!flags.overvoltage());
        assert!(!flags.default_config_loaded_at_startup());
    }

    #[test]
    fn test_script_flags() {
        let flags = ScriptFlags::from(u8::new(0b0000_0010));
        assert!(flags.encoder_disconnected());
        assert!(!flags.loop_error());
        assert!(!flags.amp_limiter());
    }

    #[test]
    fn test_runtime_flags_mask() {
        let flags = RuntimeFlags::from(u8::new(0b0000_1001));
        assert!(flags.amps_limit_active());
        assert!(flags.safety_stop_active());
        // 两个屏蔽位都不计入错误
        assert_eq!(0b0000_1001 & RUNTIME_FLAGS_ERROR_MASK, 0);
        assert_ne!(0b0000_0010 & RUNTIME_FLAGS_ERROR_MASK, 0);
    }

    #[test]
    fn test_flag_names_match_bit_count() {
        assert_eq!(FAULT_FLAG_NAMES.len(), 8);
        assert_eq!(SCRIPT_FLAG_NAMES.len(), 3);
        assert_eq!(RUNTIME_FLAG_NAMES.len(), 7);
        assert_eq!(RUNTIME_FLAG_NAMES[3], "safety_stop_active");
    }

    #[test]
    fn test_flag_byte_extraction() {
        let status = u32::from_le_bytes([0x12, 0xAA, 0x04, 0x00]);
        assert_eq!(fault_flags_byte(status), 0x12);
        assert_eq!(script_flags_byte(status), 0x04);

        let runtime = u32::from_le_bytes([0x02, 0x40, 0x00, 0x00]);
        assert_eq!(runtime_flags_bytes(runtime), [0x02, 0x40]);
    }

    #[test]
    fn test_parse_position_pdo() {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&(-1600i32).to_le_bytes());
        data[4..].copy_from_slice(&3200i32.to_le_bytes());
        let frame = CanFrame::new_standard(0x181, &data);

        let pdo = FeedbackPdo::try_from(frame).unwrap();
        assert_eq!(pdo, FeedbackPdo::Position([-1600, 3200]));
        assert_eq!(pdo.number(), 1);
    }

    #[test]
    fn test_pdo_to_frame_ids() {
        assert_eq!(FeedbackPdo::Velocity([1, 2]).to_frame(2).id, 0x282);
        assert_eq!(FeedbackPdo::Current([1, 2]).to_frame(1).id, 0x381);
        let frame = FeedbackPdo::Flags {
            status: 0x0004_0012,
            runtime: 0x0000_4002,
        }
        .to_frame(1);
        assert_eq!(frame.id, 0x481);
        assert_eq!(frame.data, [0x12, 0x00, 0x04, 0x00, 0x02, 0x40, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_rejects_short_or_foreign() {
        let frame = CanFrame::new_standard(0x181, &[0, 1, 2, 3]);
        assert!(matches!(
            FeedbackPdo::try_from(frame),
            Err(ProtocolError::InvalidLength { .. })
        ));
        let frame = CanFrame::new_standard(0x581, &[0; 8]);
        assert_eq!(
            FeedbackPdo::try_from(frame),
            Err(ProtocolError::InvalidCanId { id: 0x581 })
        );
    }
}
