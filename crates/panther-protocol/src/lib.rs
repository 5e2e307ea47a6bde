//! # Panther Protocol
//!
//! Roboteq 电机控制器的 CANopen 协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `ids`: COB-ID 功能码与节点号
//! - `od`: 对象字典地址（index / sub-index）
//! - `sdo`: SDO 加速传输编解码
//! - `nmt`: NMT 命令、boot-up / 心跳、EMCY 帧
//! - `feedback`: 周期性反馈 PDO 与状态位域
//!
//! ## 字节序
//!
//! CANopen 使用小端字节序（LSB 在前），本模块提供了对应的转换工具函数。

pub mod feedback;
pub mod ids;
pub mod nmt;
pub mod od;
pub mod sdo;

// 重新导出常用类型
pub use feedback::*;
pub use ids::*;
pub use nmt::*;
pub use od::*;
pub use sdo::*;

/// CAN 2.0 标准帧的统一抽象
///
/// 协议层和硬件层之间的中间类型：协议层只构建 / 解析 `CanFrame`，
/// 具体的 SocketCAN 或 mock 转换在 `panther-can` 中完成。
///
/// # 设计特性
///
/// - **Copy trait**：零成本复制
/// - **固定 8 字节**：避免堆分配
/// - **时间戳支持**：`timestamp_us` 由适配器填充，0 表示不可用
///
/// ```rust
/// use panther_protocol::CanFrame;
///
/// let frame = CanFrame::new_standard(0x601, &[0x40, 0x00, 0x10, 0x00]);
/// assert_eq!(frame.id(), 0x601);
/// assert_eq!(frame.data_slice(), &[0x40, 0x00, 0x10, 0x00]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN ID（标准帧 11-bit）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,

    /// 时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl CanFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id, data, true)
    }

    fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
            timestamp_us: 0,
        }
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 获取完整数据（8字节固定数组）
    pub fn data(&self) -> &[u8; 8] {
        &self.data
    }

    /// 校验最小数据长度
    pub(crate) fn require_len(&self, expected: usize) -> Result<(), ProtocolError> {
        if (self.len as usize) < expected {
            return Err(ProtocolError::InvalidLength {
                expected,
                actual: self.len as usize,
            });
        }
        Ok(())
    }
}

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidCanId { id: u32 },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u8 },

    #[error("Unsupported SDO transfer: command specifier 0x{0:02X}")]
    UnsupportedTransfer(u8),
}

/// 小端字节序转 i32
pub fn bytes_to_i32_le(bytes: [u8; 4]) -> i32 {
    i32::from_le_bytes(bytes)
}

/// 小端字节序转 u32
pub fn bytes_to_u32_le(bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// 小端字节序转 u16
pub fn bytes_to_u16_le(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}

/// 从 8 字节数据中按偏移读取 4 字节
pub(crate) fn word_at(data: &[u8; 8], offset: usize) -> [u8; 4] {
    [
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_standard_truncates_to_eight_bytes() {
        let frame = CanFrame::new_standard(0x181, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!frame.is_extended);
        assert_eq!(frame.timestamp_us, 0);
    }

    #[test]
    fn test_data_slice_only_valid_bytes() {
        let frame = CanFrame::new_standard(0x701, &[0x00]);
        assert_eq!(frame.data_slice(), &[0x00]);
        assert_eq!(frame.data()[1..], [0u8; 7]);
    }

    #[test]
    fn test_require_len() {
        let frame = CanFrame::new_standard(0x581, &[0x60, 0x00]);
        assert!(frame.require_len(2).is_ok());
        assert_eq!(
            frame.require_len(8),
            Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: 2
            })
        );
    }

    #[test]
    fn test_bytes_to_i32_le_negative() {
        assert_eq!(bytes_to_i32_le([0xFF, 0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(bytes_to_i32_le([0x78, 0x56, 0x34, 0x12]), 0x12345678);
    }

    #[test]
    fn test_bytes_to_u16_le() {
        assert_eq!(bytes_to_u16_le([0x34, 0x12]), 0x1234);
        assert_eq!(bytes_to_u32_le([0x01, 0x00, 0x00, 0x00]), 1);
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidCanId { id: 0x7FF };
        assert_eq!(format!("{}", err), "Invalid CAN ID: 0x7FF");
        let err = ProtocolError::UnsupportedTransfer(0x41);
        assert!(format!("{}", err).contains("0x41"));
    }
}
