//! 驱动层错误类型定义

use panther_can::CanError;
use panther_protocol::{ObjectAddress, ProtocolError};
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 从站未完成 boot 握手或报告了故障
    #[error("Boot of node {node_id} failed: {reason}")]
    BootFailure { node_id: u8, reason: String },

    /// 设备类型 / 厂商 ID 与期望值不一致
    #[error(
        "Identity mismatch on node {node_id} at {address}: expected 0x{expected:08X}, got 0x{actual:08X}"
    )]
    IdentityMismatch {
        node_id: u8,
        address: ObjectAddress,
        expected: u32,
        actual: u32,
    },

    /// 同步 SDO 读写超时
    #[error("SDO operation on node {node_id} at {address} timed out")]
    OperationTimeout { node_id: u8, address: ObjectAddress },

    /// 从站中止了 SDO 传输
    #[error("SDO transfer on node {node_id} at {address} aborted with code 0x{code:08X}")]
    SdoAbort {
        node_id: u8,
        address: ObjectAddress,
        code: u32,
    },

    /// 总线级通信故障
    #[error("Communication error: {0}")]
    CommunicationError(String),

    /// 指令超出 ±1000
    #[error("Command {value} out of range [-{max}, {max}]")]
    CommandOutOfRange { value: i32, max: i32 },

    /// 节点未处于 booted 状态
    #[error("Node {node_id} is not booted")]
    NotBooted { node_id: u8 },

    /// 控制器未初始化
    #[error("CANopen controller not initialized")]
    NotInitialized,

    /// 配置无效
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// CAN 驱动错误
    #[error("CAN driver error: {0}")]
    Can(#[from] CanError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 命令通道已关闭（总线线程退出）
    #[error("Command channel closed")]
    ChannelClosed,

    /// 总线线程错误
    #[error("IO thread error: {0}")]
    IoThread(String),
}

impl DriverError {
    /// 是否为通信类错误（超时、中止、总线故障）
    ///
    /// 上层的错误过滤器据此累计读写失败次数。
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            DriverError::OperationTimeout { .. }
                | DriverError::SdoAbort { .. }
                | DriverError::CommunicationError(_)
                | DriverError::Can(_)
                | DriverError::ChannelClosed
        )
    }
}
