//! NMT 命令、boot-up / 心跳、EMCY 帧

use crate::ids::{COB_NMT, FUNCTION_EMCY, FUNCTION_HEARTBEAT, cob_id};
use crate::{CanFrame, ProtocolError, bytes_to_u16_le};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

/// NMT 命令（COB-ID 0x000，data = [command, node_id]）
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NmtCommand {
    Start = 0x01,
    Stop = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

/// 从站 NMT 状态（心跳报文 byte 0）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NmtState {
    BootUp = 0x00,
    Stopped = 0x04,
    Operational = 0x05,
    PreOperational = 0x7F,
    #[default]
    Unknown = 0xFF,
}

/// 构建 NMT 命令帧，`node_id = 0` 表示广播
pub fn nmt_frame(command: NmtCommand, node_id: u8) -> CanFrame {
    CanFrame::new_standard(COB_NMT as u16, &[command.into(), node_id])
}

/// 解析 NMT 命令帧，返回 (命令, 目标节点)
pub fn parse_nmt(frame: &CanFrame) -> Result<(NmtCommand, u8), ProtocolError> {
    if frame.id != COB_NMT {
        return Err(ProtocolError::InvalidCanId { id: frame.id });
    }
    frame.require_len(2)?;
    let command =
        NmtCommand::try_from(frame.data[0]).map_err(|e| ProtocolError::InvalidValue {
            field: "nmt_command".to_string(),
            value: e.number,
        })?;
    Ok((command, frame.data[1]))
}

/// 心跳帧（COB-ID 0x700 + node）
pub fn heartbeat_frame(node_id: u8, state: NmtState) -> CanFrame {
    CanFrame::new_standard(cob_id(FUNCTION_HEARTBEAT, node_id) as u16, &[state.into()])
}

/// boot-up 报文：状态为 0x00 的心跳帧
pub fn boot_up_frame(node_id: u8) -> CanFrame {
    heartbeat_frame(node_id, NmtState::BootUp)
}

/// 解析心跳 / boot-up 帧中的节点状态
pub fn parse_heartbeat(frame: &CanFrame) -> Result<NmtState, ProtocolError> {
    if frame.id & 0x780 != FUNCTION_HEARTBEAT {
        return Err(ProtocolError::InvalidCanId { id: frame.id });
    }
    frame.require_len(1)?;
    Ok(NmtState::from(frame.data[0] & 0x7F))
}

/// 紧急报文（EMCY，COB-ID 0x080 + node）
///
/// | Byte | 含义 |
/// |------|------|
/// | 0-1 | 错误码（小端） |
/// | 2 | 错误寄存器（对象 0x1001） |
/// | 3-7 | 厂商自定义 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Emergency {
    pub error_code: u16,
    pub error_register: u8,
    pub vendor: [u8; 5],
}

impl Emergency {
    pub fn new(error_code: u16, error_register: u8) -> Self {
        Self {
            error_code,
            error_register,
            vendor: [0; 5],
        }
    }

    /// 错误码 0x0000 表示错误复位 / 无错误
    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    pub fn to_frame(&self, node_id: u8) -> CanFrame {
        let code = self.error_code.to_le_bytes();
        let mut data = [0u8; 8];
        data[0] = code[0];
        data[1] = code[1];
        data[2] = self.error_register;
        data[3..].copy_from_slice(&self.vendor);
        CanFrame::new_standard(cob_id(FUNCTION_EMCY, node_id) as u16, &data)
    }
}

impl TryFrom<CanFrame> for Emergency {
    type Error = ProtocolError;

    fn try_from(frame: CanFrame) -> Result<Self, Self::Error> {
        if frame.id & 0x780 != FUNCTION_EMCY || frame.id == FUNCTION_EMCY {
            return Err(ProtocolError::InvalidCanId { id: frame.id });
        }
        frame.require_len(3)?;

        let mut vendor = [0u8; 5];
        vendor.copy_from_slice(&frame.data[3..8]);
        Ok(Self {
            error_code: bytes_to_u16_le([frame.data[0], frame.data[1]]),
            error_register: frame.data[2],
            vendor,
        })
    }
}
