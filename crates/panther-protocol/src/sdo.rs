//! SDO 加速传输（expedited transfer）编解码
//!
//! 帧布局固定 8 字节：
//!
//! | Byte | 含义 |
//! |------|------|
//! | 0 | 命令字（高 3 位为命令说明符） |
//! | 1-2 | index（小端） |
//! | 3 | sub-index |
//! | 4-7 | 数据（小端，不足 4 字节补 0） |
//!
//! 只支持 ≤ 4 字节的加速传输；分段 / 块传输返回 [`ProtocolError::UnsupportedTransfer`]。

use crate::ids::{FUNCTION_SDO_RX, FUNCTION_SDO_TX, cob_id};
use crate::od::ObjectAddress;
use crate::{CanFrame, ProtocolError, bytes_to_u32_le, word_at};

/// SDO 帧长度
pub const SDO_FRAME_LEN: usize = 8;

/// 中止码：SDO 协议超时（主站取消时发送）
pub const SDO_ABORT_TIMEOUT: u32 = 0x0504_0000;

/// 中止码：对象字典中不存在该对象
pub const SDO_ABORT_OBJECT_NOT_EXIST: u32 = 0x0602_0000;

/// 中止码：通用错误
pub const SDO_ABORT_GENERAL_ERROR: u32 = 0x0800_0000;

// 命令说明符（byte 0 高 3 位）
const CCS_DOWNLOAD: u8 = 1;
const CCS_UPLOAD: u8 = 2;
const SCS_UPLOAD: u8 = 2;
const SCS_DOWNLOAD: u8 = 3;
const CS_ABORT: u8 = 4;

const UPLOAD_REQUEST: u8 = 0x40;
const DOWNLOAD_RESPONSE: u8 = 0x60;
const ABORT: u8 = 0x80;

// expedited (e) + size indicated (s)
const EXPEDITED_SIZED: u8 = 0x03;

/// 可通过 SDO 加速传输的值类型
///
/// 值以小端写入数据区的前 `SIZE` 字节。
pub trait SdoValue: Copy + Send + 'static {
    /// 数据宽度（字节）
    const SIZE: usize;

    fn to_raw(self) -> [u8; 4];

    fn from_raw(raw: [u8; 4]) -> Self;
}

macro_rules! impl_sdo_value {
    ($($ty:ty),*) => {
        $(
            impl SdoValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn to_raw(self) -> [u8; 4] {
                    let mut raw = [0u8; 4];
                    raw[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                    raw
                }

                fn from_raw(raw: [u8; 4]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                    bytes.copy_from_slice(&raw[..Self::SIZE]);
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_sdo_value!(i8, u8, i16, u16, i32, u32);

/// 主站 -> 从站 SDO 请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    /// 读取（upload）
    Upload { address: ObjectAddress },
    /// 写入（download），`size` 为 1..=4
    Download {
        address: ObjectAddress,
        data: [u8; 4],
        size: u8,
    },
    /// 中止当前传输
    Abort { address: ObjectAddress, code: u32 },
}

/// 从站 -> 主站 SDO 响应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoResponse {
    /// 读取结果
    Upload {
        address: ObjectAddress,
        data: [u8; 4],
        size: u8,
    },
    /// 写入确认
    DownloadAck { address: ObjectAddress },
    /// 从站中止
    Abort { address: ObjectAddress, code: u32 },
}

impl SdoRequest {
    pub fn upload(address: ObjectAddress) -> Self {
        SdoRequest::Upload { address }
    }

    pub fn download<T: SdoValue>(address: ObjectAddress, value: T) -> Self {
        SdoRequest::Download {
            address,
            data: value.to_raw(),
            size: T::SIZE as u8,
        }
    }

    pub fn abort(address: ObjectAddress, code: u32) -> Self {
        SdoRequest::Abort { address, code }
    }

    pub fn address(&self) -> ObjectAddress {
        match *self {
            SdoRequest::Upload { address }
            | SdoRequest::Download { address, .. }
            | SdoRequest::Abort { address, .. } => address,
        }
    }

    /// 编码为发往 `node_id` 的请求帧（COB-ID 0x600 + node）
    pub fn to_frame(&self, node_id: u8) -> CanFrame {
        let (command, address, data) = match *self {
            SdoRequest::Upload { address } => (UPLOAD_REQUEST, address, [0u8; 4]),
            SdoRequest::Download {
                address,
                data,
                size,
            } => (expedited_command(CCS_DOWNLOAD, size), address, data),
            SdoRequest::Abort { address, code } => (ABORT, address, code.to_le_bytes()),
        };
        build_frame(cob_id(FUNCTION_SDO_RX, node_id), command, address, data)
    }

    /// 解析请求帧（从站侧使用）
    pub fn parse(frame: &CanFrame) -> Result<Self, ProtocolError> {
        frame.require_len(SDO_FRAME_LEN)?;
        let command = frame.data[0];
        let address = parse_address(&frame.data);
        let payload = word_at(&frame.data, 4);

        match command >> 5 {
            CCS_UPLOAD => Ok(SdoRequest::Upload { address }),
            CCS_DOWNLOAD => {
                let size = expedited_size(command)?;
                Ok(SdoRequest::Download {
                    address,
                    data: payload,
                    size,
                })
            },
            CS_ABORT => Ok(SdoRequest::Abort {
                address,
                code: bytes_to_u32_le(payload),
            }),
            _ => Err(ProtocolError::UnsupportedTransfer(command)),
        }
    }
}

impl SdoResponse {
    pub fn address(&self) -> ObjectAddress {
        match *self {
            SdoResponse::Upload { address, .. }
            | SdoResponse::DownloadAck { address }
            | SdoResponse::Abort { address, .. } => address,
        }
    }

    /// 按 `T` 的宽度解码上传数据
    ///
    /// # 错误
    ///
    /// - 响应不是 upload 结果：`InvalidValue`
    /// - 数据宽度与 `T::SIZE` 不一致：`InvalidLength`
    pub fn value<T: SdoValue>(&self) -> Result<T, ProtocolError> {
        match *self {
            SdoResponse::Upload { data, size, .. } => {
                if size as usize != T::SIZE {
                    return Err(ProtocolError::InvalidLength {
                        expected: T::SIZE,
                        actual: size as usize,
                    });
                }
                Ok(T::from_raw(data))
            },
            SdoResponse::DownloadAck { .. } => Err(ProtocolError::InvalidValue {
                field: "sdo_response".to_string(),
                value: DOWNLOAD_RESPONSE,
            }),
            SdoResponse::Abort { .. } => Err(ProtocolError::InvalidValue {
                field: "sdo_response".to_string(),
                value: ABORT,
            }),
        }
    }

    /// 编码为 `node_id` 发出的响应帧（COB-ID 0x580 + node）
    pub fn to_frame(&self, node_id: u8) -> CanFrame {
        let (command, address, data) = match *self {
            SdoResponse::Upload {
                address,
                data,
                size,
            } => (expedited_command(SCS_UPLOAD, size), address, data),
            SdoResponse::DownloadAck { address } => (DOWNLOAD_RESPONSE, address, [0u8; 4]),
            SdoResponse::Abort { address, code } => (ABORT, address, code.to_le_bytes()),
        };
        build_frame(cob_id(FUNCTION_SDO_TX, node_id), command, address, data)
    }

    /// 解析响应帧（主站侧使用）
    pub fn parse(frame: &CanFrame) -> Result<Self, ProtocolError> {
        frame.require_len(SDO_FRAME_LEN)?;
        let command = frame.data[0];
        let address = parse_address(&frame.data);
        let payload = word_at(&frame.data, 4);

        match command >> 5 {
            SCS_UPLOAD => {
                let size = expedited_size(command)?;
                Ok(SdoResponse::Upload {
                    address,
                    data: payload,
                    size,
                })
            },
            SCS_DOWNLOAD => Ok(SdoResponse::DownloadAck { address }),
            CS_ABORT => Ok(SdoResponse::Abort {
                address,
                code: bytes_to_u32_le(payload),
            }),
            _ => Err(ProtocolError::UnsupportedTransfer(command)),
        }
    }
}

fn expedited_command(specifier: u8, size: u8) -> u8 {
    let size = size.clamp(1, 4);
    (specifier << 5) | ((4 - size) << 2) | EXPEDITED_SIZED
}

/// 从命令字解析加速传输数据宽度
///
/// e = 0 表示分段传输，不支持；s = 0 时宽度未指定，按 4 字节处理。
fn expedited_size(command: u8) -> Result<u8, ProtocolError> {
    let expedited = command & 0x02 != 0;
    let size_indicated = command & 0x01 != 0;
    if !expedited {
        return Err(ProtocolError::UnsupportedTransfer(command));
    }
    if size_indicated {
        Ok(4 - ((command >> 2) & 0x03))
    } else {
        Ok(4)
    }
}

fn parse_address(data: &[u8; 8]) -> ObjectAddress {
    ObjectAddress::new(u16::from_le_bytes([data[1], data[2]]), data[3])
}

fn build_frame(id: u32, command: u8, address: ObjectAddress, payload: [u8; 4]) -> CanFrame {
    let index = address.index.to_le_bytes();
    let data = [
        command,
        index[0],
        index[1],
        address.sub_index,
        payload[0],
        payload[1],
        payload[2],
        payload[3],
    ];
    CanFrame::new_standard(id as u16, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{COMMAND_CHANNEL_1, DEVICE_TYPE, RESET_SCRIPT, TEMPERATURE, VOLTAGE};

    #[test]
    fn test_upload_request_frame() {
        let frame = SdoRequest::upload(DEVICE_TYPE).to_frame(1);
        assert_eq!(frame.id, 0x601);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data, [0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn test_download_request_command_byte() {
        // 4 字节 -> 0x23，1 字节 -> 0x2F
        let frame = SdoRequest::download(COMMAND_CHANNEL_1, -1i32).to_frame(2);
        assert_eq!(frame.id, 0x602);
        assert_eq!(frame.data, [0x23, 0x00, 0x20, 0x01, 0xFF, 0xFF, 0xFF, 0xFF]);

        let frame = SdoRequest::download(RESET_SCRIPT, 2u8).to_frame(1);
        assert_eq!(frame.data, [0x2F, 0x18, 0x20, 0x00, 0x02, 0, 0, 0]);

        let frame = SdoRequest::download(VOLTAGE, 0x1234u16).to_frame(1);
        assert_eq!(frame.data[0], 0x2B);
        assert_eq!(&frame.data[4..6], &[0x34, 0x12]);
    }

    #[test]
    fn test_parse_download_request() {
        let frame = SdoRequest::download(COMMAND_CHANNEL_1, 500i32).to_frame(1);
        let request = SdoRequest::parse(&frame).unwrap();
        assert_eq!(request, SdoRequest::download(COMMAND_CHANNEL_1, 500i32));
        assert_eq!(request.address(), COMMAND_CHANNEL_1);
    }

    #[test]
    fn test_parse_upload_response_with_size() {
        // 0x4F：1 字节有效数据
        let frame = CanFrame::new_standard(0x581, &[0x4F, 0x0F, 0x21, 0x01, 0xE7, 0, 0, 0]);
        let response = SdoResponse::parse(&frame).unwrap();
        assert_eq!(response.address(), TEMPERATURE);
        assert_eq!(response.value::<i8>().unwrap(), -25);
        // 宽度不匹配
        assert_eq!(
            response.value::<i32>(),
            Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: 1
            })
        );
    }

    #[test]
    fn test_parse_upload_response_without_size() {
        // e=1, s=0：宽度未指定，按 4 字节
        let frame = CanFrame::new_standard(0x581, &[0x42, 0x00, 0x10, 0x00, 1, 0, 0, 0]);
        let response = SdoResponse::parse(&frame).unwrap();
        assert_eq!(response.value::<u32>().unwrap(), 1);
    }

    #[test]
    fn test_parse_segmented_rejected() {
        // 0x41：分段上传初始化
        let frame = CanFrame::new_standard(0x581, &[0x41, 0x00, 0x10, 0x00, 8, 0, 0, 0]);
        assert_eq!(
            SdoResponse::parse(&frame),
            Err(ProtocolError::UnsupportedTransfer(0x41))
        );
    }

    #[test]
    fn test_download_ack_and_abort() {
        let frame = CanFrame::new_standard(0x582, &[0x60, 0x00, 0x20, 0x02, 0, 0, 0, 0]);
        assert_eq!(
            SdoResponse::parse(&frame).unwrap(),
            SdoResponse::DownloadAck {
                address: ObjectAddress::new(0x2000, 2)
            }
        );

        let abort = SdoResponse::Abort {
            address: DEVICE_TYPE,
            code: SDO_ABORT_OBJECT_NOT_EXIST,
        };
        let frame = abort.to_frame(1);
        assert_eq!(frame.id, 0x581);
        assert_eq!(frame.data, [0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x02, 0x06]);
        assert_eq!(SdoResponse::parse(&frame).unwrap(), abort);
        assert!(abort.value::<u32>().is_err());
    }

    #[test]
    fn test_abort_request_frame() {
        let frame = SdoRequest::abort(VOLTAGE, SDO_ABORT_TIMEOUT).to_frame(1);
        assert_eq!(frame.data[0], 0x80);
        assert_eq!(&frame.data[4..], &[0x00, 0x00, 0x04, 0x05]);
        assert_eq!(
            SdoRequest::parse(&frame).unwrap(),
            SdoRequest::Abort {
                address: VOLTAGE,
                code: SDO_ABORT_TIMEOUT
            }
        );
    }

    #[test]
    fn test_short_frame_rejected() {
        let frame = CanFrame::new_standard(0x581, &[0x60, 0x00]);
        assert!(matches!(
            SdoResponse::parse(&frame),
            Err(ProtocolError::InvalidLength { expected: 8, .. })
        ));
    }

    #[test]
    fn test_sdo_value_sign_extension() {
        assert_eq!(i16::from_raw((-300i16).to_raw()), -300);
        assert_eq!((-1i8).to_raw(), [0xFF, 0, 0, 0]);
        assert_eq!(<u16 as SdoValue>::SIZE, 2);
    }
}
