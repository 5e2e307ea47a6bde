//! SocketCAN 适配器实现
//!
//! 基于 Linux 内核 SocketCAN 子系统。波特率由系统工具配置：
//!
//! ```text
//! sudo ip link set can0 type can bitrate 1000000
//! sudo ip link set up can0
//! ```
//!
//! 错误帧会被订阅：Bus Off 与控制器故障（error passive、缓冲区溢出等）转换为
//! [`CanError`]，供总线会话锁存 CAN 错误；其余错误帧记录日志后忽略。

use crate::{CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError, CanFrame};
use ::socketcan::{
    BlockingCan, CanError as SocketCanError, CanErrorFrame, CanFrame as RawCanFrame, CanSocket,
    EmbeddedFrame, ExtendedId, Frame, Socket, StandardId,
};
use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{error, trace, warn};

mod interface_check;

pub use interface_check::check_interface_status;

/// SO_RCVTIMEO 为 0 表示无限阻塞，用最小超时模拟非阻塞读
const MIN_READ_TIMEOUT: Duration = Duration::from_micros(100);

/// 默认读超时，保证会话线程能及时响应退出信号
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2);

/// SocketCAN 适配器
///
/// # 示例
///
/// ```no_run
/// use panther_can::{CanAdapter, CanFrame, SocketCanAdapter};
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
/// adapter.send(CanFrame::new_standard(0x000, &[0x82, 0x01])).unwrap();
/// let frame = adapter.receive().unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 打开 CAN 接口
    ///
    /// 打开前检查接口是否存在且已启动。
    ///
    /// # 错误
    /// - `CanError::Device`: 接口不存在 / 未启动 / 无法打开
    /// - `CanError::Io`: 系统调用失败
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();

        if !check_interface_status(&interface)? {
            return Err(CanDeviceError::new(
                CanDeviceErrorKind::NotUp,
                format!(
                    "CAN interface '{}' exists but is not UP. Please start it first:\n  sudo ip link set up {}",
                    interface, interface
                ),
            )
            .into());
        }

        let socket = CanSocket::open(&interface).map_err(|e| {
            let kind = if e.kind() == io::ErrorKind::PermissionDenied {
                CanDeviceErrorKind::AccessDenied
            } else {
                CanDeviceErrorKind::Backend
            };
            CanDeviceError::new(
                kind,
                format!("Failed to open CAN interface '{}': {}", interface, e),
            )
        })?;

        // 订阅所有错误帧
        let err_mask: libc::can_err_mask_t = libc::CAN_ERR_MASK;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_ERR_FILTER,
                &err_mask as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::can_err_mask_t>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!(
                "Failed to enable error frames on '{}': {}, bus faults will only surface as IO errors",
                interface,
                io::Error::last_os_error()
            );
        }

        socket
            .set_read_timeout(DEFAULT_READ_TIMEOUT)
            .map_err(CanError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);
        Ok(Self {
            socket,
            interface,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    /// 接口名称
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// 设置读超时
    ///
    /// # 错误
    /// - `CanError::Io`: setsockopt 失败
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        let timeout = timeout.max(MIN_READ_TIMEOUT);
        if timeout == self.read_timeout {
            return Ok(());
        }
        self.socket.set_read_timeout(timeout).map_err(CanError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }

    /// 把错误帧转换为适配层错误
    ///
    /// 返回 `None` 表示该错误帧可以忽略。
    fn classify_error_frame(error_frame: CanErrorFrame) -> Option<CanError> {
        let socketcan_error = SocketCanError::from(error_frame);
        match &socketcan_error {
            SocketCanError::BusOff => {
                error!("CAN Bus Off error detected");
                Some(CanError::BusOff)
            },
            SocketCanError::ControllerProblem(problem) => {
                let problem_str = format!("{}", problem);
                if problem_str.to_lowercase().contains("overflow") {
                    error!("CAN Buffer Overflow detected: {}", problem);
                    Some(CanError::BufferOverflow)
                } else {
                    warn!("CAN Controller Problem: {}", problem);
                    Some(CanError::ErrorFrame(problem_str))
                }
            },
            _ => {
                warn!("CAN Error Frame received: {}, ignoring", socketcan_error);
                None
            },
        }
    }

    fn to_raw_frame(frame: &CanFrame) -> Result<RawCanFrame, CanError> {
        let data = frame.data_slice();
        let raw = if frame.is_extended {
            ExtendedId::new(frame.id).and_then(|id| RawCanFrame::new(id, data))
        } else {
            StandardId::new(frame.id as u16).and_then(|id| RawCanFrame::new(id, data))
        };
        raw.ok_or_else(|| {
            CanDeviceError::new(
                CanDeviceErrorKind::InvalidFrame,
                format!("Failed to create frame with ID 0x{:X}", frame.id),
            )
            .into()
        })
    }
}

impl Drop for SocketCanAdapter {
    fn drop(&mut self) {
        trace!("[Auto-Drop] SocketCAN interface '{}' closed", self.interface);
    }
}

impl CanAdapter for SocketCanAdapter {
    /// 发送帧（Fire-and-Forget）
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        let raw = Self::to_raw_frame(&frame)?;
        self.socket.transmit(&raw).map_err(|e| {
            CanError::Io(io::Error::other(format!("SocketCAN transmit error: {}", e)))
        })?;
        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    /// 接收数据帧，错误帧按 [`Self::classify_error_frame`] 处理
    ///
    /// # 错误
    /// - `CanError::Timeout`: 读超时（可重试）
    /// - `CanError::BusOff` / `BufferOverflow` / `ErrorFrame`: 控制器报告的总线故障
    /// - `CanError::Io`: IO 错误
    fn receive(&mut self) -> Result<CanFrame, CanError> {
        loop {
            let raw = match self.socket.read_frame() {
                Ok(raw) => raw,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(CanError::Timeout);
                },
                Err(e) => return Err(CanError::Io(e)),
            };

            if raw.is_error_frame() {
                match CanErrorFrame::try_from(raw) {
                    Ok(error_frame) => match Self::classify_error_frame(error_frame) {
                        Some(err) => return Err(err),
                        None => continue,
                    },
                    Err(_) => {
                        warn!("Received CAN error frame but failed to parse, ignoring");
                        continue;
                    },
                }
            }

            let mut frame = if raw.is_extended() {
                CanFrame::new_extended(raw.raw_id(), raw.data())
            } else {
                CanFrame::new_standard(raw.raw_id() as u16, raw.data())
            };
            frame.len = raw.dlc().min(8) as u8;

            trace!("Received CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
            return Ok(frame);
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!("Failed to set receive timeout: {}", e);
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<CanFrame, CanError> {
        self.set_read_timeout(timeout)?;
        self.receive()
    }
}
