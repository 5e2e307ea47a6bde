//! Roboteq 单元驱动
//!
//! 一个 [`RoboteqDriver`] 对应一个物理电机控制器（前轴或后轴），在总线会话之上提供
//! boot 握手、同步 SDO 读写、反馈缓存读取和速度指令发送。

use crate::error::DriverError;
use crate::session::{ExchangeError, SessionHandle};
use crate::settings::CanOpenSettings;
use crate::state::{BootState, NodeContext, UnitFeedback};
use panther_protocol::{
    COMMAND_CHANNEL_1, COMMAND_CHANNEL_2, Channel, ESTOP_COMMAND_VALUE, MAX_COMMAND,
    ObjectAddress, RESET_SCRIPT, RESET_SCRIPT_VALUE, SAFETY_STOP, SdoRequest, SdoResponse,
    SdoValue, TEMPERATURE, TURN_OFF_ESTOP, TURN_ON_ESTOP, VOLTAGE,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 单个 Roboteq 控制器的驱动
///
/// 读和写各自串行化（同一时间最多一个读、一个写在途），读写之间可以并发。
///
/// # 示例
///
/// ```rust,no_run
/// use panther_driver::CanOpenControllerBuilder;
/// use panther_protocol::Channel;
///
/// let controller = CanOpenControllerBuilder::new().build().unwrap();
/// controller.initialize().unwrap();
///
/// let front = controller.front_driver().unwrap();
/// front.send_command(100, -100).unwrap();
/// let feedback = front.read_feedback();
/// println!("position: {}", feedback.channel(Channel::One).position);
/// ```
pub struct RoboteqDriver {
    node: Arc<NodeContext>,
    session: SessionHandle,
    sdo_timeout: Duration,
    cancel_grace: Duration,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl RoboteqDriver {
    pub(crate) fn new(
        node: Arc<NodeContext>,
        session: SessionHandle,
        settings: &CanOpenSettings,
    ) -> Self {
        Self {
            node,
            session,
            sdo_timeout: settings.sdo_operation_timeout,
            cancel_grace: settings.sdo_cancel_grace,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node.node_id()
    }

    // ============================================================
    // Boot
    // ============================================================

    /// 发起 boot 握手（非阻塞）
    pub fn boot(&self) -> Result<(), DriverError> {
        self.session.boot(self.node_id())
    }

    /// 阻塞等待 boot 完成
    ///
    /// # 错误
    ///
    /// 从站发送 EMCY 或 `timeout` 内没有 boot-up 时返回 `BootFailure`
    pub fn wait_for_boot(&self, timeout: Duration) -> Result<(), DriverError> {
        self.node.wait_for_boot(timeout)
    }

    pub fn is_booted(&self) -> bool {
        self.node.boot_state().is_booted()
    }

    pub fn boot_state(&self) -> BootState {
        self.node.boot_state()
    }

    // ============================================================
    // 同步 SDO
    // ============================================================

    /// 同步读取对象字典
    ///
    /// 阻塞至响应或超时。超时后先请求取消，再等待一个固定宽限期让会话确认，
    /// 总等待时间不超过 `sdo_operation_timeout + sdo_cancel_grace`。
    ///
    /// # 错误
    ///
    /// - `NotBooted`: 节点未完成 boot
    /// - `OperationTimeout`: 超时
    /// - `SdoAbort`: 从站中止传输
    /// - `Protocol`: 响应数据宽度与 `T` 不符
    pub fn sync_read<T: SdoValue>(&self, address: ObjectAddress) -> Result<T, DriverError> {
        self.ensure_booted()?;
        let _guard = self.read_lock.lock();
        let response = self.exchange(SdoRequest::upload(address))?;
        Ok(response.value::<T>()?)
    }

    /// 同步写入对象字典
    ///
    /// 超时语义与 [`sync_read`](Self::sync_read) 相同。
    pub fn sync_write<T: SdoValue>(
        &self,
        address: ObjectAddress,
        value: T,
    ) -> Result<(), DriverError> {
        self.ensure_booted()?;
        let _guard = self.write_lock.lock();
        match self.exchange(SdoRequest::download(address, value))? {
            SdoResponse::DownloadAck { .. } => Ok(()),
            other => Err(DriverError::CommunicationError(format!(
                "unexpected response {:?} to download of {}",
                other, address
            ))),
        }
    }

    fn ensure_booted(&self) -> Result<(), DriverError> {
        if self.is_booted() {
            Ok(())
        } else {
            Err(DriverError::NotBooted {
                node_id: self.node_id(),
            })
        }
    }

    fn exchange(&self, request: SdoRequest) -> Result<SdoResponse, DriverError> {
        let node_id = self.node_id();
        let address = request.address();
        let started = Instant::now();
        let handle = self.session.schedule(node_id, request, self.sdo_timeout)?;

        let reply = match handle.wait(self.sdo_timeout) {
            Some(reply) => reply,
            None => {
                // 会话可能仍会收到迟到的响应，取消后等待确认再返回
                if self.session.cancel(&handle).is_ok() && handle.wait(self.cancel_grace).is_none() {
                    debug!("Cancellation of SDO {} on node {} not acknowledged", address, node_id);
                }
                warn!(
                    "SDO {} on node {} timed out after {:?}",
                    address,
                    node_id,
                    started.elapsed()
                );
                return Err(DriverError::OperationTimeout { node_id, address });
            },
        };

        reply.map_err(|e| match e {
            ExchangeError::TimedOut => DriverError::OperationTimeout { node_id, address },
            ExchangeError::Aborted(code) => DriverError::SdoAbort {
                node_id,
                address,
                code,
            },
            ExchangeError::Cancelled => DriverError::CommunicationError(format!(
                "SDO {} on node {} was cancelled",
                address, node_id
            )),
            ExchangeError::Can(e) => DriverError::CommunicationError(format!(
                "SDO {} on node {} failed: {}",
                address, node_id, e
            )),
            ExchangeError::Protocol(e) => DriverError::Protocol(e),
            ExchangeError::SessionClosed => DriverError::ChannelClosed,
        })
    }

    // ============================================================
    // 反馈与指令
    // ============================================================

    /// 最新缓存的反馈（非阻塞）
    pub fn read_feedback(&self) -> UnitFeedback {
        self.node.feedback()
    }

    /// 发送两个通道的速度指令
    ///
    /// # 错误
    ///
    /// 任一指令超出 ±1000 时返回 `CommandOutOfRange`，此时不发送任何帧。
    pub fn send_command(&self, channel_1: i32, channel_2: i32) -> Result<(), DriverError> {
        for value in [channel_1, channel_2] {
            if !(-MAX_COMMAND..=MAX_COMMAND).contains(&value) {
                return Err(DriverError::CommandOutOfRange {
                    value,
                    max: MAX_COMMAND,
                });
            }
        }
        self.sync_write(COMMAND_CHANNEL_1, channel_1)?;
        self.sync_write(COMMAND_CHANNEL_2, channel_2)
    }

    pub fn reset_script(&self) -> Result<(), DriverError> {
        self.sync_write(RESET_SCRIPT, RESET_SCRIPT_VALUE)
    }

    pub fn turn_on_estop(&self) -> Result<(), DriverError> {
        self.sync_write(TURN_ON_ESTOP, ESTOP_COMMAND_VALUE)
    }

    pub fn turn_off_estop(&self) -> Result<(), DriverError> {
        self.sync_write(TURN_OFF_ESTOP, ESTOP_COMMAND_VALUE)
    }

    /// 对指定通道开启 safety stop（写入通道号）
    pub fn turn_on_safety_stop(&self, channel: Channel) -> Result<(), DriverError> {
        self.sync_write(SAFETY_STOP, channel.number())
    }

    // ============================================================
    // 辅助状态
    // ============================================================

    /// 控制器温度（°C）
    pub fn read_temperature(&self) -> Result<i16, DriverError> {
        Ok(i16::from(self.sync_read::<i8>(TEMPERATURE)?))
    }

    /// 电池电压（0.1 V）
    pub fn read_voltage(&self) -> Result<u16, DriverError> {
        self.sync_read::<u16>(VOLTAGE)
    }

    /// 电池电流（0.1 A）
    pub fn read_battery_current(&self, channel: Channel) -> Result<i16, DriverError> {
        self.sync_read::<i16>(channel.battery_current_address())
    }

    /// 总线错误锁存，仅由下一次成功交换清除
    pub fn is_bus_error(&self) -> bool {
        self.node.is_bus_error()
    }
}

impl std::fmt::Debug for RoboteqDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoboteqDriver")
            .field("node", &self.node)
            .field("sdo_timeout", &self.sdo_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BusSession, SessionConfig};
    use panther_can::mock::{MockCanBus, RoboteqMock};

    fn settings() -> CanOpenSettings {
        CanOpenSettings {
            sdo_operation_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_operations_rejected_before_boot() {
        let bus = MockCanBus::new();
        let ctx = Arc::new(NodeContext::new(1));
        let adapter = bus.connect();
        let session =
            BusSession::start(move || Ok(adapter), vec![ctx.clone()], SessionConfig::default())
                .unwrap();
        let driver = RoboteqDriver::new(ctx, session.handle(), &settings());

        assert!(matches!(
            driver.sync_read::<u32>(panther_protocol::DEVICE_TYPE),
            Err(DriverError::NotBooted { node_id: 1 })
        ));
        assert!(matches!(
            driver.reset_script(),
            Err(DriverError::NotBooted { node_id: 1 })
        ));
    }

    #[test]
    fn test_command_range_checked_before_send() {
        let bus = MockCanBus::new();
        let mock = RoboteqMock::start(&bus, &[1]).unwrap();
        let ctx = Arc::new(NodeContext::new(1));
        let adapter = bus.connect();
        let session =
            BusSession::start(move || Ok(adapter), vec![ctx.clone()], SessionConfig::default())
                .unwrap();
        let driver = RoboteqDriver::new(ctx, session.handle(), &settings());
        driver.boot().unwrap();
        driver.wait_for_boot(Duration::from_secs(1)).unwrap();

        assert!(matches!(
            driver.send_command(1001, 0),
            Err(DriverError::CommandOutOfRange { value: 1001, .. })
        ));
        assert!(matches!(
            driver.send_command(0, -1001),
            Err(DriverError::CommandOutOfRange { value: -1001, .. })
        ));
        assert_eq!(mock.write_count(1, COMMAND_CHANNEL_1), 0);

        driver.send_command(1000, -1000).unwrap();
        assert_eq!(mock.command(1, Channel::One), Some(1000));
        assert_eq!(mock.command(1, Channel::Two), Some(-1000));
    }
}
