//! CANopen 控制器
//!
//! 管理总线会话和前后两个 Roboteq 驱动的生命周期：初始化（启动会话、boot、身份校验）、
//! 反初始化（有序关闭）、激活（复位脚本并下发零指令）。

use crate::driver::RoboteqDriver;
use crate::error::DriverError;
use crate::session::{BusSession, SessionConfig};
use crate::settings::CanOpenSettings;
use crate::state::NodeContext;
use arc_swap::ArcSwapOption;
use panther_can::{CanAdapter, CanError};
use panther_protocol::{DEVICE_TYPE, ObjectAddress, VENDOR_ID};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// CAN 适配器工厂，每次初始化调用一次
pub type AdapterFactory =
    Arc<dyn Fn() -> Result<Box<dyn CanAdapter + Send>, CanError> + Send + Sync>;

/// 已初始化的前后驱动
#[derive(Debug)]
pub struct DriverPair {
    pub front: Arc<RoboteqDriver>,
    pub rear: Arc<RoboteqDriver>,
}

/// CANopen 控制器
///
/// `initialize` / `deinitialize` 可以反复调用；生命周期操作之间互斥，
/// 驱动通过 `ArcSwapOption` 发布，读取驱动不需要加锁。
pub struct CanOpenController {
    settings: CanOpenSettings,
    session_config: SessionConfig,
    factory: AdapterFactory,
    /// 生命周期锁，同时持有当前会话（包括初始化中途失败留下的会话）
    session: Mutex<Option<BusSession>>,
    drivers: ArcSwapOption<DriverPair>,
}

impl CanOpenController {
    pub(crate) fn new(
        settings: CanOpenSettings,
        session_config: SessionConfig,
        factory: AdapterFactory,
    ) -> Self {
        Self {
            settings,
            session_config,
            factory,
            session: Mutex::new(None),
            drivers: ArcSwapOption::empty(),
        }
    }

    pub fn settings(&self) -> &CanOpenSettings {
        &self.settings
    }

    /// 启动通信、boot 两个单元并校验身份
    ///
    /// 已初始化时直接返回成功。上一次失败留下的会话会先被关闭。
    ///
    /// # 错误
    ///
    /// - `CommunicationError`: 适配器无法打开或通信未按时启动
    /// - `BootFailure`: 任一单元 boot 失败
    /// - `IdentityMismatch`: 设备类型或厂商 ID 不符
    /// - `OperationTimeout`: 身份读取超时
    pub fn initialize(&self) -> Result<(), DriverError> {
        let mut session_slot = self.session.lock();
        if self.drivers.load().is_some() {
            debug!("CANopen controller already initialized");
            return Ok(());
        }
        if let Some(mut stale) = session_slot.take() {
            debug!("Tearing down session left by a failed initialization");
            stale.shutdown();
        }

        info!(
            "Initializing CANopen controller (master {}, front {}, rear {})",
            self.settings.master_node_id, self.settings.front_node_id, self.settings.rear_node_id
        );

        let front_node = Arc::new(NodeContext::new(self.settings.front_node_id));
        let rear_node = Arc::new(NodeContext::new(self.settings.rear_node_id));
        let factory = self.factory.clone();
        let session = BusSession::start(
            move || factory(),
            vec![front_node.clone(), rear_node.clone()],
            self.session_config.clone(),
        )?;
        let handle = session.handle();
        *session_slot = Some(session);

        let front = Arc::new(RoboteqDriver::new(front_node, handle.clone(), &self.settings));
        let rear = Arc::new(RoboteqDriver::new(rear_node, handle, &self.settings));

        front.boot()?;
        rear.boot()?;
        front.wait_for_boot(self.settings.boot_timeout)?;
        rear.wait_for_boot(self.settings.boot_timeout)?;

        self.validate_identity(&front)?;
        self.validate_identity(&rear)?;

        self.drivers.store(Some(Arc::new(DriverPair { front, rear })));
        info!("CANopen controller initialized");
        Ok(())
    }

    fn validate_identity(&self, driver: &RoboteqDriver) -> Result<(), DriverError> {
        let checks: [(ObjectAddress, u32); 2] = [
            (DEVICE_TYPE, self.settings.expected_device_type),
            (VENDOR_ID, self.settings.expected_vendor_id),
        ];
        for (address, expected) in checks {
            let actual = driver.sync_read::<u32>(address)?;
            if actual != expected {
                error!(
                    "Node {} identity mismatch at {}: expected 0x{:08X}, got 0x{:08X}",
                    driver.node_id(),
                    address,
                    expected,
                    actual
                );
                return Err(DriverError::IdentityMismatch {
                    node_id: driver.node_id(),
                    address,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// 停止所有从站并关闭会话
    ///
    /// 在任何状态下都可以调用，包括初始化中途失败之后。
    pub fn deinitialize(&self) {
        let mut session_slot = self.session.lock();
        self.drivers.store(None);
        if let Some(mut session) = session_slot.take() {
            session.shutdown();
            info!("CANopen controller deinitialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.drivers.load().is_some()
    }

    /// 复位两个单元的脚本并下发零指令
    ///
    /// 刚复位的控制器短时间内会忽略指令，每一步之后等待 `settle`。
    pub fn activate(&self, settle: Duration) -> Result<(), DriverError> {
        let drivers = self.drivers()?;

        drivers.front.reset_script()?;
        drivers.rear.reset_script()?;
        spin_sleep::sleep(settle);

        drivers.front.send_command(0, 0)?;
        drivers.rear.send_command(0, 0)?;
        spin_sleep::sleep(settle);

        debug!("Motor controllers activated");
        Ok(())
    }

    /// 当前驱动对
    pub fn drivers(&self) -> Result<Arc<DriverPair>, DriverError> {
        self.drivers.load_full().ok_or(DriverError::NotInitialized)
    }

    pub fn front_driver(&self) -> Result<Arc<RoboteqDriver>, DriverError> {
        Ok(self.drivers()?.front.clone())
    }

    pub fn rear_driver(&self) -> Result<Arc<RoboteqDriver>, DriverError> {
        Ok(self.drivers()?.rear.clone())
    }
}

impl Drop for CanOpenController {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
