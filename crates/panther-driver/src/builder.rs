//! Builder 模式实现
//!
//! 提供链式构造 `CanOpenController` 实例的便捷方式。

use crate::controller::{AdapterFactory, CanOpenController};
use crate::error::DriverError;
use crate::session::SessionConfig;
use crate::settings::CanOpenSettings;
#[cfg(target_os = "linux")]
use panther_can::SocketCanAdapter;
use panther_can::{CanAdapter, CanError};
#[cfg(not(target_os = "linux"))]
use panther_can::{CanDeviceError, CanDeviceErrorKind};
use std::sync::Arc;
use std::time::Duration;

/// 默认 SocketCAN 接口名
pub const DEFAULT_INTERFACE: &str = "panther_can";

/// CANopen 控制器 Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// use panther_driver::{CanOpenControllerBuilder, CanOpenSettings};
/// use std::time::Duration;
///
/// // 使用默认配置（SocketCAN 接口 "panther_can"）
/// let controller = CanOpenControllerBuilder::new().build().unwrap();
///
/// // 自定义接口和超时
/// let settings = CanOpenSettings {
///     sdo_operation_timeout: Duration::from_millis(6),
///     ..Default::default()
/// };
/// let controller = CanOpenControllerBuilder::new()
///     .interface("can0")
///     .settings(settings)
///     .build()
///     .unwrap();
/// ```
pub struct CanOpenControllerBuilder {
    /// SocketCAN 接口名称
    interface: Option<String>,
    /// 自定义适配器工厂（优先于 `interface`）
    adapter_factory: Option<AdapterFactory>,
    settings: Option<CanOpenSettings>,
    /// IO 线程的接收超时
    receive_timeout: Option<Duration>,
}

impl CanOpenControllerBuilder {
    pub fn new() -> Self {
        Self {
            interface: None,
            adapter_factory: None,
            settings: None,
            receive_timeout: None,
        }
    }

    /// 设置 SocketCAN 接口名称
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// 使用自定义适配器（例如 mock 总线）
    ///
    /// 工厂在每次 `initialize` 时调用一次。
    pub fn with_adapter_factory<F, A>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<A, CanError> + Send + Sync + 'static,
        A: CanAdapter + Send + 'static,
    {
        self.adapter_factory = Some(Arc::new(move || {
            factory().map(|adapter| Box::new(adapter) as Box<dyn CanAdapter + Send>)
        }));
        self
    }

    pub fn settings(mut self, settings: CanOpenSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// 构建控制器（不打开总线，总线在 `initialize` 时打开）
    ///
    /// # 错误
    ///
    /// 配置无效时返回 `InvalidSettings`
    pub fn build(self) -> Result<CanOpenController, DriverError> {
        let settings = self.settings.unwrap_or_default();
        settings.validate()?;

        let mut session_config = SessionConfig {
            start_timeout: settings.communication_start_timeout,
            ..Default::default()
        };
        if let Some(timeout) = self.receive_timeout {
            session_config.receive_timeout = timeout;
        }

        let factory = match self.adapter_factory {
            Some(factory) => factory,
            None => {
                let interface = self.interface.unwrap_or_else(|| DEFAULT_INTERFACE.to_string());
                socketcan_factory(interface)
            },
        };

        Ok(CanOpenController::new(settings, session_config, factory))
    }
}

#[cfg(target_os = "linux")]
fn socketcan_factory(interface: String) -> AdapterFactory {
    Arc::new(move || {
        SocketCanAdapter::new(interface.as_str())
            .map(|adapter| Box::new(adapter) as Box<dyn CanAdapter + Send>)
    })
}

#[cfg(not(target_os = "linux"))]
fn socketcan_factory(interface: String) -> AdapterFactory {
    Arc::new(move || {
        Err(CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NotFound,
            format!("SocketCAN interface '{}' is only available on Linux", interface),
        )))
    })
}

impl Default for CanOpenControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
