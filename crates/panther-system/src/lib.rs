//! # Panther System
//!
//! Panther 底盘驱动系统层，建立在 `panther-driver` 之上：
//!
//! - `converters`: 原始反馈到物理量的转换、标志位解析（状态聚合）
//! - `error_filter`: 通信错误去抖（粘滞故障）
//! - `motors_controller`: 前后两个单元的统一操作入口
//! - `gpio`: 急停硬件通路使用的数字 I/O 能力
//! - `e_stop`: 急停管理器与可替换的硬件 / 软件策略
//! - `system`: 控制周期编排（初始化、激活、读、写）
//! - `config`: TOML 配置
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use panther_system::{DriveSystem, SystemConfig, VirtualGpio, WheelVelocities};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SystemConfig::load_from_file("panther.toml")?;
//! let system = DriveSystem::from_config(config, Arc::new(VirtualGpio::new()))?;
//! system.initialize()?;
//! system.activate()?;
//! system.reset_e_stop()?;
//!
//! system.read()?;
//! system.write(WheelVelocities::new(1.0, 1.0, 1.0, 1.0))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod converters;
pub mod e_stop;
mod error;
pub mod error_filter;
pub mod gpio;
pub mod motors_controller;
pub mod system;
mod utils;

pub use config::{ConfigError, SystemConfig};
pub use converters::{
    DriverState, DrivetrainSettings, FlagError, MotorState, UnitState, VelocityCommandConverter,
};
pub use e_stop::{
    EStopManager, EStopManagerResources, EStopStrategy, EStopStrategyKind, HardwareEStop,
    SoftwareEStop,
};
pub use error::{EStopError, SystemError, Unit};
pub use error_filter::{ErrorFilter, ErrorFilterId, ErrorFilterSettings, RoboteqErrorFilter};
pub use gpio::{GpioController, GpioError, GpioPin, VirtualGpio};
pub use motors_controller::{DriverStateUpdate, MotorsController, WheelVelocities};
pub use system::DriveSystem;
pub use utils::operation_with_attempts;
