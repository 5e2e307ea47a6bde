//! 驱动层模块
//!
//! 本模块提供 Panther 底盘 Roboteq 电机控制器的 CANopen 驱动，包括：
//! - 总线会话（专用 IO 线程，SDO 交换调度与取消）
//! - 单元驱动（boot 握手、带超时的同步 SDO 读写、反馈缓存、速度指令）
//! - 控制器生命周期（初始化、身份校验、反初始化、激活）
//!
//! # 使用场景
//!
//! 大多数用户应该使用 `panther-system` 提供的电机控制器和急停管理器；
//! 需要直接访问对象字典时再使用本模块。

mod builder;
mod controller;
mod driver;
mod error;
pub mod session;
mod settings;
pub mod state;

pub use builder::{CanOpenControllerBuilder, DEFAULT_INTERFACE};
pub use controller::{AdapterFactory, CanOpenController, DriverPair};
pub use driver::RoboteqDriver;
pub use error::DriverError;
pub use session::{BusSession, ExchangeError, ExchangeHandle, SessionConfig, SessionHandle};
pub use settings::CanOpenSettings;
pub use state::*;
