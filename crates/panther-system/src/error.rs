//! 系统层错误类型定义

use crate::gpio::GpioError;
use panther_driver::DriverError;
use std::fmt;
use thiserror::Error;

/// 驱动单元（前轴 / 后轴）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Front,
    Rear,
}

impl Unit {
    pub const ALL: [Unit; 2] = [Unit::Front, Unit::Rear];

    pub(crate) fn index(self) -> usize {
        match self {
            Unit::Front => 0,
            Unit::Rear => 1,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Front => write!(f, "front"),
            Unit::Rear => write!(f, "rear"),
        }
    }
}

/// 电机控制器 / 驱动系统错误
#[derive(Error, Debug)]
pub enum SystemError {
    /// 反馈 PDO 超过过期阈值未更新
    #[error("Feedback of the {unit} unit is stale")]
    FeedbackStale { unit: Unit },

    /// 单元锁存了总线错误
    #[error("CAN error detected on the {unit} unit")]
    CommunicationError { unit: Unit },

    /// 单元驱动操作失败
    #[error("Operation on the {unit} unit failed: {source}")]
    Driver {
        unit: Unit,
        #[source]
        source: DriverError,
    },

    /// 控制器生命周期错误（初始化、未初始化等）
    #[error("CANopen controller error: {0}")]
    Controller(#[from] DriverError),

    /// GPIO 操作失败
    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),

    /// 多次尝试后仍然失败
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
}

impl SystemError {
    /// 出错的单元（如果可以确定）
    pub fn unit(&self) -> Option<Unit> {
        match self {
            SystemError::FeedbackStale { unit }
            | SystemError::CommunicationError { unit }
            | SystemError::Driver { unit, .. } => Some(*unit),
            _ => None,
        }
    }

    /// 是否为单周期通信类错误（由错误过滤器吸收）
    pub fn is_cycle_fault(&self) -> bool {
        match self {
            SystemError::FeedbackStale { .. } | SystemError::CommunicationError { .. } => true,
            SystemError::Driver { source, .. } => source.is_communication(),
            _ => false,
        }
    }

    pub(crate) fn driver(unit: Unit) -> impl FnOnce(DriverError) -> SystemError {
        move |source| SystemError::Driver { unit, source }
    }
}

/// 急停操作错误
///
/// 复位前置条件不满足和复位被打断是预期内的可恢复结果，调用方需要分别处理。
#[derive(Error, Debug)]
pub enum EStopError {
    /// 复位前置条件不满足（速度指令非零、电机未上电或驱动器报错）
    #[error("E-Stop reset precondition not met: {0}")]
    EStopResetPrecondition(String),

    /// 复位过程中被急停触发打断
    #[error("E-Stop reset interrupted by a trigger")]
    EStopResetInterrupted,

    /// 复位动作完成但系统仍处于急停
    #[error("E-Stop reset failed: {0}")]
    EStopResetFailed(String),

    /// 触发急停失败（状态保持不变）
    #[error("E-Stop trigger failed: {0}")]
    EStopTriggerFailed(String),

    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_display() {
        assert_eq!(Unit::Front.to_string(), "front");
        assert_eq!(Unit::Rear.to_string(), "rear");
        assert_eq!(Unit::Rear.index(), 1);
    }

    #[test]
    fn test_system_error_unit() {
        let err = SystemError::Driver {
            unit: Unit::Rear,
            source: DriverError::NotInitialized,
        };
        assert_eq!(err.unit(), Some(Unit::Rear));
        assert!(!err.is_cycle_fault());

        let err = SystemError::Controller(DriverError::NotInitialized);
        assert_eq!(err.unit(), None);
    }

    #[test]
    fn test_cycle_fault_classification() {
        assert!(SystemError::FeedbackStale { unit: Unit::Front }.is_cycle_fault());
        assert!(SystemError::CommunicationError { unit: Unit::Rear }.is_cycle_fault());
        let err = SystemError::Driver {
            unit: Unit::Front,
            source: DriverError::CommunicationError("bus off".to_string()),
        };
        assert!(err.is_cycle_fault());
    }

    #[test]
    fn test_error_display() {
        let err = SystemError::CommunicationError { unit: Unit::Front };
        assert_eq!(format!("{}", err), "CAN error detected on the front unit");
        let err = EStopError::EStopResetPrecondition("velocity commands are not zero".into());
        assert!(format!("{}", err).contains("velocity commands"));
    }
}
