//! CANopen 通信参数

use crate::error::DriverError;
use panther_protocol::is_valid_node_id;
use std::time::Duration;

/// CANopen 通信参数（构造后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanOpenSettings {
    /// 主站节点号
    pub master_node_id: u8,
    /// 前轴控制器节点号
    pub front_node_id: u8,
    /// 后轴控制器节点号
    pub rear_node_id: u8,
    /// 反馈 PDO 过期阈值
    pub pdo_feedback_timeout: Duration,
    /// 同步 SDO 读写超时
    pub sdo_operation_timeout: Duration,
    /// SDO 超时后等待取消确认的宽限期
    pub sdo_cancel_grace: Duration,
    /// 等待 boot-up 的超时
    pub boot_timeout: Duration,
    /// 等待总线线程启动的超时
    pub communication_start_timeout: Duration,
    /// 期望的设备类型（0x1000/0）
    pub expected_device_type: u32,
    /// 期望的厂商 ID（0x1018/1）
    pub expected_vendor_id: u32,
}

impl Default for CanOpenSettings {
    fn default() -> Self {
        Self {
            master_node_id: 3,
            front_node_id: 1,
            rear_node_id: 2,
            pdo_feedback_timeout: Duration::from_millis(15),
            sdo_operation_timeout: Duration::from_millis(4),
            sdo_cancel_grace: Duration::from_micros(750),
            boot_timeout: Duration::from_secs(2),
            communication_start_timeout: Duration::from_secs(1),
            expected_device_type: 0,
            expected_vendor_id: 0,
        }
    }
}

impl CanOpenSettings {
    /// 校验节点号与超时
    ///
    /// # 错误
    ///
    /// 节点号不在 1..=127 或重复、超时为 0 时返回 `InvalidSettings`
    pub fn validate(&self) -> Result<(), DriverError> {
        let ids = [
            ("master", self.master_node_id),
            ("front", self.front_node_id),
            ("rear", self.rear_node_id),
        ];
        for (name, id) in ids {
            if !is_valid_node_id(id) {
                return Err(DriverError::InvalidSettings(format!(
                    "{} node id {} is outside 1..=127",
                    name, id
                )));
            }
        }
        if self.master_node_id == self.front_node_id
            || self.master_node_id == self.rear_node_id
            || self.front_node_id == self.rear_node_id
        {
            return Err(DriverError::InvalidSettings(format!(
                "node ids must be distinct (master {}, front {}, rear {})",
                self.master_node_id, self.front_node_id, self.rear_node_id
            )));
        }
        if self.sdo_operation_timeout.is_zero() || self.pdo_feedback_timeout.is_zero() {
            return Err(DriverError::InvalidSettings(
                "sdo_operation_timeout and pdo_feedback_timeout must be non-zero".to_string(),
            ));
        }
        if self.boot_timeout.is_zero() || self.communication_start_timeout.is_zero() {
            return Err(DriverError::InvalidSettings(
                "boot_timeout and communication_start_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = CanOpenSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.sdo_operation_timeout, Duration::from_millis(4));
        assert_eq!(settings.pdo_feedback_timeout, Duration::from_millis(15));
    }

    #[test]
    fn test_duplicate_node_ids_rejected() {
        let settings = CanOpenSettings {
            rear_node_id: 1,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(DriverError::InvalidSettings(msg)) if msg.contains("distinct")
        ));
    }

    #[test]
    fn test_node_id_range_rejected() {
        let settings = CanOpenSettings {
            front_node_id: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        let settings = CanOpenSettings {
            master_node_id: 200,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let settings = CanOpenSettings {
            sdo_operation_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
