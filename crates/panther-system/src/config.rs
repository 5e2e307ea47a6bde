//! # 系统配置
//!
//! TOML 格式，所有字段都有实车默认值，可以只写需要覆盖的部分：
//!
//! ```toml
//! [canopen]
//! interface = "panther_can"
//! sdo_operation_timeout_ms = 4
//!
//! [e_stop]
//! strategy = "hardware"
//! ```

use crate::converters::DrivetrainSettings;
use crate::e_stop::EStopStrategyKind;
use crate::error_filter::ErrorFilterSettings;
use panther_driver::{CanOpenSettings, DEFAULT_INTERFACE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 系统配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub canopen: CanOpenConfig,
    pub drivetrain: DrivetrainConfig,
    pub error_filter: ErrorFilterConfig,
    pub attempts: AttemptsConfig,
    pub e_stop: EStopConfig,
}

impl SystemConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载并校验
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// 校验节点号、传动参数和阈值
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.canopen
            .to_settings()
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        let drivetrain = [
            ("motor_torque_constant", self.drivetrain.motor_torque_constant),
            ("gear_ratio", self.drivetrain.gear_ratio),
            ("gearbox_efficiency", self.drivetrain.gearbox_efficiency),
            ("encoder_resolution", self.drivetrain.encoder_resolution),
            ("max_rpm_motor_speed", self.drivetrain.max_rpm_motor_speed),
        ];
        for (name, value) in drivetrain {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "drivetrain.{} must be positive, got {}",
                    name, value
                )));
            }
        }

        let thresholds = [
            ("write_sdo_max_failures", self.error_filter.write_sdo_max_failures),
            ("read_sdo_max_failures", self.error_filter.read_sdo_max_failures),
            ("read_pdo_max_failures", self.error_filter.read_pdo_max_failures),
            ("initialization", self.attempts.initialization),
            ("activation", self.attempts.activation),
            ("safety_stop", self.attempts.safety_stop),
        ];
        for (name, value) in thresholds {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

/// CANopen 通信配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanOpenConfig {
    /// SocketCAN 接口名
    pub interface: String,
    pub master_node_id: u8,
    pub front_node_id: u8,
    pub rear_node_id: u8,
    pub pdo_feedback_timeout_ms: u64,
    pub sdo_operation_timeout_ms: u64,
    pub sdo_cancel_grace_us: u64,
    pub boot_timeout_ms: u64,
    pub communication_start_timeout_ms: u64,
    pub expected_device_type: u32,
    pub expected_vendor_id: u32,
    /// 激活时每一步之后的等待
    pub activate_settle_ms: u64,
}

impl Default for CanOpenConfig {
    fn default() -> Self {
        let settings = CanOpenSettings::default();
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            master_node_id: settings.master_node_id,
            front_node_id: settings.front_node_id,
            rear_node_id: settings.rear_node_id,
            pdo_feedback_timeout_ms: settings.pdo_feedback_timeout.as_millis() as u64,
            sdo_operation_timeout_ms: settings.sdo_operation_timeout.as_millis() as u64,
            sdo_cancel_grace_us: settings.sdo_cancel_grace.as_micros() as u64,
            boot_timeout_ms: settings.boot_timeout.as_millis() as u64,
            communication_start_timeout_ms: settings.communication_start_timeout.as_millis()
                as u64,
            expected_device_type: settings.expected_device_type,
            expected_vendor_id: settings.expected_vendor_id,
            activate_settle_ms: 1000,
        }
    }
}

impl CanOpenConfig {
    pub fn to_settings(&self) -> CanOpenSettings {
        CanOpenSettings {
            master_node_id: self.master_node_id,
            front_node_id: self.front_node_id,
            rear_node_id: self.rear_node_id,
            pdo_feedback_timeout: Duration::from_millis(self.pdo_feedback_timeout_ms),
            sdo_operation_timeout: Duration::from_millis(self.sdo_operation_timeout_ms),
            sdo_cancel_grace: Duration::from_micros(self.sdo_cancel_grace_us),
            boot_timeout: Duration::from_millis(self.boot_timeout_ms),
            communication_start_timeout: Duration::from_millis(
                self.communication_start_timeout_ms,
            ),
            expected_device_type: self.expected_device_type,
            expected_vendor_id: self.expected_vendor_id,
        }
    }

    pub fn activate_settle(&self) -> Duration {
        Duration::from_millis(self.activate_settle_ms)
    }
}

/// 传动参数配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrivetrainConfig {
    pub motor_torque_constant: f64,
    pub gear_ratio: f64,
    pub gearbox_efficiency: f64,
    pub encoder_resolution: f64,
    pub max_rpm_motor_speed: f64,
}

impl Default for DrivetrainConfig {
    fn default() -> Self {
        let settings = DrivetrainSettings::default();
        Self {
            motor_torque_constant: settings.motor_torque_constant,
            gear_ratio: settings.gear_ratio,
            gearbox_efficiency: settings.gearbox_efficiency,
            encoder_resolution: settings.encoder_resolution,
            max_rpm_motor_speed: settings.max_rpm_motor_speed,
        }
    }
}

impl DrivetrainConfig {
    pub fn to_settings(&self) -> DrivetrainSettings {
        DrivetrainSettings {
            motor_torque_constant: self.motor_torque_constant,
            gear_ratio: self.gear_ratio,
            gearbox_efficiency: self.gearbox_efficiency,
            encoder_resolution: self.encoder_resolution,
            max_rpm_motor_speed: self.max_rpm_motor_speed,
        }
    }
}

/// 错误过滤阈值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorFilterConfig {
    pub write_sdo_max_failures: u32,
    pub read_sdo_max_failures: u32,
    pub read_pdo_max_failures: u32,
}

impl Default for ErrorFilterConfig {
    fn default() -> Self {
        let settings = ErrorFilterSettings::default();
        Self {
            write_sdo_max_failures: settings.write_sdo_max_failures,
            read_sdo_max_failures: settings.read_sdo_max_failures,
            read_pdo_max_failures: settings.read_pdo_max_failures,
        }
    }
}

impl ErrorFilterConfig {
    pub fn to_settings(&self) -> ErrorFilterSettings {
        ErrorFilterSettings {
            write_sdo_max_failures: self.write_sdo_max_failures,
            read_sdo_max_failures: self.read_sdo_max_failures,
            read_pdo_max_failures: self.read_pdo_max_failures,
        }
    }
}

/// 重试次数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptsConfig {
    pub initialization: u32,
    pub activation: u32,
    pub safety_stop: u32,
}

impl Default for AttemptsConfig {
    fn default() -> Self {
        Self {
            initialization: 3,
            activation: 3,
            safety_stop: 20,
        }
    }
}

/// 急停配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EStopConfig {
    pub strategy: EStopStrategyKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SystemConfig::from_toml_str("").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.canopen.to_settings(), CanOpenSettings::default());
        assert_eq!(config.drivetrain.to_settings(), DrivetrainSettings::default());
        assert_eq!(config.error_filter.to_settings(), ErrorFilterSettings::default());
        assert_eq!(config.canopen.activate_settle(), Duration::from_secs(1));
        assert_eq!(config.e_stop.strategy, EStopStrategyKind::Software);
    }

    #[test]
    fn test_partial_config() {
        let config = SystemConfig::from_toml_str(
            r#"
            [canopen]
            interface = "can0"
            sdo_operation_timeout_ms = 6
            sdo_cancel_grace_us = 1000

            [error_filter]
            read_pdo_max_failures = 3

            [e_stop]
            strategy = "hardware"
            "#,
        )
        .unwrap();

        assert_eq!(config.canopen.interface, "can0");
        let settings = config.canopen.to_settings();
        assert_eq!(settings.sdo_operation_timeout, Duration::from_millis(6));
        assert_eq!(settings.sdo_cancel_grace, Duration::from_micros(1000));
        assert_eq!(settings.front_node_id, 1);
        assert_eq!(config.error_filter.read_pdo_max_failures, 3);
        assert_eq!(config.error_filter.write_sdo_max_failures, 2);
        assert_eq!(config.e_stop.strategy, EStopStrategyKind::Hardware);
    }

    #[test]
    fn test_rejects_duplicate_node_ids() {
        let result = SystemConfig::from_toml_str(
            r#"
            [canopen]
            front_node_id = 2
            rear_node_id = 2
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_non_positive_drivetrain() {
        let result = SystemConfig::from_toml_str("[drivetrain]\ngear_ratio = 0.0\n");
        match result {
            Err(ConfigError::Invalid(message)) => assert!(message.contains("gear_ratio")),
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let result = SystemConfig::from_toml_str("[attempts]\nsafety_stop = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let result = SystemConfig::from_toml_str("[e_stop]\nstrategy = \"magic\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panther.toml");
        let mut config = SystemConfig::default();
        config.canopen.interface = "vcan0".to_string();
        config.attempts.safety_stop = 5;

        config.save_to_file(&path).unwrap();
        let loaded = SystemConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let result = SystemConfig::load_from_file("/nonexistent/panther.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
