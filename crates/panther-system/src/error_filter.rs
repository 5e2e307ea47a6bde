//! 通信错误去抖过滤器
//!
//! 把每个控制周期的读写结果转换为稳定的粘滞故障：
//! 连续失败达到阈值后置位，之后只有显式清除请求加上一次成功才能复位。

use crate::error::Unit;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// 过滤器编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorFilterId {
    /// SDO 写（速度指令、急停写入）
    WriteSdo = 0,
    /// SDO 读（辅助状态）
    ReadSdo = 1,
    /// 反馈 PDO 过期
    ReadPdo = 2,
}

impl ErrorFilterId {
    pub const ALL: [ErrorFilterId; 3] = [
        ErrorFilterId::WriteSdo,
        ErrorFilterId::ReadSdo,
        ErrorFilterId::ReadPdo,
    ];
}

/// 各过滤器的失败阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorFilterSettings {
    pub write_sdo_max_failures: u32,
    pub read_sdo_max_failures: u32,
    pub read_pdo_max_failures: u32,
}

impl Default for ErrorFilterSettings {
    fn default() -> Self {
        Self {
            write_sdo_max_failures: 2,
            read_sdo_max_failures: 2,
            read_pdo_max_failures: 1,
        }
    }
}

impl ErrorFilterSettings {
    fn threshold(&self, id: ErrorFilterId) -> u32 {
        match id {
            ErrorFilterId::WriteSdo => self.write_sdo_max_failures,
            ErrorFilterId::ReadSdo => self.read_sdo_max_failures,
            ErrorFilterId::ReadPdo => self.read_pdo_max_failures,
        }
    }
}

/// 单路连续失败计数器
#[derive(Debug, Clone, Copy)]
pub struct ErrorFilter {
    max_failures: u32,
    failures: u32,
    error: bool,
}

impl ErrorFilter {
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures,
            failures: 0,
            error: false,
        }
    }

    /// 记录一次结果
    ///
    /// 成功只复位计数，不复位粘滞故障。
    pub fn update(&mut self, failure: bool) {
        if failure {
            self.failures = self.failures.saturating_add(1);
            if self.failures >= self.max_failures {
                self.error = true;
            }
        } else {
            self.failures = 0;
        }
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn clear(&mut self) {
        self.failures = 0;
        self.error = false;
    }
}

/// 单个驱动单元的过滤器组
///
/// 控制周期写入结果，急停线程读取 `is_error`，所以内部加锁。
#[derive(Debug)]
pub struct UnitErrorFilter {
    filters: Mutex<[ErrorFilter; 3]>,
    bus_error: AtomicBool,
    clear_requested: AtomicBool,
}

impl UnitErrorFilter {
    pub fn new(settings: &ErrorFilterSettings) -> Self {
        Self {
            filters: Mutex::new(ErrorFilterId::ALL.map(|id| ErrorFilter::new(settings.threshold(id)))),
            bus_error: AtomicBool::new(false),
            clear_requested: AtomicBool::new(false),
        }
    }

    /// 记录一次结果；有挂起的清除请求时，成功会先清除全部故障
    pub fn update(&self, id: ErrorFilterId, failure: bool) {
        let mut filters = self.filters.lock();
        if !failure && self.clear_requested.swap(false, Ordering::AcqRel) {
            for filter in filters.iter_mut() {
                filter.clear();
            }
        }
        filters[id as usize].update(failure);
    }

    /// 当前的总线错误状态（不去抖）
    pub fn set_bus_error(&self, bus_error: bool) {
        self.bus_error.store(bus_error, Ordering::Release);
    }

    pub fn request_clear(&self) {
        self.clear_requested.store(true, Ordering::Release);
    }

    pub fn is_clear_requested(&self) -> bool {
        self.clear_requested.load(Ordering::Acquire)
    }

    pub fn is_error(&self) -> bool {
        self.filters.lock().iter().any(ErrorFilter::is_error)
            || self.bus_error.load(Ordering::Acquire)
    }

    pub fn is_filter_error(&self, id: ErrorFilterId) -> bool {
        self.filters.lock()[id as usize].is_error()
    }

    pub fn is_bus_error(&self) -> bool {
        self.bus_error.load(Ordering::Acquire)
    }
}

/// 前后两个单元的过滤器
#[derive(Debug)]
pub struct RoboteqErrorFilter {
    units: [UnitErrorFilter; 2],
}

impl RoboteqErrorFilter {
    pub fn new(settings: ErrorFilterSettings) -> Self {
        Self {
            units: [UnitErrorFilter::new(&settings), UnitErrorFilter::new(&settings)],
        }
    }

    pub fn unit(&self, unit: Unit) -> &UnitErrorFilter {
        &self.units[unit.index()]
    }

    pub fn update(&self, unit: Unit, id: ErrorFilterId, failure: bool) {
        let filter = self.unit(unit);
        let was_error = filter.is_filter_error(id);
        filter.update(id, failure);
        if !was_error && filter.is_filter_error(id) {
            warn!("{:?} error filter of the {} unit tripped", id, unit);
        }
    }

    pub fn set_bus_error(&self, unit: Unit, bus_error: bool) {
        self.unit(unit).set_bus_error(bus_error);
    }

    /// 请求在下一次成功后清除两个单元的故障
    pub fn set_clear_errors(&self) {
        info!("Requested clearing of the Roboteq error filters");
        for filter in &self.units {
            filter.request_clear();
        }
    }

    pub fn is_error(&self) -> bool {
        self.units.iter().any(UnitErrorFilter::is_error)
    }

    pub fn is_unit_error(&self, unit: Unit) -> bool {
        self.unit(unit).is_error()
    }

    pub fn is_filter_error(&self, unit: Unit, id: ErrorFilterId) -> bool {
        self.unit(unit).is_filter_error(id)
    }
}

impl Default for RoboteqErrorFilter {
    fn default() -> Self {
        Self::new(ErrorFilterSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_trips_at_threshold() {
        let mut filter = ErrorFilter::new(2);
        filter.update(true);
        assert!(!filter.is_error());
        assert_eq!(filter.failures(), 1);
        filter.update(true);
        assert!(filter.is_error());
    }

    #[test]
    fn test_success_resets_count_only() {
        let mut filter = ErrorFilter::new(2);
        filter.update(true);
        filter.update(false);
        filter.update(true);
        assert!(!filter.is_error());

        filter.update(true);
        assert!(filter.is_error());
        filter.update(false);
        // 单次成功不清除粘滞故障
        assert!(filter.is_error());
        assert_eq!(filter.failures(), 0);
    }

    #[test]
    fn test_clear_applies_on_next_success() {
        let filter = UnitErrorFilter::new(&ErrorFilterSettings::default());
        filter.update(ErrorFilterId::WriteSdo, true);
        filter.update(ErrorFilterId::WriteSdo, true);
        filter.update(ErrorFilterId::ReadPdo, true);
        assert!(filter.is_filter_error(ErrorFilterId::WriteSdo));
        assert!(filter.is_filter_error(ErrorFilterId::ReadPdo));

        filter.request_clear();
        assert!(filter.is_error());

        // 清除请求不会被持续的失败消费
        filter.update(ErrorFilterId::WriteSdo, true);
        assert!(filter.is_error());
        assert!(filter.is_clear_requested());

        filter.update(ErrorFilterId::ReadSdo, false);
        assert!(!filter.is_error());
        assert!(!filter.is_clear_requested());
    }

    #[test]
    fn test_bus_error_not_debounced() {
        let filter = UnitErrorFilter::new(&ErrorFilterSettings::default());
        filter.set_bus_error(true);
        assert!(filter.is_error());
        assert!(filter.is_bus_error());
        filter.set_bus_error(false);
        assert!(!filter.is_error());
    }

    #[test]
    fn test_read_pdo_trips_immediately() {
        let filter = RoboteqErrorFilter::default();
        filter.update(Unit::Rear, ErrorFilterId::ReadPdo, true);
        assert!(filter.is_error());
        assert!(filter.is_unit_error(Unit::Rear));
        assert!(!filter.is_unit_error(Unit::Front));
        assert!(filter.is_filter_error(Unit::Rear, ErrorFilterId::ReadPdo));
    }

    #[test]
    fn test_pair_clear_is_per_unit() {
        let filter = RoboteqErrorFilter::default();
        for unit in Unit::ALL {
            filter.update(unit, ErrorFilterId::ReadPdo, true);
        }
        filter.set_clear_errors();

        filter.update(Unit::Front, ErrorFilterId::ReadPdo, false);
        assert!(!filter.is_unit_error(Unit::Front));
        assert!(filter.is_unit_error(Unit::Rear));

        filter.update(Unit::Rear, ErrorFilterId::ReadPdo, false);
        assert!(!filter.is_error());
    }

    #[test]
    fn test_custom_thresholds() {
        let settings = ErrorFilterSettings {
            write_sdo_max_failures: 3,
            ..Default::default()
        };
        let filter = UnitErrorFilter::new(&settings);
        filter.update(ErrorFilterId::WriteSdo, true);
        filter.update(ErrorFilterId::WriteSdo, true);
        assert!(!filter.is_error());
        filter.update(ErrorFilterId::WriteSdo, true);
        assert!(filter.is_error());
    }
}
