//! 节点共享状态
//!
//! 每个从站一份 [`NodeContext`]：总线线程写入 boot 状态、总线错误锁存和反馈快照，
//! 控制线程读取。boot 状态和错误锁存使用原子量，反馈快照使用 `ArcSwap`。

use crate::error::DriverError;
use arc_swap::ArcSwap;
use panther_protocol::{Channel, FeedbackPdo, fault_flags_byte, runtime_flags_bytes, script_flags_byte};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 从站 boot 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BootState {
    /// 尚未发起 boot
    #[default]
    NotBooted = 0,
    /// 已发送 Reset Communication，等待 boot-up
    Booting = 1,
    /// boot 完成，可以进行 SDO 读写
    Booted = 2,
    /// 从站报告故障或超时
    BootFailed = 3,
}

impl BootState {
    /// 从 u8 转换，无效值视为 NotBooted
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Booting,
            2 => Self::Booted,
            3 => Self::BootFailed,
            _ => Self::NotBooted,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_booted(self) -> bool {
        self == Self::Booted
    }
}

/// Boot 状态（原子版本，用于线程间共享）
#[derive(Debug)]
pub struct AtomicBootState {
    inner: AtomicU8,
}

impl AtomicBootState {
    pub fn new(state: BootState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self, ordering: Ordering) -> BootState {
        BootState::from_u8(self.inner.load(ordering))
    }

    pub fn set(&self, state: BootState, ordering: Ordering) {
        self.inner.store(state.as_u8(), ordering);
    }

    /// 比较并交换，成功返回 true
    pub fn compare_exchange(
        &self,
        current: BootState,
        new: BootState,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.inner
            .compare_exchange(current.as_u8(), new.as_u8(), success, failure)
            .is_ok()
    }
}

// ============================================================================
// 反馈
// ============================================================================

/// 单通道电机反馈（原始单位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotorChannelFeedback {
    /// 编码器计数
    pub position: i32,
    /// 转速（RPM）
    pub velocity: i32,
    /// 电流（0.1 A）
    pub current: i32,
}

/// 一个控制器单元的反馈快照
///
/// 每收到一帧 TPDO 由总线线程生成一份新快照；位置帧（TPDO1）刷新时间戳。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitFeedback {
    pub channel_1: MotorChannelFeedback,
    pub channel_2: MotorChannelFeedback,
    pub fault_flags: u8,
    pub script_flags: u8,
    /// 通道 1 / 2 的运行时标志
    pub runtime_flags: [u8; 2],
    /// 最近一次位置帧的接收时间，`None` 表示从未收到
    pub timestamp: Option<Instant>,
}

impl UnitFeedback {
    pub fn channel(&self, channel: Channel) -> &MotorChannelFeedback {
        match channel {
            Channel::One => &self.channel_1,
            Channel::Two => &self.channel_2,
        }
    }

    pub fn runtime_flags(&self, channel: Channel) -> u8 {
        match channel {
            Channel::One => self.runtime_flags[0],
            Channel::Two => self.runtime_flags[1],
        }
    }

    /// 在 `now` 时刻快照是否已超过 `timeout`
    ///
    /// 从未收到位置帧的快照视为过期。
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match self.timestamp {
            Some(timestamp) => now.saturating_duration_since(timestamp) > timeout,
            None => true,
        }
    }

    /// 应用一帧反馈 PDO，返回新快照
    pub fn with_pdo(mut self, pdo: FeedbackPdo, received_at: Instant) -> Self {
        match pdo {
            FeedbackPdo::Position([ch1, ch2]) => {
                self.channel_1.position = ch1;
                self.channel_2.position = ch2;
                self.timestamp = Some(received_at);
            },
            FeedbackPdo::Velocity([ch1, ch2]) => {
                self.channel_1.velocity = ch1;
                self.channel_2.velocity = ch2;
            },
            FeedbackPdo::Current([ch1, ch2]) => {
                self.channel_1.current = ch1;
                self.channel_2.current = ch2;
            },
            FeedbackPdo::Flags { status, runtime } => {
                self.fault_flags = fault_flags_byte(status);
                self.script_flags = script_flags_byte(status);
                self.runtime_flags = runtime_flags_bytes(runtime);
            },
        }
        self
    }
}

// ============================================================================
// NodeContext
// ============================================================================

/// 单个从站的跨线程共享状态
///
/// 写入方只有总线线程（boot 结果、错误锁存、反馈），控制线程只读；
/// 唯一例外是 SDO 成功后由总线线程清除错误锁存。
pub struct NodeContext {
    node_id: u8,
    boot_state: AtomicBootState,
    /// boot 失败原因，同时作为 `boot_signal` 的锁
    boot_error: Mutex<Option<String>>,
    boot_signal: Condvar,
    bus_error: AtomicBool,
    feedback: ArcSwap<UnitFeedback>,
}

impl NodeContext {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            boot_state: AtomicBootState::new(BootState::NotBooted),
            boot_error: Mutex::new(None),
            boot_signal: Condvar::new(),
            bus_error: AtomicBool::new(false),
            feedback: ArcSwap::from_pointee(UnitFeedback::default()),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn boot_state(&self) -> BootState {
        self.boot_state.get(Ordering::Acquire)
    }

    /// 进入 Booting，清除上一次的失败原因
    pub fn begin_boot(&self) {
        let mut error = self.boot_error.lock();
        *error = None;
        self.boot_state.set(BootState::Booting, Ordering::Release);
    }

    /// 标记 boot 失败并唤醒等待者
    pub fn fail_boot(&self, reason: impl Into<String>) {
        let mut error = self.boot_error.lock();
        *error = Some(reason.into());
        self.boot_state.set(BootState::BootFailed, Ordering::Release);
        self.boot_signal.notify_all();
    }

    /// 会话结束后回到 NotBooted
    pub fn reset_boot(&self) {
        let _error = self.boot_error.lock();
        self.boot_state.set(BootState::NotBooted, Ordering::Release);
        self.boot_signal.notify_all();
    }

    /// 阻塞等待 boot 结果
    ///
    /// # 错误
    ///
    /// 从站报告故障、超时或 boot 从未发起时返回 `BootFailure`。
    /// 超时后状态置为 BootFailed，迟到的 boot-up 会被忽略。
    pub fn wait_for_boot(&self, timeout: Duration) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        let mut error = self.boot_error.lock();

        while self.boot_state() == BootState::Booting {
            if self.boot_signal.wait_until(&mut error, deadline).timed_out() {
                break;
            }
        }

        match self.boot_state() {
            BootState::Booted => {
                debug!("Node {} booted", self.node_id);
                Ok(())
            },
            BootState::BootFailed => Err(DriverError::BootFailure {
                node_id: self.node_id,
                reason: error.clone().unwrap_or_else(|| "unknown".to_string()),
            }),
            BootState::NotBooted => Err(DriverError::BootFailure {
                node_id: self.node_id,
                reason: "boot was not started".to_string(),
            }),
            BootState::Booting => {
                let reason = format!("no boot-up message within {:?}", timeout);
                warn!("Node {}: {}", self.node_id, reason);
                *error = Some(reason.clone());
                self.boot_state.set(BootState::BootFailed, Ordering::Release);
                Err(DriverError::BootFailure {
                    node_id: self.node_id,
                    reason,
                })
            },
        }
    }

    /// 仅当处于 Booting 时转为 Booted 并唤醒等待者
    pub(crate) fn try_complete_boot(&self) -> bool {
        let _error = self.boot_error.lock();
        let switched = self.boot_state.compare_exchange(
            BootState::Booting,
            BootState::Booted,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if switched {
            self.boot_signal.notify_all();
        }
        switched
    }

    pub fn is_bus_error(&self) -> bool {
        self.bus_error.load(Ordering::Acquire)
    }

    pub(crate) fn latch_bus_error(&self) {
        if !self.bus_error.swap(true, Ordering::AcqRel) {
            warn!("Node {}: CAN bus error latched", self.node_id);
        }
    }

    pub(crate) fn clear_bus_error(&self) {
        if self.bus_error.swap(false, Ordering::AcqRel) {
            debug!("Node {}: CAN bus error cleared by successful exchange", self.node_id);
        }
    }

    /// 最新反馈快照（非阻塞）
    pub fn feedback(&self) -> UnitFeedback {
        **self.feedback.load()
    }

    pub(crate) fn apply_pdo(&self, pdo: FeedbackPdo, received_at: Instant) {
        let next = self.feedback().with_pdo(pdo, received_at);
        self.feedback.store(Arc::new(next));
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("boot_state", &self.boot_state())
            .field("bus_error", &self.is_bus_error())
            .finish()
    }
}
