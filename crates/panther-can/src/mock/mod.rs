//! 进程内 mock CAN 总线
//!
//! 每个 [`MockCanAdapter`] 是总线上的一个端口：发送的帧广播给除自己以外的所有端口。
//! 支持故障注入（发送失败、总线错误事件），用于在没有硬件的情况下测试总线会话。
//!
//! ```rust
//! use panther_can::mock::MockCanBus;
//! use panther_can::{CanAdapter, CanFrame};
//!
//! let bus = MockCanBus::new();
//! let mut a = bus.connect();
//! let mut b = bus.connect();
//! a.send(CanFrame::new_standard(0x701, &[0x00])).unwrap();
//! assert_eq!(b.receive().unwrap().id, 0x701);
//! ```

mod roboteq;

pub use roboteq::{BootBehavior, RoboteqMock};

use crate::{CanAdapter, CanError, CanFrame};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;

/// 端口收到的总线事件
#[derive(Debug, Clone, Copy)]
enum BusEvent {
    Frame(CanFrame),
    /// 控制器报告总线故障
    Fault,
}

struct Port {
    id: usize,
    tx: Sender<BusEvent>,
}

struct BusInner {
    ports: Mutex<Vec<Port>>,
    next_port: AtomicUsize,
    fail_sends: AtomicBool,
}

impl BusInner {
    fn broadcast(&self, from: Option<usize>, event: BusEvent) {
        let mut ports = self.ports.lock();
        // 已断开的端口顺便清理
        ports.retain(|port| {
            if Some(port.id) == from {
                return true;
            }
            port.tx.send(event).is_ok()
        });
    }
}

/// 进程内 CAN 总线
#[derive(Clone)]
pub struct MockCanBus {
    inner: Arc<BusInner>,
}

impl Default for MockCanBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCanBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                ports: Mutex::new(Vec::new()),
                next_port: AtomicUsize::new(0),
                fail_sends: AtomicBool::new(false),
            }),
        }
    }

    /// 连接一个新端口
    pub fn connect(&self) -> MockCanAdapter {
        let id = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.inner.ports.lock().push(Port { id, tx });
        trace!("Mock CAN port {} connected", id);
        MockCanAdapter {
            id,
            bus: self.inner.clone(),
            rx,
            timeout: Duration::from_millis(2),
        }
    }

    /// 开启后所有端口的 `send` 返回 `CanError::BusOff`
    pub fn set_send_failure(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::Release);
    }

    /// 向所有端口投递一次总线故障，下一次 `receive` 返回 `CanError::BusOff`
    pub fn inject_bus_fault(&self) {
        self.inner.broadcast(None, BusEvent::Fault);
    }

    /// 当前连接的端口数
    pub fn port_count(&self) -> usize {
        self.inner.ports.lock().len()
    }
}

/// mock 总线上的一个端口
pub struct MockCanAdapter {
    id: usize,
    bus: Arc<BusInner>,
    rx: Receiver<BusEvent>,
    timeout: Duration,
}

impl MockCanAdapter {
    fn map_event(event: BusEvent) -> Result<CanFrame, CanError> {
        match event {
            BusEvent::Frame(frame) => Ok(frame),
            BusEvent::Fault => Err(CanError::BusOff),
        }
    }
}

impl CanAdapter for MockCanAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        if self.bus.fail_sends.load(Ordering::Acquire) {
            return Err(CanError::BusOff);
        }
        self.bus.broadcast(Some(self.id), BusEvent::Frame(frame));
        Ok(())
    }

    fn receive(&mut self) -> Result<CanFrame, CanError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(event) => Self::map_event(event),
            Err(RecvTimeoutError::Timeout) => Err(CanError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CanError::NotStarted),
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, CanError> {
        match self.rx.try_recv() {
            Ok(event) => Self::map_event(event).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CanError::NotStarted),
        }
    }
}

impl Drop for MockCanAdapter {
    fn drop(&mut self) {
        let id = self.id;
        self.bus.ports.lock().retain(|port| port.id != id);
        trace!("Mock CAN port {} disconnected", id);
    }
}
