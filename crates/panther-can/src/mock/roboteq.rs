//! 模拟 Roboteq 从站
//!
//! 在 mock 总线上模拟一台或多台 Roboteq 控制器：
//!
//! - NMT：Reset Communication / Reset Node 后回复 boot-up（可配置延迟、静默或 EMCY 失败）
//! - SDO：对象字典读写，可对单个地址注入响应延迟
//! - PDO：Operational 状态下周期性发送 TPDO1..TPDO4（0x2106/1..8）

use super::{MockCanAdapter, MockCanBus};
use crate::{CanAdapter, CanError, CanFrame};
use panther_protocol::{
    BATTERY_CURRENT_1, BATTERY_CURRENT_2, COMMAND_CHANNEL_1, COMMAND_CHANNEL_2,
    CURRENT_CHANNEL_1, CURRENT_CHANNEL_2, Channel, CobKind, DEVICE_TYPE, Emergency, FeedbackPdo,
    NmtCommand, NmtState, ObjectAddress, POSITION_CHANNEL_1, POSITION_CHANNEL_2, RESET_SCRIPT,
    RUNTIME_FLAGS, SAFETY_STOP, SDO_ABORT_OBJECT_NOT_EXIST, STATUS_FLAGS, SdoRequest,
    SdoResponse, SdoValue, TEMPERATURE, TURN_OFF_ESTOP, TURN_ON_ESTOP, VELOCITY_CHANNEL_1,
    VELOCITY_CHANNEL_2, VENDOR_ID, VOLTAGE, boot_up_frame, classify, parse_nmt,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 默认 PDO 周期
const DEFAULT_PDO_PERIOD: Duration = Duration::from_millis(10);

/// 收到复位命令后的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootBehavior {
    /// 正常回复 boot-up
    #[default]
    Normal,
    /// 不回复
    Silent,
    /// 回复带错误码的 EMCY
    Emergency(u16),
}

#[derive(Debug, Clone, Copy)]
struct OdEntry {
    raw: [u8; 4],
    size: u8,
}

struct MockNode {
    od: HashMap<ObjectAddress, OdEntry>,
    nmt: NmtState,
    boot_behavior: BootBehavior,
    boot_delay: Duration,
    response_delays: HashMap<ObjectAddress, Duration>,
    write_counts: HashMap<ObjectAddress, usize>,
    pdo_enabled: bool,
}

impl MockNode {
    fn new() -> Self {
        let mut od = HashMap::new();
        let mut insert = |address: ObjectAddress, size: u8| {
            od.insert(address, OdEntry { raw: [0; 4], size });
        };
        insert(DEVICE_TYPE, 4);
        insert(VENDOR_ID, 4);
        insert(COMMAND_CHANNEL_1, 4);
        insert(COMMAND_CHANNEL_2, 4);
        for address in [
            POSITION_CHANNEL_1,
            POSITION_CHANNEL_2,
            VELOCITY_CHANNEL_1,
            VELOCITY_CHANNEL_2,
            CURRENT_CHANNEL_1,
            CURRENT_CHANNEL_2,
            STATUS_FLAGS,
            RUNTIME_FLAGS,
        ] {
            insert(address, 4);
        }
        insert(TEMPERATURE, 1);
        insert(VOLTAGE, 2);
        insert(BATTERY_CURRENT_1, 2);
        insert(BATTERY_CURRENT_2, 2);
        insert(RESET_SCRIPT, 1);
        insert(TURN_ON_ESTOP, 1);
        insert(TURN_OFF_ESTOP, 1);
        insert(SAFETY_STOP, 1);

        Self {
            od,
            nmt: NmtState::PreOperational,
            boot_behavior: BootBehavior::Normal,
            boot_delay: Duration::ZERO,
            response_delays: HashMap::new(),
            write_counts: HashMap::new(),
            pdo_enabled: true,
        }
    }

    fn set<T: SdoValue>(&mut self, address: ObjectAddress, value: T) {
        self.od.insert(
            address,
            OdEntry {
                raw: value.to_raw(),
                size: T::SIZE as u8,
            },
        );
    }

    fn get<T: SdoValue>(&self, address: ObjectAddress) -> Option<T> {
        self.od
            .get(&address)
            .filter(|entry| entry.size as usize == T::SIZE)
            .map(|entry| T::from_raw(entry.raw))
    }

    fn word(&self, address: ObjectAddress) -> [u8; 4] {
        self.od.get(&address).map(|e| e.raw).unwrap_or_default()
    }

    fn set_byte(&mut self, address: ObjectAddress, byte: usize, value: u8) {
        let mut raw = self.word(address);
        raw[byte] = value;
        self.od.insert(address, OdEntry { raw, size: 4 });
    }

    fn pdo_frames(&self, node_id: u8) -> [CanFrame; 4] {
        let pair = |a: ObjectAddress, b: ObjectAddress| {
            [
                i32::from_le_bytes(self.word(a)),
                i32::from_le_bytes(self.word(b)),
            ]
        };
        [
            FeedbackPdo::Position(pair(POSITION_CHANNEL_1, POSITION_CHANNEL_2)).to_frame(node_id),
            FeedbackPdo::Velocity(pair(VELOCITY_CHANNEL_1, VELOCITY_CHANNEL_2)).to_frame(node_id),
            FeedbackPdo::Current(pair(CURRENT_CHANNEL_1, CURRENT_CHANNEL_2)).to_frame(node_id),
            FeedbackPdo::Flags {
                status: u32::from_le_bytes(self.word(STATUS_FLAGS)),
                runtime: u32::from_le_bytes(self.word(RUNTIME_FLAGS)),
            }
            .to_frame(node_id),
        ]
    }

    /// 处理 SDO 请求，返回响应（无需响应时为 `None`）
    fn handle_sdo(&mut self, request: SdoRequest) -> Option<SdoResponse> {
        match request {
            SdoRequest::Upload { address } => Some(match self.od.get(&address) {
                Some(entry) => SdoResponse::Upload {
                    address,
                    data: entry.raw,
                    size: entry.size,
                },
                None => SdoResponse::Abort {
                    address,
                    code: SDO_ABORT_OBJECT_NOT_EXIST,
                },
            }),
            SdoRequest::Download {
                address,
                data,
                size,
            } => {
                if !self.od.contains_key(&address) {
                    return Some(SdoResponse::Abort {
                        address,
                        code: SDO_ABORT_OBJECT_NOT_EXIST,
                    });
                }
                self.od.insert(address, OdEntry { raw: data, size });
                *self.write_counts.entry(address).or_default() += 1;
                Some(SdoResponse::DownloadAck { address })
            },
            SdoRequest::Abort { address, code } => {
                trace!("Mock received SDO abort 0x{:08X} for {}", code, address);
                None
            },
        }
    }
}

struct MockShared {
    nodes: Mutex<HashMap<u8, MockNode>>,
    running: AtomicBool,
}

/// 模拟 Roboteq 从站集合
///
/// 后台线程持有一个 mock 总线端口；`Drop` 时停止线程。
pub struct RoboteqMock {
    shared: Arc<MockShared>,
    handle: Option<JoinHandle<()>>,
}

impl RoboteqMock {
    /// 在 `bus` 上启动节点 `node_ids` 的模拟（PDO 周期 10 ms）
    pub fn start(bus: &MockCanBus, node_ids: &[u8]) -> Result<Self, CanError> {
        Self::start_with_period(bus, node_ids, DEFAULT_PDO_PERIOD)
    }

    pub fn start_with_period(
        bus: &MockCanBus,
        node_ids: &[u8],
        pdo_period: Duration,
    ) -> Result<Self, CanError> {
        let nodes = node_ids.iter().map(|&id| (id, MockNode::new())).collect();
        let shared = Arc::new(MockShared {
            nodes: Mutex::new(nodes),
            running: AtomicBool::new(true),
        });

        let adapter = bus.connect();
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("roboteq-mock".into())
            .spawn(move || run_mock(adapter, thread_shared, pdo_period))?;

        debug!("Roboteq mock started for nodes {:?}", node_ids);
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn with_node<R>(&self, node_id: u8, f: impl FnOnce(&mut MockNode) -> R) -> Option<R> {
        let mut nodes = self.shared.nodes.lock();
        match nodes.get_mut(&node_id) {
            Some(node) => Some(f(node)),
            None => {
                warn!("Roboteq mock has no node {}", node_id);
                None
            },
        }
    }

    /// 直接写入对象字典
    pub fn set_value<T: SdoValue>(&self, node_id: u8, address: ObjectAddress, value: T) {
        self.with_node(node_id, |node| node.set(address, value));
    }

    /// 读取对象字典（宽度不匹配或不存在返回 `None`）
    pub fn value<T: SdoValue>(&self, node_id: u8, address: ObjectAddress) -> Option<T> {
        self.with_node(node_id, |node| node.get(address)).flatten()
    }

    pub fn set_position(&self, node_id: u8, channel: Channel, ticks: i32) {
        let address = match channel {
            Channel::One => POSITION_CHANNEL_1,
            Channel::Two => POSITION_CHANNEL_2,
        };
        self.set_value(node_id, address, ticks);
    }

    pub fn set_velocity(&self, node_id: u8, channel: Channel, rpm: i32) {
        let address = match channel {
            Channel::One => VELOCITY_CHANNEL_1,
            Channel::Two => VELOCITY_CHANNEL_2,
        };
        self.set_value(node_id, address, rpm);
    }

    pub fn set_current(&self, node_id: u8, channel: Channel, deci_amps: i32) {
        let address = match channel {
            Channel::One => CURRENT_CHANNEL_1,
            Channel::Two => CURRENT_CHANNEL_2,
        };
        self.set_value(node_id, address, deci_amps);
    }

    pub fn set_fault_flags(&self, node_id: u8, flags: u8) {
        self.with_node(node_id, |node| node.set_byte(STATUS_FLAGS, 0, flags));
    }

    pub fn set_script_flags(&self, node_id: u8, flags: u8) {
        self.with_node(node_id, |node| node.set_byte(STATUS_FLAGS, 2, flags));
    }

    pub fn set_runtime_flags(&self, node_id: u8, channel: Channel, flags: u8) {
        let byte = match channel {
            Channel::One => 0,
            Channel::Two => 1,
        };
        self.with_node(node_id, |node| node.set_byte(RUNTIME_FLAGS, byte, flags));
    }

    pub fn set_temperature(&self, node_id: u8, celsius: i8) {
        self.set_value(node_id, TEMPERATURE, celsius);
    }

    pub fn set_voltage(&self, node_id: u8, deci_volts: u16) {
        self.set_value(node_id, VOLTAGE, deci_volts);
    }

    pub fn set_battery_current(&self, node_id: u8, channel: Channel, deci_amps: i16) {
        self.set_value(node_id, channel.battery_current_address(), deci_amps);
    }

    pub fn set_device_type(&self, node_id: u8, device_type: u32) {
        self.set_value(node_id, DEVICE_TYPE, device_type);
    }

    pub fn set_vendor_id(&self, node_id: u8, vendor_id: u32) {
        self.set_value(node_id, VENDOR_ID, vendor_id);
    }

    /// 对 `address` 的 SDO 响应延迟 `delay` 后发送
    pub fn set_response_delay(&self, node_id: u8, address: ObjectAddress, delay: Duration) {
        self.with_node(node_id, |node| node.response_delays.insert(address, delay));
    }

    pub fn clear_response_delays(&self, node_id: u8) {
        self.with_node(node_id, |node| node.response_delays.clear());
    }

    pub fn set_boot_behavior(&self, node_id: u8, behavior: BootBehavior) {
        self.with_node(node_id, |node| node.boot_behavior = behavior);
    }

    pub fn set_boot_delay(&self, node_id: u8, delay: Duration) {
        self.with_node(node_id, |node| node.boot_delay = delay);
    }

    /// 关闭后该节点停止发送 PDO（用于模拟反馈过期）
    pub fn set_pdo_enabled(&self, node_id: u8, enabled: bool) {
        self.with_node(node_id, |node| node.pdo_enabled = enabled);
    }

    /// 最近一次写入的速度指令
    pub fn command(&self, node_id: u8, channel: Channel) -> Option<i32> {
        self.value(node_id, channel.command_address())
    }

    /// `address` 被 SDO 写入的次数
    pub fn write_count(&self, node_id: u8, address: ObjectAddress) -> usize {
        self.with_node(node_id, |node| {
            node.write_counts.get(&address).copied().unwrap_or(0)
        })
        .unwrap_or(0)
    }

    pub fn nmt_state(&self, node_id: u8) -> Option<NmtState> {
        self.with_node(node_id, |node| node.nmt)
    }

    /// 停止后台线程
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RoboteqMock {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_mock(mut adapter: MockCanAdapter, shared: Arc<MockShared>, pdo_period: Duration) {
    adapter.set_receive_timeout(Duration::from_millis(1));
    let mut pending: Vec<(Instant, CanFrame)> = Vec::new();
    let mut next_pdo = Instant::now() + pdo_period;

    while shared.running.load(Ordering::Acquire) {
        match adapter.receive() {
            Ok(frame) => handle_frame(&shared, frame, &mut pending),
            Err(CanError::Timeout) | Err(CanError::BusOff) => {},
            Err(e) => {
                warn!("Roboteq mock stopped: {}", e);
                break;
            },
        }

        let now = Instant::now();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].0 <= now {
                let (_, frame) = pending.remove(i);
                let _ = adapter.send(frame);
            } else {
                i += 1;
            }
        }

        if now >= next_pdo {
            next_pdo = now + pdo_period;
            let frames: Vec<CanFrame> = {
                let nodes = shared.nodes.lock();
                nodes
                    .iter()
                    .filter(|(_, node)| node.nmt == NmtState::Operational && node.pdo_enabled)
                    .flat_map(|(&id, node)| node.pdo_frames(id))
                    .collect()
            };
            for frame in frames {
                let _ = adapter.send(frame);
            }
        }
    }
}

fn handle_frame(shared: &MockShared, frame: CanFrame, pending: &mut Vec<(Instant, CanFrame)>) {
    let now = Instant::now();
    let mut nodes = shared.nodes.lock();

    match classify(frame.id) {
        CobKind::Nmt => {
            let Ok((command, target)) = parse_nmt(&frame) else {
                return;
            };
            for (&node_id, node) in nodes.iter_mut() {
                if target != 0 && target != node_id {
                    continue;
                }
                match command {
                    NmtCommand::ResetCommunication | NmtCommand::ResetNode => {
                        node.nmt = NmtState::PreOperational;
                        let due = now + node.boot_delay;
                        match node.boot_behavior {
                            BootBehavior::Normal => pending.push((due, boot_up_frame(node_id))),
                            BootBehavior::Silent => {},
                            BootBehavior::Emergency(code) => {
                                pending.push((due, Emergency::new(code, 0x01).to_frame(node_id)))
                            },
                        }
                    },
                    NmtCommand::Start => node.nmt = NmtState::Operational,
                    NmtCommand::Stop => node.nmt = NmtState::Stopped,
                    NmtCommand::EnterPreOperational => node.nmt = NmtState::PreOperational,
                }
                trace!("Mock node {} NMT {:?} -> {:?}", node_id, command, node.nmt);
            }
        },
        CobKind::SdoRequest { node_id } => {
            let Some(node) = nodes.get_mut(&node_id) else {
                return;
            };
            if node.nmt == NmtState::Stopped {
                return;
            }
            let request = match SdoRequest::parse(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Mock node {} got malformed SDO request: {}", node_id, e);
                    return;
                },
            };
            let delay = node
                .response_delays
                .get(&request.address())
                .copied()
                .unwrap_or(Duration::ZERO);
            if let Some(response) = node.handle_sdo(request) {
                pending.push((now + delay, response.to_frame(node_id)));
            }
        },
        _ => {},
    }
}
