//! 总线会话
//!
//! 独占 CAN 适配器，在专用 IO 线程中运行事件循环：
//! - 发送调度的 SDO 请求（每个节点同一时间只有一个请求在途）
//! - 分发 SDO 响应、boot-up、EMCY 和反馈 PDO
//! - 处理取消、boot 和关闭命令
//!
//! 调用方通过 [`SessionHandle`] 提交命令，得到 [`ExchangeHandle`] 后自行决定等待时长。

use crate::error::DriverError;
use crate::state::{BootState, NodeContext};
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use panther_can::{CanAdapter, CanError};
use panther_protocol::{
    CanFrame, CobKind, Emergency, FeedbackPdo, NmtCommand, NmtState, ProtocolError,
    SDO_ABORT_TIMEOUT, SdoRequest, SdoResponse, classify, nmt_frame, parse_heartbeat,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 带超时的线程 join
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();
        spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 适配器接收超时，决定命令队列的最大响应延迟
    pub receive_timeout: Duration,
    /// 等待 IO 线程报告通信已启动的超时
    pub start_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_micros(500),
            start_timeout: Duration::from_secs(1),
        }
    }
}

/// 单次交换的失败原因
#[derive(Debug)]
pub enum ExchangeError {
    /// 被调用方取消，或因 boot / 关闭被丢弃
    Cancelled,
    /// 会话侧超时
    TimedOut,
    /// 从站回复了 SDO abort
    Aborted(u32),
    /// 发送请求失败
    Can(CanError),
    /// 响应无法解析
    Protocol(ProtocolError),
    /// 会话已退出
    SessionClosed,
}

type Reply = Result<SdoResponse, ExchangeError>;

enum SessionCommand {
    Schedule {
        token: u64,
        node_id: u8,
        request: SdoRequest,
        timeout: Duration,
        reply: Sender<Reply>,
    },
    Cancel {
        token: u64,
        node_id: u8,
    },
    Boot {
        node_id: u8,
    },
    Shutdown,
}

/// 已调度交换的句柄
#[derive(Debug)]
pub struct ExchangeHandle {
    token: u64,
    node_id: u8,
    rx: Receiver<Reply>,
}

impl ExchangeHandle {
    /// 等待交换完成
    ///
    /// # 返回值
    ///
    /// `None` 表示 `timeout` 内没有结果；其余情况返回交换结果。
    pub fn wait(&self, timeout: Duration) -> Option<Reply> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => Some(reply),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Some(Err(ExchangeError::SessionClosed))
            },
        }
    }
}

/// 会话命令入口（可克隆，供每个驱动持有）
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: Sender<SessionCommand>,
    next_token: Arc<AtomicU64>,
    nodes: Arc<[Arc<NodeContext>]>,
}

impl SessionHandle {
    /// 调度一次 SDO 交换
    ///
    /// # 错误
    ///
    /// IO 线程已退出时返回 `ChannelClosed`
    pub fn schedule(
        &self,
        node_id: u8,
        request: SdoRequest,
        timeout: Duration,
    ) -> Result<ExchangeHandle, DriverError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = bounded(1);
        self.cmd_tx
            .send(SessionCommand::Schedule {
                token,
                node_id,
                request,
                timeout,
                reply,
            })
            .map_err(|_| DriverError::ChannelClosed)?;
        Ok(ExchangeHandle { token, node_id, rx })
    }

    /// 取消交换；已完成的交换不受影响
    pub fn cancel(&self, handle: &ExchangeHandle) -> Result<(), DriverError> {
        self.cmd_tx
            .send(SessionCommand::Cancel {
                token: handle.token,
                node_id: handle.node_id,
            })
            .map_err(|_| DriverError::ChannelClosed)
    }

    /// 对节点发起 boot（NMT Reset Communication）
    ///
    /// 返回前节点已处于 Booting，随后的 `wait_for_boot` 不会看到 NotBooted。
    pub fn boot(&self, node_id: u8) -> Result<(), DriverError> {
        if let Some(ctx) = self.nodes.iter().find(|ctx| ctx.node_id() == node_id) {
            ctx.begin_boot();
        }
        self.cmd_tx
            .send(SessionCommand::Boot { node_id })
            .map_err(|_| DriverError::ChannelClosed)
    }
}

/// 总线会话（拥有 IO 线程）
pub struct BusSession {
    handle: SessionHandle,
    io_thread: Option<JoinHandle<()>>,
}

impl BusSession {
    /// 启动 IO 线程并等待通信启动
    ///
    /// 适配器在 IO 线程内由 `factory` 创建。
    ///
    /// # 错误
    ///
    /// 适配器打开失败或 `config.start_timeout` 内未报告启动时返回 `CommunicationError`
    pub fn start<A, F>(
        factory: F,
        nodes: Vec<Arc<NodeContext>>,
        config: SessionConfig,
    ) -> Result<Self, DriverError>
    where
        A: CanAdapter,
        F: FnOnce() -> Result<A, CanError> + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = unbounded();
        let handle_nodes: Arc<[Arc<NodeContext>]> = nodes.iter().cloned().collect();
        let (started_tx, started_rx) = bounded::<Result<(), CanError>>(1);
        let receive_timeout = config.receive_timeout;

        let io_thread = std::thread::Builder::new()
            .name("panther-can-io".to_string())
            .spawn(move || {
                #[cfg(feature = "realtime")]
                {
                    use thread_priority::*;

                    match set_current_thread_priority(ThreadPriority::Max) {
                        Ok(_) => info!("CAN IO thread priority set to MAX (realtime)"),
                        Err(e) => warn!(
                            "Failed to set CAN IO thread priority: {}. \
                            On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                            e
                        ),
                    }
                }

                let mut can = match factory() {
                    Ok(can) => can,
                    Err(e) => {
                        let _ = started_tx.send(Err(e));
                        return;
                    },
                };
                can.set_receive_timeout(receive_timeout);
                if started_tx.send(Ok(())).is_err() {
                    return;
                }
                io_loop(can, cmd_rx, nodes);
            })
            .map_err(|e| DriverError::IoThread(e.to_string()))?;

        let mut session = Self {
            handle: SessionHandle {
                cmd_tx,
                next_token: Arc::new(AtomicU64::new(0)),
                nodes: handle_nodes,
            },
            io_thread: Some(io_thread),
        };

        match started_rx.recv_timeout(config.start_timeout) {
            Ok(Ok(())) => {
                info!("CAN communication started");
                Ok(session)
            },
            Ok(Err(e)) => {
                session.shutdown();
                Err(DriverError::CommunicationError(format!(
                    "failed to open CAN adapter: {}",
                    e
                )))
            },
            Err(_) => {
                session.shutdown();
                Err(DriverError::CommunicationError(format!(
                    "communication did not start within {:?}",
                    config.start_timeout
                )))
            },
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// 发送 NMT Stop 并等待 IO 线程退出
    pub fn shutdown(&mut self) {
        let Some(io_thread) = self.io_thread.take() else {
            return;
        };
        let _ = self.handle.cmd_tx.send(SessionCommand::Shutdown);

        let join_timeout = Duration::from_secs(2);
        if let Err(_e) = io_thread.join_timeout(join_timeout) {
            error!(
                "CAN IO thread panicked or failed to shut down within {:?}",
                join_timeout
            );
        } else {
            debug!("CAN IO thread stopped");
        }
    }
}

impl Drop for BusSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// IO 线程
// ============================================================================

struct Exchange {
    token: u64,
    request: SdoRequest,
    timeout: Duration,
    deadline: Option<Instant>,
    reply: Sender<Reply>,
}

impl Exchange {
    fn complete(self, reply: Reply) {
        // 调用方可能已经放弃等待
        let _ = self.reply.send(reply);
    }
}

struct NodeSlot {
    ctx: Arc<NodeContext>,
    queue: VecDeque<Exchange>,
    in_flight: Option<Exchange>,
}

impl NodeSlot {
    fn fail_all(&mut self, make_error: impl Fn() -> ExchangeError) {
        if let Some(exchange) = self.in_flight.take() {
            exchange.complete(Err(make_error()));
        }
        for exchange in self.queue.drain(..) {
            exchange.complete(Err(make_error()));
        }
    }
}

struct LoopState {
    slots: Vec<NodeSlot>,
}

impl LoopState {
    fn slot_mut(&mut self, node_id: u8) -> Option<&mut NodeSlot> {
        self.slots.iter_mut().find(|slot| slot.ctx.node_id() == node_id)
    }

    fn latch_bus_error(&self) {
        for slot in &self.slots {
            slot.ctx.latch_bus_error();
        }
    }
}

/// IO 线程主循环
fn io_loop(mut can: impl CanAdapter, cmd_rx: Receiver<SessionCommand>, nodes: Vec<Arc<NodeContext>>) {
    let mut state = LoopState {
        slots: nodes
            .into_iter()
            .map(|ctx| NodeSlot {
                ctx,
                queue: VecDeque::new(),
                in_flight: None,
            })
            .collect(),
    };

    loop {
        if drain_commands(&mut can, &cmd_rx, &mut state) {
            break;
        }
        dispatch_pending(&mut can, &mut state);
        expire_in_flight(&mut can, &mut state);

        match can.receive() {
            Ok(frame) => handle_frame(&mut can, &mut state, frame),
            Err(CanError::Timeout) => {},
            Err(e) => {
                if e.is_bus_fault() {
                    state.latch_bus_error();
                }
                warn!("CAN receive error: {}", e);
            },
        }
    }

    // 有序关闭：停止所有从站，丢弃未完成的交换
    for slot in &mut state.slots {
        let node_id = slot.ctx.node_id();
        if let Err(e) = can.send(nmt_frame(NmtCommand::Stop, node_id)) {
            warn!("Failed to send NMT Stop to node {}: {}", node_id, e);
        }
        slot.fail_all(|| ExchangeError::Cancelled);
        slot.ctx.reset_boot();
    }
    info!("CAN IO loop exited");
}

/// 处理命令队列（带时间预算）
///
/// # 返回值
/// 收到 Shutdown 或通道断开时返回 true。
fn drain_commands(
    can: &mut impl CanAdapter,
    cmd_rx: &Receiver<SessionCommand>,
    state: &mut LoopState,
) -> bool {
    const MAX_DRAIN_PER_CYCLE: usize = 32;
    const TIME_BUDGET: Duration = Duration::from_micros(500);

    let start = Instant::now();

    for _ in 0..MAX_DRAIN_PER_CYCLE {
        if start.elapsed() > TIME_BUDGET {
            trace!("Drain time budget exhausted, deferred {} commands", cmd_rx.len());
            break;
        }

        match cmd_rx.try_recv() {
            Ok(SessionCommand::Schedule {
                token,
                node_id,
                request,
                timeout,
                reply,
            }) => {
                let exchange = Exchange {
                    token,
                    request,
                    timeout,
                    deadline: None,
                    reply,
                };
                match state.slot_mut(node_id) {
                    Some(slot) => slot.queue.push_back(exchange),
                    None => {
                        warn!("SDO request for unknown node {}", node_id);
                        exchange.complete(Err(ExchangeError::Cancelled));
                    },
                }
            },
            Ok(SessionCommand::Cancel { token, node_id }) => cancel(can, state, token, node_id),
            Ok(SessionCommand::Boot { node_id }) => boot(can, state, node_id),
            Ok(SessionCommand::Shutdown) => return true,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return true,
        }
    }

    false
}

/// 空闲节点发出队首请求
fn dispatch_pending(can: &mut impl CanAdapter, state: &mut LoopState) {
    let mut send_failed = false;

    for slot in &mut state.slots {
        while slot.in_flight.is_none() {
            let Some(mut exchange) = slot.queue.pop_front() else {
                break;
            };
            let node_id = slot.ctx.node_id();
            match can.send(exchange.request.to_frame(node_id)) {
                Ok(()) => {
                    trace!("SDO {} -> node {}", exchange.request.address(), node_id);
                    exchange.deadline = Some(Instant::now() + exchange.timeout);
                    slot.in_flight = Some(exchange);
                },
                Err(e) => {
                    warn!("Failed to send SDO request to node {}: {}", node_id, e);
                    send_failed |= e.is_bus_fault();
                    exchange.complete(Err(ExchangeError::Can(e)));
                },
            }
        }
    }

    if send_failed {
        state.latch_bus_error();
    }
}

/// 会话侧超时：调用方未取消时兜底结束在途交换
fn expire_in_flight(can: &mut impl CanAdapter, state: &mut LoopState) {
    let now = Instant::now();
    for slot in &mut state.slots {
        let expired = matches!(
            &slot.in_flight,
            Some(Exchange { deadline: Some(deadline), .. }) if now > *deadline
        );
        if !expired {
            continue;
        }
        if let Some(exchange) = slot.in_flight.take() {
            let node_id = slot.ctx.node_id();
            debug!("SDO {} on node {} expired", exchange.request.address(), node_id);
            send_abort(can, node_id, &exchange.request);
            exchange.complete(Err(ExchangeError::TimedOut));
        }
    }
}

fn send_abort(can: &mut impl CanAdapter, node_id: u8, request: &SdoRequest) {
    let abort = SdoRequest::abort(request.address(), SDO_ABORT_TIMEOUT);
    if let Err(e) = can.send(abort.to_frame(node_id)) {
        warn!("Failed to send SDO abort to node {}: {}", node_id, e);
    }
}

fn cancel(can: &mut impl CanAdapter, state: &mut LoopState, token: u64, node_id: u8) {
    let Some(slot) = state.slot_mut(node_id) else {
        return;
    };

    if slot.in_flight.as_ref().is_some_and(|e| e.token == token) {
        if let Some(exchange) = slot.in_flight.take() {
            debug!(
                "Cancelling in-flight SDO {} on node {}",
                exchange.request.address(),
                node_id
            );
            send_abort(can, node_id, &exchange.request);
            exchange.complete(Err(ExchangeError::Cancelled));
        }
        return;
    }

    if let Some(position) = slot.queue.iter().position(|e| e.token == token)
        && let Some(exchange) = slot.queue.remove(position)
    {
        exchange.complete(Err(ExchangeError::Cancelled));
    }
}

fn boot(can: &mut impl CanAdapter, state: &mut LoopState, node_id: u8) {
    let Some(slot) = state.slot_mut(node_id) else {
        warn!("Boot requested for unknown node {}", node_id);
        return;
    };

    // Booting 已由 SessionHandle::boot 在入队前设置
    slot.fail_all(|| ExchangeError::Cancelled);
    info!("Booting node {}", node_id);

    if let Err(e) = can.send(nmt_frame(NmtCommand::ResetCommunication, node_id)) {
        slot.ctx.fail_boot(format!("failed to send NMT reset: {}", e));
        if e.is_bus_fault() {
            state.latch_bus_error();
        }
    }
}

fn handle_frame(can: &mut impl CanAdapter, state: &mut LoopState, frame: CanFrame) {
    match classify(frame.id) {
        CobKind::Tpdo { number, node_id } => {
            let Some(slot) = state.slot_mut(node_id) else {
                return;
            };
            match FeedbackPdo::parse(number, &frame) {
                Ok(pdo) => slot.ctx.apply_pdo(pdo, Instant::now()),
                Err(e) => warn!("Malformed TPDO{} from node {}: {}", number, node_id, e),
            }
        },
        CobKind::SdoResponse { node_id } => handle_sdo_response(state, node_id, &frame),
        CobKind::Heartbeat { node_id } => {
            let Some(slot) = state.slot_mut(node_id) else {
                return;
            };
            match parse_heartbeat(&frame) {
                Ok(NmtState::BootUp) => {
                    if slot.ctx.boot_state() != BootState::Booting {
                        debug!("Unexpected boot-up from node {}", node_id);
                        return;
                    }
                    match can.send(nmt_frame(NmtCommand::Start, node_id)) {
                        Ok(()) => {
                            if slot.ctx.try_complete_boot() {
                                info!("Node {} boot complete", node_id);
                            }
                        },
                        Err(e) => slot.ctx.fail_boot(format!("failed to send NMT start: {}", e)),
                    }
                },
                Ok(nmt_state) => trace!("Heartbeat from node {}: {:?}", node_id, nmt_state),
                Err(e) => warn!("Malformed heartbeat from node {}: {}", node_id, e),
            }
        },
        CobKind::Emergency { node_id } => {
            let Some(slot) = state.slot_mut(node_id) else {
                return;
            };
            match Emergency::try_from(frame) {
                Ok(emcy) if emcy.is_error() => {
                    warn!(
                        "EMCY from node {}: code 0x{:04X}, register 0x{:02X}",
                        node_id, emcy.error_code, emcy.error_register
                    );
                    if slot.ctx.boot_state() == BootState::Booting {
                        slot.ctx
                            .fail_boot(format!("EMCY error code 0x{:04X}", emcy.error_code));
                    }
                },
                Ok(_) => debug!("EMCY error reset from node {}", node_id),
                Err(e) => warn!("Malformed EMCY from node {}: {}", node_id, e),
            }
        },
        CobKind::Nmt | CobKind::SdoRequest { .. } | CobKind::Unknown => {},
    }
}

fn handle_sdo_response(state: &mut LoopState, node_id: u8, frame: &CanFrame) {
    let Some(slot) = state.slot_mut(node_id) else {
        return;
    };

    let response = match SdoResponse::parse(frame) {
        Ok(response) => response,
        Err(e) => {
            warn!("Malformed SDO response from node {}: {}", node_id, e);
            if let Some(exchange) = slot.in_flight.take() {
                exchange.complete(Err(ExchangeError::Protocol(e)));
            }
            return;
        },
    };

    let matches_in_flight = slot
        .in_flight
        .as_ref()
        .is_some_and(|e| e.request.address() == response.address());
    if !matches_in_flight {
        // 取消或超时之后迟到的响应
        debug!(
            "Dropping stale SDO response {} from node {}",
            response.address(),
            node_id
        );
        return;
    }

    let Some(exchange) = slot.in_flight.take() else {
        return;
    };
    match response {
        SdoResponse::Abort { code, .. } => {
            warn!(
                "Node {} aborted SDO {} with code 0x{:08X}",
                node_id,
                response.address(),
                code
            );
            exchange.complete(Err(ExchangeError::Aborted(code)));
        },
        _ => {
            slot.ctx.clear_bus_error();
            exchange.complete(Ok(response));
        },
    }
}
