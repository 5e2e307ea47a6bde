//! 控制周期命令
//!
//! 以固定频率执行 `read` / `write`，Ctrl-C 触发急停后退出。

use crate::setup::SystemOptions;
use anyhow::{Context, Result, bail};
use clap::Args;
use panther_system::WheelVelocities;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 控制周期参数
#[derive(Args, Debug)]
pub struct RunCommand {
    /// 控制频率（Hz）
    #[arg(short, long, default_value_t = 100)]
    pub rate: u32,

    /// 四个车轮的目标速度（rad/s）
    #[arg(short, long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub velocity: f64,

    /// 运行时长（秒），缺省运行到 Ctrl-C
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// 启动后复位急停
    #[arg(long)]
    pub reset_e_stop: bool,

    /// 状态日志间隔（秒）
    #[arg(long, default_value_t = 1.0)]
    pub status_interval: f64,
}

impl RunCommand {
    pub fn execute(&self, options: &SystemOptions) -> Result<()> {
        if self.rate == 0 {
            bail!("Control rate must be positive");
        }
        let period = Duration::from_secs_f64(1.0 / self.rate as f64);
        let deadline = self
            .duration
            .map(|seconds| Instant::now() + Duration::from_secs_f64(seconds.max(0.0)));
        let status_interval = Duration::from_secs_f64(self.status_interval.max(0.1));

        let running = Arc::new(AtomicBool::new(true));
        {
            let running = running.clone();
            ctrlc::set_handler(move || {
                running.store(false, Ordering::SeqCst);
            })
            .context("Failed to install Ctrl-C handler")?;
        }

        let handle = options.build_system()?;
        handle.start()?;
        let system = &handle.system;

        if self.reset_e_stop {
            // 复位要求速度指令为零
            system.write(WheelVelocities::ZERO)?;
            system.read()?;
            if let Err(err) = system.reset_e_stop() {
                warn!("E-Stop reset failed: {}", err);
            }
        }

        let velocities = WheelVelocities::new(
            self.velocity,
            self.velocity,
            self.velocity,
            self.velocity,
        );
        info!("Control loop running at {} Hz", self.rate);

        let mut cycles: u64 = 0;
        let mut last_status = Instant::now();
        let result = loop {
            if !running.load(Ordering::SeqCst) {
                info!("Interrupted, stopping");
                break Ok(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break Ok(());
            }

            let cycle_start = Instant::now();
            if let Err(err) = system.read().and_then(|_| system.write(velocities)) {
                break Err(err);
            }
            cycles += 1;

            if last_status.elapsed() >= status_interval {
                last_status = Instant::now();
                info!(
                    "cycles={} e_stop={} filter_error={}",
                    cycles,
                    system.e_stop().is_triggered(),
                    system.error_filter().is_error()
                );
            }

            if let Some(remaining) = period.checked_sub(cycle_start.elapsed()) {
                spin_sleep::sleep(remaining);
            }
        };

        handle.system.shutdown();
        info!("Ran {} cycles", cycles);
        result.context("Control cycle failed")
    }
}
