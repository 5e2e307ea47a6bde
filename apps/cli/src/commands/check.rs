//! 检查命令
//!
//! 初始化、激活，读取若干周期后打印两个单元的状态，最后关闭。

use crate::setup::SystemOptions;
use anyhow::{Context, Result};
use clap::Args;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// 检查命令参数
#[derive(Args, Debug)]
pub struct CheckCommand {
    /// 打印前执行的读周期数（覆盖一轮辅助状态轮询）
    #[arg(long, default_value_t = 16)]
    pub cycles: u32,

    /// 读周期间隔（毫秒）
    #[arg(long, default_value_t = 10)]
    pub period_ms: u64,

    /// 打印前尝试复位急停
    #[arg(long)]
    pub reset_e_stop: bool,
}

impl CheckCommand {
    pub fn execute(&self, options: &SystemOptions) -> Result<()> {
        let handle = options.build_system()?;
        handle.start()?;

        let result = self.run_cycles(&handle);
        handle.print_status();
        handle.system.shutdown();
        result
    }

    fn run_cycles(&self, handle: &crate::setup::SystemHandle) -> Result<()> {
        let period = Duration::from_millis(self.period_ms);
        for _ in 0..self.cycles {
            handle.system.read().context("Read cycle failed")?;
            thread::sleep(period);
        }

        if self.reset_e_stop {
            if let Err(err) = handle.system.reset_e_stop() {
                warn!("E-Stop reset failed: {}", err);
            }
            handle.system.read().context("Read cycle failed")?;
        }
        Ok(())
    }
}
