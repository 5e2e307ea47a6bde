//! # Panther CLI
//!
//! Panther 底盘驱动的命令行工具。
//!
//! ```bash
//! # 生成默认配置
//! panther-cli config init panther.toml
//!
//! # 初始化、激活并打印驱动器状态
//! panther-cli --config panther.toml check
//!
//! # 以 100 Hz 运行控制周期，Ctrl-C 触发急停后退出
//! panther-cli --config panther.toml run --velocity 0.5 --reset-e-stop
//!
//! # 无硬件：进程内模拟的 Roboteq 从站
//! panther-cli --simulate check
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod setup;

use commands::{CheckCommand, ConfigCommand, RunCommand};
use setup::SystemOptions;

/// Panther CLI - 底盘驱动命令行工具
#[derive(Parser, Debug)]
#[command(name = "panther-cli")]
#[command(about = "Command-line interface for the Panther drivetrain", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML 配置文件（缺省使用内置默认值）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 覆盖配置中的 SocketCAN 接口
    #[arg(short, long, global = true)]
    interface: Option<String>,

    /// 使用进程内模拟的 Roboteq 从站
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 初始化、激活并打印一次驱动器状态
    Check {
        #[command(flatten)]
        args: CheckCommand,
    },

    /// 运行控制周期
    Run {
        #[command(flatten)]
        args: RunCommand,
    },
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("panther_cli=info".parse()?)
                .add_directive("panther_system=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let options = SystemOptions {
        config: cli.config,
        interface: cli.interface,
        simulate: cli.simulate,
    };

    match cli.command {
        Commands::Config(cmd) => cmd.execute(&options),
        Commands::Check { args } => args.execute(&options),
        Commands::Run { args } => args.execute(&options),
    }
}
