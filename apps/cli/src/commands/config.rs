//! 配置管理命令

use crate::setup::SystemOptions;
use anyhow::{Context, Result, bail};
use clap::Subcommand;
use panther_system::SystemConfig;
use std::path::{Path, PathBuf};

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 写出默认配置
    Init {
        /// 目标文件
        path: PathBuf,

        /// 覆盖已存在的文件
        #[arg(short, long)]
        force: bool,
    },

    /// 打印生效的配置（默认值 + 配置文件 + 命令行覆盖）
    Show,
}

impl ConfigCommand {
    pub fn execute(&self, options: &SystemOptions) -> Result<()> {
        match self {
            ConfigCommand::Init { path, force } => {
                write_default_config(path, *force)?;
                println!("✅ Wrote default configuration to {}", path.display());
                Ok(())
            },
            ConfigCommand::Show => {
                let config = options.load_config()?;
                print!("{}", config.to_toml_string()?);
                Ok(())
            },
        }
    }
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    SystemConfig::default()
        .save_to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}
