//! 驱动系统的构建（真实总线或模拟从站）

use anyhow::{Context, Result};
use panther_can::mock::{MockCanBus, RoboteqMock};
use panther_driver::CanOpenControllerBuilder;
use panther_system::{DriveSystem, GpioController, SystemConfig, Unit, VirtualGpio};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// 全局命令行选项
#[derive(Debug, Clone, Default)]
pub struct SystemOptions {
    pub config: Option<PathBuf>,
    pub interface: Option<String>,
    pub simulate: bool,
}

impl SystemOptions {
    /// 加载配置并应用命令行覆盖
    pub fn load_config(&self) -> Result<SystemConfig> {
        let mut config = match &self.config {
            Some(path) => SystemConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SystemConfig::default(),
        };
        if let Some(interface) = &self.interface {
            config.canopen.interface = interface.clone();
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// 构建（未初始化的）驱动系统
    pub fn build_system(&self) -> Result<SystemHandle> {
        let config = self.load_config()?;
        let gpio = Arc::new(VirtualGpio::new()) as Arc<dyn GpioController>;

        if !self.simulate {
            info!("Using CAN interface {}", config.canopen.interface);
            let system = DriveSystem::from_config(config, gpio)?;
            return Ok(SystemHandle {
                system,
                _simulation: None,
            });
        }

        let bus = MockCanBus::new();
        let slaves = RoboteqMock::start(
            &bus,
            &[config.canopen.front_node_id, config.canopen.rear_node_id],
        )?;
        info!(
            "Using simulated Roboteq drivers (nodes {} and {})",
            config.canopen.front_node_id, config.canopen.rear_node_id
        );
        let factory_bus = bus.clone();
        let controller = CanOpenControllerBuilder::new()
            .settings(config.canopen.to_settings())
            .with_adapter_factory(move || Ok(factory_bus.connect()))
            .build()?;

        Ok(SystemHandle {
            system: DriveSystem::new(config, controller, gpio),
            _simulation: Some(Simulation {
                _slaves: slaves,
                _bus: bus,
            }),
        })
    }
}

/// 模拟从站，与驱动系统同生命周期
struct Simulation {
    _slaves: RoboteqMock,
    _bus: MockCanBus,
}

/// 驱动系统及其依赖的资源
pub struct SystemHandle {
    pub system: DriveSystem,
    _simulation: Option<Simulation>,
}

impl SystemHandle {
    /// 初始化并激活
    pub fn start(&self) -> Result<()> {
        self.system.initialize().context("Initialization failed")?;
        self.system.activate().context("Activation failed")?;
        Ok(())
    }

    /// 打印两个单元的状态
    pub fn print_status(&self) {
        for unit in Unit::ALL {
            let state = self.system.unit_state(unit);
            let driver = state.driver_state();
            println!("[{}]", unit);
            println!(
                "  left:  position {:>10.4} rad  velocity {:>8.4} rad/s  torque {:>7.3} Nm",
                state.left_motor().position(),
                state.left_motor().velocity(),
                state.left_motor().torque(),
            );
            println!(
                "  right: position {:>10.4} rad  velocity {:>8.4} rad/s  torque {:>7.3} Nm",
                state.right_motor().position(),
                state.right_motor().velocity(),
                state.right_motor().torque(),
            );
            println!(
                "  driver: {:.1} °C  {:.1} V  {:.1} A",
                driver.temperature(),
                driver.voltage(),
                driver.current(),
            );
            if state.is_error() {
                println!("  errors: {}", state.error_log());
            } else {
                println!("  errors: none");
            }
        }
        println!(
            "E-Stop ({}): {}",
            self.system.e_stop().strategy_name(),
            if self.system.e_stop().is_triggered() { "triggered" } else { "released" }
        );
    }
}
