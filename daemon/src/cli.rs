use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use regulator_common::DaemonConfig;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Err,
}

impl LogLevel {
    pub fn directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Err => "error",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "regulator-daemon",
    version,
    about = "Solar injection regulation daemon"
)]
pub struct Args {
    /// Address of the inverter gateway (overrides the config file).
    pub ecu_ip: Option<String>,
    #[arg(long)]
    pub modbus_port: Option<u16>,
    #[arg(long)]
    pub modbus_slave: Option<u8>,
    #[arg(long, default_value = "0.0.0.0")]
    pub http_host: String,
    #[arg(long, default_value_t = 8000)]
    pub http_port: u16,
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,
    /// Append logs to this file instead of stdout.
    #[arg(long)]
    pub logfile: Option<PathBuf>,
    /// JSON daemon settings; defaults apply when absent.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Args {
    pub fn apply(&self, config: &mut DaemonConfig) {
        if let Some(host) = &self.ecu_ip {
            config.modbus.host = host.clone();
        }
        if let Some(port) = self.modbus_port {
            config.modbus.port = port;
        }
        if let Some(slave) = self.modbus_slave {
            config.modbus.slave_id = slave;
        }
    }
}
