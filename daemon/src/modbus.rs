use std::{future::Future, io, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::net::lookup_host;
use tokio_modbus::{
    client::{tcp, Context},
    prelude::{Reader, Writer},
    slave::Slave,
};

use regulator_common::ModbusConfig;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("modbus transaction failed: {0}")]
    Transaction(#[source] io::Error),
    #[error("no register value in response")]
    EmptyResponse,
    #[error("modbus transaction timed out after {0:?}")]
    Timeout(Duration),
    #[error("power limit {0} does not fit a register")]
    OutOfRange(i32),
}

/// Holder of the inverter power limit, in per-mille of rated output.
pub trait PowerLimitDevice {
    fn read_power_limit(&self) -> impl Future<Output = Result<u16, DeviceError>> + Send;

    fn write_power_limit(&self, value: u16) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

/// Modbus TCP access to the inverter gateway; one connection per transaction.
#[derive(Debug, Clone)]
pub struct EcuClient {
    host: String,
    port: u16,
    slave: u8,
    register: u16,
    timeout: Duration,
}

impl EcuClient {
    pub fn new(config: &ModbusConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            slave: config.slave_id,
            register: config.power_limit_register,
            timeout: Duration::from_secs(config.timeout_s),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<Context, DeviceError> {
        let addr = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|source| DeviceError::Resolve {
                host: self.host.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| DeviceError::Resolve {
                host: self.host.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no address"),
            })?;

        tcp::connect_slave(addr, Slave(self.slave))
            .await
            .map_err(|source| DeviceError::Connect { addr, source })
    }

    async fn bounded<T>(
        &self,
        transaction: impl Future<Output = Result<T, DeviceError>>,
    ) -> Result<T, DeviceError> {
        tokio::time::timeout(self.timeout, transaction)
            .await
            .map_err(|_| DeviceError::Timeout(self.timeout))?
    }
}

impl PowerLimitDevice for EcuClient {
    async fn read_power_limit(&self) -> Result<u16, DeviceError> {
        self.bounded(async {
            let mut ctx = self.connect().await?;
            let values = ctx
                .read_holding_registers(self.register, 1)
                .await
                .map_err(DeviceError::Transaction)?;
            values.first().copied().ok_or(DeviceError::EmptyResponse)
        })
        .await
    }

    async fn write_power_limit(&self, value: u16) -> Result<(), DeviceError> {
        self.bounded(async {
            let mut ctx = self.connect().await?;
            ctx.write_multiple_registers(self.register, &[value])
                .await
                .map_err(DeviceError::Transaction)
        })
        .await
    }
}
