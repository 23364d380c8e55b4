//! Modbus TCP grid meter
//!
//! Reads a signed power value from holding registers. 32-bit values are
//! transmitted low word first.

use super::PowerMeterReader;
use super::retry::RetryPolicy;
use crate::config::MeterRegisterType;
use crate::error::{Result, ZeroFeedError};
use crate::logging::{StructuredLogger, get_logger};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::{Context, tcp};
use tokio_modbus::prelude::*;

/// Register layout of the power value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Int16,
    Uint16,
    Int32,
}

impl RegisterType {
    pub fn register_count(self) -> u16 {
        match self {
            RegisterType::Int16 | RegisterType::Uint16 => 1,
            RegisterType::Int32 => 2,
        }
    }
}

impl From<MeterRegisterType> for RegisterType {
    fn from(value: MeterRegisterType) -> Self {
        match value {
            MeterRegisterType::Int16 => RegisterType::Int16,
            MeterRegisterType::Uint16 => RegisterType::Uint16,
            MeterRegisterType::Int32 => RegisterType::Int32,
        }
    }
}

/// Decode raw registers into whole watts, truncating toward zero after scaling
pub fn decode_register_watts(registers: &[u16], register_type: RegisterType, scale: f64) -> Result<i64> {
    let needed = register_type.register_count() as usize;
    if registers.len() < needed {
        return Err(ZeroFeedError::modbus(format!(
            "Expected {} registers, got {}",
            needed,
            registers.len()
        )));
    }

    let raw: f64 = match register_type {
        RegisterType::Int16 => f64::from(registers[0] as i16),
        RegisterType::Uint16 => f64::from(registers[0]),
        RegisterType::Int32 => {
            let combined = (u32::from(registers[1]) << 16) | u32::from(registers[0]);
            f64::from(combined as i32)
        }
    };

    let watts = raw * scale;
    if !watts.is_finite() {
        return Err(ZeroFeedError::modbus(format!(
            "Scaled meter value is not finite (raw {}, scale {})",
            raw, scale
        )));
    }
    Ok(watts as i64)
}

/// Grid meter reading one holding register block per call
pub struct ModbusTcpMeter {
    address: String,
    unit_id: u8,
    register: u16,
    register_type: RegisterType,
    scale: f64,
    connection_timeout: Duration,
    operation_timeout: Duration,
    client: Mutex<Option<Context>>,
    retry: RetryPolicy,
    logger: StructuredLogger,
}

impl ModbusTcpMeter {
    pub fn new(
        ip: &str,
        port: u16,
        unit_id: u8,
        register: u16,
        register_type: RegisterType,
        scale: f64,
    ) -> Self {
        Self {
            address: format!("{}:{}", ip, port),
            unit_id,
            register,
            register_type,
            scale,
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
            client: Mutex::new(None),
            retry: RetryPolicy::default(),
            logger: get_logger("modbus_meter"),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn connect(&self) -> Result<Context> {
        self.logger
            .info(&format!("Connecting to Modbus meter at {}", self.address));

        let socket_addr: std::net::SocketAddr = self
            .address
            .parse()
            .map_err(|e| ZeroFeedError::config(format!("Invalid socket address: {}", e)))?;

        match timeout(
            self.connection_timeout,
            tcp::connect_slave(socket_addr, Slave(self.unit_id)),
        )
        .await
        {
            Ok(Ok(ctx)) => {
                self.logger.info("Connected to Modbus meter");
                Ok(ctx)
            }
            Ok(Err(e)) => Err(ZeroFeedError::modbus(format!(
                "Failed to connect to Modbus meter: {}",
                e
            ))),
            Err(_) => Err(ZeroFeedError::timeout("Modbus connection timeout")),
        }
    }

    async fn read_registers(&self, ctx: &mut Context) -> Result<Vec<u16>> {
        let count = self.register_type.register_count();
        self.logger.trace(&format!(
            "Reading {} registers from address {} on unit {}",
            count, self.register, self.unit_id
        ));

        match timeout(
            self.operation_timeout,
            ctx.read_holding_registers(self.register, count),
        )
        .await
        {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(ZeroFeedError::modbus(format!(
                "Meter answered with exception: {:?}",
                exception
            ))),
            Ok(Err(e)) => Err(ZeroFeedError::modbus(format!(
                "Failed to read holding registers: {}",
                e
            ))),
            Err(_) => Err(ZeroFeedError::timeout("Modbus read timeout")),
        }
    }

    /// One attempt: connect if needed and read the raw words. A failed read
    /// drops the connection so the next attempt reconnects.
    async fn read_once(&self) -> Result<Vec<u16>> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }

        let Some(ctx) = guard.as_mut() else {
            return Err(ZeroFeedError::modbus("Not connected to Modbus meter"));
        };

        match self.read_registers(ctx).await {
            Ok(words) => Ok(words),
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PowerMeterReader for ModbusTcpMeter {
    async fn get_watts(&self) -> Result<i64> {
        let words = self
            .retry
            .execute(&self.logger, "Modbus meter read", || self.read_once())
            .await
            .map_err(|e| {
                self.logger.warn(&format!("Modbus meter read failed: {}", e));
                if e.is_transient() {
                    ZeroFeedError::communication(e.to_string())
                } else {
                    e
                }
            })?;

        let watts = decode_register_watts(&words, self.register_type, self.scale)?;
        self.logger.info(&format!("powermeter ModbusTCP: {} Watt", watts));
        Ok(watts)
    }
}
