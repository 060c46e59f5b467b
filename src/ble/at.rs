//! AT command driver for the BLE module
//!
//! The module keeps its GATT table, event flags and a small user NV region
//! behind a line-based command set. Every command is answered by zero or
//! more data lines and a final `OK` or `ERROR`.
//!
//! Inbound writes are not pushed by the module. `update` polls
//! `AT+EVENTSTATUS` for characteristics written since the last poll and
//! reads each one back with `AT+GATTCHAR=<id>`.

use core::fmt::{self, Write};

use heapless::{Deque, Vec};
use log::warn;

use crate::ble::characteristic::CharacteristicDef;
use crate::ble::traits::{BleError, BlePeripheral, CharId, GattWrite, ServiceId};
use crate::clock::Clock;
use crate::config::at::{COMMAND_TIMEOUT_MS, NV_BLOCK_SIZE, NV_SIZE, RESET_TIMEOUT_MS, WRITE_QUEUE_DEPTH};
use crate::serial::reader::{Line, ReadError, Reply, ReplyReader};
use crate::serial::traits::SerialPort;
use crate::storage::traits::{NvError, NvStorage};

/// Highest characteristic id covered by the event mask
const MAX_EVENT_CHAR_ID: CharId = 32;

/// `AT+NVMWRITE`/`AT+NVMREAD` data type for byte arrays
const NVM_BYTE_ARRAY: u8 = 2;

/// Bytes rendered as dash-separated hex, e.g. `DE-AD-BE-EF`
struct Hex<'a>(&'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Parse dash-separated hex into `out`. Returns `None` on malformed input
/// or if `out` is too small.
fn parse_hex<const N: usize>(text: &str, out: &mut Vec<u8, N>) -> Option<()> {
    out.clear();
    for part in text.trim().split('-').filter(|p| !p.is_empty()) {
        let byte = u8::from_str_radix(part, 16).ok()?;
        out.push(byte).ok()?;
    }
    Some(())
}

fn command_line(args: fmt::Arguments<'_>) -> Result<Line, BleError> {
    let mut line = Line::new();
    line.write_fmt(args).map_err(|_| BleError::CommandFailed)?;
    Ok(line)
}

fn ble_error(e: ReadError) -> BleError {
    match e {
        ReadError::Rejected => BleError::CommandFailed,
        ReadError::Timeout | ReadError::Serial(_) => BleError::NotResponding,
    }
}

/// Single integer reply, as returned for new service and characteristic ids
fn int_reply(reply: &Reply) -> Result<u8, BleError> {
    reply
        .first()
        .and_then(|line| line.trim().parse().ok())
        .ok_or(BleError::CommandFailed)
}

/// GATT event bits from an `AT+EVENTSTATUS` reply (`0x<system>,0x<gatt>`)
fn gatt_event_bits(reply: &Reply) -> Option<u32> {
    let gatt = reply.first()?.split(',').nth(1)?.trim();
    let digits = gatt.strip_prefix("0x").or_else(|| gatt.strip_prefix("0X")).unwrap_or(gatt);
    u32::from_str_radix(digits, 16).ok()
}

/// BLE module driven over an AT command link
pub struct AtPeripheral<S: SerialPort, C: Clock> {
    port: S,
    clock: C,
    reader: ReplyReader,
    /// Characteristics with write events enabled, bit `id - 1`
    write_mask: u32,
    inbound: Deque<GattWrite, WRITE_QUEUE_DEPTH>,
}

impl<S: SerialPort, C: Clock> AtPeripheral<S, C> {
    pub fn new(port: S, clock: C) -> Self {
        Self {
            port,
            clock,
            reader: ReplyReader::new(),
            write_mask: 0,
            inbound: Deque::new(),
        }
    }

    /// Send one command line and wait for its reply
    async fn exchange(&mut self, line: &str, timeout_ms: u64) -> Result<Reply, ReadError> {
        self.port.write(line.as_bytes()).await?;
        self.port.write(b"\n").await?;
        self.port.flush().await?;
        self.reader.read_reply(&mut self.port, &self.clock, timeout_ms).await
    }

    async fn command(&mut self, args: fmt::Arguments<'_>) -> Result<Reply, BleError> {
        let line = command_line(args)?;
        self.exchange(&line, COMMAND_TIMEOUT_MS).await.map_err(ble_error)
    }

    /// Read one characteristic value back from the module
    async fn read_char(&mut self, id: CharId) -> Result<GattWrite, BleError> {
        let reply = self.command(format_args!("AT+GATTCHAR={}", id)).await?;
        let mut data = Vec::new();
        if let Some(line) = reply.first() {
            parse_hex(line, &mut data).ok_or(BleError::CommandFailed)?;
        }
        Ok(GattWrite { char_id: id, data })
    }

    async fn poll_events(&mut self, budget_ms: u32) -> Result<(), BleError> {
        let line = command_line(format_args!("AT+EVENTSTATUS"))?;
        let reply = self.exchange(&line, budget_ms.into()).await.map_err(ble_error)?;
        let bits = gatt_event_bits(&reply).ok_or(BleError::CommandFailed)? & self.write_mask;

        for bit in (0..MAX_EVENT_CHAR_ID).filter(|b| bits & (1 << b) != 0) {
            let write = match self.read_char(bit + 1).await {
                Ok(write) => write,
                Err(e) => {
                    warn!("BLE: read-back of char {} failed ({:?})", bit + 1, e);
                    continue;
                }
            };
            if write.data.is_empty() {
                continue;
            }
            if self.inbound.push_back(write).is_err() {
                warn!("BLE: write queue full, dropping write to char {}", bit + 1);
            }
        }
        Ok(())
    }

    pub fn port(&self) -> &S {
        &self.port
    }
}

impl<S: SerialPort, C: Clock> BlePeripheral for AtPeripheral<S, C> {
    async fn begin(&mut self) -> Result<(), BleError> {
        self.reader.reset();
        // Echo off, so replies carry only data and status lines
        self.command(format_args!("ATE=0")).await.map(drop)
    }

    async fn set_device_name(&mut self, name: &str) -> Result<(), BleError> {
        self.command(format_args!("AT+GAPDEVNAME={}", name)).await.map(drop)
    }

    async fn clear_gatt(&mut self) -> Result<(), BleError> {
        self.command(format_args!("AT+GATTCLEAR")).await.map(drop)
    }

    async fn add_service(&mut self, uuid: u16) -> Result<ServiceId, BleError> {
        let reply = self.command(format_args!("AT+GATTADDSERVICE=UUID=0x{:04X}", uuid)).await?;
        int_reply(&reply)
    }

    async fn add_characteristic(&mut self, def: &CharacteristicDef) -> Result<CharId, BleError> {
        let reply = self.command(format_args!("{}", def)).await?;
        match int_reply(&reply)? {
            0 => Err(BleError::CommandFailed),
            id => Ok(id),
        }
    }

    async fn set_adv_data(&mut self, data: &[u8]) -> Result<(), BleError> {
        self.command(format_args!("AT+GAPSETADVDATA={}", Hex(data))).await.map(drop)
    }

    async fn reset(&mut self) -> Result<(), BleError> {
        let line = command_line(format_args!("ATZ"))?;
        self.exchange(&line, RESET_TIMEOUT_MS).await.map_err(ble_error)?;
        // Event enables do not survive a reset
        self.write_mask = 0;
        self.inbound.clear();
        Ok(())
    }

    async fn enable_write_events(&mut self, id: CharId) -> Result<(), BleError> {
        if id == 0 || id > MAX_EVENT_CHAR_ID {
            return Err(BleError::TableFull);
        }
        let mask = self.write_mask | (1 << (id - 1));
        self.command(format_args!("AT+EVENTENABLE=0x00000000,0x{:08X}", mask)).await?;
        self.write_mask = mask;
        Ok(())
    }

    async fn set_char(&mut self, id: CharId, data: &[u8]) -> Result<(), BleError> {
        self.command(format_args!("AT+GATTCHAR={},{}", id, Hex(data)))
            .await
            .map(drop)
            .map_err(|_| BleError::NotifyFailed)
    }

    async fn update(&mut self, budget_ms: u32) {
        if self.write_mask == 0 {
            return;
        }
        if let Err(e) = self.poll_events(budget_ms).await {
            warn!("BLE: event poll failed ({:?})", e);
        }
    }

    fn next_write(&mut self) -> Option<GattWrite> {
        self.inbound.pop_front()
    }

    async fn disconnect(&mut self) -> Result<(), BleError> {
        self.command(format_args!("AT+GAPDISCONNECT")).await.map(drop)
    }
}

impl<S: SerialPort, C: Clock> NvStorage for AtPeripheral<S, C> {
    fn max_block_size(&self) -> usize {
        NV_BLOCK_SIZE
    }

    async fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), NvError> {
        if buf.len() > NV_BLOCK_SIZE || usize::from(address) + buf.len() > NV_SIZE {
            return Err(NvError::OutOfRange);
        }

        let reply = self
            .command(format_args!("AT+NVMREAD={},{},{}", address, buf.len(), NVM_BYTE_ARRAY))
            .await
            .map_err(|_| NvError::ReadFailed)?;

        let mut data: Vec<u8, NV_BLOCK_SIZE> = Vec::new();
        reply
            .first()
            .and_then(|line| parse_hex(line, &mut data))
            .ok_or(NvError::ReadFailed)?;
        if data.len() != buf.len() {
            return Err(NvError::ReadFailed);
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    async fn write(&mut self, address: u16, data: &[u8]) -> Result<(), NvError> {
        if data.len() > NV_BLOCK_SIZE || usize::from(address) + data.len() > NV_SIZE {
            return Err(NvError::OutOfRange);
        }

        self.command(format_args!("AT+NVMWRITE={},{},{}", address, NVM_BYTE_ARRAY, Hex(data)))
            .await
            .map(drop)
            .map_err(|_| NvError::WriteFailed)
    }

    async fn factory_reset(&mut self) -> Result<(), NvError> {
        let line = command_line(format_args!("AT+FACTORYRESET")).map_err(|_| NvError::ResetFailed)?;
        self.exchange(&line, RESET_TIMEOUT_MS)
            .await
            .map(drop)
            .map_err(|_| NvError::ResetFailed)
    }
}
