//! BLE control channel
//!
//! Provisions the GATT layout on the peripheral and routes inbound writes to
//! the session controller. The peripheral assigns characteristic ids at
//! provisioning time; the dispatch table pairs each assigned id with the
//! [`ControlCharacteristic`] it was created for, so lookups never depend on
//! table position.
//!
//! Join credentials and session keys are wider than one attribute, so each
//! field has its own characteristic. Field writes are staged, then a write to
//! `Join` or `Activate` decodes the staged buffer and acts on it.

use heapless::Vec;
use log::{debug, error, info, warn};

use crate::ble::characteristic::{self, CharacteristicDef, ControlCharacteristic, Staging};
use crate::ble::traits::{BleError, BlePeripheral, CharId, GattWrite};
use crate::config::{ble::MAX_CONTROL_CHARACTERISTICS, gatt, NodeConfig};
use crate::lora::plan::DataRate;
use crate::lora::traits::LoraStack;
use crate::protocol::codec::{
    encode_battery_level, log_message_chunks, DeviceSession, JoinCredentials, TxResultRecord, TxStatus,
};
use crate::session::{ReadinessMode, SessionController};

/// Failures that stop the node from entering the run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    /// BLE module not found or not answering
    PeripheralNotFound,
    /// NV store could not be reset
    StorageReset,
    DeviceName,
    GattClear,
    /// Service with this UUID could not be added
    AddService(u16),
    /// Characteristic with this UUID could not be added
    AddCharacteristic(u16),
    /// Advertising payload rejected
    AdvertisingData,
    /// Module did not come back from the software reset
    Reset,
    /// Write events for the characteristic with this UUID could not be enabled
    WriteEvents(u16),
}

/// What a dispatched write did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Credential field staged
    Staged(ControlCharacteristic),
    /// Join started from staged credentials
    JoinStarted,
    /// Staged session installed
    Activated(DeviceSession),
    /// Uplink accepted by the controller
    Queued,
    /// Uplink refused; the record must be notified to the central
    SendRejected(TxResultRecord),
    DataRateSet(DataRate),
    /// Unknown id, bad width or incomplete staging
    Discarded,
}

/// Flags, then the complete list of 16-bit service UUIDs
pub fn advertising_data() -> [u8; 13] {
    let [di_lo, di_hi] = gatt::DEVICE_INFO_SERVICE.to_le_bytes();
    let [bat_lo, bat_hi] = gatt::BATTERY_SERVICE.to_le_bytes();
    let [lora_lo, lora_hi] = gatt::LORA_SERVICE.to_le_bytes();
    let [log_lo, log_hi] = gatt::LOGGING_SERVICE.to_le_bytes();
    [
        0x02, 0x01, 0x06, // LE general discoverable, BR/EDR not supported
        0x09, 0x02, di_lo, di_hi, bat_lo, bat_hi, lora_lo, lora_hi, log_lo, log_hi,
    ]
}

/// Provisioned GATT layout and write dispatcher
pub struct ControlChannel {
    table: Vec<(CharId, ControlCharacteristic), MAX_CONTROL_CHARACTERISTICS>,
    tx_result: CharId,
    status: CharId,
    log_message: CharId,
    battery_level: CharId,
    join_staging: [u8; JoinCredentials::LEN],
    session_staging: [u8; DeviceSession::KEYS_LEN],
    /// One bit per staged `ControlCharacteristic`
    staged: u16,
}

impl ControlChannel {
    /// Build the GATT layout on a freshly started peripheral.
    ///
    /// Ends with a software reset of the module and write events enabled for
    /// every control characteristic.
    pub async fn provision<P: BlePeripheral>(ble: &mut P, config: &NodeConfig) -> Result<Self, SetupError> {
        info!("BLE: setting device name to '{}'", config.device_name);
        ble.set_device_name(&config.device_name)
            .await
            .map_err(|_| SetupError::DeviceName)?;

        ble.clear_gatt().await.map_err(|_| SetupError::GattClear)?;

        add_service(ble, gatt::LORA_SERVICE).await?;
        let tx_result = add_characteristic(ble, &characteristic::TX_RESULT).await?;

        let mut table = Vec::new();
        for role in ControlCharacteristic::ALL {
            let id = add_characteristic(ble, &role.definition()).await?;
            table
                .push((id, role))
                .map_err(|_| SetupError::AddCharacteristic(role.definition().uuid))?;
        }
        let status = add_characteristic(ble, &characteristic::STATUS).await?;

        add_service(ble, gatt::LOGGING_SERVICE).await?;
        let log_message = add_characteristic(ble, &characteristic::LOG_MESSAGE).await?;

        add_service(ble, gatt::DEVICE_INFO_SERVICE).await?;
        add_characteristic(ble, &characteristic::manufacturer_name(config.manufacturer)).await?;
        add_characteristic(ble, &characteristic::software_revision(config.firmware_version)).await?;

        add_service(ble, gatt::BATTERY_SERVICE).await?;
        let battery_level = add_characteristic(ble, &characteristic::BATTERY_LEVEL).await?;

        ble.set_adv_data(&advertising_data())
            .await
            .map_err(|_| SetupError::AdvertisingData)?;

        debug!("BLE: software reset to apply GATT changes");
        ble.reset().await.map_err(|_| SetupError::Reset)?;

        for (id, role) in table.iter() {
            if let Err(e) = ble.enable_write_events(*id).await {
                error!("BLE: write events for {:?} not enabled ({:?})", role, e);
                return Err(SetupError::WriteEvents(role.definition().uuid));
            }
        }

        info!("BLE: {} control characteristics ready", table.len());
        Ok(Self {
            table,
            tx_result,
            status,
            log_message,
            battery_level,
            join_staging: [0; JoinCredentials::LEN],
            session_staging: [0; DeviceSession::KEYS_LEN],
            staged: 0,
        })
    }

    /// Role registered for a characteristic id
    pub fn lookup(&self, id: CharId) -> Option<ControlCharacteristic> {
        self.table.iter().find(|(char_id, _)| *char_id == id).map(|(_, role)| *role)
    }

    /// Id assigned to a role at provisioning
    pub fn id_of(&self, role: ControlCharacteristic) -> Option<CharId> {
        self.table.iter().find(|(_, r)| *r == role).map(|(id, _)| *id)
    }

    /// Dispatch one inbound write
    pub fn handle_write<S: LoraStack>(
        &mut self,
        write: &GattWrite,
        session: &mut SessionController,
        stack: &mut S,
        now_ms: u64,
    ) -> WriteOutcome {
        let Some(role) = self.lookup(write.char_id) else {
            warn!("BLE: write to unknown characteristic {}, discarded", write.char_id);
            return WriteOutcome::Discarded;
        };
        let data = write.data.as_slice();
        debug!("BLE: {:?} write, {} bytes", role, data.len());

        match role {
            ControlCharacteristic::SendPacket => self.send_packet(data, session, stack, now_ms),
            ControlCharacteristic::Join => self.join(data, session, stack),
            ControlCharacteristic::Activate => self.activate(data, session, stack),
            ControlCharacteristic::SpreadingFactor => match data {
                [sf] => WriteOutcome::DataRateSet(session.set_spreading_factor(stack, *sf)),
                _ => {
                    warn!("BLE: spreading factor needs 1 byte, got {}", data.len());
                    WriteOutcome::Discarded
                }
            },
            _ => self.stage(role, data),
        }
    }

    /// Notify a transmit result
    pub async fn notify_tx_result<P: BlePeripheral>(
        &self,
        ble: &mut P,
        record: &TxResultRecord,
    ) -> Result<(), BleError> {
        ble.set_char(self.tx_result, &record.encode())
            .await
            .inspect_err(|e| error!("BLE: TX result notify failed ({:?})", e))
    }

    /// Publish the readiness mode on the status characteristic
    pub async fn notify_status<P: BlePeripheral>(&self, ble: &mut P, mode: ReadinessMode) -> Result<(), BleError> {
        ble.set_char(self.status, &[mode.status_byte()])
            .await
            .inspect_err(|e| error!("BLE: status notify failed ({:?})", e))
    }

    /// Publish the battery level (clamped to 100)
    pub async fn report_battery<P: BlePeripheral>(&self, ble: &mut P, level: u8) -> Result<(), BleError> {
        ble.set_char(self.battery_level, &encode_battery_level(level))
            .await
            .inspect_err(|e| warn!("BLE: battery level update failed ({:?})", e))
    }

    /// Write a message to the log characteristic in attribute-sized chunks.
    ///
    /// Never logs: the logger itself forwards lines here.
    pub async fn send_log_message<P: BlePeripheral>(&self, ble: &mut P, message: &str) -> Result<(), BleError> {
        for chunk in log_message_chunks(message) {
            ble.set_char(self.log_message, chunk).await?;
        }
        Ok(())
    }

    fn send_packet<S: LoraStack>(
        &mut self,
        data: &[u8],
        session: &mut SessionController,
        stack: &mut S,
        now_ms: u64,
    ) -> WriteOutcome {
        let (ble_sequence, payload) = match data {
            [seq, payload @ ..] if !payload.is_empty() => (*seq, payload),
            _ => {
                warn!("BLE: send packet needs sequence and data, got {} bytes", data.len());
                let seq = data.first().copied().unwrap_or(0);
                return WriteOutcome::SendRejected(TxResultRecord::new(
                    seq,
                    TxStatus::InvalidPayload,
                    stack.seq_no_up(),
                ));
            }
        };

        match session.send_packet(stack, ble_sequence, payload, now_ms) {
            Ok(()) => WriteOutcome::Queued,
            Err(e) => WriteOutcome::SendRejected(TxResultRecord::new(ble_sequence, e.into(), stack.seq_no_up())),
        }
    }

    fn join<S: LoraStack>(&mut self, data: &[u8], session: &mut SessionController, stack: &mut S) -> WriteOutcome {
        if !self.is_staged(&[
            ControlCharacteristic::AppKey,
            ControlCharacteristic::AppEui,
            ControlCharacteristic::DevEui,
        ]) {
            warn!("BLE: join requested before AppKey, AppEUI and DevEUI were written");
            return WriteOutcome::Discarded;
        }

        match JoinCredentials::decode(&self.join_staging) {
            Ok(credentials) => {
                session.request_join(stack, &credentials, starting_seq_no(data));
                WriteOutcome::JoinStarted
            }
            Err(e) => {
                error!("BLE: staged credentials invalid ({:?})", e);
                WriteOutcome::Discarded
            }
        }
    }

    fn activate<S: LoraStack>(&mut self, data: &[u8], session: &mut SessionController, stack: &mut S) -> WriteOutcome {
        if !self.is_staged(&[
            ControlCharacteristic::DevAddr,
            ControlCharacteristic::NwkSKey,
            ControlCharacteristic::AppSKey,
        ]) {
            warn!("BLE: activation requested before DevAddr, NwkSKey and AppSKey were written");
            return WriteOutcome::Discarded;
        }

        let seq_no_up = starting_seq_no(data).unwrap_or(0);
        match DeviceSession::decode_keys(&self.session_staging, seq_no_up) {
            Ok(device_session) => {
                session.install_session(stack, device_session.clone());
                WriteOutcome::Activated(device_session)
            }
            Err(e) => {
                error!("BLE: staged session invalid ({:?})", e);
                WriteOutcome::Discarded
            }
        }
    }

    fn stage(&mut self, role: ControlCharacteristic, data: &[u8]) -> WriteOutcome {
        let Some((staging, range)) = role.field() else {
            return WriteOutcome::Discarded;
        };
        if data.len() != range.len() {
            warn!("BLE: {:?} needs {} bytes, got {}", role, range.len(), data.len());
            return WriteOutcome::Discarded;
        }

        let buffer: &mut [u8] = match staging {
            Staging::Join => &mut self.join_staging[..],
            Staging::Session => &mut self.session_staging[..],
        };
        buffer[range].copy_from_slice(data);
        self.staged |= staged_bit(role);
        WriteOutcome::Staged(role)
    }

    fn is_staged(&self, roles: &[ControlCharacteristic]) -> bool {
        roles.iter().all(|role| self.staged & staged_bit(*role) != 0)
    }
}

async fn add_service<P: BlePeripheral>(ble: &mut P, uuid: u16) -> Result<(), SetupError> {
    debug!("BLE: adding service 0x{:04X}", uuid);
    ble.add_service(uuid)
        .await
        .map(|_| ())
        .inspect_err(|e| error!("BLE: could not add service 0x{:04X} ({:?})", uuid, e))
        .map_err(|_| SetupError::AddService(uuid))
}

async fn add_characteristic<P: BlePeripheral>(ble: &mut P, def: &CharacteristicDef) -> Result<CharId, SetupError> {
    debug!("BLE: {}", def);
    ble.add_characteristic(def)
        .await
        .inspect_err(|e| error!("BLE: could not add characteristic 0x{:04X} ({:?})", def.uuid, e))
        .map_err(|_| SetupError::AddCharacteristic(def.uuid))
}

/// Optional u32 LE starting sequence number on Join/Activate writes
fn starting_seq_no(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

const fn staged_bit(role: ControlCharacteristic) -> u16 {
    1 << role as u16
}
