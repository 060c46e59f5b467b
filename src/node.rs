//! Run loop driver
//!
//! Ties the BLE peripheral, the LoRaWAN stack and the session controller
//! together. [`Node::tick`] is the single externally driven step:
//!
//! 1. Poll the peripheral for at most the configured budget
//! 2. Dispatch every buffered write to the control channel
//! 3. Unless the node still needs configuration, run one stack job
//! 4. Check the transmit watchdog
//! 5. Deliver controller output: notifications and persistence
//!
//! Nothing here blocks on the radio. Sends are queue-and-return and joins
//! complete on a later tick.

use log::{debug, error, info, warn};

use crate::ble::channel::{ControlChannel, SetupError, WriteOutcome};
use crate::ble::traits::{BleError, BlePeripheral};
use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::logging::{LogLine, LOG_RELAY_DEPTH};
use crate::lora::traits::LoraStack;
use crate::protocol::codec::DeviceSession;
use crate::session::{ReadinessMode, SessionController, SessionOutput};
use crate::storage::{CredentialStore, InitOutcome, NvStorage};

/// A configured field node
pub struct Node<P, S, C> {
    ble: P,
    stack: S,
    clock: C,
    session: SessionController,
    channel: ControlChannel,
    config: NodeConfig,
}

impl<P, S, C> Node<P, S, C>
where
    P: BlePeripheral + NvStorage,
    S: LoraStack,
    C: Clock,
{
    /// Bring up the BLE module, the NV store and the GATT layout.
    ///
    /// A valid stored session is resumed. On error the caller must not enter
    /// the run loop.
    pub async fn setup(mut ble: P, stack: S, clock: C, config: NodeConfig) -> Result<Self, SetupError> {
        info!("Initialising the BLE module");
        if let Err(e) = ble.begin().await {
            error!("BLE module not found ({:?})", e);
            return Err(SetupError::PeripheralNotFound);
        }

        // Before provisioning: a factory reset clears the module's GATT too
        let stored = {
            let mut store = CredentialStore::new(&mut ble);
            match store.init().await {
                Ok(InitOutcome::MagicFound) => store.load_session().await.unwrap_or_else(|e| {
                    warn!("NV: stored session unreadable ({:?})", e);
                    None
                }),
                Ok(InitOutcome::FactoryReset) => None,
                Err(e) => {
                    error!("NV: store unusable ({:?})", e);
                    return Err(SetupError::StorageReset);
                }
            }
        };

        let channel = ControlChannel::provision(&mut ble, &config).await?;
        let mut node = Self {
            ble,
            stack,
            clock,
            session: SessionController::new(&config),
            channel,
            config,
        };

        if let Some(session) = stored {
            info!("Resuming stored session at seq {}", session.seq_no_up);
            node.session.install_session(&mut node.stack, session);
        }
        node.deliver_outputs().await;

        Ok(node)
    }

    /// One pass of the run loop
    pub async fn tick(&mut self) {
        self.ble.update(self.config.ble_poll_budget_ms).await;

        while let Some(write) = self.ble.next_write() {
            let now_ms = self.clock.now_ms();
            let outcome = self
                .channel
                .handle_write(&write, &mut self.session, &mut self.stack, now_ms);
            self.apply(outcome).await;
        }

        if self.session.mode() != ReadinessMode::NeedsConfiguration {
            if let Some(event) = self.stack.run_once() {
                self.session.handle_event(&mut self.stack, event);
            }
        }

        self.session.check_watchdog(&mut self.stack, self.clock.now_ms());
        self.deliver_outputs().await;
    }

    pub fn mode(&self) -> ReadinessMode {
        self.session.mode()
    }

    pub fn session(&self) -> Option<&DeviceSession> {
        self.session.session()
    }

    /// Publish the battery level (0-100)
    pub async fn report_battery(&mut self, level: u8) -> Result<(), BleError> {
        self.channel.report_battery(&mut self.ble, level).await
    }

    /// Write a message to the log characteristic. Never logs.
    pub async fn send_log_message(&mut self, message: &str) -> Result<(), BleError> {
        self.channel.send_log_message(&mut self.ble, message).await
    }

    /// Drop the central's connection. The session and any pending uplink
    /// are left alone.
    pub async fn disconnect(&mut self) -> Result<(), BleError> {
        info!("BLE: disconnecting central");
        self.ble.disconnect().await
    }

    /// Forward pending log lines to the log characteristic.
    ///
    /// Takes at most one relay's worth of lines so records logged while
    /// forwarding wait for the next call.
    pub async fn forward_logs(&mut self, mut next_line: impl FnMut() -> Option<LogLine>) {
        for _ in 0..LOG_RELAY_DEPTH {
            let Some(line) = next_line() else {
                break;
            };
            if self.send_log_message(&line).await.is_err() {
                break;
            }
        }
    }

    /// Forward lines from the global log relay
    #[cfg(feature = "embedded")]
    pub async fn flush_logs(&mut self) {
        self.forward_logs(crate::logging::take_line).await
    }

    pub fn peripheral(&self) -> &P {
        &self.ble
    }

    pub fn peripheral_mut(&mut self) -> &mut P {
        &mut self.ble
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    async fn apply(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Activated(session) => self.persist_session(&session).await,
            WriteOutcome::SendRejected(record) => {
                let _ = self.channel.notify_tx_result(&mut self.ble, &record).await;
            }
            other => debug!("BLE: write handled ({:?})", other),
        }
    }

    async fn deliver_outputs(&mut self) {
        while let Some(output) = self.session.take_output() {
            match output {
                SessionOutput::JoinResult(Some(session)) => self.persist_session(&session).await,
                SessionOutput::JoinResult(None) => info!("Join: no session"),
                SessionOutput::TxResult { record, downlink } => {
                    if !downlink.is_empty() {
                        debug!("TX: result carries {} downlink bytes", downlink.len());
                    }
                    let _ = self.channel.notify_tx_result(&mut self.ble, &record).await;
                    self.persist_seq_no().await;
                }
                SessionOutput::ModeChanged(mode) => {
                    let _ = self.channel.notify_status(&mut self.ble, mode).await;
                }
            }
        }
    }

    async fn persist_session(&mut self, session: &DeviceSession) {
        if let Err(e) = CredentialStore::new(&mut self.ble).save_session(session).await {
            warn!("NV: session not persisted ({:?})", e);
        }
    }

    async fn persist_seq_no(&mut self) {
        let Some(seq_no_up) = self.session.session().map(|s| s.seq_no_up) else {
            return;
        };
        if let Err(e) = CredentialStore::new(&mut self.ble).save_seq_no(seq_no_up).await {
            warn!("NV: sequence number not persisted ({:?})", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::traits::mock::MockPeripheral;
    use crate::clock::mock::MockClock;
    use crate::config::{gatt, nv};
    use crate::logging::LogRelay;
    use crate::lora::traits::mock::MockLoraStack;
    use crate::protocol::codec::{DevAddr, SessionRecord, TxResultRecord, TxStatus};
    use futures::executor::block_on;

    type TestNode<'a> = Node<MockPeripheral, MockLoraStack, &'a MockClock>;

    fn setup(ble: MockPeripheral, clock: &MockClock) -> TestNode<'_> {
        block_on(Node::setup(ble, MockLoraStack::new(), clock, NodeConfig::default())).unwrap()
    }

    fn write(node: &mut TestNode<'_>, uuid: u16, data: &[u8]) {
        let id = node.peripheral().char_id_for(uuid).unwrap();
        node.peripheral_mut().queue_write(id, data);
    }

    fn values(node: &TestNode<'_>, uuid: u16) -> std::vec::Vec<std::vec::Vec<u8>> {
        let id = node.peripheral().char_id_for(uuid).unwrap();
        node.peripheral().values_for(id).map(|v| v.to_vec()).collect()
    }

    fn tx_results(node: &TestNode<'_>) -> std::vec::Vec<TxResultRecord> {
        values(node, gatt::TX_RESULT)
            .iter()
            .map(|v| TxResultRecord::decode(v.as_slice().try_into().unwrap()))
            .collect()
    }

    fn activate(node: &mut TestNode<'_>, seq_no_up: u32) {
        write(node, gatt::DEV_ADDR, &[0x26, 0x01, 0x1F, 0x3C]);
        write(node, gatt::NWK_SKEY, &[0x11; 16]);
        write(node, gatt::APP_SKEY, &[0x22; 16]);
        write(node, gatt::ACTIVATE, &seq_no_up.to_le_bytes());
        block_on(node.tick());
    }

    #[test]
    fn test_setup_without_peripheral_fails() {
        let clock = MockClock::new();
        let result = block_on(Node::setup(
            MockPeripheral::absent(),
            MockLoraStack::new(),
            &clock,
            NodeConfig::default(),
        ));
        assert!(matches!(result, Err(SetupError::PeripheralNotFound)));
    }

    #[test]
    fn test_setup_fresh_store() {
        let clock = MockClock::new();
        let node = setup(MockPeripheral::new(), &clock);

        assert_eq!(node.mode(), ReadinessMode::NeedsConfiguration);
        assert_eq!(node.peripheral().nv.reset_count(), 1);
        assert_eq!(&node.peripheral().nv.memory()[0..4], &nv::MAGIC_NUMBER.to_le_bytes());
    }

    #[test]
    fn test_setup_storage_failure() {
        let clock = MockClock::new();
        let ble = MockPeripheral::new();
        ble.nv.set_next_reset_error(crate::storage::NvError::ResetFailed);

        let result = block_on(Node::setup(ble, MockLoraStack::new(), &clock, NodeConfig::default()));
        assert!(matches!(result, Err(SetupError::StorageReset)));
    }

    #[test]
    fn test_setup_resumes_stored_session() {
        let clock = MockClock::new();
        let session = DeviceSession {
            dev_addr: DevAddr::from_wire([0x26, 0x01, 0x1F, 0x3C]),
            nwk_skey: [0x11; 16],
            app_skey: [0x22; 16],
            seq_no_up: 0,
        };
        let mut ble = MockPeripheral::new();
        ble.nv.preload(0, &nv::MAGIC_NUMBER.to_le_bytes());
        ble.nv.preload(4, &SessionRecord::encode(&session));
        ble.nv.preload(4 + nv::SEQ_NO_OFFSET as usize, &77u32.to_le_bytes());

        let node = setup(ble, &clock);

        assert_eq!(node.mode(), ReadinessMode::Ready);
        assert_eq!(node.stack().seq_no_up(), 77);
        assert_eq!(node.stack().session().dev_addr, 0x2601_1F3C);
        assert_eq!(node.peripheral().nv.reset_count(), 0);
        assert_eq!(values(&node, gatt::STATUS), [[2]]);
    }

    #[test]
    fn test_join_end_to_end() {
        let clock = MockClock::new();
        let mut node = setup(MockPeripheral::new(), &clock);

        write(&mut node, gatt::APP_KEY, &[0xA5; 16]);
        write(&mut node, gatt::APP_EUI, &[0x70, 0xB3, 0xD5, 0x7E, 0xF0, 0x00, 0x00, 0x01]);
        write(&mut node, gatt::DEV_EUI, &[0x00, 0x04, 0xA3, 0x0B, 0x00, 0x1B, 0x7A, 0x2C]);
        write(&mut node, gatt::JOIN, &[0x01]);
        block_on(node.tick());

        assert_eq!(node.mode(), ReadinessMode::ReadyToJoin);
        assert_eq!(node.stack().join_count, 1);

        node.stack_mut().accept_join(0xDEAD_AAAA, [0x33; 16], [0x44; 16]);
        block_on(node.tick());

        assert_eq!(node.mode(), ReadinessMode::Ready);
        let session = node.session().unwrap();
        assert_eq!(session.dev_addr.to_wire(), [0xDE, 0xAD, 0xAA, 0xAA]);
        assert_eq!(values(&node, gatt::STATUS), [[1], [2]]);

        // Session persisted with the wire-order address
        let memory = node.peripheral().nv.memory();
        assert_eq!(&memory[5..9], &[0xDE, 0xAD, 0xAA, 0xAA]);
        let record: [u8; SessionRecord::LEN] = memory[4..4 + SessionRecord::LEN].try_into().unwrap();
        assert_eq!(SessionRecord::decode(&record, 0).unwrap().nwk_skey, [0x33; 16]);
    }

    #[test]
    fn test_join_failure_reverts_status() {
        let clock = MockClock::new();
        let mut node = setup(MockPeripheral::new(), &clock);
        write(&mut node, gatt::APP_KEY, &[0xA5; 16]);
        write(&mut node, gatt::APP_EUI, &[0x01; 8]);
        write(&mut node, gatt::DEV_EUI, &[0x02; 8]);
        write(&mut node, gatt::JOIN, &[0x01]);
        block_on(node.tick());

        node.stack_mut().reject_join();
        block_on(node.tick());

        assert_eq!(node.mode(), ReadinessMode::NeedsConfiguration);
        assert_eq!(values(&node, gatt::STATUS), [[1], [0]]);
    }

    #[test]
    fn test_stack_not_polled_until_configured() {
        let clock = MockClock::new();
        let mut node = setup(MockPeripheral::new(), &clock);

        write(&mut node, gatt::SEND_PACKET, &[0x04, 0x48, 0x69]);
        block_on(node.tick());
        block_on(node.tick());

        assert_eq!(node.stack().run_count, 0);
        assert!(node.stack().uplinks().is_empty());
        assert_eq!(tx_results(&node), [TxResultRecord::new(0x04, TxStatus::NotReady, 0)]);
        assert_eq!(node.peripheral().update_budgets.as_slice(), &[200, 200]);
    }

    #[test]
    fn test_send_and_complete() {
        let clock = MockClock::new();
        let mut node = setup(MockPeripheral::new(), &clock);
        activate(&mut node, 10);
        assert_eq!(node.mode(), ReadinessMode::Ready);

        write(&mut node, gatt::SEND_PACKET, &[0x01, 0xCA, 0xFE]);
        block_on(node.tick());
        assert_eq!(node.stack().uplinks()[0].as_slice(), &[0xCA, 0xFE]);

        // Second send while the first is pending is refused
        write(&mut node, gatt::SEND_PACKET, &[0x02, 0x00]);
        block_on(node.tick());

        node.stack_mut().complete_tx(&[]);
        block_on(node.tick());

        assert_eq!(
            tx_results(&node),
            [
                TxResultRecord::new(0x02, TxStatus::Busy, 10),
                TxResultRecord::new(0x01, TxStatus::Success, 10),
            ]
        );

        // Next sequence number persisted after the header
        let offset = 4 + nv::SEQ_NO_OFFSET as usize;
        assert_eq!(&node.peripheral().nv.memory()[offset..offset + 4], &11u32.to_le_bytes());
    }

    #[test]
    fn test_send_times_out() {
        let clock = MockClock::new();
        let mut node = setup(MockPeripheral::new(), &clock);
        activate(&mut node, 0);

        write(&mut node, gatt::SEND_PACKET, &[0x09, 0x01]);
        block_on(node.tick());

        clock.advance(19_999);
        block_on(node.tick());
        assert!(tx_results(&node).is_empty());

        // The frame went out but no completion arrives
        node.stack_mut().set_seq_no_up(1);
        clock.advance(1);
        block_on(node.tick());
        assert_eq!(tx_results(&node), [TxResultRecord::new(0x09, TxStatus::Timeout, 0)]);
        assert_eq!(node.stack().clear_count, 1);

        // The spent counter is persisted, not the one from activation
        let offset = 4 + nv::SEQ_NO_OFFSET as usize;
        assert_eq!(&node.peripheral().nv.memory()[offset..offset + 4], &1u32.to_le_bytes());

        // A late completion is not reported a second time
        node.stack_mut().complete_tx(&[]);
        block_on(node.tick());
        assert_eq!(tx_results(&node).len(), 1);
    }

    #[test]
    fn test_forward_logs() {
        let clock = MockClock::new();
        let mut node = setup(MockPeripheral::new(), &clock);
        let mut relay = LogRelay::new();
        relay.push_fmt(format_args!("INFO Join: started"));
        relay.push_fmt(format_args!("WARN TX: timeout, clearing pending transmit"));

        block_on(node.forward_logs(|| relay.pop()));

        let chunks = values(&node, gatt::LOG_MESSAGE);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], b"INFO Join: started");
        assert_eq!(chunks[1..].concat(), b"WARN TX: timeout, clearing pending transmit");
    }

    #[test]
    fn test_disconnect_keeps_session() {
        let clock = MockClock::new();
        let mut node = setup(MockPeripheral::new(), &clock);
        activate(&mut node, 4);

        block_on(node.disconnect()).unwrap();

        assert_eq!(node.peripheral().commands().last().map(|c| c.as_str()), Some("AT+GAPDISCONNECT"));
        assert_eq!(node.mode(), ReadinessMode::Ready);
        assert_eq!(node.session().unwrap().seq_no_up, 4);
    }

    #[test]
    fn test_report_battery() {
        let clock = MockClock::new();
        let mut node = setup(MockPeripheral::new(), &clock);

        block_on(node.report_battery(87)).unwrap();
        assert_eq!(values(&node, gatt::BATTERY_LEVEL), [[87]]);
    }
}
