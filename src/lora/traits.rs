//! LoRaWAN stack trait for abstraction and testability
//!
//! This trait defines the boundary to the LoRaWAN MAC implementation,
//! allowing the real stack to be swapped with a mock for testing. The stack
//! runs a cooperative scheduler: `run_once` executes at most one pending job
//! and returns the event it raised, if any.

use crate::lora::plan::{ChannelPlan, DataRate};
use crate::protocol::codec::{AesKey, JoinCredentials};

/// Errors that can occur when handing work to the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// A transmit or receive is already pending
    Busy,
    /// Payload exceeds the current data rate's limit
    TooLong,
    /// Stack refused the configuration it was given
    InvalidConfig,
}

/// Events raised by the stack's scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    ScanTimeout,
    BeaconFound,
    BeaconMissed,
    BeaconTracked,
    Joining,
    Joined,
    JoinFailed,
    RejoinFailed,
    /// Uplink finished, including the receive windows
    TxComplete,
    LostTsync,
    Reset,
    /// Data received in a ping slot
    RxComplete,
    LinkDead,
    LinkAlive,
    /// Event code this layer does not know
    Unknown(u8),
}

/// Session material as held inside the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSession {
    /// Device address as a native value
    pub dev_addr: u32,
    pub nwk_skey: AesKey,
    pub app_skey: AesKey,
}

/// Abstract LoRaWAN stack interface
pub trait LoraStack {
    /// Reset the MAC state, discarding any session and pending transfer
    fn reset(&mut self);

    /// Configure uplink channels and select the sub-band
    fn setup_channels(&mut self, plan: &ChannelPlan);

    /// Enable or disable link check validation
    fn set_link_check(&mut self, enabled: bool);

    /// Set uplink data rate and transmit power
    fn set_data_rate(&mut self, rate: DataRate, tx_power_dbm: i8);

    /// Set the next upstream frame counter
    fn set_seq_no_up(&mut self, seq_no_up: u32);

    /// Next upstream frame counter
    fn seq_no_up(&self) -> u32;

    /// Start an over-the-air join
    fn start_join(&mut self, credentials: &JoinCredentials);

    /// Install session keys directly (activation-by-personalization)
    fn set_session(&mut self, net_id: u32, dev_addr: u32, nwk_skey: &AesKey, app_skey: &AesKey);

    /// Session currently held by the stack
    fn session(&self) -> StackSession;

    /// True while a join is in progress
    fn is_joining(&self) -> bool;

    /// True while a transmit or receive is outstanding
    fn is_tx_rx_pending(&self) -> bool;

    /// Queue an uplink for the next possible slot
    fn queue_uplink(&mut self, port: u8, data: &[u8], confirmed: bool) -> Result<(), StackError>;

    /// Drop any queued or pending uplink
    fn clear_tx_data(&mut self);

    /// Downlink payload received after the last uplink (empty if none)
    fn downlink(&self) -> &[u8];

    /// Run one scheduler job
    fn run_once(&mut self) -> Option<StackEvent>;
}

#[cfg(test)]
pub mod mock {
    //! Mock LoRaWAN stack for testing

    use super::*;
    use heapless::{Deque, Vec};

    /// Mock LoRaWAN stack for unit testing
    pub struct MockLoraStack {
        /// Events returned by run_once(), in order
        events: Deque<StackEvent, 8>,
        /// Record of queued uplinks
        uplinks: Vec<Vec<u8, 32>, 8>,
        /// Last installed session
        session: StackSession,
        /// Net id given with the last ABP session
        net_id: Option<u32>,
        /// Credentials of the last join
        last_join: Option<JoinCredentials>,
        seq_no_up: u32,
        data_rate: Option<(DataRate, i8)>,
        link_check: Option<bool>,
        sub_band: Option<u8>,
        downlink: Vec<u8, 32>,
        joining: bool,
        pending: bool,
        pub join_count: usize,
        pub reset_count: usize,
        pub channel_setups: usize,
        pub clear_count: usize,
        pub run_count: usize,
        /// Error to return on next queue_uplink
        next_queue_error: Option<StackError>,
    }

    impl MockLoraStack {
        pub fn new() -> Self {
            Self {
                events: Deque::new(),
                uplinks: Vec::new(),
                session: StackSession {
                    dev_addr: 0,
                    nwk_skey: [0; 16],
                    app_skey: [0; 16],
                },
                net_id: None,
                last_join: None,
                seq_no_up: 0,
                data_rate: None,
                link_check: None,
                sub_band: None,
                downlink: Vec::new(),
                joining: false,
                pending: false,
                join_count: 0,
                reset_count: 0,
                channel_setups: 0,
                clear_count: 0,
                run_count: 0,
                next_queue_error: None,
            }
        }

        /// Queue an event for the next run_once()
        pub fn push_event(&mut self, event: StackEvent) {
            let _ = self.events.push_back(event);
        }

        /// Simulate the network accepting the join
        pub fn accept_join(&mut self, dev_addr: u32, nwk_skey: AesKey, app_skey: AesKey) {
            self.session = StackSession {
                dev_addr,
                nwk_skey,
                app_skey,
            };
            self.joining = false;
            self.push_event(StackEvent::Joined);
        }

        /// Simulate the join attempt giving up
        pub fn reject_join(&mut self) {
            self.joining = false;
            self.push_event(StackEvent::JoinFailed);
        }

        /// Simulate the pending uplink finishing, optionally with a downlink
        pub fn complete_tx(&mut self, downlink: &[u8]) {
            self.pending = false;
            self.seq_no_up = self.seq_no_up.wrapping_add(1);
            self.downlink.clear();
            let _ = self.downlink.extend_from_slice(downlink);
            self.push_event(StackEvent::TxComplete);
        }

        /// Keep the stack in joining state
        pub fn set_joining(&mut self, joining: bool) {
            self.joining = joining;
        }

        pub fn set_next_queue_error(&mut self, error: StackError) {
            self.next_queue_error = Some(error);
        }

        pub fn uplinks(&self) -> &[Vec<u8, 32>] {
            &self.uplinks
        }

        pub fn net_id(&self) -> Option<u32> {
            self.net_id
        }

        pub fn last_join(&self) -> Option<&JoinCredentials> {
            self.last_join.as_ref()
        }

        pub fn data_rate(&self) -> Option<(DataRate, i8)> {
            self.data_rate
        }

        pub fn link_check(&self) -> Option<bool> {
            self.link_check
        }

        pub fn sub_band(&self) -> Option<u8> {
            self.sub_band
        }
    }

    impl Default for MockLoraStack {
        fn default() -> Self {
            Self::new()
        }
    }

    impl LoraStack for MockLoraStack {
        fn reset(&mut self) {
            self.reset_count += 1;
            self.joining = false;
            self.pending = false;
            self.net_id = None;
        }

        fn setup_channels(&mut self, plan: &ChannelPlan) {
            self.channel_setups += 1;
            self.sub_band = Some(plan.sub_band);
        }

        fn set_link_check(&mut self, enabled: bool) {
            self.link_check = Some(enabled);
        }

        fn set_data_rate(&mut self, rate: DataRate, tx_power_dbm: i8) {
            self.data_rate = Some((rate, tx_power_dbm));
        }

        fn set_seq_no_up(&mut self, seq_no_up: u32) {
            self.seq_no_up = seq_no_up;
        }

        fn seq_no_up(&self) -> u32 {
            self.seq_no_up
        }

        fn start_join(&mut self, credentials: &JoinCredentials) {
            self.join_count += 1;
            self.joining = true;
            self.last_join = Some(credentials.clone());
        }

        fn set_session(&mut self, net_id: u32, dev_addr: u32, nwk_skey: &AesKey, app_skey: &AesKey) {
            self.net_id = Some(net_id);
            self.session = StackSession {
                dev_addr,
                nwk_skey: *nwk_skey,
                app_skey: *app_skey,
            };
        }

        fn session(&self) -> StackSession {
            self.session
        }

        fn is_joining(&self) -> bool {
            self.joining
        }

        fn is_tx_rx_pending(&self) -> bool {
            self.pending
        }

        fn queue_uplink(&mut self, _port: u8, data: &[u8], _confirmed: bool) -> Result<(), StackError> {
            if let Some(error) = self.next_queue_error.take() {
                return Err(error);
            }

            let mut packet = Vec::new();
            packet
                .extend_from_slice(data)
                .map_err(|_| StackError::TooLong)?;
            let _ = self.uplinks.push(packet);
            self.pending = true;
            Ok(())
        }

        fn clear_tx_data(&mut self) {
            self.clear_count += 1;
            self.pending = false;
        }

        fn downlink(&self) -> &[u8] {
            &self.downlink
        }

        fn run_once(&mut self) -> Option<StackEvent> {
            self.run_count += 1;
            self.events.pop_front()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_mock_uplink_pending_until_complete() {
            let mut stack = MockLoraStack::new();
            stack.set_seq_no_up(5);

            stack.queue_uplink(1, &[0x01, 0x02], false).unwrap();
            assert!(stack.is_tx_rx_pending());
            assert_eq!(stack.uplinks()[0].as_slice(), &[0x01, 0x02]);

            stack.complete_tx(&[0xAA]);
            assert!(!stack.is_tx_rx_pending());
            assert_eq!(stack.seq_no_up(), 6);
            assert_eq!(stack.run_once(), Some(StackEvent::TxComplete));
            assert_eq!(stack.downlink(), &[0xAA]);
            assert_eq!(stack.run_once(), None);
        }

        #[test]
        fn test_mock_queue_error() {
            let mut stack = MockLoraStack::new();
            stack.set_next_queue_error(StackError::Busy);

            assert_eq!(stack.queue_uplink(1, &[0x01], false), Err(StackError::Busy));
            // Error should be cleared, next call should succeed
            stack.queue_uplink(1, &[0x02], false).unwrap();
        }
    }
}
