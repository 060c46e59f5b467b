//! Session state machine
//!
//! Owns the readiness mode and the active LoRaWAN session, drives the radio
//! stack through joins, activations and uplinks, and turns stack events into
//! [`SessionOutput`] values for the run loop to deliver.
//!
//! ```text
//! NeedsConfiguration --request_join--> ReadyToJoin --Joined--> Ready
//!        ^                                  |
//!        +------------JoinFailed------------+
//!
//! any mode --install_session--> Ready
//! ```
//!
//! Every `request_join` call resolves with exactly one `JoinResult`, and every
//! accepted `send_packet` call resolves with exactly one `TxResult`.

use heapless::{Deque, Vec};
use log::{debug, info, warn};

use crate::config::{lora_defaults, protocol::MAX_DOWNLINK_PAYLOAD, protocol::MAX_UPLINK_PAYLOAD, NodeConfig};
use crate::lora::plan::{ChannelPlan, DataRate};
use crate::lora::traits::{LoraStack, StackError, StackEvent};
use crate::protocol::codec::{DevAddr, DeviceSession, JoinCredentials, TxResultRecord, TxStatus};
use crate::session::watchdog::TxWatchdog;

/// Capacity of the output queue between ticks
const OUTBOX_SIZE: usize = 8;

/// Downlink payload carried with a transmit result
pub type Downlink = Vec<u8, MAX_DOWNLINK_PAYLOAD>;

/// Readiness of the node to send uplinks
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadinessMode {
    /// No credentials or session supplied
    #[default]
    NeedsConfiguration = 0,
    /// Join credentials supplied, join in progress
    ReadyToJoin = 1,
    /// Session established, uplinks allowed
    Ready = 2,
}

impl ReadinessMode {
    /// Value reported on the status characteristic
    pub const fn status_byte(self) -> u8 {
        self as u8
    }
}

/// Reasons a send is refused before reaching the air
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Mode is not `Ready`
    NotReady,
    /// A transmit or receive is already pending
    Busy,
    /// Payload wider than one uplink allows
    TooLong,
    /// The stack refused the uplink
    Rejected,
}

impl From<SendError> for TxStatus {
    fn from(error: SendError) -> Self {
        match error {
            SendError::NotReady => TxStatus::NotReady,
            SendError::Busy => TxStatus::Busy,
            SendError::TooLong => TxStatus::InvalidPayload,
            SendError::Rejected => TxStatus::Rejected,
        }
    }
}

impl From<StackError> for SendError {
    fn from(error: StackError) -> Self {
        match error {
            StackError::Busy => SendError::Busy,
            StackError::TooLong => SendError::TooLong,
            StackError::InvalidConfig => SendError::Rejected,
        }
    }
}

/// Results produced by the controller, drained by the run loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    /// Outcome of a `request_join`; `None` means the join failed
    JoinResult(Option<DeviceSession>),
    /// Outcome of an accepted `send_packet`
    TxResult {
        record: TxResultRecord,
        downlink: Downlink,
    },
    /// Readiness mode changed
    ModeChanged(ReadinessMode),
}

/// Uplink accepted by the stack and not yet resolved
#[derive(Debug, Clone, Copy)]
struct PendingTx {
    ble_sequence: u8,
    /// Upstream counter the uplink was queued with
    seq_no_up: u32,
}

/// Session state machine
pub struct SessionController {
    mode: ReadinessMode,
    session: Option<DeviceSession>,
    join_outstanding: bool,
    pending_tx: Option<PendingTx>,
    watchdog: TxWatchdog,
    plan: ChannelPlan,
    data_rate: DataRate,
    tx_power_dbm: i8,
    uplink_port: u8,
    outbox: Deque<SessionOutput, OUTBOX_SIZE>,
}

impl SessionController {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            mode: ReadinessMode::NeedsConfiguration,
            session: None,
            join_outstanding: false,
            pending_tx: None,
            watchdog: TxWatchdog::new(config.tx_timeout_ms),
            plan: ChannelPlan::default(),
            data_rate: data_rate_for(config.spreading_factor),
            tx_power_dbm: config.tx_power_dbm,
            uplink_port: config.uplink_port,
            outbox: Deque::new(),
        }
    }

    pub fn mode(&self) -> ReadinessMode {
        self.mode
    }

    /// Active session, if joined or activated
    pub fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    pub fn data_rate(&self) -> DataRate {
        self.data_rate
    }

    /// True while an accepted uplink awaits completion or timeout
    pub fn is_tx_pending(&self) -> bool {
        self.pending_tx.is_some()
    }

    /// Next output for the run loop
    pub fn take_output(&mut self) -> Option<SessionOutput> {
        self.outbox.pop_front()
    }

    /// Start an over-the-air join.
    ///
    /// Valid from any mode. A join still outstanding from an earlier call is
    /// resolved as failed first, and a pending uplink is resolved as cancelled.
    pub fn request_join<S: LoraStack>(
        &mut self,
        stack: &mut S,
        credentials: &JoinCredentials,
        starting_seq_no: Option<u32>,
    ) {
        if self.join_outstanding {
            warn!("Join: new request supersedes outstanding join");
            self.push(SessionOutput::JoinResult(None));
        }
        self.cancel_pending_tx();

        stack.reset();
        self.configure_radio(stack);
        if let Some(seq_no_up) = starting_seq_no {
            stack.set_seq_no_up(seq_no_up);
        }
        stack.start_join(credentials);

        info!("Join: started");
        self.session = None;
        self.join_outstanding = true;
        self.set_mode(ReadinessMode::ReadyToJoin);
    }

    /// Install session keys directly (activation-by-personalization).
    ///
    /// Takes effect immediately; the stack's upstream counter continues from
    /// `session.seq_no_up`.
    pub fn install_session<S: LoraStack>(&mut self, stack: &mut S, session: DeviceSession) {
        if self.join_outstanding {
            warn!("Join: abandoned for direct activation");
            self.join_outstanding = false;
            self.push(SessionOutput::JoinResult(None));
        }
        self.cancel_pending_tx();

        stack.reset();
        stack.set_session(
            lora_defaults::NET_ID,
            session.dev_addr.native(),
            &session.nwk_skey,
            &session.app_skey,
        );
        // Channels after the session, which installs the minimal channel set
        self.configure_radio(stack);
        stack.set_seq_no_up(session.seq_no_up);

        info!(
            "Session: activated {:02X?} at seq {}",
            session.dev_addr.to_wire(),
            session.seq_no_up
        );
        self.session = Some(session);
        self.set_mode(ReadinessMode::Ready);
    }

    /// Queue an uplink.
    ///
    /// Refused without touching the radio unless the mode is `Ready` and the
    /// stack has nothing pending. On success the watchdog is armed, unless the
    /// stack is (re)joining.
    pub fn send_packet<S: LoraStack>(
        &mut self,
        stack: &mut S,
        ble_sequence: u8,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(), SendError> {
        if self.mode != ReadinessMode::Ready {
            warn!("TX: not sent, mode {:?}", self.mode);
            return Err(SendError::NotReady);
        }
        if self.pending_tx.is_some() || stack.is_tx_rx_pending() {
            warn!("TX: not sent, transmit pending");
            return Err(SendError::Busy);
        }
        if data.len() > MAX_UPLINK_PAYLOAD {
            warn!("TX: not sent, {} bytes exceeds {}", data.len(), MAX_UPLINK_PAYLOAD);
            return Err(SendError::TooLong);
        }

        let seq_no_up = stack.seq_no_up();
        stack
            .queue_uplink(self.uplink_port, data, false)
            .inspect_err(|e| warn!("TX: stack refused uplink ({:?})", e))?;

        debug!("TX: queued {} bytes, ble seq {}", data.len(), ble_sequence);
        self.pending_tx = Some(PendingTx {
            ble_sequence,
            seq_no_up,
        });
        if !stack.is_joining() {
            self.watchdog.arm(now_ms);
        }
        Ok(())
    }

    /// React to one event raised by the stack's scheduler
    pub fn handle_event<S: LoraStack>(&mut self, stack: &mut S, event: StackEvent) {
        match event {
            StackEvent::Joined => self.on_joined(stack),
            StackEvent::JoinFailed | StackEvent::RejoinFailed => self.on_join_failed(event),
            StackEvent::TxComplete => self.on_tx_complete(stack),
            other => debug!("LoRa: {:?}", other),
        }
    }

    /// Clear a transmit that outlived the watchdog.
    ///
    /// Resolves the pending uplink with `TxStatus::Timeout`. While the stack
    /// is joining the watchdog is disarmed without touching the transmit.
    pub fn check_watchdog<S: LoraStack>(&mut self, stack: &mut S, now_ms: u64) {
        if !self.watchdog.expired(now_ms) {
            return;
        }
        self.watchdog.cancel();

        if stack.is_joining() {
            debug!("TX: watchdog expired during join, still waiting");
            return;
        }

        warn!("TX: timeout, clearing pending transmit");
        stack.clear_tx_data();
        // The frame counter may already be spent on air
        let stack_seq_no = stack.seq_no_up();
        if let Some(session) = self.session.as_mut() {
            session.seq_no_up = session.seq_no_up.max(stack_seq_no);
        }
        if let Some(pending) = self.pending_tx.take() {
            self.push_tx_result(
                TxResultRecord::new(pending.ble_sequence, TxStatus::Timeout, pending.seq_no_up),
                Downlink::new(),
            );
        }
    }

    /// Change the uplink spreading factor.
    ///
    /// SF7..=SF10 are accepted; anything else falls back to SF10. Applied to
    /// the stack at once if a join or session is in place, otherwise at the
    /// next join or activation.
    pub fn set_spreading_factor<S: LoraStack>(&mut self, stack: &mut S, spreading_factor: u8) -> DataRate {
        self.data_rate = data_rate_for(spreading_factor);
        if self.mode != ReadinessMode::NeedsConfiguration {
            stack.set_data_rate(self.data_rate, self.tx_power_dbm);
        }
        info!("LoRa: data rate {:?}", self.data_rate);
        self.data_rate
    }

    fn on_joined<S: LoraStack>(&mut self, stack: &mut S) {
        let requested = core::mem::take(&mut self.join_outstanding);
        stack.set_link_check(false);

        let installed = stack.session();
        let session = DeviceSession {
            dev_addr: DevAddr::from_native(installed.dev_addr),
            nwk_skey: installed.nwk_skey,
            app_skey: installed.app_skey,
            seq_no_up: stack.seq_no_up(),
        };

        info!("Join: joined as {:02X?}", session.dev_addr.to_wire());
        self.session = Some(session.clone());
        self.set_mode(ReadinessMode::Ready);
        if requested {
            self.push(SessionOutput::JoinResult(Some(session)));
        } else {
            warn!("Join: session adopted with no outstanding request");
        }
    }

    fn on_join_failed(&mut self, event: StackEvent) {
        if !self.join_outstanding {
            debug!("Join: {:?} with no outstanding request", event);
            return;
        }

        warn!("Join: failed ({:?})", event);
        self.join_outstanding = false;
        self.session = None;
        self.push(SessionOutput::JoinResult(None));
        self.set_mode(ReadinessMode::NeedsConfiguration);
    }

    fn on_tx_complete<S: LoraStack>(&mut self, stack: &mut S) {
        let Some(pending) = self.pending_tx.take() else {
            debug!("TX: completion with no pending send, ignored");
            return;
        };
        self.watchdog.cancel();

        // The stack's counter has already moved past the frame just sent
        let next_seq_no = stack.seq_no_up();
        let seq_no_up = next_seq_no.wrapping_sub(1);
        if let Some(session) = self.session.as_mut() {
            session.seq_no_up = next_seq_no;
        }

        let received = stack.downlink();
        let mut downlink = Downlink::new();
        let kept = received.len().min(MAX_DOWNLINK_PAYLOAD);
        if kept < received.len() {
            warn!("RX: downlink of {} bytes truncated to {}", received.len(), kept);
        }
        let _ = downlink.extend_from_slice(&received[..kept]);
        if !downlink.is_empty() {
            info!("RX: downlink {:02X?}", downlink.as_slice());
        }

        debug!("TX: complete, seq {}", seq_no_up);
        self.push_tx_result(
            TxResultRecord::new(pending.ble_sequence, TxStatus::Success, seq_no_up),
            downlink,
        );
    }

    fn configure_radio<S: LoraStack>(&mut self, stack: &mut S) {
        stack.setup_channels(&self.plan);
        stack.set_link_check(false);
        stack.set_data_rate(self.data_rate, self.tx_power_dbm);
    }

    fn cancel_pending_tx(&mut self) {
        self.watchdog.cancel();
        if let Some(pending) = self.pending_tx.take() {
            warn!("TX: pending transmit cancelled");
            self.push_tx_result(
                TxResultRecord::new(pending.ble_sequence, TxStatus::Cancelled, pending.seq_no_up),
                Downlink::new(),
            );
        }
    }

    fn set_mode(&mut self, mode: ReadinessMode) {
        if self.mode != mode {
            debug!("Mode: {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
            self.push(SessionOutput::ModeChanged(mode));
        }
    }

    fn push_tx_result(&mut self, record: TxResultRecord, downlink: Downlink) {
        self.push(SessionOutput::TxResult { record, downlink });
    }

    fn push(&mut self, output: SessionOutput) {
        if self.outbox.is_full() {
            warn!("Session: output queue full, dropping oldest");
            self.outbox.pop_front();
        }
        let _ = self.outbox.push_back(output);
    }
}

fn data_rate_for(spreading_factor: u8) -> DataRate {
    DataRate::from_spreading_factor(spreading_factor).unwrap_or_else(|| {
        warn!("LoRa: invalid SF {}, using default", spreading_factor);
        DataRate::default()
    })
}
