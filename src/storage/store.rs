//! Persistent credential store
//!
//! Layout of the NV region:
//!
//! ```text
//! [magic: u32 LE = 0x40DE2017][application payload ...]
//! ```
//!
//! All application offsets are relative to the byte after the magic number.
//! Transfers wider than the transport's block size are split into sequential
//! block-sized requests, and blocks whose contents already match are not
//! rewritten.

use log::{debug, error, info, warn};

use crate::config::nv::{MAGIC_NUMBER, MAGIC_NUMBER_SIZE, SEQ_NO_OFFSET, SESSION_RECORD_OFFSET};
use crate::protocol::chunked::chunks;
use crate::protocol::codec::{DeviceSession, SessionRecord};
use crate::storage::traits::{NvError, NvStorage};

/// Largest block compared before a write
const COMPARE_BUFFER_SIZE: usize = 64;

/// What `init` found at the bottom of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Header present, payload kept
    MagicFound,
    /// Header absent or wrong, store was reset and the header written
    FactoryReset,
}

/// Credential store over an NV transport
pub struct CredentialStore<'a, S: NvStorage> {
    storage: &'a mut S,
}

impl<'a, S: NvStorage> CredentialStore<'a, S> {
    pub fn new(storage: &'a mut S) -> Self {
        Self { storage }
    }

    /// Check the magic number and reset the store if it is missing.
    pub async fn init(&mut self) -> Result<InitOutcome, NvError> {
        let mut magic = [0u8; MAGIC_NUMBER_SIZE as usize];
        if let Err(e) = self.storage.read(0, &mut magic).await {
            warn!("NV: magic read failed ({:?})", e);
        }

        if u32::from_le_bytes(magic) == MAGIC_NUMBER {
            debug!("NV: magic found");
            return Ok(InitOutcome::MagicFound);
        }

        info!("NV: magic not found, performing factory reset");
        if let Err(e) = self.storage.factory_reset().await {
            error!("NV: factory reset failed ({:?})", e);
            return Err(NvError::ResetFailed);
        }

        self.storage
            .write(0, &MAGIC_NUMBER.to_le_bytes())
            .await
            .inspect_err(|e| error!("NV: magic write failed ({:?})", e))?;

        Ok(InitOutcome::FactoryReset)
    }

    /// Write bytes at `offset` past the header.
    ///
    /// Stops at the first failing block and reports the failure.
    pub async fn write_bytes(&mut self, offset: u16, bytes: &[u8]) -> Result<(), NvError> {
        let block = self.block_size();
        let mut current = [0u8; COMPARE_BUFFER_SIZE];

        for range in chunks(bytes.len(), block) {
            let address = payload_address(offset, range.start)?;
            let data = &bytes[range];

            let existing = &mut current[..data.len()];
            if self.storage.read(address, existing).await.is_ok() && existing == data {
                continue;
            }

            if let Err(e) = self.storage.write(address, data).await {
                error!("NV: write of {} bytes at {} failed ({:?})", data.len(), address, e);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Read bytes at `offset` past the header into `buf`.
    pub async fn read_bytes(&mut self, offset: u16, buf: &mut [u8]) -> Result<(), NvError> {
        let block = self.block_size();

        for range in chunks(buf.len(), block) {
            let address = payload_address(offset, range.start)?;
            let len = range.len();
            if let Err(e) = self.storage.read(address, &mut buf[range]).await {
                error!("NV: read of {} bytes at {} failed ({:?})", len, address, e);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Write a 4-byte little-endian integer at `offset` past the header.
    pub async fn write_int(&mut self, offset: u16, value: u32) -> Result<(), NvError> {
        let address = payload_address(offset, 0)?;
        self.storage
            .write(address, &value.to_le_bytes())
            .await
            .inspect_err(|e| error!("NV: int write at {} failed ({:?})", address, e))
    }

    /// Read a 4-byte little-endian integer at `offset` past the header.
    pub async fn read_int(&mut self, offset: u16) -> Result<u32, NvError> {
        let address = payload_address(offset, 0)?;
        let mut buf = [0u8; 4];
        self.storage
            .read(address, &mut buf)
            .await
            .inspect_err(|e| error!("NV: int read at {} failed ({:?})", address, e))?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Persist a session record and its sequence number.
    pub async fn save_session(&mut self, session: &DeviceSession) -> Result<(), NvError> {
        self.write_bytes(SESSION_RECORD_OFFSET, &SessionRecord::encode(session))
            .await?;
        self.save_seq_no(session.seq_no_up).await
    }

    /// Persist the next upstream sequence number.
    pub async fn save_seq_no(&mut self, seq_no_up: u32) -> Result<(), NvError> {
        if self.read_int(SEQ_NO_OFFSET).await.ok() == Some(seq_no_up) {
            return Ok(());
        }
        self.write_int(SEQ_NO_OFFSET, seq_no_up).await
    }

    /// Load the persisted session, if a valid record exists.
    pub async fn load_session(&mut self) -> Result<Option<DeviceSession>, NvError> {
        let mut record = [0u8; SessionRecord::LEN];
        self.read_bytes(SESSION_RECORD_OFFSET, &mut record).await?;
        let seq_no_up = self.read_int(SEQ_NO_OFFSET).await?;

        match SessionRecord::decode(&record, seq_no_up) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                debug!("NV: no stored session ({:?})", e);
                Ok(None)
            }
        }
    }

    fn block_size(&self) -> usize {
        self.storage.max_block_size().clamp(1, COMPARE_BUFFER_SIZE)
    }
}

/// Absolute NV address of a payload offset
fn payload_address(offset: u16, delta: usize) -> Result<u16, NvError> {
    let delta = u16::try_from(delta).map_err(|_| NvError::OutOfRange)?;
    MAGIC_NUMBER_SIZE
        .checked_add(offset)
        .and_then(|a| a.checked_add(delta))
        .ok_or(NvError::OutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::DevAddr;
    use crate::storage::traits::mock::MockNvStorage;

    fn with_magic(block_size: usize) -> MockNvStorage {
        let mut nv = MockNvStorage::new(block_size);
        nv.preload(0, &MAGIC_NUMBER.to_le_bytes());
        nv
    }

    #[test]
    fn test_init_without_magic_resets() {
        let mut nv = MockNvStorage::new(16);
        nv.preload(0, &[0xAB; 8]);

        futures::executor::block_on(async {
            let outcome = CredentialStore::new(&mut nv).init().await;
            assert_eq!(outcome, Ok(InitOutcome::FactoryReset));
        });

        assert_eq!(nv.reset_count(), 1);
        assert_eq!(&nv.memory()[0..4], &MAGIC_NUMBER.to_le_bytes());
        // Payload region cleared by the reset
        assert_eq!(&nv.memory()[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_init_with_magic_keeps_payload() {
        let mut nv = with_magic(16);
        nv.preload(4, &[0x2A]);

        futures::executor::block_on(async {
            let mut store = CredentialStore::new(&mut nv);
            assert_eq!(store.init().await, Ok(InitOutcome::MagicFound));

            let mut buf = [0u8; 1];
            store.read_bytes(0, &mut buf).await.unwrap();
            assert_eq!(buf, [0x2A]);
        });

        assert_eq!(nv.reset_count(), 0);
        assert!(nv.write_log().is_empty());
    }

    #[test]
    fn test_init_reset_failure() {
        let mut nv = MockNvStorage::new(16);
        nv.set_next_reset_error(NvError::ResetFailed);

        futures::executor::block_on(async {
            let outcome = CredentialStore::new(&mut nv).init().await;
            assert_eq!(outcome, Err(NvError::ResetFailed));
        });
    }

    #[test]
    fn test_write_bytes_splits_into_blocks() {
        let mut nv = with_magic(16);
        let data: [u8; 40] = core::array::from_fn(|i| i as u8 + 1);

        futures::executor::block_on(async {
            let mut store = CredentialStore::new(&mut nv);
            store.write_bytes(2, &data).await.unwrap();

            let mut back = [0u8; 40];
            store.read_bytes(2, &mut back).await.unwrap();
            assert_eq!(back, data);
        });

        assert_eq!(nv.write_log().as_slice(), &[6, 22, 38]);
        assert!(!nv.saw_oversized_request());
        assert_eq!(&nv.memory()[6..46], &data);
    }

    #[test]
    fn test_write_bytes_skips_unchanged_blocks() {
        let mut nv = with_magic(16);
        let mut data = [0x11u8; 32];

        futures::executor::block_on(async {
            CredentialStore::new(&mut nv).write_bytes(0, &data).await.unwrap();
        });
        nv.clear_write_log();

        data[20] = 0x22;
        futures::executor::block_on(async {
            CredentialStore::new(&mut nv).write_bytes(0, &data).await.unwrap();
        });

        // Only the second block changed
        assert_eq!(nv.write_log().as_slice(), &[20]);
    }

    #[test]
    fn test_write_bytes_stops_at_first_failure() {
        let mut nv = with_magic(16);
        nv.fail_write_at(1);

        futures::executor::block_on(async {
            let result = CredentialStore::new(&mut nv).write_bytes(0, &[0x5A; 48]).await;
            assert_eq!(result, Err(NvError::WriteFailed));
        });

        // First block written, second failed, third never attempted
        assert_eq!(nv.write_log().as_slice(), &[4, 20]);
        assert_eq!(nv.memory()[4], 0x5A);
        assert_eq!(nv.memory()[36], 0x00);
    }

    #[test]
    fn test_read_bytes_failure_reported() {
        let mut nv = with_magic(16);
        nv.set_next_read_error(NvError::ReadFailed);

        futures::executor::block_on(async {
            let mut buf = [0u8; 4];
            let result = CredentialStore::new(&mut nv).read_bytes(0, &mut buf).await;
            assert_eq!(result, Err(NvError::ReadFailed));
        });
    }

    #[test]
    fn test_int_round_trip_after_header() {
        let mut nv = with_magic(16);

        futures::executor::block_on(async {
            let mut store = CredentialStore::new(&mut nv);
            store.write_int(8, 0xCAFE_F00D).await.unwrap();
            assert_eq!(store.read_int(8).await, Ok(0xCAFE_F00D));
        });

        assert_eq!(&nv.memory()[12..16], &[0x0D, 0xF0, 0xFE, 0xCA]);
    }

    #[test]
    fn test_offset_past_region() {
        let mut nv = with_magic(16);

        futures::executor::block_on(async {
            let result = CredentialStore::new(&mut nv).write_int(u16::MAX, 1).await;
            assert_eq!(result, Err(NvError::OutOfRange));
        });
    }

    #[test]
    fn test_session_persisted_and_loaded() {
        let mut nv = with_magic(16);
        let session = DeviceSession {
            dev_addr: DevAddr::from_wire([0x26, 0x01, 0x1F, 0x3C]),
            nwk_skey: [0x11; 16],
            app_skey: [0x22; 16],
            seq_no_up: 41,
        };

        futures::executor::block_on(async {
            let mut store = CredentialStore::new(&mut nv);
            assert_eq!(store.load_session().await, Ok(None));

            store.save_session(&session).await.unwrap();
            store.save_seq_no(42).await.unwrap();

            let loaded = store.load_session().await.unwrap().unwrap();
            assert_eq!(loaded.dev_addr, session.dev_addr);
            assert_eq!(loaded.nwk_skey, session.nwk_skey);
            assert_eq!(loaded.seq_no_up, 42);
        });

        // Address stored big-endian right after the record version
        assert_eq!(&nv.memory()[5..9], &[0x26, 0x01, 0x1F, 0x3C]);
    }
}
