pub mod store;
pub mod traits;

pub use store::{CredentialStore, InitOutcome};
pub use traits::{NvError, NvStorage};
