// Tiered, witness-verified, trust-weighted event ledger core.
// Time is injected through `Clock`; nothing here reads the wall clock directly
// except `SystemClock`.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
#[cfg(feature = "federation")]
pub mod federation;
pub mod ledger;
pub mod merkle;
pub mod node;
pub mod promotion;
pub mod scoring;
pub mod storage;
pub mod tensor;
pub mod validation;
pub mod witness;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use entry::{Entry, EntryContent, EntryRef, Hash, NewEntry, Tier, ZERO_HASH};
pub use error::LedgerError;
pub use node::{AckOutcome, LedgerNode, Submission, WitnessRequest};
pub use tensor::{Dimension, Root, TensorKey, TensorSnapshot};
pub use witness::WitnessType;
