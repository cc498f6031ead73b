pub mod counter;
pub mod error;
pub mod evidence;
pub mod ids;
pub mod leads;
pub mod ledger;
pub mod sources;
pub mod state;
pub mod store;

pub use counter::{AllocationPartition, IdKind, IdSpace};
pub use error::{CounterError, StoreError};
pub use evidence::{EvidenceFile, EvidenceMetadata};
pub use leads::{Lead, LeadStatus, LeadsFile, Priority};
pub use ledger::{LedgerEntry, LedgerEntryType, LedgerFile};
pub use sources::{SourceCatalog, SourceLayout, SourceRecord};
pub use state::{Allocation, AllocationStatus, CaseState, GateName, Phase};
pub use store::CasePaths;
