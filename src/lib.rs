pub mod builder;
pub mod config;
pub mod ledger;
pub mod metrics;
pub mod referral;
pub mod replay;
pub mod settle;
pub mod split;
pub mod storage;
pub mod verify;

pub use replay::SignatureGuard;
pub use split::FeeSplit;
pub use storage::Store;
pub use verify::{Verifier, VerifyError};
