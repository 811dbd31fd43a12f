//! Backup-aware operation protocol.
//!
//! `protocol` defines the contract every operation follows and the driver the
//! partition executor uses, `backup` the immutable effect descriptors sent to
//! replicas, and `codec` the wire layout of the record-id carrying operations.
//! The concrete multimap transaction operations live in `txn` and
//! `remove_all`; cache operations in `cache_ops`.

mod backup;
mod cache_ops;
pub mod codec;
mod protocol;
mod remove_all;
mod txn;

pub use backup::{BackupEffect, BackupOperation};
pub use cache_ops::{CacheGetOperation, CachePutOperation, CacheRemoveOperation};
pub use protocol::{execute_operation, KeyTarget, Operation, OperationContext, OperationOutcome, Response};
pub use remove_all::TxnRemoveAllOperation;
pub use txn::{
    CollectionGetOperation, TxnGenerateRecordIdOperation, TxnLockAndGetOperation, TxnPutOperation,
    TxnUnlockOperation,
};
