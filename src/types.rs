use std::sync::{RwLockReadGuard, RwLockWriteGuard};

/// Identifier of a token in the model's vocabulary.
pub type TokenId = u32;

/// Identifier of a logical generation request.
pub type RequestId = u64;

/// Identifier of a single hypothesis (`Sequence`) within a request.
pub type SequenceId = u64;

pub trait ReadLock {
    type Error;
    type Inner;
    fn read_lock(&self) -> Result<RwLockReadGuard<Self::Inner>, Self::Error>;
}

pub trait WriteLock {
    type Error;
    type Inner;
    fn write_lock(&self) -> Result<RwLockWriteGuard<Self::Inner>, Self::Error>;
}
