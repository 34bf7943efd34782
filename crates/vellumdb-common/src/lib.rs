//! Shared error definitions for VellumDB.

mod error;

pub use error::{EngineError, Result, StoreError, StoreResult};
