// src/batch/mod.rs

pub mod executor;

pub use executor::{
    BatchConfig, BatchExecutor, BatchOperation, BatchOperationResult, BatchOptions,
};
