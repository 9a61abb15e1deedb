//! # Application Errors
//!
//! One error type for everything the binary does around the kernel:
//! configuration, file I/O, server startup and bridge calls.

use crate::bridge::BridgeError;
use bassline_core::{CoreError, DispatchError, KernelError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
