// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// An identifier failed its grammar check.
    #[error("Invalid {kind}: {value:?}")]
    InvalidId { kind: &'static str, value: String },
    /// A field the record cannot exist without is absent.
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
    /// A field is present with the wrong JSON type.
    #[error("Field '{0}' has the wrong type")]
    WrongType(&'static str),
    #[error("Event JSON must be an object")]
    NotAnObject,
    #[error("Event of {size} bytes exceeds the maximum of {max}")]
    TooLarge { size: usize, max: usize },
    /// The keyring holds no key for the server.
    #[error("No signing key for {0}")]
    NoKey(String),
    #[error("Signature verification failed for {0}")]
    BadSignature(String),
}

pub type KernelResult<T> = core::result::Result<T, KernelError>;
pub type Result<T> = KernelResult<T>;
