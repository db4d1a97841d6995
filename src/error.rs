// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Error taxonomy for readback providers.
//!
//! Errors fall into four groups:
//!
//! * construction failures ([`Error::UnsupportedBackend`], [`Error::InvalidDimensions`], ...)
//!   are returned synchronously from provider constructors.
//! * [`Error::ResourceMisuse`] is returned when a caller breaks the request contract.
//!   The rejected handler is dropped without being invoked.
//! * [`Error::InvalidToken`] indicates a native/managed protocol violation.  Native
//!   completion paths treat it as fatal.
//! * transient copy failures never surface here; they are delivered to the handler as
//!   an empty view instead.

use crate::readback::Backend;
use crate::registry::Token;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{0} readback is not supported on this platform")]
    UnsupportedBackend(Backend),
    #[error("Invalid readback dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("Element size {element_size} does not divide buffer length {byte_len}")]
    ElementSize { element_size: usize, byte_len: usize },
    #[error("Unknown or released token {0:?}")]
    InvalidToken(Token),
    #[error("Readback contract violation: {0}")]
    ResourceMisuse(Misuse),
    #[error("Native callback delivered a null context")]
    NullContext,
    #[error("Operation requires the graphics thread")]
    NotOnGraphicsThread,
    #[error("Can't spawn graphics thread {0}")]
    Thread(#[from] std::io::Error),
    #[error("Can't load native bridge {0}")]
    Library(#[from] libloading::Error),
    #[error("Copy failed: {0}")]
    CopyFailed(String),
    #[cfg(feature = "backend_wgpu")]
    #[error("No such adapter")]
    NoSuchAdapter,
    #[cfg(feature = "backend_wgpu")]
    #[error("Can't create device {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// Ways a caller can break the provider contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Misuse {
    #[error("a request is already in flight on this provider")]
    OverlappingRequest,
    #[error("the provider has been disposed")]
    RequestAfterDispose,
}

impl Error {
    /// True for contract violations that must not be retried.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::ResourceMisuse(_) | Error::InvalidToken(_))
    }
}

impl From<Misuse> for Error {
    fn from(value: Misuse) -> Self {
        Error::ResourceMisuse(value)
    }
}
