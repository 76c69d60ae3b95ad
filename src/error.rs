// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::io;
use thiserror::Error;

use crate::pool::BufferId;

/// Errors reported by a display/compositor surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("no free buffer in the queue")]
    NoBuffer,

    #[error("consumer has abandoned the queue")]
    Abandoned,

    #[error("buffer is not known to this queue")]
    NotFound,

    #[error("buffer is in the wrong state for this call")]
    WrongState,

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("surface error code {0}")]
    Other(i32),
}

/// Errors reported by the hardware codec component.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OmxError {
    #[error("component rejected the call with code {0}")]
    Rejected(i32),

    #[error("unknown buffer id {0}")]
    UnknownBuffer(BufferId),

    #[error("buffer id {0} is already owned by the component")]
    AlreadyQueued(BufferId),
}

/// Coarse classification of a [`DecoderError`], the code handed back to the
/// caller of setup, allocation and surface-switch operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid configuration, detected before any allocation.
    Configuration,
    /// A surface or hardware resource could not be obtained.
    Resource,
    /// An argument referenced something invalid (unknown id, wrong owner).
    InvalidValue,
    /// The call is not allowed in the decoder's current mode or state.
    InvalidOperation,
    /// The decoder thread is gone.
    Disconnected,
}

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("surface buffer request failed: {0}")]
    SurfaceRequest(#[source] SurfaceError),

    #[error("hardware use-buffer failed: {0}")]
    UseBuffer(#[source] OmxError),

    #[error("surface error: {0}")]
    Surface(#[from] SurfaceError),

    #[error("hardware component error: {0}")]
    Omx(#[from] OmxError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("decoder is gone")]
    Disconnected,
}

impl DecoderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecoderError::Configuration(_) => ErrorKind::Configuration,
            DecoderError::InvalidValue(_) => ErrorKind::InvalidValue,
            DecoderError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            DecoderError::SurfaceRequest(_)
            | DecoderError::UseBuffer(_)
            | DecoderError::Surface(_)
            | DecoderError::Omx(_)
            | DecoderError::Io(_) => ErrorKind::Resource,
            DecoderError::Disconnected => ErrorKind::Disconnected,
        }
    }
}

pub type Result<T> = std::result::Result<T, DecoderError>;
