use std::io;

use thiserror::Error;

use rdma::ibv::WcStatus;

use crate::cm::EventKind;

/// Violations of the connection-management protocol.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("{kind} carried status {status}")]
    EventStatus { kind: EventKind, status: i32 },
    #[error("expected {expected}, got {actual}")]
    UnexpectedEvent {
        expected: EventKind,
        actual: EventKind,
    },
    #[error("{op} is not allowed in state {state}")]
    InvalidTransition {
        op: &'static str,
        state: &'static str,
    },
    #[error("connect request did not carry a connection id")]
    MissingRequestId,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Resource exhausted on {op}: {source}")]
    ResourceExhaustion {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Protocol state: {0}")]
    ProtocolState(#[from] StateError),
    #[error("Work request {wr_id} completed with {status}")]
    Transport { status: WcStatus, wr_id: u64 },
    #[error("Malformed buffer descriptor: {0}")]
    MalformedDescriptor(String),
    #[error("{op} failed: {source}")]
    Verbs {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Config: {0}")]
    Config(String),
    #[error("{requested} requested but only {available} available")]
    CapacityExceeded { requested: usize, available: usize },
    #[error("Source and sink differ at offset {offset}")]
    IntegrityMismatch { offset: usize },
}

impl Error {
    pub(crate) fn resource(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::ResourceExhaustion { op, source }
    }

    pub(crate) fn verbs(op: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Verbs { op, source }
    }

    /// The negative process status reported for this error.
    ///
    /// OS-level failures mirror the errno they carry; the rest use fixed codes.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ResourceExhaustion { source, .. } | Error::Verbs { source, .. } => {
                -source.raw_os_error().filter(|e| *e > 0).unwrap_or(libc::EIO)
            }
            Error::ProtocolState(_) => -libc::EPROTO,
            Error::Transport { .. } => -libc::EIO,
            Error::MalformedDescriptor(_) => -libc::EBADMSG,
            Error::Timeout(_) => -libc::ETIMEDOUT,
            Error::Config(_) => -libc::EINVAL,
            Error::CapacityExceeded { .. } => -libc::EMSGSIZE,
            Error::IntegrityMismatch { .. } => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
