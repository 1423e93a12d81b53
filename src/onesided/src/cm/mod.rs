//! Connection management: the events librdmacm reports and the per-role state machines driven
//! by them.
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use rdma::ffi::rdma_cm_event_type as raw;
use rdma::ibv::ConnParam;
use rdma::rdmacm::{CmEvent, CmEventType, CmId, EventChannel};

use crate::error::{Error, Result, StateError};

pub mod active;
pub mod passive;

pub use active::ActiveConnector;
pub use passive::PassiveListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
    Other(u32),
}

impl From<CmEventType> for EventKind {
    fn from(event: CmEventType) -> Self {
        match event {
            raw::RDMA_CM_EVENT_ADDR_RESOLVED => EventKind::AddrResolved,
            raw::RDMA_CM_EVENT_ADDR_ERROR => EventKind::AddrError,
            raw::RDMA_CM_EVENT_ROUTE_RESOLVED => EventKind::RouteResolved,
            raw::RDMA_CM_EVENT_ROUTE_ERROR => EventKind::RouteError,
            raw::RDMA_CM_EVENT_CONNECT_REQUEST => EventKind::ConnectRequest,
            raw::RDMA_CM_EVENT_CONNECT_RESPONSE => EventKind::ConnectResponse,
            raw::RDMA_CM_EVENT_CONNECT_ERROR => EventKind::ConnectError,
            raw::RDMA_CM_EVENT_UNREACHABLE => EventKind::Unreachable,
            raw::RDMA_CM_EVENT_REJECTED => EventKind::Rejected,
            raw::RDMA_CM_EVENT_ESTABLISHED => EventKind::Established,
            raw::RDMA_CM_EVENT_DISCONNECTED => EventKind::Disconnected,
            raw::RDMA_CM_EVENT_DEVICE_REMOVAL => EventKind::DeviceRemoval,
            raw::RDMA_CM_EVENT_MULTICAST_JOIN => EventKind::MulticastJoin,
            raw::RDMA_CM_EVENT_MULTICAST_ERROR => EventKind::MulticastError,
            raw::RDMA_CM_EVENT_ADDR_CHANGE => EventKind::AddrChange,
            raw::RDMA_CM_EVENT_TIMEWAIT_EXIT => EventKind::TimewaitExit,
            other => EventKind::Other(other),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::AddrResolved => "ADDR_RESOLVED",
            EventKind::AddrError => "ADDR_ERROR",
            EventKind::RouteResolved => "ROUTE_RESOLVED",
            EventKind::RouteError => "ROUTE_ERROR",
            EventKind::ConnectRequest => "CONNECT_REQUEST",
            EventKind::ConnectResponse => "CONNECT_RESPONSE",
            EventKind::ConnectError => "CONNECT_ERROR",
            EventKind::Unreachable => "UNREACHABLE",
            EventKind::Rejected => "REJECTED",
            EventKind::Established => "ESTABLISHED",
            EventKind::Disconnected => "DISCONNECTED",
            EventKind::DeviceRemoval => "DEVICE_REMOVAL",
            EventKind::MulticastJoin => "MULTICAST_JOIN",
            EventKind::MulticastError => "MULTICAST_ERROR",
            EventKind::AddrChange => "ADDR_CHANGE",
            EventKind::TimewaitExit => "TIMEWAIT_EXIT",
            EventKind::Other(code) => return write!(f, "RDMA_CM_EVENT_{}", code),
        };
        write!(f, "RDMA_CM_EVENT_{}", name)
    }
}

/// An event taken from an event source. It is acknowledged when dropped.
pub trait ObservedEvent {
    type Id;

    fn status(&self) -> i32;
    fn kind(&self) -> EventKind;
    /// The id of the new connection carried by a `ConnectRequest`.
    fn take_request(&mut self) -> Option<Self::Id>;
}

pub trait EventSource {
    type Event: ObservedEvent;

    /// Block for the next event; `Ok(None)` means `deadline` passed.
    fn next_event(&self, deadline: Option<Instant>) -> io::Result<Option<Self::Event>>;
}

/// The CM operations that move a connection through its states.
pub trait ConnectionId {
    fn bind_addr(&self, addr: &SocketAddr) -> io::Result<()>;
    fn listen(&self, backlog: i32) -> io::Result<()>;
    fn resolve_addr(&self, addr: &SocketAddr, timeout_ms: i32) -> io::Result<()>;
    fn resolve_route(&self, timeout_ms: i32) -> io::Result<()>;
    fn connect(&self, param: &ConnParam) -> io::Result<()>;
    fn accept(&self, param: &ConnParam) -> io::Result<()>;
    fn disconnect(&self) -> io::Result<()>;
}

/// The id carried by events of `S`.
pub type RequestId<S> = <<S as EventSource>::Event as ObservedEvent>::Id;

/// Wait for the next event and check that it is `expected` with a zero status.
///
/// The event is acknowledged before this returns, on success and on failure alike. For a
/// `ConnectRequest` the id of the requesting connection is returned.
pub fn await_event<S: EventSource + ?Sized>(
    source: &S,
    expected: EventKind,
    deadline: Option<Instant>,
) -> Result<Option<RequestId<S>>> {
    let mut event = source
        .next_event(deadline)
        .map_err(Error::verbs("rdma_get_cm_event"))?
        .ok_or(Error::Timeout("connection event"))?;

    let kind = event.kind();
    let status = event.status();
    tracing::debug!("cm event {}, status {}", kind, status);

    if status != 0 {
        tracing::error!("cm event {} has non-zero status: {}", kind, status);
        return Err(StateError::EventStatus { kind, status }.into());
    }
    if kind != expected {
        tracing::error!("unexpected cm event {}, expected {}", kind, expected);
        return Err(StateError::UnexpectedEvent {
            expected,
            actual: kind,
        }
        .into());
    }

    if kind == EventKind::ConnectRequest {
        let id = event.take_request().ok_or(StateError::MissingRequestId)?;
        Ok(Some(id))
    } else {
        Ok(None)
    }
}

impl ObservedEvent for CmEvent {
    type Id = CmId;

    fn status(&self) -> i32 {
        CmEvent::status(self)
    }

    fn kind(&self) -> EventKind {
        self.event().into()
    }

    fn take_request(&mut self) -> Option<CmId> {
        CmEvent::take_request(self)
    }
}

impl EventSource for EventChannel {
    type Event = CmEvent;

    fn next_event(&self, deadline: Option<Instant>) -> io::Result<Option<CmEvent>> {
        self.get_cm_event(deadline)
    }
}

impl ConnectionId for CmId {
    fn bind_addr(&self, addr: &SocketAddr) -> io::Result<()> {
        CmId::bind_addr(self, addr)
    }

    fn listen(&self, backlog: i32) -> io::Result<()> {
        CmId::listen(self, backlog)
    }

    fn resolve_addr(&self, addr: &SocketAddr, timeout_ms: i32) -> io::Result<()> {
        CmId::resolve_addr(self, addr, timeout_ms)
    }

    fn resolve_route(&self, timeout_ms: i32) -> io::Result<()> {
        CmId::resolve_route(self, timeout_ms)
    }

    fn connect(&self, param: &ConnParam) -> io::Result<()> {
        CmId::connect(self, param)
    }

    fn accept(&self, param: &ConnParam) -> io::Result<()> {
        CmId::accept(self, param)
    }

    fn disconnect(&self) -> io::Result<()> {
        CmId::disconnect(self)
    }
}
