use std::fmt;
use std::net::SocketAddr;

use crate::config::{ConnectionConfig, TimeoutConfig};
use crate::error::{Error, Result, StateError};

use super::{await_event, ConnectionId, EventKind, EventSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Idle,
    AddrResolving,
    AddrResolved,
    RouteResolving,
    RouteResolved,
    Connecting,
    Established,
    Disconnected,
}

impl ActiveState {
    pub fn name(self) -> &'static str {
        match self {
            ActiveState::Idle => "Idle",
            ActiveState::AddrResolving => "AddrResolving",
            ActiveState::AddrResolved => "AddrResolved",
            ActiveState::RouteResolving => "RouteResolving",
            ActiveState::RouteResolved => "RouteResolved",
            ActiveState::Connecting => "Connecting",
            ActiveState::Established => "Established",
            ActiveState::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Drives the client side of a connection through address and route resolution, connect and
/// disconnect.
///
/// The connection id is passed to each step rather than held, since it moves into the
/// connection's resources between route resolution and connect.
pub struct ActiveConnector<'a, S: ?Sized> {
    source: &'a S,
    conn: ConnectionConfig,
    timeouts: TimeoutConfig,
    state: ActiveState,
}

impl<'a, S> ActiveConnector<'a, S>
where
    S: EventSource + ?Sized,
{
    pub fn new(source: &'a S, conn: ConnectionConfig, timeouts: TimeoutConfig) -> Self {
        ActiveConnector {
            source,
            conn,
            timeouts,
            state: ActiveState::Idle,
        }
    }

    #[inline]
    pub fn state(&self) -> ActiveState {
        self.state
    }

    fn expect(&self, op: &'static str, state: ActiveState) -> Result<()> {
        if self.state != state {
            return Err(StateError::InvalidTransition {
                op,
                state: self.state.name(),
            }
            .into());
        }
        Ok(())
    }

    fn enter(&mut self, state: ActiveState) {
        tracing::debug!("client cm: {} -> {}", self.state, state);
        self.state = state;
    }

    pub fn resolve_addr<I>(&mut self, id: &I, addr: &SocketAddr) -> Result<()>
    where
        I: ConnectionId + ?Sized,
    {
        self.expect("resolve_addr", ActiveState::Idle)?;
        id.resolve_addr(addr, self.conn.resolve_timeout_ms)
            .map_err(Error::verbs("rdma_resolve_addr"))?;
        self.enter(ActiveState::AddrResolving);
        await_event(self.source, EventKind::AddrResolved, self.timeouts.cm_event())?;
        self.enter(ActiveState::AddrResolved);
        Ok(())
    }

    pub fn resolve_route<I>(&mut self, id: &I) -> Result<()>
    where
        I: ConnectionId + ?Sized,
    {
        self.expect("resolve_route", ActiveState::AddrResolved)?;
        id.resolve_route(self.conn.resolve_timeout_ms)
            .map_err(Error::verbs("rdma_resolve_route"))?;
        self.enter(ActiveState::RouteResolving);
        await_event(self.source, EventKind::RouteResolved, self.timeouts.cm_event())?;
        self.enter(ActiveState::RouteResolved);
        Ok(())
    }

    /// Connect with the configured depths and retry count. The caller must have created the
    /// queue pair and pre-posted its receive.
    pub fn connect<I>(&mut self, id: &I) -> Result<()>
    where
        I: ConnectionId + ?Sized,
    {
        self.expect("connect", ActiveState::RouteResolved)?;
        id.connect(&self.conn.conn_param()).map_err(Error::verbs("rdma_connect"))?;
        self.enter(ActiveState::Connecting);
        await_event(self.source, EventKind::Established, self.timeouts.cm_event())?;
        self.enter(ActiveState::Established);
        Ok(())
    }

    pub fn disconnect<I>(&mut self, id: &I) -> Result<()>
    where
        I: ConnectionId + ?Sized,
    {
        self.expect("disconnect", ActiveState::Established)?;
        id.disconnect().map_err(Error::verbs("rdma_disconnect"))?;
        await_event(self.source, EventKind::Disconnected, self.timeouts.disconnect())?;
        self.enter(ActiveState::Disconnected);
        Ok(())
    }
}
