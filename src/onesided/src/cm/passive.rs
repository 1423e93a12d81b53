use std::fmt;
use std::net::SocketAddr;

use crate::config::{ConnectionConfig, TimeoutConfig};
use crate::error::{Error, Result, StateError};

use super::{await_event, ConnectionId, EventKind, EventSource, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveState {
    Idle,
    Listening,
    ConnectRequested,
    Accepting,
    Established,
    Disconnected,
}

impl PassiveState {
    pub fn name(self) -> &'static str {
        match self {
            PassiveState::Idle => "Idle",
            PassiveState::Listening => "Listening",
            PassiveState::ConnectRequested => "ConnectRequested",
            PassiveState::Accepting => "Accepting",
            PassiveState::Established => "Established",
            PassiveState::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for PassiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Drives the server side: bind and listen on one id, then accept a single connection request
/// and wait for it to end.
pub struct PassiveListener<'a, S: ?Sized, I: ?Sized> {
    source: &'a S,
    listen_id: &'a I,
    conn: ConnectionConfig,
    timeouts: TimeoutConfig,
    state: PassiveState,
}

impl<'a, S, I> PassiveListener<'a, S, I>
where
    S: EventSource + ?Sized,
    I: ConnectionId + ?Sized,
    RequestId<S>: ConnectionId,
{
    pub fn new(
        source: &'a S,
        listen_id: &'a I,
        conn: ConnectionConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        PassiveListener {
            source,
            listen_id,
            conn,
            timeouts,
            state: PassiveState::Idle,
        }
    }

    #[inline]
    pub fn state(&self) -> PassiveState {
        self.state
    }

    fn expect(&self, op: &'static str, state: PassiveState) -> Result<()> {
        if self.state != state {
            return Err(StateError::InvalidTransition {
                op,
                state: self.state.name(),
            }
            .into());
        }
        Ok(())
    }

    fn enter(&mut self, state: PassiveState) {
        tracing::debug!("server cm: {} -> {}", self.state, state);
        self.state = state;
    }

    pub fn listen(&mut self, addr: &SocketAddr) -> Result<()> {
        self.expect("listen", PassiveState::Idle)?;
        self.listen_id
            .bind_addr(addr)
            .map_err(Error::verbs("rdma_bind_addr"))?;
        self.listen_id
            .listen(self.conn.listen_backlog)
            .map_err(Error::verbs("rdma_listen"))?;
        self.enter(PassiveState::Listening);
        Ok(())
    }

    /// Block until a client asks to connect, returning the id of the new connection. The caller
    /// owns that id from here on.
    pub fn await_request(&mut self) -> Result<RequestId<S>> {
        self.expect("await_request", PassiveState::Listening)?;
        // a listener waits for its first client without bound
        let id = await_event(self.source, EventKind::ConnectRequest, None)?
            .ok_or(StateError::MissingRequestId)?;
        self.enter(PassiveState::ConnectRequested);
        Ok(id)
    }

    /// Accept the requested connection. Resources must already exist for `id` and its receive
    /// must be pre-posted.
    pub fn accept(&mut self, id: &RequestId<S>) -> Result<()> {
        self.expect("accept", PassiveState::ConnectRequested)?;
        id.accept(&self.conn.conn_param())
            .map_err(Error::verbs("rdma_accept"))?;
        self.enter(PassiveState::Accepting);
        await_event(self.source, EventKind::Established, self.timeouts.cm_event())?;
        self.enter(PassiveState::Established);
        Ok(())
    }

    /// Wait for the client to disconnect.
    pub fn await_disconnect(&mut self) -> Result<()> {
        self.expect("await_disconnect", PassiveState::Established)?;
        await_event(self.source, EventKind::Disconnected, self.timeouts.disconnect())?;
        self.enter(PassiveState::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::tests::{FakeChannel, FakeId};

    #[test]
    fn full_server_sequence() -> Result<()> {
        let channel = FakeChannel::with(&[
            EventKind::ConnectRequest,
            EventKind::Established,
            EventKind::Disconnected,
        ]);
        let listen_id = FakeId::new(0);
        let mut listener =
            PassiveListener::new(&channel, &listen_id, Default::default(), Default::default());
        listener.listen(&"0.0.0.0:20886".parse().unwrap())?;
        let id = listener.await_request()?;
        assert_eq!(id.handle, 42);
        listener.accept(&id)?;
        listener.await_disconnect()?;
        assert_eq!(listener.state(), PassiveState::Disconnected);
        assert_eq!(listen_id.calls(), ["bind_addr", "listen"]);
        assert_eq!(id.calls(), ["accept"]);
        assert_eq!(channel.acks(), 3);
        Ok(())
    }

    #[test]
    fn accept_requires_a_request() {
        let channel = FakeChannel::default();
        let listen_id = FakeId::new(0);
        let mut listener =
            PassiveListener::new(&channel, &listen_id, Default::default(), Default::default());
        let stray = FakeId::new(7);
        assert!(matches!(
            listener.accept(&stray),
            Err(Error::ProtocolState(StateError::InvalidTransition { op: "accept", .. }))
        ));
        assert!(stray.calls().is_empty());
    }

    #[test]
    fn unexpected_event_while_listening() -> Result<()> {
        let channel = FakeChannel::with(&[EventKind::Disconnected]);
        let listen_id = FakeId::new(0);
        let mut listener =
            PassiveListener::new(&channel, &listen_id, Default::default(), Default::default());
        listener.listen(&"0.0.0.0:20886".parse().unwrap())?;
        assert!(listener.await_request().is_err());
        assert_eq!(listener.state(), PassiveState::Listening);
        assert_eq!(channel.acks(), 1);
        Ok(())
    }
}
