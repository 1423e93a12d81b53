//! Per-connection verbs resources and their ordered release.
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::AsRawFd;

use rdma::ibv::{
    CompChannel, CompletionQueue, Context, ProtectionDomain, QpCapability, QpInitAttr, QueuePair,
};
use rdma::mr::MemoryRegion;
use rdma::rdmacm::{CmId, EventChannel};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::memory::{self, AllocatedRegion};
use crate::poller::Completions;

/// Failures collected while tearing resources down. Teardown never stops at the first one.
#[derive(Debug, Default)]
pub struct TeardownReport {
    failures: Vec<(&'static str, io::Error)>,
}

impl TeardownReport {
    pub fn record(&mut self, step: &'static str, result: io::Result<()>) {
        match result {
            Ok(()) => tracing::debug!("{} done", step),
            Err(e) => {
                tracing::warn!("{} failed: {}", step, e);
                self.failures.push((step, e));
            }
        }
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[(&'static str, io::Error)] {
        &self.failures
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return f.write_str("clean");
        }
        for (i, (step, e)) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", step, e)?;
        }
        Ok(())
    }
}

/// The verbs and librdmacm calls a connection's resources are made and released with.
///
/// [`RdmaVerbs`] is the real implementation. Every release consumes its handle, so a handle can
/// only be released once.
pub trait Verbs<'buf> {
    type Id;
    type Pd;
    type CompChannel;
    type Cq;
    type Qp;
    /// A registration of a caller-owned buffer.
    type Region;
    /// A registration that owns its buffer.
    type Allocated;
    type EventChannel;

    fn alloc_pd(id: &Self::Id) -> io::Result<Self::Pd>;
    fn create_comp_channel(id: &Self::Id) -> io::Result<Self::CompChannel>;
    fn create_cq(id: &Self::Id, capacity: i32, channel: &Self::CompChannel)
        -> io::Result<Self::Cq>;
    fn arm(cq: &Self::Cq) -> io::Result<()>;
    fn create_qp(
        id: &Self::Id,
        pd: &Self::Pd,
        cq: &Self::Cq,
        cap: QpCapability,
    ) -> io::Result<Self::Qp>;

    fn destroy_qp(id: &Self::Id, qp: Self::Qp);
    fn destroy_id(id: Self::Id) -> io::Result<()>;
    fn destroy_cq(cq: Self::Cq) -> io::Result<()>;
    fn destroy_comp_channel(channel: Self::CompChannel) -> io::Result<()>;
    fn deregister(region: Self::Region) -> io::Result<()>;
    fn free(region: Self::Allocated) -> io::Result<()>;
    fn dealloc_pd(pd: Self::Pd) -> io::Result<()>;
    fn destroy_event_channel(channel: Self::EventChannel);
}

/// libibverbs and librdmacm.
#[derive(Debug, Clone, Copy)]
pub enum RdmaVerbs {}

fn device(id: &CmId) -> io::Result<Context> {
    id.verbs().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotConnected,
            "cm id is not bound to a device",
        )
    })
}

impl<'buf> Verbs<'buf> for RdmaVerbs {
    type Id = CmId;
    type Pd = ProtectionDomain;
    type CompChannel = CompChannel;
    type Cq = CompletionQueue;
    type Qp = QueuePair;
    type Region = MemoryRegion<'buf>;
    type Allocated = AllocatedRegion;
    type EventChannel = EventChannel;

    fn alloc_pd(id: &CmId) -> io::Result<ProtectionDomain> {
        device(id)?.alloc_pd()
    }

    fn create_comp_channel(id: &CmId) -> io::Result<CompChannel> {
        let channel = device(id)?.create_comp_channel()?;
        tracing::trace!("completion channel fd {}", channel.as_raw_fd());
        Ok(channel)
    }

    fn create_cq(
        id: &CmId,
        capacity: i32,
        channel: &CompChannel,
    ) -> io::Result<CompletionQueue> {
        device(id)?.create_cq(capacity, Some(channel))
    }

    fn arm(cq: &CompletionQueue) -> io::Result<()> {
        cq.req_notify(false)
    }

    fn create_qp(
        id: &CmId,
        pd: &ProtectionDomain,
        cq: &CompletionQueue,
        cap: QpCapability,
    ) -> io::Result<QueuePair> {
        id.create_qp(
            pd,
            &QpInitAttr {
                send_cq: cq,
                recv_cq: cq,
                cap,
                sq_sig_all: false,
            },
        )
    }

    fn destroy_qp(id: &CmId, qp: QueuePair) {
        id.destroy_qp(qp)
    }

    fn destroy_id(id: CmId) -> io::Result<()> {
        id.destroy()
    }

    fn destroy_cq(cq: CompletionQueue) -> io::Result<()> {
        cq.destroy()
    }

    fn destroy_comp_channel(channel: CompChannel) -> io::Result<()> {
        channel.destroy()
    }

    fn deregister(region: MemoryRegion<'buf>) -> io::Result<()> {
        memory::deregister(Some(region))
    }

    fn free(region: AllocatedRegion) -> io::Result<()> {
        memory::free(Some(region))
    }

    fn dealloc_pd(pd: ProtectionDomain) -> io::Result<()> {
        pd.dealloc()
    }

    fn destroy_event_channel(channel: EventChannel) {
        channel.destroy()
    }
}

/// Everything one connection owns: its CM id and queue pair, the completion queue and channel
/// feeding both work queues, the protection domain, and the memory regions handed to it with
/// [`ConnectionContext::hold`] and [`ConnectionContext::hold_allocated`].
///
/// [`ConnectionContext::teardown`] releases all of it in dependency order. Dropping the context
/// instead releases the same handles in field order, logging failures.
pub struct ConnectionContext<'buf, V: Verbs<'buf> = RdmaVerbs> {
    id: V::Id,
    qp: V::Qp,
    cq: V::Cq,
    channel: V::CompChannel,
    registered: Vec<V::Region>,
    allocated: Vec<V::Allocated>,
    pd: V::Pd,
    _buffers: PhantomData<&'buf mut [u8]>,
}

impl<'buf> fmt::Debug for ConnectionContext<'buf, RdmaVerbs> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("qp_num", &self.qp.qp_num())
            .field("cq_capacity", &self.cq.capacity())
            .field("registered", &self.registered.len())
            .field("allocated", &self.allocated.len())
            .finish()
    }
}

impl<'buf> ConnectionContext<'buf, RdmaVerbs> {
    /// Create the verbs resources of `id`, which must have its device bound (address resolved, or
    /// taken from a connect request).
    pub fn establish(id: CmId, config: &TransportConfig) -> Result<Self> {
        Self::establish_with(id, config)
    }

    #[inline]
    pub fn completions(&self) -> Completions<'_> {
        Completions {
            channel: &self.channel,
            cq: &self.cq,
        }
    }
}

impl<'buf, V: Verbs<'buf>> ConnectionContext<'buf, V> {
    /// Protection domain, completion channel, completion queue, then the queue pair on both
    /// directions of that one queue.
    ///
    /// The completion queue is armed for its first notification before the queue pair exists.
    pub fn establish_with(id: V::Id, config: &TransportConfig) -> Result<Self> {
        let pd = V::alloc_pd(&id).map_err(Error::resource("ibv_alloc_pd"))?;
        tracing::debug!("pd allocated");

        let channel =
            V::create_comp_channel(&id).map_err(Error::resource("ibv_create_comp_channel"))?;
        tracing::debug!("completion channel created");

        let cq = V::create_cq(&id, config.cq_capacity, &channel)
            .map_err(Error::resource("ibv_create_cq"))?;
        tracing::debug!("cq created with {} elements", config.cq_capacity);

        V::arm(&cq).map_err(Error::resource("ibv_req_notify_cq"))?;

        let qp = V::create_qp(&id, &pd, &cq, config.qp_capability())
            .map_err(Error::resource("rdma_create_qp"))?;
        tracing::debug!("qp created");

        Ok(ConnectionContext {
            id,
            qp,
            cq,
            channel,
            registered: Vec::new(),
            allocated: Vec::new(),
            pd,
            _buffers: PhantomData,
        })
    }

    #[inline]
    pub fn id(&self) -> &V::Id {
        &self.id
    }

    #[inline]
    pub fn pd(&self) -> &V::Pd {
        &self.pd
    }

    /// Keep a borrowed-buffer region until teardown.
    pub fn hold(&mut self, mr: V::Region) {
        self.registered.push(mr);
    }

    /// Keep an allocated region until teardown.
    pub fn hold_allocated(&mut self, region: V::Allocated) {
        self.allocated.push(region);
    }

    /// Release everything: queue pair, CM id, completion queue, completion channel, borrowed
    /// regions, allocated regions and their buffers, protection domain. Every step runs whatever
    /// happened before it.
    pub fn teardown(self) -> TeardownReport {
        let ConnectionContext {
            id,
            qp,
            cq,
            channel,
            registered,
            allocated,
            pd,
            ..
        } = self;
        let mut report = TeardownReport::default();

        V::destroy_qp(&id, qp);
        tracing::debug!("qp destroyed");
        report.record("rdma_destroy_id", V::destroy_id(id));
        report.record("ibv_destroy_cq", V::destroy_cq(cq));
        report.record("ibv_destroy_comp_channel", V::destroy_comp_channel(channel));
        for mr in registered {
            report.record("ibv_dereg_mr", V::deregister(mr));
        }
        for region in allocated {
            report.record("free", V::free(region));
        }
        report.record("ibv_dealloc_pd", V::dealloc_pd(pd));

        report
    }
}

/// Client tail: the connection's resources, then the event channel.
pub fn teardown_client<'buf, V: Verbs<'buf>>(
    ctx: ConnectionContext<'buf, V>,
    channel: V::EventChannel,
) -> TeardownReport {
    let report = ctx.teardown();
    V::destroy_event_channel(channel);
    tracing::debug!("event channel destroyed");
    report
}

/// Server tail: the accepted connection's resources, then the listening id, then the event
/// channel. The listening id is only ever destroyed here.
pub fn teardown_server<'buf, V: Verbs<'buf>>(
    ctx: Option<ConnectionContext<'buf, V>>,
    listen_id: V::Id,
    channel: V::EventChannel,
) -> TeardownReport {
    let mut report = match ctx {
        Some(ctx) => ctx.teardown(),
        None => TeardownReport::default(),
    };
    report.record("rdma_destroy_id (listen)", V::destroy_id(listen_id));
    V::destroy_event_channel(channel);
    tracing::debug!("event channel destroyed");
    report
}
