use std::ffi::CStr;
use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Instant;

use socket2::SockAddr;

use crate::ffi;
use crate::ibv;

pub use ffi::rdma_cm_event_type::Type as CmEventType;

/// Name of an event type as librdmacm prints it.
pub fn event_str(event: CmEventType) -> String {
    let msg = unsafe { ffi::rdma_event_str(event) };
    if msg.is_null() {
        format!("RDMA_CM_EVENT_{}", event)
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

#[repr(transparent)]
#[derive(Debug)]
pub struct CmEvent(*mut ffi::rdma_cm_event);

unsafe impl Send for CmEvent {}
unsafe impl Sync for CmEvent {}

/// All events which are allocated by rdma_get_cm_event must be released, there
/// should be a one-to-one correspondence  between  successful  gets  and  acks.
/// This call frees the event structure and any memory that it references.
impl Drop for CmEvent {
    fn drop(&mut self) {
        // ignore the error
        let rc = unsafe { ffi::rdma_ack_cm_event(self.0) };
        if rc != 0 {
            log::debug!(
                "An error occurred on ack_cm_event: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", event_str(self.event()))
    }
}

impl CmEvent {
    #[inline]
    pub fn status(&self) -> i32 {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.status
    }

    #[inline]
    pub fn event(&self) -> CmEventType {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.event
    }

    /// Take the id of the connection being requested. Only a CONNECT_REQUEST carries one; the
    /// returned id is owned by the caller and outlives this event.
    pub fn take_request(&mut self) -> Option<CmId> {
        assert!(!self.0.is_null());
        let event = unsafe { &mut *self.0 };
        if event.event != ffi::rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST
            || event.status != 0
            || event.id.is_null()
        {
            return None;
        }
        // hand the id out once
        let id = mem::replace(&mut event.id, ptr::null_mut());
        Some(CmId(id))
    }
}

#[repr(transparent)]
#[derive(Debug)]
pub struct EventChannel(*mut ffi::rdma_event_channel);

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl AsRawFd for EventChannel {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.fd
    }
}

impl EventChannel {
    pub fn create_event_channel() -> io::Result<Self> {
        let channel = unsafe { ffi::rdma_create_event_channel() };
        if channel.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(EventChannel(channel))
        }
    }

    /// Block for the next event. Returns `Ok(None)` if `deadline` passes first.
    pub fn get_cm_event(&self, deadline: Option<Instant>) -> io::Result<Option<CmEvent>> {
        if !crate::wait_readable(self.as_raw_fd(), deadline)? {
            return Ok(None);
        }
        let mut event = ptr::null_mut();
        let rc = unsafe { ffi::rdma_get_cm_event(self.0, &mut event) };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Some(CmEvent(event)))
        }
    }

    /// Every id created on this channel must already be destroyed.
    pub fn destroy(self) {
        let channel = self.0;
        mem::forget(self);
        unsafe { ffi::rdma_destroy_event_channel(channel) };
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { ffi::rdma_destroy_event_channel(self.0) };
    }
}

#[derive(Debug)]
pub struct CmId(*mut ffi::rdma_cm_id);

unsafe impl Send for CmId {}
unsafe impl Sync for CmId {}

impl Drop for CmId {
    fn drop(&mut self) {
        log::debug!("dropping CmId in rdmacm");
        // a queue pair still attached would outlive the id
        if !unsafe { &*self.0 }.qp.is_null() {
            unsafe { ffi::rdma_destroy_qp(self.0) };
        }
        let rc = unsafe { ffi::rdma_destroy_id(self.0) };
        if rc != 0 {
            log::debug!(
                "error occured when destroying cm_id: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Convert a `SocketAddr` into storage librdmacm can read.
fn to_sockaddr(addr: &SocketAddr) -> SockAddr {
    SockAddr::from(*addr)
}

/// # Safety
///
/// `addr` must be null or point to a valid `sockaddr` of the family it declares.
unsafe fn sockaddr_from_raw(addr: *const ffi::sockaddr) -> io::Result<SocketAddr> {
    if addr.is_null() {
        return Err(io::Error::new(io::ErrorKind::Other, "Supplied pointer is null."));
    }
    let family = (*addr).sa_family as i32;
    let socklen = match family {
        libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Found unknown address family: {}", family),
            ))
        }
    };
    let ((), sockaddr) = SockAddr::init(|storage, len| {
        *len = socklen as _;
        ptr::copy_nonoverlapping(addr as *const u8, storage as *mut u8, socklen);
        Ok(())
    })?;
    sockaddr.as_socket().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Found unknown address family: {}", sockaddr.family()),
        )
    })
}

impl CmId {
    /// # Safety
    ///
    /// The user must guarantee that the event_channel lives longer than the CmId.
    pub unsafe fn create_id(channel: &EventChannel) -> io::Result<CmId> {
        let mut cm_id: *mut ffi::rdma_cm_id = ptr::null_mut();
        let rc = ffi::rdma_create_id(
            channel.0,
            &mut cm_id,
            ptr::null_mut(),
            ffi::rdma_port_space::RDMA_PS_TCP,
        );
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        assert!(!cm_id.is_null());
        Ok(CmId(cm_id))
    }

    /// The device context, available once the address is resolved (active side) or the
    /// connection request has arrived (passive side).
    #[inline]
    pub fn verbs(&self) -> Option<ibv::Context> {
        assert!(!self.0.is_null());
        let ctx = unsafe { &*self.0 }.verbs;
        if ctx.is_null() {
            None
        } else {
            Some(ibv::Context { ctx })
        }
    }

    pub fn bind_addr(&self, sockaddr: &SocketAddr) -> io::Result<()> {
        let addr = to_sockaddr(sockaddr);
        let rc = unsafe { ffi::rdma_bind_addr(self.0, addr.as_ptr() as *mut ffi::sockaddr) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_listen(self.0, backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn resolve_addr(&self, sockaddr: &SocketAddr, timeout_ms: i32) -> io::Result<()> {
        let dst_addr = to_sockaddr(sockaddr);
        let rc = unsafe {
            ffi::rdma_resolve_addr(
                self.0,
                ptr::null_mut(),
                dst_addr.as_ptr() as *mut ffi::sockaddr,
                timeout_ms,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn resolve_route(&self, timeout_ms: i32) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_resolve_route(self.0, timeout_ms) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Create the queue pair of this id in `pd`.
    pub fn create_qp(
        &self,
        pd: &ibv::ProtectionDomain,
        qp_init_attr: &ibv::QpInitAttr,
    ) -> io::Result<ibv::QueuePair> {
        let mut attr = qp_init_attr.to_ibv_qp_init_attr();
        let rc = unsafe { ffi::rdma_create_qp(self.0, pd.pd, &mut attr) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ibv::QueuePair {
            qp: unsafe { &*self.0 }.qp,
        })
    }

    /// Destroy the queue pair created by [`CmId::create_qp`].
    pub fn destroy_qp(&self, qp: ibv::QueuePair) {
        debug_assert_eq!(qp.qp, unsafe { &*self.0 }.qp);
        unsafe { ffi::rdma_destroy_qp(self.0) };
    }

    pub fn connect(&self, conn_param: &ibv::ConnParam) -> io::Result<()> {
        let mut param = conn_param.to_rdma_conn_param();
        let rc = unsafe { ffi::rdma_connect(self.0, &mut param) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn accept(&self, conn_param: &ibv::ConnParam) -> io::Result<()> {
        let mut param = conn_param.to_rdma_conn_param();
        let rc = unsafe { ffi::rdma_accept(self.0, &mut param) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn disconnect(&self) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_disconnect(self.0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn destroy(self) -> io::Result<()> {
        let id = self.0;
        mem::forget(self);
        let rc = unsafe { ffi::rdma_destroy_id(id) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `addr..addr + length` must lie in a region registered with `lkey` and stay valid until a
    /// work completion for `wr_id` has been retrieved.
    #[inline]
    pub unsafe fn post_recv(&self, wr_id: u64, addr: u64, length: u32, lkey: u32) -> io::Result<()> {
        let errno = ffi::rdma_post_recv_sge(self.0, wr_id, addr, length, lkey);
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Same contract as [`CmId::post_recv`].
    #[inline]
    pub unsafe fn post_send(
        &self,
        wr_id: u64,
        addr: u64,
        length: u32,
        lkey: u32,
        flags: ibv::SendFlags,
    ) -> io::Result<()> {
        let errno = ffi::rdma_post_send_sge(self.0, wr_id, addr, length, lkey, flags.bits());
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Same contract as [`CmId::post_recv`]. The remote range is checked by the peer's HCA, not
    /// here.
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub unsafe fn post_write(
        &self,
        wr_id: u64,
        addr: u64,
        length: u32,
        lkey: u32,
        flags: ibv::SendFlags,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        self.post_one_sided(
            ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            wr_id,
            addr,
            length,
            lkey,
            flags,
            remote_addr,
            rkey,
        )
    }

    /// # Safety
    ///
    /// Same contract as [`CmId::post_write`].
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub unsafe fn post_read(
        &self,
        wr_id: u64,
        addr: u64,
        length: u32,
        lkey: u32,
        flags: ibv::SendFlags,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        self.post_one_sided(
            ffi::ibv_wr_opcode::IBV_WR_RDMA_READ,
            wr_id,
            addr,
            length,
            lkey,
            flags,
            remote_addr,
            rkey,
        )
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn post_one_sided(
        &self,
        opcode: ffi::ibv_wr_opcode::Type,
        wr_id: u64,
        addr: u64,
        length: u32,
        lkey: u32,
        flags: ibv::SendFlags,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        let errno = ffi::rdma_post_one_sided_sge(
            self.0,
            opcode,
            wr_id,
            addr,
            length,
            lkey,
            flags.bits(),
            remote_addr,
            rkey,
        );
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    pub fn get_local_addr(&self) -> io::Result<SocketAddr> {
        unsafe { sockaddr_from_raw(ffi::rdma_get_local_addr_real(self.0)) }
    }

    pub fn get_peer_addr(&self) -> io::Result<SocketAddr> {
        unsafe { sockaddr_from_raw(ffi::rdma_get_peer_addr_real(self.0)) }
    }
}
