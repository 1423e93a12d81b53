//! Verbs objects: device context, protection domain, completion channel, completion queue and
//! the queue-pair handle owned by a CM id.
use std::ffi::CStr;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Instant;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::ffi;

bitflags! {
    /// Access permissions of a memory region. The remote bits only take effect when
    /// `LOCAL_WRITE` is also set for `REMOTE_WRITE`.
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b00000001;
        const REMOTE_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
    }

    /// Flags of the WR properties.
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Set the fence indicator. Valid only for QPs with Transport Service Type RC.
        const FENCE = 0b00000001;
        /// Set the completion notification indicator.
        const SIGNALED = 0b00000010;
        /// Set the solicited event indicator.
        const SOLICITED = 0b00000100;
        /// Send data in given gather list as inline data in a send WQE.
        const INLINE = 0b00001000;
    }
}

const_assert_eq!(
    AccessFlags::LOCAL_WRITE.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
);
const_assert_eq!(
    AccessFlags::REMOTE_WRITE.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
);
const_assert_eq!(
    AccessFlags::REMOTE_READ.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
);
const_assert_eq!(SendFlags::FENCE.bits(), ffi::ibv_send_flags::IBV_SEND_FENCE.0);
const_assert_eq!(SendFlags::SIGNALED.bits(), ffi::ibv_send_flags::IBV_SEND_SIGNALED.0);
const_assert_eq!(SendFlags::SOLICITED.bits(), ffi::ibv_send_flags::IBV_SEND_SOLICITED.0);
const_assert_eq!(SendFlags::INLINE.bits(), ffi::ibv_send_flags::IBV_SEND_INLINE.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WcStatus {
    #[default]
    Success,
    Error(u32),
}

impl WcStatus {
    #[inline]
    pub fn code(&self) -> u32 {
        match *self {
            WcStatus::Success => ffi::ibv_wc_status::IBV_WC_SUCCESS,
            WcStatus::Error(code) => code,
        }
    }
}

impl From<ffi::ibv_wc_status::Type> for WcStatus {
    fn from(status: ffi::ibv_wc_status::Type) -> Self {
        if status == ffi::ibv_wc_status::IBV_WC_SUCCESS {
            WcStatus::Success
        } else {
            WcStatus::Error(status)
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = unsafe { ffi::ibv_wc_status_str(self.code()) };
        if msg.is_null() {
            write!(f, "unknown status {}", self.code())
        } else {
            let msg = unsafe { CStr::from_ptr(msg) };
            write!(f, "{} ({})", msg.to_string_lossy(), self.code())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    #[default]
    Invalid,
}

impl From<ffi::ibv_wc_opcode::Type> for WcOpcode {
    fn from(opcode: ffi::ibv_wc_opcode::Type) -> Self {
        use ffi::ibv_wc_opcode::*;
        match opcode {
            IBV_WC_SEND => WcOpcode::Send,
            IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
            IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
            IBV_WC_RECV => WcOpcode::Recv,
            IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
            _ => WcOpcode::Invalid,
        }
    }
}

/// A structure represent completion of some work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    /// Only meaningful when `status` is `Success`.
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub qp_num: u32,
}

impl From<&ffi::ibv_wc> for WorkCompletion {
    fn from(wc: &ffi::ibv_wc) -> Self {
        WorkCompletion {
            wr_id: wc.wr_id,
            status: wc.status.into(),
            opcode: wc.opcode.into(),
            vendor_err: wc.vendor_err,
            byte_len: wc.byte_len,
            qp_num: wc.qp_num,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// Attributes of a reliable-connected queue pair.
#[derive(Debug)]
pub struct QpInitAttr<'a> {
    pub send_cq: &'a CompletionQueue,
    pub recv_cq: &'a CompletionQueue,
    pub cap: QpCapability,
    pub sq_sig_all: bool,
}

impl<'a> QpInitAttr<'a> {
    pub fn to_ibv_qp_init_attr(&self) -> ffi::ibv_qp_init_attr {
        let mut attr: ffi::ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.send_cq = self.send_cq.cq;
        attr.recv_cq = self.recv_cq.cq;
        attr.cap.max_send_wr = self.cap.max_send_wr;
        attr.cap.max_recv_wr = self.cap.max_recv_wr;
        attr.cap.max_send_sge = self.cap.max_send_sge;
        attr.cap.max_recv_sge = self.cap.max_recv_sge;
        attr.cap.max_inline_data = self.cap.max_inline_data;
        attr.qp_type = ffi::ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = self.sq_sig_all as _;
        attr
    }
}

/// Parameters carried by `rdma_connect` and `rdma_accept`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnParam {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

impl ConnParam {
    pub fn to_rdma_conn_param(&self) -> ffi::rdma_conn_param {
        let mut param: ffi::rdma_conn_param = unsafe { mem::zeroed() };
        param.responder_resources = self.responder_resources;
        param.initiator_depth = self.initiator_depth;
        param.retry_count = self.retry_count;
        param.rnr_retry_count = self.rnr_retry_count;
        param
    }
}

/// A device context borrowed from a CM id. librdmacm owns it, so it is never closed here.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub(crate) ctx: *mut ffi::ibv_context,
}

impl Context {
    pub fn alloc_pd(&self) -> io::Result<ProtectionDomain> {
        let pd = unsafe { ffi::ibv_alloc_pd(self.ctx) };
        if pd.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ProtectionDomain { pd })
        }
    }

    pub fn create_comp_channel(&self) -> io::Result<CompChannel> {
        let channel = unsafe { ffi::ibv_create_comp_channel(self.ctx) };
        if channel.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(CompChannel { channel })
        }
    }

    /// Create a completion queue with at least `min_cq_entries` entries, reporting to `channel`
    /// when one is given.
    pub fn create_cq(
        &self,
        min_cq_entries: i32,
        channel: Option<&CompChannel>,
    ) -> io::Result<CompletionQueue> {
        let cq = unsafe {
            ffi::ibv_create_cq(
                self.ctx,
                min_cq_entries,
                ptr::null_mut(),
                channel.map_or(ptr::null_mut(), |c| c.channel),
                0,
            )
        };
        if cq.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(CompletionQueue { cq })
        }
    }
}

#[derive(Debug)]
pub struct ProtectionDomain {
    pub(crate) pd: *mut ffi::ibv_pd,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl ProtectionDomain {
    /// Deallocate the domain. Every memory region and queue pair created in it must already be
    /// gone.
    pub fn dealloc(self) -> io::Result<()> {
        let pd = self.pd;
        mem::forget(self);
        let errno = unsafe { ffi::ibv_dealloc_pd(pd) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dealloc_pd(self.pd) };
        if errno != 0 {
            log::warn!(
                "error occured when deallocating pd: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
    }
}

/// Completion event channel. Each notification it delivers is one-shot: the CQ must be re-armed
/// with [`CompletionQueue::req_notify`] before the next one can arrive.
#[repr(transparent)]
#[derive(Debug)]
pub struct CompChannel {
    pub(crate) channel: *mut ffi::ibv_comp_channel,
}

unsafe impl Send for CompChannel {}
unsafe impl Sync for CompChannel {}

impl AsRawFd for CompChannel {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        assert!(!self.channel.is_null());
        unsafe { &*self.channel }.fd
    }
}

impl CompChannel {
    /// Wait for the next notification for `cq`.
    ///
    /// Returns `Ok(false)` if `deadline` passed first. The notification must later be
    /// acknowledged through [`CompletionQueue::ack_events`].
    pub fn get_cq_event(&self, cq: &CompletionQueue, deadline: Option<Instant>) -> io::Result<bool> {
        if !crate::wait_readable(self.as_raw_fd(), deadline)? {
            return Ok(false);
        }
        let mut ev_cq = ptr::null_mut();
        let mut ev_ctx = ptr::null_mut();
        let rc = unsafe { ffi::ibv_get_cq_event(self.channel, &mut ev_cq, &mut ev_ctx) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if ev_cq != cq.cq {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("notification for unknown cq {:p}", ev_cq),
            ));
        }
        Ok(true)
    }

    pub fn destroy(self) -> io::Result<()> {
        let channel = self.channel;
        mem::forget(self);
        let errno = unsafe { ffi::ibv_destroy_comp_channel(channel) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }
}

impl Drop for CompChannel {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_comp_channel(self.channel) };
        if errno != 0 {
            log::warn!(
                "error occured when destroying comp channel: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
    }
}

const POLL_BATCH: usize = 16;

#[derive(Debug)]
pub struct CompletionQueue {
    pub(crate) cq: *mut ffi::ibv_cq,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    /// The number of entries the provider actually allocated.
    #[inline]
    pub fn capacity(&self) -> i32 {
        assert!(!self.cq.is_null());
        unsafe { &*self.cq }.cqe
    }

    /// Arm the queue for one notification on its completion channel.
    pub fn req_notify(&self, solicited_only: bool) -> io::Result<()> {
        let errno = unsafe { ffi::ibv_req_notify_cq_real(self.cq, solicited_only as _) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    /// Move up to `out.len()` ready completions into `out`, returning how many were written.
    /// Zero means nothing was ready yet.
    pub fn poll(&self, out: &mut [WorkCompletion]) -> io::Result<usize> {
        let mut wc = [ffi::ibv_wc::default(); POLL_BATCH];
        let mut total = 0;
        while total < out.len() {
            let want = (out.len() - total).min(POLL_BATCH);
            let n = unsafe { ffi::ibv_poll_cq_real(self.cq, want as _, wc.as_mut_ptr()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            let n = n as usize;
            for (dst, src) in out[total..total + n].iter_mut().zip(&wc[..n]) {
                *dst = src.into();
            }
            total += n;
            if n < want {
                break;
            }
        }
        Ok(total)
    }

    pub fn ack_events(&self, nevents: u32) {
        unsafe { ffi::ibv_ack_cq_events(self.cq, nevents) };
    }

    pub fn destroy(self) -> io::Result<()> {
        let cq = self.cq;
        mem::forget(self);
        let errno = unsafe { ffi::ibv_destroy_cq(cq) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_cq(self.cq) };
        if errno != 0 {
            log::warn!(
                "error occured when destroying cq: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
    }
}

/// A queue pair created through `rdma_create_qp`. It is destroyed through its CM id
/// (`CmId::destroy_qp`), never on its own.
#[derive(Debug)]
pub struct QueuePair {
    pub(crate) qp: *mut ffi::ibv_qp,
}

unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl QueuePair {
    #[inline]
    pub fn qp_num(&self) -> u32 {
        assert!(!self.qp.is_null());
        unsafe { &*self.qp }.qp_num
    }
}
