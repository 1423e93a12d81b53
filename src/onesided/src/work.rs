//! Posting work requests.
use std::io;

use rdma::ibv::SendFlags;
use rdma::rdmacm::CmId;

use crate::descriptor::AccessToken;

/// Work request ids used on the connection's queue pair.
pub mod wr_id {
    pub const DESCRIPTOR_RECV: u64 = 1;
    pub const DESCRIPTOR_SEND: u64 = 2;
    pub const RDMA_WRITE: u64 = 3;
    pub const RDMA_READ: u64 = 4;
}

/// One scatter-gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// The peer memory a one-sided operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget {
    pub addr: u64,
    pub token: AccessToken,
}

/// The queue pair operations the protocol needs. All sends are posted signaled.
///
/// # Safety
///
/// Every method hands `sge` to the device. The memory it names must stay registered and must not
/// be freed or moved until the matching completion has been polled or the queue pair has been
/// destroyed.
pub trait PostWork {
    unsafe fn post_recv(&self, wr_id: u64, sge: Sge) -> io::Result<()>;
    unsafe fn post_send(&self, wr_id: u64, sge: Sge) -> io::Result<()>;
    unsafe fn post_write(&self, wr_id: u64, sge: Sge, remote: RemoteTarget) -> io::Result<()>;
    unsafe fn post_read(&self, wr_id: u64, sge: Sge, remote: RemoteTarget) -> io::Result<()>;
}

impl PostWork for CmId {
    unsafe fn post_recv(&self, wr_id: u64, sge: Sge) -> io::Result<()> {
        CmId::post_recv(self, wr_id, sge.addr, sge.length, sge.lkey)
    }

    unsafe fn post_send(&self, wr_id: u64, sge: Sge) -> io::Result<()> {
        CmId::post_send(
            self,
            wr_id,
            sge.addr,
            sge.length,
            sge.lkey,
            SendFlags::SIGNALED,
        )
    }

    unsafe fn post_write(&self, wr_id: u64, sge: Sge, remote: RemoteTarget) -> io::Result<()> {
        CmId::post_write(
            self,
            wr_id,
            sge.addr,
            sge.length,
            sge.lkey,
            SendFlags::SIGNALED,
            remote.addr,
            remote.token.get(),
        )
    }

    unsafe fn post_read(&self, wr_id: u64, sge: Sge, remote: RemoteTarget) -> io::Result<()> {
        CmId::post_read(
            self,
            wr_id,
            sge.addr,
            sge.length,
            sge.lkey,
            SendFlags::SIGNALED,
            remote.addr,
            remote.token.get(),
        )
    }
}
