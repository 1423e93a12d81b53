//! One-sided RDMA WRITE and READ against an advertised remote buffer.
use std::time::Instant;

use crate::descriptor::BufferDescriptor;
use crate::error::{Error, Result};
use crate::memory::LocalRegion;
use crate::poller::{wait_for, Await, CompletionSource};
use crate::work::{wr_id, PostWork, RemoteTarget};

/// Write all of `source` into the remote buffer, then read the same range back into `sink`.
///
/// Each operation is waited for before the next is posted.
///
/// # Safety
///
/// `source` and `sink` are handed to the device; see [`PostWork`]. A failed or timed-out wait
/// may leave a request in flight.
pub unsafe fn write_then_read<Q, C, S, K>(
    qp: &Q,
    cq: &C,
    source: &S,
    sink: &K,
    remote: &BufferDescriptor,
    deadline: Option<Instant>,
) -> Result<()>
where
    Q: PostWork + ?Sized,
    C: CompletionSource + ?Sized,
    S: LocalRegion + ?Sized,
    K: LocalRegion + ?Sized,
{
    let len = source.len();
    let (address, length, token) = (remote.address, remote.length, remote.token);
    if len > length as usize {
        return Err(Error::CapacityExceeded {
            requested: len,
            available: length as usize,
        });
    }
    if len > sink.len() {
        return Err(Error::CapacityExceeded {
            requested: len,
            available: sink.len(),
        });
    }
    let target = RemoteTarget {
        addr: address,
        token,
    };

    qp.post_write(wr_id::RDMA_WRITE, source.sge(len), target)
        .map_err(Error::verbs("ibv_post_send"))?;
    wait_for(cq, Await::OneSided, deadline)?;
    tracing::debug!("Client side WRITE is complete");

    qp.post_read(wr_id::RDMA_READ, sink.sge(len), target)
        .map_err(Error::verbs("ibv_post_send"))?;
    wait_for(cq, Await::OneSided, deadline)?;
    tracing::debug!("Client side READ is complete");
    Ok(())
}

/// Compare what was written with what was read back.
pub fn verify(source: &[u8], sink: &[u8]) -> Result<()> {
    let len = source.len().min(sink.len());
    if let Some(offset) = source.iter().zip(sink).position(|(a, b)| a != b) {
        return Err(Error::IntegrityMismatch { offset });
    }
    if source.len() != sink.len() {
        return Err(Error::IntegrityMismatch { offset: len });
    }
    Ok(())
}
