//! Advertising buffers: each side sends the other one [`BufferDescriptor`] over SEND/RECV.
//!
//! Every function here that posts work is `unsafe` under the contract of [`PostWork`]: the
//! regions it is given must stay registered and in place until their requests complete or the
//! queue pair is destroyed. That holds even when the function returns an error, since a request
//! may still be in flight.
use std::time::Instant;

use rdma::ibv::{WcOpcode, WorkCompletion};

use crate::descriptor::{AccessToken, BufferDescriptor, DESCRIPTOR_LEN};
use crate::error::{Error, Result};
use crate::memory::LocalRegion;
use crate::poller::{wait_for, Await, CompletionSource};
use crate::work::{wr_id, PostWork};

/// Describe `region` so that the peer can access all of it.
pub fn describe<R: LocalRegion + ?Sized>(region: &R) -> Result<BufferDescriptor> {
    let length = u32::try_from(region.len()).map_err(|_| Error::CapacityExceeded {
        requested: region.len(),
        available: u32::MAX as usize,
    })?;
    Ok(BufferDescriptor::new(
        region.addr(),
        length,
        AccessToken::new(region.lkey()),
    ))
}

/// Post the receive that the peer's descriptor will land in. Must happen before connect or
/// accept.
///
/// # Safety
///
/// `meta_recv` is written by the device once the peer sends; see [`PostWork`].
pub unsafe fn pre_post_descriptor_recv<Q, R>(qp: &Q, meta_recv: &R) -> Result<()>
where
    Q: PostWork + ?Sized,
    R: LocalRegion + ?Sized,
{
    if meta_recv.len() < DESCRIPTOR_LEN {
        return Err(Error::MalformedDescriptor(format!(
            "receive region of {} bytes is too small",
            meta_recv.len()
        )));
    }
    qp.post_recv(wr_id::DESCRIPTOR_RECV, meta_recv.sge(DESCRIPTOR_LEN))
        .map_err(Error::verbs("ibv_post_recv"))?;
    tracing::debug!("pre-posted receive for the peer descriptor");
    Ok(())
}

unsafe fn post_descriptor<Q, R>(
    qp: &Q,
    desc: &BufferDescriptor,
    meta_send: &mut R,
) -> Result<()>
where
    Q: PostWork + ?Sized,
    R: LocalRegion + ?Sized,
{
    desc.encode_into(meta_send.bytes_mut())?;
    qp.post_send(wr_id::DESCRIPTOR_SEND, meta_send.sge(DESCRIPTOR_LEN))
        .map_err(Error::verbs("ibv_post_send"))
}

/// Decode the peer descriptor once its receive has completed.
fn take_peer_descriptor<R>(wcs: &[WorkCompletion], meta_recv: &R) -> Result<BufferDescriptor>
where
    R: LocalRegion + ?Sized,
{
    let recv = wcs
        .iter()
        .find(|wc| wc.wr_id == wr_id::DESCRIPTOR_RECV)
        .ok_or_else(|| Error::MalformedDescriptor("no receive completion".to_owned()))?;
    if recv.opcode != WcOpcode::Recv || recv.byte_len as usize != DESCRIPTOR_LEN {
        return Err(Error::MalformedDescriptor(format!(
            "received {} bytes ({:?}), expected {}",
            recv.byte_len, recv.opcode, DESCRIPTOR_LEN
        )));
    }
    let desc = BufferDescriptor::decode(meta_recv.bytes())?;
    let length = desc.length;
    if length == 0 {
        return Err(Error::MalformedDescriptor(
            "peer advertised an empty buffer".to_owned(),
        ));
    }
    Ok(desc)
}

/// Client side: advertise `payload`, then wait both for that send and for the server's reply.
///
/// Returns the server's descriptor.
///
/// # Safety
///
/// `meta_send` and `meta_recv` are handed to the device; see [`PostWork`].
pub unsafe fn exchange_with_server<Q, C, P, S, R>(
    qp: &Q,
    cq: &C,
    payload: &P,
    meta_send: &mut S,
    meta_recv: &R,
    deadline: Option<Instant>,
) -> Result<BufferDescriptor>
where
    Q: PostWork + ?Sized,
    C: CompletionSource + ?Sized,
    P: LocalRegion + ?Sized,
    S: LocalRegion + ?Sized,
    R: LocalRegion + ?Sized,
{
    let ours = describe(payload)?;
    post_descriptor(qp, &ours, meta_send)?;
    let wcs = wait_for(cq, Await::SendAndPeerDescriptor, deadline)?;
    let theirs = take_peer_descriptor(&wcs, meta_recv)?;
    tracing::info!(
        "The server has sent us its buffer location and credentials, showing its buffer attributes\n{}",
        theirs
    );
    Ok(theirs)
}

/// Server side: wait for the client's descriptor.
pub fn receive_client_descriptor<C, R>(
    cq: &C,
    meta_recv: &R,
    deadline: Option<Instant>,
) -> Result<BufferDescriptor>
where
    C: CompletionSource + ?Sized,
    R: LocalRegion + ?Sized,
{
    let wcs = wait_for(cq, Await::PeerDescriptor, deadline)?;
    let desc = take_peer_descriptor(&wcs, meta_recv)?;
    tracing::info!("Client side buffer information is received...\n{}", desc);
    let length = desc.length;
    tracing::info!("The client has requested buffer length of : {} bytes", length);
    Ok(desc)
}

/// Server side: send the descriptor of `region` to the client. The send is not waited for.
///
/// # Safety
///
/// `meta_send` is read by the device until the send completes; see [`PostWork`].
pub unsafe fn advertise_buffer<Q, R, S>(
    qp: &Q,
    region: &R,
    meta_send: &mut S,
) -> Result<BufferDescriptor>
where
    Q: PostWork + ?Sized,
    R: LocalRegion + ?Sized,
    S: LocalRegion + ?Sized,
{
    let desc = describe(region)?;
    post_descriptor(qp, &desc, meta_send)?;
    tracing::info!("Local buffer metadata has been sent to the client");
    Ok(desc)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::io;

    use super::*;
    use crate::poller::tests::{ok_wc, ScriptedCq};
    use crate::work::{RemoteTarget, Sge};

    /// A heap buffer standing in for a registered region.
    pub(crate) struct HeapRegion {
        pub buf: Vec<u8>,
        pub lkey: u32,
    }

    impl HeapRegion {
        pub(crate) fn new(buf: Vec<u8>, lkey: u32) -> Self {
            HeapRegion { buf, lkey }
        }
    }

    impl LocalRegion for HeapRegion {
        fn addr(&self) -> u64 {
            self.buf.as_ptr() as u64
        }

        fn len(&self) -> usize {
            self.buf.len()
        }

        fn lkey(&self) -> u32 {
            self.lkey
        }

        fn bytes(&self) -> &[u8] {
            &self.buf
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.buf
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Posted {
        Recv(u64, Sge),
        Send(u64, Sge),
        Write(u64, Sge, RemoteTarget),
        Read(u64, Sge, RemoteTarget),
    }

    #[derive(Default)]
    pub(crate) struct RecordingQp {
        pub posted: RefCell<Vec<Posted>>,
    }

    impl PostWork for RecordingQp {
        unsafe fn post_recv(&self, wr_id: u64, sge: Sge) -> io::Result<()> {
            self.posted.borrow_mut().push(Posted::Recv(wr_id, sge));
            Ok(())
        }

        unsafe fn post_send(&self, wr_id: u64, sge: Sge) -> io::Result<()> {
            self.posted.borrow_mut().push(Posted::Send(wr_id, sge));
            Ok(())
        }

        unsafe fn post_write(
            &self,
            wr_id: u64,
            sge: Sge,
            remote: RemoteTarget,
        ) -> io::Result<()> {
            self.posted
                .borrow_mut()
                .push(Posted::Write(wr_id, sge, remote));
            Ok(())
        }

        unsafe fn post_read(
            &self,
            wr_id: u64,
            sge: Sge,
            remote: RemoteTarget,
        ) -> io::Result<()> {
            self.posted
                .borrow_mut()
                .push(Posted::Read(wr_id, sge, remote));
            Ok(())
        }
    }

    fn recv_wc() -> WorkCompletion {
        ok_wc(wr_id::DESCRIPTOR_RECV, WcOpcode::Recv)
    }

    fn send_wc() -> WorkCompletion {
        ok_wc(wr_id::DESCRIPTOR_SEND, WcOpcode::Send)
    }

    #[test]
    fn pre_post_covers_one_descriptor() -> Result<()> {
        let qp = RecordingQp::default();
        let meta = HeapRegion::new(vec![0; 64], 9);
        unsafe { pre_post_descriptor_recv(&qp, &meta) }?;
        assert_eq!(
            qp.posted.borrow()[0],
            Posted::Recv(wr_id::DESCRIPTOR_RECV, meta.sge(16))
        );
        let small = HeapRegion::new(vec![0; 8], 9);
        assert!(unsafe { pre_post_descriptor_recv(&qp, &small) }.is_err());
        Ok(())
    }

    #[test]
    fn client_exchange_sends_own_and_decodes_peer() -> Result<()> {
        let qp = RecordingQp::default();
        let cq = ScriptedCq::new(vec![vec![send_wc(), recv_wc()]]);
        let payload = HeapRegion::new(b"hello".to_vec(), 0x11);
        let mut meta_send = HeapRegion::new(vec![0; 16], 0x22);
        let server = BufferDescriptor::new(0xdead_0000, 5, AccessToken::new(0x33));
        let meta_recv = HeapRegion::new(server.encode().to_vec(), 0x44);

        let remote = unsafe {
            exchange_with_server(&qp, &cq, &payload, &mut meta_send, &meta_recv, None)
        }?;
        assert_eq!(remote, server);

        let sent = BufferDescriptor::decode(&meta_send.buf)?;
        assert_eq!(sent, BufferDescriptor::new(payload.addr(), 5, AccessToken::new(0x11)));
        assert_eq!(
            qp.posted.borrow().as_slice(),
            [Posted::Send(wr_id::DESCRIPTOR_SEND, meta_send.sge(16))]
        );
        assert_eq!(cq.acks.get(), 1);
        Ok(())
    }

    #[test]
    fn empty_peer_buffer_is_rejected() {
        let cq = ScriptedCq::new(vec![vec![recv_wc()]]);
        let meta_recv = HeapRegion::new(BufferDescriptor::default().encode().to_vec(), 1);
        assert!(matches!(
            receive_client_descriptor(&cq, &meta_recv, None),
            Err(Error::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn short_receive_is_rejected() {
        let mut short = recv_wc();
        short.byte_len = 12;
        let cq = ScriptedCq::new(vec![vec![short]]);
        let desc = BufferDescriptor::new(1, 1, AccessToken::new(1));
        let meta_recv = HeapRegion::new(desc.encode().to_vec(), 1);
        assert!(matches!(
            receive_client_descriptor(&cq, &meta_recv, None),
            Err(Error::MalformedDescriptor(_))
        ));
    }

    #[test]
    fn server_advertises_whole_region() -> Result<()> {
        let qp = RecordingQp::default();
        let region = HeapRegion::new(vec![0; 10], 0x77);
        let mut meta_send = HeapRegion::new(vec![0; 16], 0x88);
        let desc = unsafe { advertise_buffer(&qp, &region, &mut meta_send) }?;
        let (token, length) = (desc.token, desc.length);
        assert_eq!(token, AccessToken::new(0x77));
        assert_eq!(length, 10);
        assert_eq!(BufferDescriptor::decode(&meta_send.buf)?, desc);
        Ok(())
    }
}
