//! Drives the descriptor exchange and the WRITE/READ round trip between two threads over an
//! in-process fabric that behaves like an RC queue pair with its completion queue.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr;
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rdma::ibv::{WcOpcode, WcStatus, WorkCompletion};

use onesided::descriptor::{AccessToken, BufferDescriptor, DESCRIPTOR_LEN};
use onesided::exchange::{
    advertise_buffer, exchange_with_server, pre_post_descriptor_recv, receive_client_descriptor,
};
use onesided::memory::LocalRegion;
use onesided::ops::{verify, write_then_read};
use onesided::poller::{wait_for, Await, CompletionSource};
use onesided::work::{PostWork, RemoteTarget, Sge};
use onesided::{Error, Result};

// values of enum ibv_wc_status
const REM_ACCESS_ERR: u32 = 10;
const LOC_PROT_ERR: u32 = 4;

#[derive(Default)]
struct Side {
    recvs: VecDeque<(u64, Sge)>,
    cq: VecDeque<WorkCompletion>,
    armed: bool,
    notifications: u32,
    acked: u32,
}

#[derive(Default)]
struct State {
    sides: [Side; 2],
    // key -> (addr, len)
    regions: HashMap<u32, (u64, usize)>,
    next_key: u32,
}

impl State {
    fn complete(&mut self, side: usize, wc: WorkCompletion) {
        let side = &mut self.sides[side];
        side.cq.push_back(wc);
        if side.armed {
            side.armed = false;
            side.notifications += 1;
        }
    }

    fn covers(&self, key: u32, addr: u64, len: usize) -> bool {
        match self.regions.get(&key) {
            Some(&(start, size)) => addr >= start && addr + len as u64 <= start + size as u64,
            None => false,
        }
    }
}

#[derive(Default)]
struct Fabric {
    state: Mutex<State>,
    cond: Condvar,
}

impl Fabric {
    fn alloc(&self, init: &[u8]) -> Buffer {
        let buf = init.to_vec().into_boxed_slice();
        let mut state = self.state.lock().unwrap();
        state.next_key += 1;
        let key = state.next_key * 0x100 + 7;
        state.regions.insert(key, (buf.as_ptr() as u64, buf.len()));
        Buffer { buf, key }
    }

    fn endpoint(self: &Arc<Self>, side: usize) -> Endpoint {
        // resources come up with the cq armed
        self.state.lock().unwrap().sides[side].armed = true;
        Endpoint {
            fabric: Arc::clone(self),
            side,
        }
    }
}

struct Buffer {
    buf: Box<[u8]>,
    key: u32,
}

impl LocalRegion for Buffer {
    fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn lkey(&self) -> u32 {
        self.key
    }

    fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

struct Endpoint {
    fabric: Arc<Fabric>,
    side: usize,
}

unsafe fn copy(src: u64, dst: u64, len: usize) {
    ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
}

impl Endpoint {
    fn peer(&self) -> usize {
        1 - self.side
    }

    fn one_sided(
        &self,
        wr_id: u64,
        sge: Sge,
        remote: RemoteTarget,
        opcode: WcOpcode,
    ) -> io::Result<()> {
        let mut state = self.fabric.state.lock().unwrap();
        let len = sge.length as usize;
        let status = if !state.covers(sge.lkey, sge.addr, len) {
            WcStatus::Error(LOC_PROT_ERR)
        } else if !state.covers(remote.token.get(), remote.addr, len) {
            WcStatus::Error(REM_ACCESS_ERR)
        } else {
            unsafe {
                match opcode {
                    WcOpcode::RdmaWrite => copy(sge.addr, remote.addr, len),
                    _ => copy(remote.addr, sge.addr, len),
                }
            }
            WcStatus::Success
        };
        state.complete(
            self.side,
            WorkCompletion {
                wr_id,
                status,
                opcode,
                byte_len: sge.length,
                ..Default::default()
            },
        );
        self.fabric.cond.notify_all();
        Ok(())
    }
}

impl PostWork for Endpoint {
    unsafe fn post_recv(&self, wr_id: u64, sge: Sge) -> io::Result<()> {
        let mut state = self.fabric.state.lock().unwrap();
        state.sides[self.side].recvs.push_back((wr_id, sge));
        Ok(())
    }

    unsafe fn post_send(&self, wr_id: u64, sge: Sge) -> io::Result<()> {
        let mut state = self.fabric.state.lock().unwrap();
        let peer = self.peer();
        let (recv_id, recv) = state.sides[peer]
            .recvs
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOBUFS))?;
        assert!(sge.length <= recv.length, "receive too small for send");
        copy(sge.addr, recv.addr, sge.length as usize);
        state.complete(
            self.side,
            WorkCompletion {
                wr_id,
                opcode: WcOpcode::Send,
                byte_len: sge.length,
                ..Default::default()
            },
        );
        state.complete(
            peer,
            WorkCompletion {
                wr_id: recv_id,
                opcode: WcOpcode::Recv,
                byte_len: sge.length,
                ..Default::default()
            },
        );
        self.fabric.cond.notify_all();
        Ok(())
    }

    unsafe fn post_write(&self, wr_id: u64, sge: Sge, remote: RemoteTarget) -> io::Result<()> {
        self.one_sided(wr_id, sge, remote, WcOpcode::RdmaWrite)
    }

    unsafe fn post_read(&self, wr_id: u64, sge: Sge, remote: RemoteTarget) -> io::Result<()> {
        self.one_sided(wr_id, sge, remote, WcOpcode::RdmaRead)
    }
}

impl CompletionSource for Endpoint {
    fn wait_notification(&self, deadline: Option<Instant>) -> io::Result<bool> {
        let mut state = self.fabric.state.lock().unwrap();
        loop {
            if state.sides[self.side].notifications > 0 {
                state.sides[self.side].notifications -= 1;
                return Ok(true);
            }
            let remaining = match deadline {
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(r) => r,
                    None => return Ok(false),
                },
                None => Duration::from_secs(3600),
            };
            state = self.fabric.cond.wait_timeout(state, remaining).unwrap().0;
        }
    }

    fn arm(&self) -> io::Result<()> {
        self.fabric.state.lock().unwrap().sides[self.side].armed = true;
        Ok(())
    }

    fn poll(&self, out: &mut [WorkCompletion]) -> io::Result<usize> {
        let mut state = self.fabric.state.lock().unwrap();
        let cq = &mut state.sides[self.side].cq;
        let mut n = 0;
        while n < out.len() {
            match cq.pop_front() {
                Some(wc) => {
                    out[n] = wc;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn ack_notifications(&self, n: u32) {
        self.fabric.state.lock().unwrap().sides[self.side].acked += n;
    }
}

fn deadline() -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(10))
}

/// Runs the server half; returns what its buffer holds once the client has gone.
fn serve(
    ep: Endpoint,
    fabric: Arc<Fabric>,
    ready: Arc<Barrier>,
    gone: mpsc::Receiver<()>,
) -> Result<Vec<u8>> {
    let meta_recv = fabric.alloc(&[0; DESCRIPTOR_LEN]);
    let mut meta_send = fabric.alloc(&[0; DESCRIPTOR_LEN]);
    // SAFETY: fabric buffers live until the thread returns, after the last completion.
    unsafe { pre_post_descriptor_recv(&ep, &meta_recv) }?;
    ready.wait();

    let client = receive_client_descriptor(&ep, &meta_recv, deadline())?;
    let length = client.length;
    let reply = fabric.alloc(&vec![0; length as usize]);
    unsafe { advertise_buffer(&ep, &reply, &mut meta_send) }?;
    wait_for(&ep, Await::OwnSend, deadline())?;

    gone.recv().expect("client hung up without disconnecting");
    Ok(reply.bytes().to_vec())
}

fn run_pair<F>(payload: Vec<u8>, drive: F) -> (Result<Vec<u8>>, Result<()>, Arc<Fabric>)
where
    F: FnOnce(&Endpoint, &Fabric, &Buffer, &Buffer, BufferDescriptor) -> Result<()> + Send + 'static,
{
    let fabric = Arc::new(Fabric::default());
    let ready = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel();

    let server = {
        let ep = fabric.endpoint(1);
        let fabric = Arc::clone(&fabric);
        let ready = Arc::clone(&ready);
        thread::spawn(move || serve(ep, fabric, ready, rx))
    };

    let client_fabric = Arc::clone(&fabric);
    let client = thread::spawn(move || -> Result<()> {
        let fabric = client_fabric;
        let ep = fabric.endpoint(0);
        let source = fabric.alloc(&payload);
        let sink = fabric.alloc(&vec![0; payload.len()]);
        let mut meta_send = fabric.alloc(&[0; DESCRIPTOR_LEN]);
        let meta_recv = fabric.alloc(&[0; DESCRIPTOR_LEN]);
        unsafe { pre_post_descriptor_recv(&ep, &meta_recv) }?;
        ready.wait();

        let remote = unsafe {
            exchange_with_server(&ep, &ep, &source, &mut meta_send, &meta_recv, deadline())
        };
        let ret = remote.and_then(|remote| drive(&ep, &*fabric, &source, &sink, remote));
        // disconnect
        tx.send(()).unwrap();
        ret
    });

    let client_ret = client.join().unwrap();
    let server_ret = server.join().unwrap();
    (server_ret, client_ret, fabric)
}

#[test]
fn payload_round_trips_through_server_buffer() {
    const PAYLOAD: &[u8] = b"hello-rdma";
    let (server, client, fabric) = run_pair(PAYLOAD.to_vec(), |ep, _, source, sink, remote| {
        let length = remote.length;
        assert_eq!(length as usize, PAYLOAD.len());
        unsafe { write_then_read(ep, ep, source, sink, &remote, deadline()) }?;
        verify(source.bytes(), sink.bytes())?;
        assert_eq!(sink.bytes(), PAYLOAD);
        Ok(())
    });
    client.unwrap();
    assert_eq!(server.unwrap(), PAYLOAD);

    // one acknowledged notification per wait on each side
    let state = fabric.state.lock().unwrap();
    assert_eq!(state.sides[0].acked, 3);
    assert_eq!(state.sides[1].acked, 2);
    assert!(state.sides.iter().all(|s| s.cq.is_empty()));
}

#[test]
fn payloads_of_any_length_and_content_round_trip() {
    let pattern: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 251) as u8).collect();
    let payloads = vec![
        b"x".to_vec(),
        vec![0x00, 0xff, 0x00, 0x7f, 0x80, 0xff, 0x01],
        (0..=255u8).collect(),
        pattern,
    ];
    for payload in payloads {
        let expected = payload.clone();
        let (server, client, _) = run_pair(payload, |ep, _, source, sink, remote| {
            unsafe { write_then_read(ep, ep, source, sink, &remote, deadline()) }?;
            verify(source.bytes(), sink.bytes())
        });
        if let Err(e) = client {
            panic!("{} byte payload failed: {}", expected.len(), e);
        }
        assert_eq!(server.unwrap(), expected);
    }
}

#[test]
fn forged_token_is_refused_by_the_remote_side() {
    let (server, client, _) = run_pair(b"secret".to_vec(), |ep, _, source, sink, remote| {
        let forged = BufferDescriptor::new(
            remote.address,
            remote.length,
            AccessToken::new(remote.token.get() ^ 0xffff),
        );
        unsafe { write_then_read(ep, ep, source, sink, &forged, deadline()) }
    });
    match client {
        Err(Error::Transport { status, .. }) => {
            assert_eq!(status, WcStatus::Error(REM_ACCESS_ERR))
        }
        other => panic!("unexpected {:?}", other),
    }
    // nothing reached the server's buffer
    assert_eq!(server.unwrap(), vec![0; 6]);
}

#[test]
fn remote_buffer_bounds_are_enforced() {
    let (server, client, _) = run_pair(b"0123456789".to_vec(), |ep, fabric, source, sink, remote| {
        // aim past the end of the advertised buffer
        let shifted = BufferDescriptor::new(remote.address + 4, remote.length, remote.token);
        let ret = unsafe { write_then_read(ep, ep, source, sink, &shifted, deadline()) };
        assert!(fabric.state.lock().unwrap().sides[0].cq.is_empty());
        ret
    });
    assert!(matches!(client, Err(Error::Transport { .. })));
    assert!(server.is_ok());
}
