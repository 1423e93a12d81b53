//! Blocking retrieval of work completions through a completion channel.
use std::fmt;
use std::io;
use std::time::Instant;

use rdma::ibv::{CompChannel, CompletionQueue, WcStatus, WorkCompletion};

use crate::error::{Error, Result};

/// A completion queue observed through a notification channel.
pub trait CompletionSource {
    /// Block for the next notification. `Ok(false)` means `deadline` passed.
    fn wait_notification(&self, deadline: Option<Instant>) -> io::Result<bool>;
    /// Request one more notification.
    fn arm(&self) -> io::Result<()>;
    fn poll(&self, out: &mut [WorkCompletion]) -> io::Result<usize>;
    fn ack_notifications(&self, n: u32);
}

/// The real channel and queue of a connection.
#[derive(Debug, Clone, Copy)]
pub struct Completions<'a> {
    pub channel: &'a CompChannel,
    pub cq: &'a CompletionQueue,
}

impl<'a> CompletionSource for Completions<'a> {
    fn wait_notification(&self, deadline: Option<Instant>) -> io::Result<bool> {
        self.channel.get_cq_event(self.cq, deadline)
    }

    fn arm(&self) -> io::Result<()> {
        self.cq.req_notify(false)
    }

    fn poll(&self, out: &mut [WorkCompletion]) -> io::Result<usize> {
        self.cq.poll(out)
    }

    fn ack_notifications(&self, n: u32) {
        self.cq.ack_events(n)
    }
}

/// Wait for a notification and collect exactly `max_count` completions into `out`.
///
/// The queue is re-armed before draining. Exactly one notification is acknowledged per call once
/// it has been obtained, whatever the outcome. The first completion with a non-success status
/// fails the whole call. An `out` shorter than `max_count` is refused before anything is waited
/// for.
pub fn await_completions<C: CompletionSource + ?Sized>(
    source: &C,
    out: &mut [WorkCompletion],
    max_count: usize,
    deadline: Option<Instant>,
) -> Result<usize> {
    if out.len() < max_count {
        return Err(Error::CapacityExceeded {
            requested: max_count,
            available: out.len(),
        });
    }
    let notified = source
        .wait_notification(deadline)
        .map_err(Error::verbs("ibv_get_cq_event"))?;
    if !notified {
        return Err(Error::Timeout("completion notification"));
    }

    let ret = drain(source, &mut out[..max_count], deadline);
    source.ack_notifications(1);
    ret
}

fn drain<C: CompletionSource + ?Sized>(
    source: &C,
    out: &mut [WorkCompletion],
    deadline: Option<Instant>,
) -> Result<usize> {
    source.arm().map_err(Error::verbs("ibv_req_notify_cq"))?;

    let mut total = 0;
    while total < out.len() {
        let n = source
            .poll(&mut out[total..])
            .map_err(Error::verbs("ibv_poll_cq"))?;
        if n == 0 && deadline.map_or(false, |d| Instant::now() >= d) {
            return Err(Error::Timeout("work completions"));
        }
        total += n;
    }

    for wc in out.iter() {
        if wc.status != WcStatus::Success {
            tracing::error!(
                "work completion {} failed: {}, vendor err {:#x}",
                wc.wr_id,
                wc.status,
                wc.vendor_err
            );
            return Err(Error::Transport {
                status: wc.status,
                wr_id: wc.wr_id,
            });
        }
        tracing::debug!(
            "work completion {}: {:?}, {} bytes",
            wc.wr_id,
            wc.opcode,
            wc.byte_len
        );
    }
    Ok(total)
}

/// The points at which the protocol blocks for completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Await {
    /// The peer's descriptor has landed in the pre-posted receive.
    PeerDescriptor,
    /// Our own descriptor send has finished.
    OwnSend,
    /// Both of the above, in either order.
    SendAndPeerDescriptor,
    /// A single RDMA WRITE or READ.
    OneSided,
}

impl Await {
    pub fn count(self) -> usize {
        match self {
            Await::PeerDescriptor | Await::OwnSend | Await::OneSided => 1,
            Await::SendAndPeerDescriptor => 2,
        }
    }
}

impl fmt::Display for Await {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Await::PeerDescriptor => "peer descriptor",
            Await::OwnSend => "descriptor send",
            Await::SendAndPeerDescriptor => "descriptor send and peer descriptor",
            Await::OneSided => "one-sided operation",
        };
        f.write_str(name)
    }
}

pub fn wait_for<C: CompletionSource + ?Sized>(
    source: &C,
    what: Await,
    deadline: Option<Instant>,
) -> Result<Vec<WorkCompletion>> {
    tracing::debug!("waiting for {}", what);
    let mut wcs = vec![WorkCompletion::default(); what.count()];
    let n = await_completions(source, &mut wcs, what.count(), deadline)?;
    wcs.truncate(n);
    Ok(wcs)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use rdma::ibv::WcOpcode;

    use super::*;

    /// Hands out a scripted sequence of poll results.
    #[derive(Default)]
    pub(crate) struct ScriptedCq {
        pub notify: Cell<bool>,
        pub polls: RefCell<VecDeque<Vec<WorkCompletion>>>,
        pub arms: Cell<u32>,
        pub acks: Cell<u32>,
    }

    impl ScriptedCq {
        pub(crate) fn new(polls: Vec<Vec<WorkCompletion>>) -> Self {
            ScriptedCq {
                notify: Cell::new(true),
                polls: RefCell::new(polls.into()),
                ..Default::default()
            }
        }
    }

    impl CompletionSource for ScriptedCq {
        fn wait_notification(&self, _deadline: Option<Instant>) -> io::Result<bool> {
            Ok(self.notify.get())
        }

        fn arm(&self) -> io::Result<()> {
            self.arms.set(self.arms.get() + 1);
            Ok(())
        }

        fn poll(&self, out: &mut [WorkCompletion]) -> io::Result<usize> {
            let batch = self.polls.borrow_mut().pop_front().unwrap_or_default();
            assert!(batch.len() <= out.len(), "scripted batch larger than requested");
            out[..batch.len()].copy_from_slice(&batch);
            Ok(batch.len())
        }

        fn ack_notifications(&self, n: u32) {
            self.acks.set(self.acks.get() + n);
        }
    }

    pub(crate) fn ok_wc(wr_id: u64, opcode: WcOpcode) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            opcode,
            byte_len: 16,
            ..Default::default()
        }
    }

    #[test]
    fn collects_across_empty_polls() -> Result<()> {
        let cq = ScriptedCq::new(vec![
            vec![],
            vec![ok_wc(2, WcOpcode::Send)],
            vec![],
            vec![ok_wc(1, WcOpcode::Recv)],
        ]);
        let wcs = wait_for(&cq, Await::SendAndPeerDescriptor, None)?;
        assert_eq!(wcs.len(), 2);
        assert_eq!(wcs[0].wr_id, 2);
        assert_eq!(wcs[1].wr_id, 1);
        assert_eq!(cq.arms.get(), 1);
        assert_eq!(cq.acks.get(), 1);
        Ok(())
    }

    #[test]
    fn failed_status_is_transport_error_and_still_acked() {
        let mut bad = ok_wc(3, WcOpcode::RdmaWrite);
        bad.status = WcStatus::Error(10);
        let cq = ScriptedCq::new(vec![vec![bad]]);
        match wait_for(&cq, Await::OneSided, None) {
            Err(Error::Transport { status, wr_id }) => {
                assert_eq!(status, WcStatus::Error(10));
                assert_eq!(wr_id, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cq.acks.get(), 1);
    }

    #[test]
    fn missing_notification_times_out_without_ack() {
        let cq = ScriptedCq::new(vec![]);
        cq.notify.set(false);
        assert!(matches!(
            wait_for(&cq, Await::PeerDescriptor, Some(Instant::now())),
            Err(Error::Timeout(_))
        ));
        assert_eq!(cq.acks.get(), 0);
        assert_eq!(cq.arms.get(), 0);
    }

    #[test]
    fn expired_deadline_stops_draining() {
        let cq = ScriptedCq::new(vec![vec![ok_wc(2, WcOpcode::Send)]]);
        assert!(matches!(
            wait_for(&cq, Await::SendAndPeerDescriptor, Some(Instant::now())),
            Err(Error::Timeout("work completions"))
        ));
        assert_eq!(cq.acks.get(), 1);
    }

    #[test]
    fn never_collects_more_than_asked() -> Result<()> {
        let cq = ScriptedCq::new(vec![vec![ok_wc(1, WcOpcode::Recv)]]);
        let mut out = [WorkCompletion::default(); 4];
        assert_eq!(await_completions(&cq, &mut out, 1, None)?, 1);
        assert_eq!(Await::SendAndPeerDescriptor.count(), 2);
        assert_eq!(Await::OwnSend.count(), 1);
        Ok(())
    }

    #[test]
    fn short_output_buffer_is_refused() {
        let cq = ScriptedCq::new(vec![vec![ok_wc(1, WcOpcode::Recv)]]);
        let mut out = [WorkCompletion::default(); 1];
        assert!(matches!(
            await_completions(&cq, &mut out, 2, None),
            Err(Error::CapacityExceeded {
                requested: 2,
                available: 1
            })
        ));
        // nothing consumed, nothing acked
        assert_eq!(cq.polls.borrow().len(), 1);
        assert_eq!(cq.arms.get(), 0);
        assert_eq!(cq.acks.get(), 0);
    }
}
