//! Coordination between the read and write engines of one connection.
//!
//! The write engine may not put anything but the initiator's first chunk on
//! the wire before the read engine has finished the first round: the decoy
//! exchange that opens every connection. The read engine reports the outcome
//! exactly once through a [`FirstRoundSignal`]; the write engine waits on the
//! matching [`FirstRoundWaiter`]. Dropping the signal without firing it
//! reports failure.
//!
//! The initiator's write engine also hands the rest of its first batch to the
//! read engine through a one-shot handoff, so those chunks are written only
//! after the responder's decoys validated.
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::debug;

use crate::{error::Error, segment::SegmentBatch};

/// Creates a connected signal/waiter pair.
pub(crate) fn first_round() -> (FirstRoundSignal, FirstRoundWaiter) {
    let (tx, rx) = oneshot::channel();
    (
        FirstRoundSignal(tx),
        FirstRoundWaiter {
            rx: Some(rx),
            outcome: None,
        },
    )
}

/// Sending half, owned by the read engine.
#[derive(Debug)]
pub(crate) struct FirstRoundSignal(oneshot::Sender<bool>);

impl FirstRoundSignal {
    pub(crate) fn fire(self, can_continue: bool) {
        debug!(can_continue, "first round finished");
        // The waiter may already be gone together with its write engine.
        let _ = self.0.send(can_continue);
    }
}

/// Receiving half, owned by the write engine.
#[derive(Debug)]
pub(crate) struct FirstRoundWaiter {
    rx: Option<oneshot::Receiver<bool>>,
    outcome: Option<bool>,
}

impl FirstRoundWaiter {
    /// Returns the outcome if it is known, without blocking.
    pub(crate) fn try_outcome(&mut self) -> Option<Result<(), Error>> {
        if self.outcome.is_none() {
            let rx = self.rx.as_mut()?;
            let received = match rx.try_recv() {
                Ok(can_continue) => can_continue,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => false,
            };
            self.settle(received);
        }
        self.outcome.map(into_result)
    }

    /// Polls for the outcome, registering `cx` to be woken when it arrives.
    pub(crate) fn poll_outcome(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if let Some(outcome) = self.outcome {
            return Poll::Ready(into_result(outcome));
        }
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(Error::SynchronizationAborted));
        };
        let received = match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(can_continue)) => can_continue,
            Poll::Ready(Err(_)) => false,
            Poll::Pending => return Poll::Pending,
        };
        self.settle(received);
        Poll::Ready(into_result(received))
    }

    /// Blocks the current thread until the outcome is known.
    ///
    /// Must not be called from within an asynchronous execution context.
    pub(crate) fn blocking_outcome(&mut self) -> Result<(), Error> {
        if self.outcome.is_none() {
            let received = match self.rx.take() {
                Some(rx) => rx.blocking_recv().unwrap_or(false),
                None => false,
            };
            self.outcome = Some(received);
        }
        self.outcome.map_or(Err(Error::SynchronizationAborted), into_result)
    }

    fn settle(&mut self, can_continue: bool) {
        self.outcome = Some(can_continue);
        self.rx = None;
    }
}

fn into_result(can_continue: bool) -> Result<(), Error> {
    if can_continue {
        Ok(())
    } else {
        Err(Error::SynchronizationAborted)
    }
}

/// Creates a connected handoff pair.
pub(crate) fn handoff() -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = oneshot::channel();
    (HandoffSender(tx), HandoffReceiver(Some(rx)))
}

/// Write side of the handoff. Consumed when the queue is sent.
#[derive(Debug)]
pub(crate) struct HandoffSender(oneshot::Sender<SegmentBatch>);

impl HandoffSender {
    pub(crate) fn send(self, queue: SegmentBatch) {
        // The read engine may already be gone.
        let _ = self.0.send(queue);
    }
}

/// Read side of the handoff.
#[derive(Debug)]
pub(crate) struct HandoffReceiver(Option<oneshot::Receiver<SegmentBatch>>);

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Handoff {
    /// The queued chunks. Returned at most once.
    Ready(SegmentBatch),
    /// The write engine has not finished its first call yet.
    Pending,
    /// Nothing will ever be handed off.
    Closed,
}

impl HandoffReceiver {
    pub(crate) fn try_take(&mut self) -> Handoff {
        let Some(rx) = self.0.as_mut() else {
            return Handoff::Closed;
        };
        match rx.try_recv() {
            Ok(queue) => {
                self.0 = None;
                Handoff::Ready(queue)
            }
            Err(TryRecvError::Empty) => Handoff::Pending,
            Err(TryRecvError::Closed) => {
                self.0 = None;
                Handoff::Closed
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::segment::Segment;

    #[test]
    fn test_waiter_sees_fired_outcome() {
        let (signal, mut waiter) = first_round();
        assert_eq!(waiter.try_outcome(), None);
        signal.fire(true);
        assert_eq!(waiter.try_outcome(), Some(Ok(())));
        // settled outcomes are sticky
        assert_eq!(waiter.try_outcome(), Some(Ok(())));
    }

    #[test]
    fn test_dropped_signal_aborts() {
        let (signal, mut waiter) = first_round();
        drop(signal);
        assert_eq!(
            waiter.try_outcome(),
            Some(Err(Error::SynchronizationAborted))
        );
    }

    #[test]
    fn test_blocking_outcome_across_threads() {
        let (signal, mut waiter) = first_round();
        let handle = std::thread::spawn(move || signal.fire(false));
        assert_eq!(
            waiter.blocking_outcome(),
            Err(Error::SynchronizationAborted)
        );
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_poll_outcome_wakes() {
        let (signal, mut waiter) = first_round();
        let task = tokio::spawn(async move {
            std::future::poll_fn(|cx| waiter.poll_outcome(cx)).await
        });
        tokio::task::yield_now().await;
        signal.fire(true);
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[test]
    fn test_handoff_delivered_once() {
        let (tx, mut rx) = handoff();
        assert_eq!(rx.try_take(), Handoff::Pending);
        tx.send(vec![Segment::from(b"queued".to_vec())]);
        assert_eq!(
            rx.try_take(),
            Handoff::Ready(vec![Segment::from(b"queued".to_vec())])
        );
        assert_eq!(rx.try_take(), Handoff::Closed);
    }

    #[test]
    fn test_handoff_sender_dropped() {
        let (tx, mut rx) = handoff();
        drop(tx);
        assert_eq!(rx.try_take(), Handoff::Closed);
    }
}
