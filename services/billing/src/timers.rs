//! Payment timeout timer wheel.
//!
//! The original topology spawned one fire-and-forget task per pending
//! timeout (`asyncio.create_task(sleep(...))`); a process restart silently
//! dropped every outstanding timer along with it. This wheel is a single
//! background task per process holding a min-heap of `(fire_at, invoice_id)`
//! pairs: scheduling and cancelling are just channel sends, and the task
//! sleeps until the next entry is due instead of spawning one sleeper per
//! invoice. [`crate::handlers::BillingService::recover_payment_timers`]
//! re-populates the heap from the database at startup so a restart loses
//! no in-flight timeout, only the precision of exactly when it fires.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

enum TimerCommand {
    Schedule(Uuid, DateTime<Utc>),
    Cancel(Uuid),
    Now(Uuid),
}

pub struct TimerWheel {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerWheel {
    /// Spawn the wheel's background task. Returns the handle plus a
    /// receiver yielding the invoice ids whose timeout has fired; the
    /// caller is responsible for acting on each (calling
    /// `BillingService::handle_payment_timeout`).
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, fire_tx));
        (Self { tx: cmd_tx }, fire_rx)
    }

    pub fn schedule(&self, invoice_id: Uuid, fire_at: DateTime<Utc>) {
        let _ = self.tx.send(TimerCommand::Schedule(invoice_id, fire_at));
    }

    pub fn cancel(&self, invoice_id: Uuid) {
        let _ = self.tx.send(TimerCommand::Cancel(invoice_id));
    }

    /// Fire immediately. Used by startup recovery for timeouts that were
    /// already overdue when the process crashed.
    pub fn schedule_now(&self, invoice_id: Uuid) {
        let _ = self.tx.send(TimerCommand::Now(invoice_id));
    }
}

async fn run(mut cmd_rx: mpsc::UnboundedReceiver<TimerCommand>, fire_tx: mpsc::UnboundedSender<Uuid>) {
    let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>> = BinaryHeap::new();
    let mut cancelled: HashSet<Uuid> = HashSet::new();

    loop {
        let sleep_for = match heap.peek() {
            Some(Reverse((at, _))) => (*at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(0)),
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {
                let now = Utc::now();
                while let Some(Reverse((at, id))) = heap.peek().copied() {
                    if at > now {
                        break;
                    }
                    heap.pop();
                    if cancelled.remove(&id) {
                        debug!(invoice_id = %id, "payment timeout was cancelled before firing");
                        continue;
                    }
                    let _ = fire_tx.send(id);
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TimerCommand::Schedule(id, at)) => {
                        cancelled.remove(&id);
                        heap.push(Reverse((at, id)));
                    }
                    Some(TimerCommand::Cancel(id)) => {
                        cancelled.insert(id);
                    }
                    Some(TimerCommand::Now(id)) => {
                        cancelled.remove(&id);
                        heap.push(Reverse((Utc::now(), id)));
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration as TokioDuration};

    #[tokio::test]
    async fn test_timer_fires_after_delay() {
        let (wheel, mut fired) = TimerWheel::spawn();
        let id = Uuid::new_v4();
        wheel.schedule(id, Utc::now() + chrono::Duration::milliseconds(20));

        let got = timeout(TokioDuration::from_secs(1), fired.recv()).await.unwrap();
        assert_eq!(got, Some(id));
    }

    #[tokio::test]
    async fn test_cancelled_timer_does_not_fire() {
        let (wheel, mut fired) = TimerWheel::spawn();
        let id = Uuid::new_v4();
        wheel.schedule(id, Utc::now() + chrono::Duration::milliseconds(20));
        wheel.cancel(id);

        let other = Uuid::new_v4();
        wheel.schedule(other, Utc::now() + chrono::Duration::milliseconds(40));

        let got = timeout(TokioDuration::from_secs(1), fired.recv()).await.unwrap();
        assert_eq!(got, Some(other));
    }

    #[tokio::test]
    async fn test_schedule_now_fires_immediately() {
        let (wheel, mut fired) = TimerWheel::spawn();
        let id = Uuid::new_v4();
        wheel.schedule(id, Utc::now() + chrono::Duration::hours(1));
        wheel.schedule_now(id);

        let got = timeout(TokioDuration::from_millis(200), fired.recv()).await.unwrap();
        assert_eq!(got, Some(id));
    }
}
