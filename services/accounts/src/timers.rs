//! Silence timeout timer wheel.
//!
//! Identical in shape to `billing::timers::TimerWheel`, keyed by customer id
//! instead of invoice id: a single background task holding a min-heap of
//! `(fire_at, customer_id)` pairs, sleeping until the nearest deadline.
//! `AccountsService::recover_silence_timers` re-arms the heap from
//! `CustomerStore::list_pending_deletions_past_timeout` at startup so a
//! restart loses no in-flight silence window.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

enum TimerCommand {
    Schedule(String, DateTime<Utc>),
    Cancel(String),
    Now(String),
}

pub struct TimerWheel {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerWheel {
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, fire_tx));
        (Self { tx: cmd_tx }, fire_rx)
    }

    pub fn schedule(&self, customer_id: String, fire_at: DateTime<Utc>) {
        let _ = self.tx.send(TimerCommand::Schedule(customer_id, fire_at));
    }

    pub fn cancel(&self, customer_id: &str) {
        let _ = self.tx.send(TimerCommand::Cancel(customer_id.to_string()));
    }

    pub fn schedule_now(&self, customer_id: String) {
        let _ = self.tx.send(TimerCommand::Now(customer_id));
    }
}

async fn run(mut cmd_rx: mpsc::UnboundedReceiver<TimerCommand>, fire_tx: mpsc::UnboundedSender<String>) {
    let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>> = BinaryHeap::new();
    let mut cancelled: HashSet<String> = HashSet::new();

    loop {
        let sleep_for = match heap.peek() {
            Some(Reverse((at, _))) => (*at - Utc::now()).to_std().unwrap_or(Duration::from_millis(0)),
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {
                let now = Utc::now();
                while let Some(Reverse((at, _))) = heap.peek() {
                    if *at > now {
                        break;
                    }
                    let Reverse((_, id)) = heap.pop().unwrap();
                    if cancelled.remove(&id) {
                        debug!(customer_id = %id, "silence timeout was cancelled before firing");
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
        wheel.schedule("cust-1".to_string(), Utc::now() + chrono::Duration::milliseconds(20));
        let got = timeout(TokioDuration::from_secs(1), fired.recv()).await.unwrap();
        assert_eq!(got, Some("cust-1".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_timer_does_not_fire() {
        let (wheel, mut fired) = TimerWheel::spawn();
        wheel.schedule("cust-1".to_string(), Utc::now() + chrono::Duration::milliseconds(20));
        wheel.cancel("cust-1");
        wheel.schedule("cust-2".to_string(), Utc::now() + chrono::Duration::milliseconds(40));

        let got = timeout(TokioDuration::from_secs(1), fired.recv()).await.unwrap();
        assert_eq!(got, Some("cust-2".to_string()));
    }
}
