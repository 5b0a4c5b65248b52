//! Ramp-rate parsing and the slot pacer.

use crate::metrics;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Parse a ramp expression like `"5/s"` into users per second.
///
/// Anything that is not a non-negative integer before the first `/` is
/// treated as 0, which means fire-at-once.
pub fn parse_ramp_rate(ramp: &str) -> u64 {
    ramp.split('/')
        .next()
        .unwrap_or("")
        .trim()
        .parse()
        .unwrap_or(0)
}

/// Feed `total` integer slots into `slots`, one per `1s/rate` tick, bumping
/// the active-users gauge for each. A rate of 0 releases every slot
/// immediately. Returns early on cancellation or when the receiver is gone.
pub async fn run_pacer(
    rate: u64,
    total: usize,
    slots: mpsc::Sender<usize>,
    cancel: CancellationToken,
) {
    if rate == 0 {
        for slot in 0..total {
            tokio::select! {
                sent = slots.send(slot) => {
                    if sent.is_err() {
                        return;
                    }
                    metrics::ACTIVE_USERS.inc();
                }
                _ = cancel.cancelled() => return,
            }
        }
        return;
    }

    let period = Duration::from_nanos(1_000_000_000 / rate);
    let mut ticker = tokio::time::interval(period);
    // the first tick fires immediately; skip it so slots pace from t=period
    ticker.tick().await;

    let mut started = 0;
    while started < total {
        tokio::select! {
            _ = ticker.tick() => {
                if slots.send(started).await.is_err() {
                    return;
                }
                metrics::ACTIVE_USERS.inc();
                started += 1;
                debug!("started user {started}/{total}");
            }
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_rate_per_second() {
        assert_eq!(parse_ramp_rate("5/s"), 5);
        assert_eq!(parse_ramp_rate("10/s"), 10);
        assert_eq!(parse_ramp_rate("1"), 1);
        assert_eq!(parse_ramp_rate(" 3 /s"), 3);
    }

    #[test]
    fn parse_treats_garbage_as_fire_at_once() {
        assert_eq!(parse_ramp_rate(""), 0);
        assert_eq!(parse_ramp_rate("fast/s"), 0);
        assert_eq!(parse_ramp_rate("-3/s"), 0);
        assert_eq!(parse_ramp_rate("/s"), 0);
    }

    #[tokio::test]
    async fn zero_rate_releases_all_slots_immediately() {
        let (tx, mut rx) = mpsc::channel(5);
        run_pacer(0, 5, tx, CancellationToken::new()).await;

        let mut slots = Vec::new();
        while let Some(slot) = rx.recv().await {
            slots.push(slot);
        }
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn positive_rate_paces_one_slot_per_period() {
        let (tx, mut rx) = mpsc::channel(4);
        let pacer = tokio::spawn(run_pacer(4, 4, tx, CancellationToken::new()));

        // nothing before the first period elapses
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(rx.recv().await, Some(0));

        tokio::time::advance(Duration::from_secs(1)).await;
        let mut rest = Vec::new();
        while let Some(slot) = rx.recv().await {
            rest.push(slot);
        }
        assert_eq!(rest, vec![1, 2, 3]);
        pacer.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_pacer() {
        let (tx, mut rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_pacer(1, 100, tx, cancel).await;
        // at most the tick that raced the cancellation
        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert!(delivered <= 1);
    }
}
