//! Timer source
//!
//! `timer://<period>` emits a `{tick_id, timestamp}` message every period,
//! starting one period after route start. The schedule is non-drifting:
//! ticks fire at `start + n·period` regardless of how long downstream
//! processing takes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use virta_core::{keys, Message, Result, RouteError};

use super::{MessageTx, Source};
use crate::uri::EndpointUri;

/// Periodic tick source
#[derive(Debug)]
pub struct TimerSource {
    period: Duration,
    uri: String,
}

impl TimerSource {
    /// Build from a `timer://<period>` URI; the authority is a duration
    /// like `500ms`, `1s`, or `5m`
    pub fn from_uri(uri: &EndpointUri) -> Result<Self> {
        let spec = uri.host.as_str();
        let period = humantime::parse_duration(spec).map_err(|e| {
            RouteError::Config(format!("timer period '{spec}': {e}"))
        })?;
        if period.is_zero() {
            return Err(RouteError::Config("timer period must be positive".to_string()));
        }
        Ok(Self {
            period,
            uri: uri.raw().to_string(),
        })
    }

    /// The configured period
    pub fn period(&self) -> Duration {
        self.period
    }
}

#[async_trait]
impl Source for TimerSource {
    fn name(&self) -> &str {
        "timer"
    }

    async fn run(&self, tx: MessageTx, cancel: CancellationToken) -> Result<()> {
        let mut ticks = interval_at(Instant::now() + self.period, self.period);
        // Burst keeps the schedule anchored at start + n·period after a
        // stall, instead of shifting every later tick.
        ticks.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut tick_id: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticks.tick() => {
                    let msg = Message::new(self.uri.clone())
                        .with_field(keys::TICK_ID, tick_id);
                    if !tx.send(msg).await {
                        return Ok(());
                    }
                    tick_id += 1;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn timer(uri: &str) -> TimerSource {
        TimerSource::from_uri(&EndpointUri::parse(uri).unwrap()).unwrap()
    }

    #[test]
    fn test_period_parsing() {
        assert_eq!(timer("timer://250ms").period(), Duration::from_millis(250));
        assert_eq!(timer("timer://1s").period(), Duration::from_secs(1));
        assert_eq!(timer("timer://5m").period(), Duration::from_secs(300));
        assert_eq!(timer("timer://2h").period(), Duration::from_secs(7200));
    }

    #[test]
    fn test_invalid_periods_rejected() {
        for uri in ["timer://", "timer://fast", "timer://0s", "timer://-1s"] {
            let parsed = EndpointUri::parse(uri).unwrap();
            assert!(TimerSource::from_uri(&parsed).is_err(), "{uri}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_periodic_and_numbered() {
        let source = timer("timer://100ms");
        let (tx, mut rx) = mpsc::channel(16);
        let mtx = MessageTx::new(tx, "ticks");
        let cancel = CancellationToken::new();

        let driver = tokio::spawn({
            let cancel = cancel.clone();
            async move { source.run(mtx, cancel).await }
        });

        // First tick fires one period after start, not immediately
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        driver.await.unwrap().unwrap();

        let mut ids = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            assert_eq!(msg.source(), Some("timer://100ms"));
            assert!(msg.timestamp().is_some());
            ids.push(msg.as_i64(keys::TICK_ID).unwrap());
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_promptly() {
        let source = timer("timer://1h");
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let driver = tokio::spawn({
            let cancel = cancel.clone();
            let mtx = MessageTx::new(tx, "slow");
            async move { source.run(mtx, cancel).await }
        });

        cancel.cancel();
        driver.await.unwrap().unwrap();
    }
}
