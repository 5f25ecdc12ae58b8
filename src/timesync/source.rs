//! A single clock endpoint sampler.
//!
//! One [`TimeSyncSource`] owns one remote clock (the server, or one peer) and
//! keeps a rolling estimate of `{offset, ping}` against it. The actual wire
//! exchange is behind the [`Pinger`] seam so the server RPC and the peer
//! data-channel exchange share all of the bookkeeping here.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::error::CoordinatorResult;

/// Samples kept in the rolling window.
pub const SAMPLE_WINDOW: usize = 8;

/// Ping cadence once the window is full.
const POLL_INTERVAL_STEADY: Duration = Duration::from_secs(60);

/// Ping cadence while the window is still filling.
const POLL_INTERVAL_WARMUP: Duration = Duration::from_secs(1);

// ────────────────────────────────────────────────────────────────────────────
// Ping samples
// ────────────────────────────────────────────────────────────────────────────

/// One four-timestamp exchange. `request_sent` and `response_received` are
/// stamped on the local clock, the middle two on the remote clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSample {
    pub request_sent: i64,
    pub request_received: i64,
    pub response_sent: i64,
    pub response_received: i64,
}

impl PingSample {
    /// Round-trip time with the remote processing time removed. Clamped at
    /// zero: coarse clocks can make the raw difference negative.
    pub fn rtt_ms(&self) -> f64 {
        let rtt = (self.response_received - self.request_sent)
            - (self.response_sent - self.request_received);
        rtt.max(0) as f64
    }

    /// Signed milliseconds to add to a local instant to obtain the remote
    /// equivalent.
    pub fn offset_ms(&self) -> f64 {
        ((self.request_received - self.request_sent) as f64
            + (self.response_sent - self.response_received) as f64)
            / 2.0
    }
}

/// How a source reaches its remote clock. Implementations must not run two
/// pings concurrently; the owning source task never does.
#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self) -> CoordinatorResult<PingSample>;
}

// ────────────────────────────────────────────────────────────────────────────
// Source state
// ────────────────────────────────────────────────────────────────────────────

/// Estimate broadcast after every ping attempt. `error` is set (and the
/// estimates are `None`) when the attempt failed; the source keeps its
/// previous window either way.
#[derive(Debug, Clone)]
pub struct TimeSyncUpdate {
    pub source_id: String,
    pub error: Option<String>,
    pub offset_ms: Option<f64>,
    pub ping_ms: Option<f64>,
}

#[derive(Default)]
struct SourceState {
    window: VecDeque<(f64, f64)>,
    offset_ms: f64,
    ping_ms: f64,
    has_estimate: bool,
}

impl SourceState {
    fn push(&mut self, sample: &PingSample) {
        if self.window.len() == SAMPLE_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back((sample.offset_ms(), sample.rtt_ms()));

        // Mean over the window once full; the latest sample alone before
        // that, so early estimates are not dominated by the first outlier.
        if self.window.len() == SAMPLE_WINDOW {
            let n = self.window.len() as f64;
            self.offset_ms = self.window.iter().map(|(o, _)| o).sum::<f64>() / n;
            self.ping_ms = self.window.iter().map(|(_, p)| p).sum::<f64>() / n;
        } else {
            self.offset_ms = sample.offset_ms();
            self.ping_ms = sample.rtt_ms();
        }
        self.has_estimate = true;
    }
}

/// A background sampler for one remote clock.
pub struct TimeSyncSource {
    id: String,
    pinger: Arc<dyn Pinger>,
    state: Arc<Mutex<SourceState>>,
    updates: broadcast::Sender<TimeSyncUpdate>,
    kick: Arc<Notify>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl TimeSyncSource {
    pub fn new(id: impl Into<String>, pinger: Arc<dyn Pinger>) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            id: id.into(),
            pinger,
            state: Arc::new(Mutex::new(SourceState::default())),
            updates,
            kick: Arc::new(Notify::new()),
            cancel: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimeSyncUpdate> {
        self.updates.subscribe()
    }

    /// Start the polling task. Pings are serialized: one attempt completes
    /// (or fails) before the wait for the next begins. Restarting an already
    /// running source cancels the previous task first, so a late response
    /// from the old task is dropped with it.
    pub fn start(&self) {
        let token = CancellationToken::new();
        if let Some(old) = self.cancel.lock().replace(token.clone()) {
            old.cancel();
        }

        let id = self.id.clone();
        let pinger = self.pinger.clone();
        let state = self.state.clone();
        let updates = self.updates.clone();
        let kick = self.kick.clone();

        tokio::spawn(async move {
            loop {
                let attempt = tokio::select! {
                    _ = token.cancelled() => break,
                    r = pinger.ping() => r,
                };

                let update = match attempt {
                    Ok(sample) => {
                        let mut st = state.lock();
                        st.push(&sample);
                        TimeSyncUpdate {
                            source_id: id.clone(),
                            error: None,
                            offset_ms: Some(st.offset_ms),
                            ping_ms: Some(st.ping_ms),
                        }
                    }
                    Err(e) => {
                        debug!("time sync ping to {} failed: {}", id, e);
                        TimeSyncUpdate {
                            source_id: id.clone(),
                            error: Some(e.to_string()),
                            offset_ms: None,
                            ping_ms: None,
                        }
                    }
                };
                let _ = updates.send(update);

                let interval = if state.lock().window.len() < SAMPLE_WINDOW {
                    POLL_INTERVAL_WARMUP
                } else {
                    POLL_INTERVAL_STEADY
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                    _ = kick.notified() => {}
                }
            }
            debug!("time sync source {} stopped", id);
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    /// Skip the current wait and ping immediately.
    pub fn force_update(&self) {
        self.kick.notify_one();
    }

    pub fn has_estimate(&self) -> bool {
        self.state.lock().has_estimate
    }

    pub fn offset_ms(&self) -> f64 {
        self.state.lock().offset_ms
    }

    pub fn ping_ms(&self) -> f64 {
        self.state.lock().ping_ms
    }

    pub fn local_to_remote(&self, local: i64) -> i64 {
        local + self.offset_ms().round() as i64
    }

    pub fn remote_to_local(&self, remote: i64) -> i64 {
        remote - self.offset_ms().round() as i64
    }
}

impl Drop for TimeSyncSource {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinatorError;
    use std::collections::VecDeque as Queue;

    struct ScriptedPinger {
        script: Mutex<Queue<CoordinatorResult<PingSample>>>,
    }

    impl ScriptedPinger {
        fn new(samples: Vec<CoordinatorResult<PingSample>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(samples.into_iter().collect()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Pinger for ScriptedPinger {
        async fn ping(&self) -> CoordinatorResult<PingSample> {
            let next = self.script.lock().pop_front();
            match next {
                Some(r) => r,
                None => std::future::pending().await,
            }
        }
    }

    fn sample(rs: i64, rr: i64, st: i64, resp: i64) -> PingSample {
        PingSample {
            request_sent: rs,
            request_received: rr,
            response_sent: st,
            response_received: resp,
        }
    }

    #[test]
    fn offset_and_rtt_from_four_timestamps() {
        // requestSent=1000, requestReceived=1050, responseSent=1060,
        // responseReceived=1120 => rtt 120 - 10 = 110, offset -5.
        let s = sample(1000, 1050, 1060, 1120);
        assert_eq!(s.rtt_ms(), 110.0);
        assert_eq!(s.offset_ms(), -5.0);
    }

    #[test]
    fn rtt_clamped_at_zero() {
        let s = sample(1000, 1100, 1300, 1150);
        assert_eq!(s.rtt_ms(), 0.0);
    }

    #[test]
    fn offset_bounded_by_elapsed_local_time() {
        for s in [
            sample(0, 40, 45, 100),
            sample(1000, 1050, 1060, 1120),
            sample(500, 480, 490, 560),
        ] {
            let elapsed = (s.response_received - s.request_sent) as f64;
            assert!(s.offset_ms().abs() <= elapsed);
        }
    }

    #[tokio::test]
    async fn single_sample_estimate_then_window_mean() {
        // Seven samples at offset 10 then one at offset 90: before the
        // window fills the estimate is the latest sample, after it is the
        // mean of all eight.
        let mut script: Vec<CoordinatorResult<PingSample>> = Vec::new();
        for _ in 0..7 {
            script.push(Ok(sample(1000, 1015, 1015, 1010)));
        }
        script.push(Ok(sample(1000, 1095, 1095, 1010)));
        let source = TimeSyncSource::new("server", ScriptedPinger::new(script));
        let mut rx = source.subscribe();
        source.start();

        let mut last = None;
        for i in 0..8 {
            if i > 0 {
                source.force_update();
            }
            last = Some(rx.recv().await.unwrap());
        }
        source.stop();

        let last = last.unwrap();
        // Mean of 7×10 and 1×90.
        assert_eq!(last.offset_ms, Some(20.0));
        assert_eq!(source.offset_ms(), 20.0);
    }

    #[tokio::test]
    async fn failed_ping_reports_error_and_keeps_estimate() {
        let source = TimeSyncSource::new(
            "server",
            ScriptedPinger::new(vec![
                Ok(sample(1000, 1050, 1060, 1120)),
                Err(CoordinatorError::ClockSampleFailed {
                    source_id: "server".to_string(),
                    detail: "boom".to_string(),
                }),
            ]),
        );
        let mut rx = source.subscribe();
        source.start();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.offset_ms, Some(-5.0));

        source.force_update();
        let second = rx.recv().await.unwrap();
        assert!(second.error.is_some());
        assert_eq!(second.offset_ms, None);

        // The window is untouched by the failure.
        assert_eq!(source.offset_ms(), -5.0);
        assert_eq!(source.ping_ms(), 110.0);
        source.stop();
    }

    #[tokio::test]
    async fn conversions_are_inverse() {
        let source = TimeSyncSource::new(
            "server",
            ScriptedPinger::new(vec![Ok(sample(1000, 1050, 1060, 1120))]),
        );
        let mut rx = source.subscribe();
        source.start();
        rx.recv().await.unwrap();
        source.stop();

        for t in [0, 1_000, 123_456_789] {
            assert_eq!(source.remote_to_local(source.local_to_remote(t)), t);
        }
        assert_eq!(source.local_to_remote(2000), 1995);
    }
}
