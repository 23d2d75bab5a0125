//! Engine: drives the tick schedule in real time against a virtual-user pool.
//!
//! One dispatcher task walks the precomputed schedule using absolute
//! `sleep_until` targets so timer overshoot never accumulates. Ticks are
//! handed to VUs over a bounded channel; a VU that cannot accept a tick
//! within the lag budget triggers a one-time pool widening, after which late
//! ticks are dropped and counted as overruns.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::pipeline::{self, PipelineConfig};
use crate::plan::Hammer;
use crate::report::{IterationReport, SummarySnapshot};
use crate::reporter::ReportSink;
use crate::runner::ScenarioRunner;
use crate::schedule::plan_ticks;

/// VU pool head-room multiplier over the mean iterations-per-second.
const SAFETY_FACTOR: u64 = 10;
/// Absolute cap on the VU pool, including after widening.
const HARD_POOL_CEILING: usize = 1000;
/// How long a tick may wait for a free VU before the overrun policy kicks in.
const LAG_BUDGET: Duration = Duration::from_millis(100);
/// Below this remaining time the dispatcher spins instead of sleeping.
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

pub struct Engine {
    hammer: Arc<Hammer>,
}

impl Engine {
    pub fn new(hammer: Hammer) -> Self {
        Self {
            hammer: Arc::new(hammer),
        }
    }

    /// `P = max(1, min(N, ceil(N/D) · safety_factor))`, capped at the hard
    /// ceiling; debug mode runs a single VU.
    pub fn pool_size(&self) -> usize {
        if self.hammer.debug {
            return 1;
        }
        let n = self.hammer.effective_iteration_count();
        let d = self.hammer.effective_duration_secs().max(1);
        let per_second = n.div_ceil(d);
        let sized = (per_second * SAFETY_FACTOR).min(n).max(1);
        (sized as usize).min(HARD_POOL_CEILING)
    }

    /// Run the plan to completion or cancellation and emit the summary
    /// through `sink`.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        sink: Box<dyn ReportSink>,
    ) -> Result<SummarySnapshot, EngineError> {
        let hammer = &self.hammer;
        let n = hammer.effective_iteration_count();
        let d = hammer.effective_duration_secs();
        let ticks = plan_ticks(n, d, hammer.load_shape, &hammer.manual_buckets);
        let pool = self.pool_size();

        info!(
            iterations = n,
            duration_secs = d,
            pool,
            debug = hammer.debug,
            "engine starting"
        );

        let runner = ScenarioRunner::new(Arc::clone(hammer), Default::default());
        let (report_tx, pipeline_handle) = pipeline::start(
            sink,
            PipelineConfig {
                capacity: pool * 10,
                sampling_rate: hammer.sampling_rate,
                debug: hammer.debug,
            },
        );

        let (tick_tx, tick_rx) = mpsc::channel::<u64>(pool);
        let tick_rx = Arc::new(tokio::sync::Mutex::new(tick_rx));

        let mut vu_handles = Vec::with_capacity(pool);
        for _ in 0..pool {
            vu_handles.push(tokio::spawn(vu_loop(
                runner.clone(),
                Arc::clone(&tick_rx),
                report_tx.clone(),
                cancel.clone(),
            )));
        }

        let started = Instant::now();
        let mut dispatched: u64 = 0;
        let mut overruns: u64 = 0;
        let mut widened = false;

        'dispatch: for (index, offset) in ticks.iter().enumerate() {
            if !sleep_until_or_cancelled(started + *offset, &cancel).await {
                info!(dispatched, "dispatch stopped by cancellation");
                break;
            }
            let iteration_id = index as u64 + 1;

            match timeout(LAG_BUDGET, tick_tx.send(iteration_id)).await {
                Ok(Ok(())) => {
                    dispatched += 1;
                    continue;
                }
                Ok(Err(_)) => break 'dispatch,
                Err(_) => {}
            }

            if !widened {
                widened = true;
                let grow = pool.min(HARD_POOL_CEILING.saturating_sub(vu_handles.len()));
                warn!(grow, "lag budget exceeded, widening VU pool");
                for _ in 0..grow {
                    vu_handles.push(tokio::spawn(vu_loop(
                        runner.clone(),
                        Arc::clone(&tick_rx),
                        report_tx.clone(),
                        cancel.clone(),
                    )));
                }
                match timeout(LAG_BUDGET, tick_tx.send(iteration_id)).await {
                    Ok(Ok(())) => {
                        dispatched += 1;
                        continue;
                    }
                    Ok(Err(_)) => break 'dispatch,
                    Err(_) => {
                        overruns += 1;
                        debug!(iteration_id, "tick dropped after widening");
                    }
                }
            } else {
                overruns += 1;
                debug!(iteration_id, "tick dropped, pool already widened");
            }
        }

        drop(tick_tx);
        for handle in vu_handles {
            let _ = handle.await;
        }
        drop(report_tx);

        let (mut summary, mut sink) = pipeline_handle
            .await
            .map_err(|e| EngineError::PipelineJoin(e.to_string()))?;
        summary.dispatched = dispatched;
        summary.overruns = overruns;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        let snapshot = summary.snapshot();
        sink.done(&snapshot).await;

        info!(
            iterations = snapshot.iterations,
            dispatched,
            overruns,
            elapsed_ms = snapshot.elapsed_ms,
            "engine finished"
        );
        Ok(snapshot)
    }
}

/// One virtual user: take ticks until the channel closes or the run is
/// cancelled, running a full scenario iteration per tick. The current
/// iteration always runs to completion; cancellation only stops new work.
async fn vu_loop(
    runner: ScenarioRunner,
    tick_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<u64>>>,
    report_tx: mpsc::Sender<IterationReport>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = tick_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = rx.recv() => next,
            }
        };
        let Some(iteration_id) = next else { break };

        let report = runner.run_iteration(iteration_id, &cancel).await;
        // A full queue backpressures the VU here on purpose.
        if report_tx.send(report).await.is_err() {
            break;
        }
    }
}

/// Sleep until `target`, spinning out the final stretch because the timer
/// wheel is only millisecond-accurate. Returns false when cancelled first.
async fn sleep_until_or_cancelled(target: Instant, cancel: &CancellationToken) -> bool {
    loop {
        let now = Instant::now();
        if now >= target {
            return true;
        }
        if target - now > SPIN_THRESHOLD {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(target - SPIN_THRESHOLD) => {}
            }
        } else {
            while Instant::now() < target {
                if cancel.is_cancelled() {
                    return false;
                }
                std::hint::spin_loop();
            }
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{
        LoadShape, ProxyPolicy, ReportDestination, Scenario, SleepSpec, Step, StepOptions,
    };
    use std::collections::HashMap;

    fn hammer(n: u64, d: u64, debug: bool) -> Hammer {
        Hammer {
            iteration_count: n,
            duration_secs: d,
            load_shape: LoadShape::Linear,
            manual_buckets: Vec::new(),
            scenario: Scenario {
                envs: HashMap::new(),
                data: HashMap::new(),
                steps: vec![Step {
                    id: 1,
                    name: "s".into(),
                    method: "GET".into(),
                    url: "http://127.0.0.1:9/".into(),
                    headers: Vec::new(),
                    payload: Vec::new(),
                    auth: None,
                    timeout_secs: 5,
                    sleep: SleepSpec::None,
                    tls: None,
                    captures: Vec::new(),
                    assertions: Vec::new(),
                    options: StepOptions::default(),
                }],
            },
            proxy: ProxyPolicy::None,
            report_destination: ReportDestination::Stdout,
            debug,
            sampling_rate: 0,
        }
    }

    #[test]
    fn pool_size_scales_with_rate() {
        assert_eq!(Engine::new(hammer(100, 10, false)).pool_size(), 100);
        assert_eq!(Engine::new(hammer(1, 1, false)).pool_size(), 1);
        assert_eq!(Engine::new(hammer(3, 30, false)).pool_size(), 3);
        // Hard ceiling bounds very hot plans.
        assert_eq!(Engine::new(hammer(50_000, 1, false)).pool_size(), 1000);
    }

    #[test]
    fn debug_mode_forces_single_vu() {
        assert_eq!(Engine::new(hammer(100, 10, true)).pool_size(), 1);
    }

    #[tokio::test]
    async fn sleep_until_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let target = Instant::now() + Duration::from_secs(30);
        assert!(!sleep_until_or_cancelled(target, &cancel).await);
    }
}
