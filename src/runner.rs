//! Scenario runtime: one complete iteration by a virtual user.
//!
//! Steps run strictly in order. Each iteration owns its environment map,
//! seeded from the plan's envs plus one row from every registered row
//! source; captures from earlier steps are visible to later ones. A
//! `TargetInvalid` step aborts the iteration, transport errors do not unless
//! the step opts into `abort-on-fail`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ErrorKind;
use crate::plan::Hammer;
use crate::report::{epoch_ms, IterationReport, StepReport};
use crate::requester::{ClientCache, HttpRequester};

/// Executes scenario iterations against a shared plan and client cache.
#[derive(Clone)]
pub struct ScenarioRunner {
    hammer: Arc<Hammer>,
    cache: ClientCache,
}

impl ScenarioRunner {
    pub fn new(hammer: Arc<Hammer>, cache: ClientCache) -> Self {
        Self { hammer, cache }
    }

    /// Build the iteration's starting environment: plan envs plus one row
    /// from each row source, exposed as `data.<source>.<tag>`.
    fn seed_env(&self) -> HashMap<String, Value> {
        let scenario = &self.hammer.scenario;
        let mut env = scenario.envs.clone();
        for (source_name, source) in &scenario.data {
            for (tag, value) in source.next_row() {
                env.insert(format!("data.{source_name}.{tag}"), value);
            }
        }
        env
    }

    /// Run one full scenario iteration.
    pub async fn run_iteration(
        &self,
        iteration_id: u64,
        cancel: &CancellationToken,
    ) -> IterationReport {
        let hammer = &self.hammer;
        let started_at_ms = epoch_ms();
        let mut env = self.seed_env();
        let step_count = hammer.scenario.steps.len();
        let mut step_reports = Vec::with_capacity(step_count);

        for (index, step) in hammer.scenario.steps.iter().enumerate() {
            let proxy = hammer.proxy.pick(iteration_id);

            let report = match HttpRequester::init(step, proxy, hammer.debug, &self.cache) {
                Ok(requester) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            StepReport::failed(step.id, &step.name, ErrorKind::Cancelled, 0)
                        }
                        report = requester.send(&env) => report,
                    }
                }
                Err(kind) => StepReport::failed(step.id, &step.name, kind, 0),
            };

            for (name, value) in &report.extracted_envs {
                env.insert(name.clone(), Value::String(value.clone()));
            }

            let abort = report
                .error_kind
                .as_ref()
                .map(|kind| kind.aborts_iteration() || step.options.abort_on_fail)
                .unwrap_or(false);
            step_reports.push(report);

            if abort {
                debug!(
                    iteration_id,
                    step = %step.name,
                    "aborting iteration after unrecoverable step"
                );
                break;
            }

            if index + 1 < step_count {
                if let Some(pause) = step.sleep.pick() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        IterationReport {
            iteration_id,
            started_at_ms,
            step_reports,
            env,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{
        LoadShape, ProxyPolicy, ReportDestination, Scenario, SleepSpec, Step, StepOptions,
    };

    fn hammer_with_steps(steps: Vec<Step>) -> Arc<Hammer> {
        Arc::new(Hammer {
            iteration_count: 1,
            duration_secs: 1,
            load_shape: LoadShape::Linear,
            manual_buckets: Vec::new(),
            scenario: Scenario {
                envs: HashMap::new(),
                data: HashMap::new(),
                steps,
            },
            proxy: ProxyPolicy::None,
            report_destination: ReportDestination::Stdout,
            debug: false,
            sampling_rate: 0,
        })
    }

    fn step(id: u16, method: &str, url: &str) -> Step {
        Step {
            id,
            name: format!("step-{id}"),
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            payload: Vec::new(),
            auth: None,
            timeout_secs: 5,
            sleep: SleepSpec::None,
            tls: None,
            captures: Vec::new(),
            assertions: Vec::new(),
            options: StepOptions::default(),
        }
    }

    #[tokio::test]
    async fn invalid_method_aborts_iteration_before_later_steps() {
        let hammer = hammer_with_steps(vec![
            step(1, ":31:31:#", "http://localhost:1/"),
            step(2, "GET", "http://localhost:1/never"),
        ]);
        let runner = ScenarioRunner::new(hammer, ClientCache::new());
        let cancel = CancellationToken::new();

        let report = runner.run_iteration(1, &cancel).await;
        assert_eq!(report.step_reports.len(), 1);
        assert!(matches!(
            report.step_reports[0].error_kind,
            Some(ErrorKind::TargetInvalid(_))
        ));
    }

    #[tokio::test]
    async fn transport_error_continues_to_next_step_by_default() {
        // Port 9 on localhost is expected to refuse connections.
        let hammer = hammer_with_steps(vec![
            step(1, "GET", "http://127.0.0.1:9/"),
            step(2, "GET", "http://127.0.0.1:9/second"),
        ]);
        let runner = ScenarioRunner::new(hammer, ClientCache::new());
        let cancel = CancellationToken::new();

        let report = runner.run_iteration(1, &cancel).await;
        assert_eq!(report.step_reports.len(), 2);
    }

    #[tokio::test]
    async fn abort_on_fail_stops_after_transport_error() {
        let mut first = step(1, "GET", "http://127.0.0.1:9/");
        first.options.abort_on_fail = true;
        let hammer = hammer_with_steps(vec![first, step(2, "GET", "http://127.0.0.1:9/second")]);
        let runner = ScenarioRunner::new(hammer, ClientCache::new());
        let cancel = CancellationToken::new();

        let report = runner.run_iteration(1, &cancel).await;
        assert_eq!(report.step_reports.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_steps() {
        let hammer = hammer_with_steps(vec![step(1, "GET", "http://127.0.0.1:9/")]);
        let runner = ScenarioRunner::new(hammer, ClientCache::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner.run_iteration(1, &cancel).await;
        assert_eq!(report.step_reports.len(), 1);
        assert_eq!(
            report.step_reports[0].error_kind,
            Some(ErrorKind::Cancelled)
        );
    }

    #[tokio::test]
    async fn env_seeds_from_plan_and_rows() {
        use crate::data_source::{CsvSpec, RowOrder, RowSource, VarKind, VarTag};

        let mut vars = HashMap::new();
        vars.insert(
            0,
            VarTag {
                tag: "city".into(),
                kind: VarKind::String,
            },
        );
        let spec = CsvSpec {
            path: "<memory>".into(),
            delimiter: b',',
            skip_first_line: false,
            skip_empty_line: true,
            allow_quota: false,
            vars,
            order: RowOrder::Sequential,
        };
        let source = RowSource::from_reader(&spec, "istanbul\n".as_bytes()).unwrap();

        let mut hammer = hammer_with_steps(vec![step(1, ":bad:", "http://x/")]);
        {
            let h = Arc::get_mut(&mut hammer).unwrap();
            h.scenario
                .envs
                .insert("base".into(), Value::String("v1".into()));
            h.scenario.data.insert("users".into(), source);
        }
        let runner = ScenarioRunner::new(hammer, ClientCache::new());
        let cancel = CancellationToken::new();

        let report = runner.run_iteration(1, &cancel).await;
        assert_eq!(report.env.get("base"), Some(&Value::String("v1".into())));
        assert_eq!(
            report.env.get("data.users.city"),
            Some(&Value::String("istanbul".into()))
        );
    }
}
