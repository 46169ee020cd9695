use chrono::Utc;
use uuid::Uuid;

use crate::config::FailurePolicy;
use crate::error::{EngineError, ErrorKind, PlanError};
use crate::history::ExecutionRecord;

use super::graph::StepGraph;
use super::plan::PlannedStep;
use super::transitions::{StepTransition, TaskTransition, TransitionError};
use super::types::{
    SkipReason, Step, StepArtifacts, StepId, StepStatus, Task, TaskProgress, TaskStatus,
};

/// Sole owner of a [`Task`]. Callers share it behind a per-task mutex so that
/// every mutation is serialized.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    task: Task,
    graph: StepGraph,
    policy: FailurePolicy,
}

impl TaskStateMachine {
    /// Build a task from planner output. Rejects empty, duplicate, dangling and cyclic plans.
    pub fn plan(
        description: impl Into<String>,
        planned: Vec<PlannedStep>,
        max_retries: u32,
        policy: FailurePolicy,
    ) -> Result<Self, PlanError> {
        Self::plan_as(Uuid::new_v4().to_string(), description, planned, max_retries, policy)
    }

    /// Same as [`TaskStateMachine::plan`] with a caller-chosen task id, so events and
    /// checkpoints written while planning already belong to the task.
    pub fn plan_as(
        task_id: impl Into<String>,
        description: impl Into<String>,
        planned: Vec<PlannedStep>,
        max_retries: u32,
        policy: FailurePolicy,
    ) -> Result<Self, PlanError> {
        let keys: Vec<String> = planned
            .iter()
            .enumerate()
            .map(|(i, p)| {
                p.id.as_ref()
                    .map(|r| r.as_key())
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| (i + 1).to_string())
            })
            .collect();

        let graph = StepGraph::build(keys.iter().cloned().zip(
            planned
                .iter()
                .map(|p| p.dependencies.iter().map(|d| d.as_key()).collect()),
        ))?;

        let task_id = task_id.into();
        let steps = planned
            .into_iter()
            .zip(keys)
            .enumerate()
            .map(|(i, (p, key))| Step {
                id: StepId(i),
                task_id: task_id.clone(),
                key,
                description: p.description,
                language: p.language.filter(|l| !l.trim().is_empty()),
                code: p.code.filter(|c| !c.trim().is_empty()),
                dependencies: graph.dependencies(i).iter().map(|&d| StepId(d)).collect(),
                status: StepStatus::Pending,
                skip_reason: None,
                retry_count: 0,
                max_retries: max_retries.max(1),
                artifacts: StepArtifacts::default(),
            })
            .collect();

        let now = Utc::now();
        let task = Task {
            id: task_id,
            description: description.into(),
            steps,
            status: TaskStatus::Planned,
            created_at: now,
            updated_at: now,
        };

        tracing::info!(
            task_id = %task.id,
            steps = task.steps.len(),
            "task planned"
        );

        Ok(Self {
            task,
            graph,
            policy,
        })
    }

    /// Rebuild from a persisted snapshot.
    pub fn from_task(task: Task, policy: FailurePolicy) -> Result<Self, PlanError> {
        let graph = StepGraph::build(task.steps.iter().map(|s| {
            (
                s.key.clone(),
                s.dependencies
                    .iter()
                    .filter_map(|d| task.steps.get(d.0).map(|dep| dep.key.clone()))
                    .collect(),
            )
        }))?;
        Ok(Self {
            task,
            graph,
            policy,
        })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn step(&self, id: StepId) -> Result<&Step, EngineError> {
        self.task
            .steps
            .get(id.0)
            .ok_or_else(|| EngineError::StepNotFound(id.to_string()))
    }

    pub fn is_terminal(&self) -> bool {
        self.task.status.is_terminal()
    }

    /// Planned -> Running, or Paused -> Running.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.task.status == TaskStatus::Running {
            return Ok(());
        }
        self.set_task_status(TaskStatus::Running)
    }

    pub fn pause(&mut self) -> Result<(), TransitionError> {
        if self.task.status == TaskStatus::Paused {
            return Ok(());
        }
        self.set_task_status(TaskStatus::Paused)
    }

    /// Promote every Pending step whose dependencies are all Completed, then return
    /// all Ready steps in creation order. Calling it again without intervening
    /// mutations returns the same set.
    pub fn advance(&mut self) -> Vec<StepId> {
        if self.task.status != TaskStatus::Running {
            return Vec::new();
        }

        let promotable: Vec<usize> = (0..self.task.steps.len())
            .filter(|&i| {
                self.task.steps[i].status == StepStatus::Pending && self.dependencies_met(i)
            })
            .collect();
        if !promotable.is_empty() {
            for &i in &promotable {
                self.task.steps[i].status = StepStatus::Ready;
            }
            self.touch();
        }

        self.task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Ready)
            .map(|s| s.id)
            .collect()
    }

    /// Start one attempt: the step goes to Running and its shared attempt counter
    /// increments. Returns the 1-based attempt number.
    pub fn begin_attempt(&mut self, id: StepId) -> Result<u32, EngineError> {
        self.ensure_live()?;
        let step = self.step(id)?;
        StepTransition::validate(id, step.status, StepStatus::Running)?;
        if !self.dependencies_met(id.0) {
            return Err(TransitionError::DependenciesUnmet { step: id }.into());
        }
        if step.retry_count >= step.max_retries {
            return Err(TransitionError::AttemptsExhausted {
                step: id,
                attempts: step.retry_count,
                max: step.max_retries,
            }
            .into());
        }

        let step = &mut self.task.steps[id.0];
        step.status = StepStatus::Running;
        step.retry_count += 1;
        let attempt = step.retry_count;
        self.touch();
        Ok(attempt)
    }

    /// Record the outcome of the running attempt. Success completes the step. A failure
    /// returns it to Pending while attempts remain, otherwise it fails terminally and the
    /// failure policy is applied.
    pub fn complete_step(
        &mut self,
        id: StepId,
        record: &ExecutionRecord,
    ) -> Result<StepStatus, EngineError> {
        self.ensure_live()?;
        let current = self.step(id)?.status;
        if current != StepStatus::Running {
            return Err(TransitionError::InvalidStep {
                step: id,
                from: current,
                to: if record.success {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                },
            }
            .into());
        }

        let step = &mut self.task.steps[id.0];
        step.artifacts.records.push(record.id);
        step.artifacts.code = Some(record.code.clone());

        let next = if record.success {
            step.artifacts.output = Some(record.stdout.clone());
            step.artifacts.last_error = None;
            step.artifacts.error_kind = None;
            StepStatus::Completed
        } else {
            step.artifacts.last_error = Some(record.failure_summary());
            step.artifacts.error_kind = record.error_kind();
            if step.retry_count < step.max_retries {
                StepStatus::Pending
            } else {
                StepStatus::Failed
            }
        };
        step.status = next;

        tracing::debug!(
            target: "autopilot.flow",
            task_id = %self.task.id,
            step = %id,
            attempt = record.attempt,
            status = ?next,
            "step attempt recorded"
        );

        if next == StepStatus::Failed {
            self.on_terminal_failure(id);
        }
        self.settle();
        Ok(next)
    }

    /// Complete a step whose generated answer contained no code to run.
    pub fn complete_without_execution(
        &mut self,
        id: StepId,
        output: String,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        let step = self.step(id)?;
        StepTransition::validate(id, step.status, StepStatus::Completed)?;
        if !self.dependencies_met(id.0) {
            return Err(TransitionError::DependenciesUnmet { step: id }.into());
        }
        let step = &mut self.task.steps[id.0];
        step.status = StepStatus::Completed;
        step.artifacts.output = Some(output);
        self.settle();
        Ok(())
    }

    /// Fail a step without consuming retries, for structural errors such as a
    /// safety rejection or an unsupported language.
    pub fn fail_step(
        &mut self,
        id: StepId,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        let step = self.step(id)?;
        StepTransition::validate(id, step.status, StepStatus::Failed)?;
        let step = &mut self.task.steps[id.0];
        step.status = StepStatus::Failed;
        step.artifacts.last_error = Some(message.into());
        step.artifacts.error_kind = Some(kind);
        self.on_terminal_failure(id);
        self.settle();
        Ok(())
    }

    /// Explicitly skip a step. Its dependents still need it Completed, so they are
    /// skipped along with it as `DependencySkipped`. Both count towards completion.
    pub fn skip_step(&mut self, id: StepId) -> Result<(), EngineError> {
        self.ensure_live()?;
        let step = self.step(id)?;
        StepTransition::validate(id, step.status, StepStatus::Skipped)?;
        self.mark_skipped(id.0, SkipReason::Requested);
        for d in self.graph.transitive_dependents(id.0) {
            if !self.task.steps[d].status.is_terminal() {
                self.mark_skipped(d, SkipReason::DependencySkipped);
            }
        }
        self.settle();
        Ok(())
    }

    pub fn set_code(&mut self, id: StepId, code: impl Into<String>) -> Result<(), EngineError> {
        self.step(id)?;
        self.task.steps[id.0].artifacts.code = Some(code.into());
        Ok(())
    }

    /// Cancel the task: every non-terminal step is skipped as Cancelled.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::TaskTerminal {
                state: self.task.status,
            });
        }
        for i in 0..self.task.steps.len() {
            if !self.task.steps[i].status.is_terminal() {
                self.mark_skipped(i, SkipReason::Cancelled);
            }
        }
        self.set_task_status(TaskStatus::Cancelled)
    }

    /// Force the task to Failed, e.g. when continuation is exhausted during planning.
    pub fn abort(&mut self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Ok(());
        }
        for i in 0..self.task.steps.len() {
            if !self.task.steps[i].status.is_terminal() {
                self.mark_skipped(i, SkipReason::Cancelled);
            }
        }
        self.set_task_status(TaskStatus::Failed)
    }

    /// After a crash, attempts that were running never reported back. Put them back
    /// to Pending so they run again; their counter keeps the attempt that was lost.
    pub fn reset_interrupted(&mut self) -> Vec<StepId> {
        let mut reset = Vec::new();
        for step in self.task.steps.iter_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
                reset.push(step.id);
            }
        }
        if !reset.is_empty() {
            self.touch();
        }
        reset
    }

    pub fn progress(&self) -> TaskProgress {
        let mut p = TaskProgress {
            total: self.task.steps.len(),
            ..TaskProgress::default()
        };
        for step in &self.task.steps {
            match step.status {
                StepStatus::Pending => p.pending += 1,
                StepStatus::Ready => p.ready += 1,
                StepStatus::Running => p.running += 1,
                StepStatus::Completed => p.completed += 1,
                StepStatus::Failed => p.failed += 1,
                StepStatus::Skipped => p.skipped += 1,
            }
        }
        if p.total > 0 {
            p.percent = ((p.completed + p.failed + p.skipped) as f64 / p.total as f64) * 100.0;
        }
        p
    }

    /// True while any step can still make progress.
    pub fn has_live_steps(&self) -> bool {
        self.task.steps.iter().any(|s| {
            matches!(
                s.status,
                StepStatus::Pending | StepStatus::Ready | StepStatus::Running
            )
        })
    }

    fn dependencies_met(&self, i: usize) -> bool {
        self.graph
            .dependencies(i)
            .iter()
            .all(|&d| self.task.steps[d].status == StepStatus::Completed)
    }

    fn on_terminal_failure(&mut self, id: StepId) {
        let affected: Vec<usize> = match self.policy {
            FailurePolicy::IsolateBranch => self.graph.transitive_dependents(id.0),
            FailurePolicy::FailFast => (0..self.task.steps.len()).collect(),
        };
        for i in affected {
            if !self.task.steps[i].status.is_terminal() {
                self.mark_skipped(i, SkipReason::DependencyFailed);
            }
        }
        tracing::warn!(
            task_id = %self.task.id,
            step = %id,
            policy = ?self.policy,
            error.kind = ?self.task.steps[id.0].artifacts.error_kind,
            error.message = self.task.steps[id.0].artifacts.last_error.as_deref().unwrap_or(""),
            "step failed terminally"
        );
    }

    fn mark_skipped(&mut self, i: usize, reason: SkipReason) {
        let step = &mut self.task.steps[i];
        step.status = StepStatus::Skipped;
        step.skip_reason = Some(reason);
    }

    /// Move the task to its terminal state once no step can make progress.
    fn settle(&mut self) {
        if self.is_terminal() || self.has_live_steps() {
            self.touch();
            return;
        }
        let all_done = self.task.steps.iter().all(|s| {
            s.status == StepStatus::Completed
                || (s.status == StepStatus::Skipped
                    && matches!(
                        s.skip_reason,
                        Some(SkipReason::Requested | SkipReason::DependencySkipped)
                    ))
        });
        let next = if all_done {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if let Err(err) = self.set_task_status(next) {
            tracing::error!(task_id = %self.task.id, error = %err, "task settle rejected");
        }
    }

    fn ensure_live(&self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::TaskTerminal {
                state: self.task.status,
            });
        }
        Ok(())
    }

    fn set_task_status(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        TaskTransition::validate(self.task.status, to)?;
        tracing::info!(
            task_id = %self.task.id,
            from = %self.task.status,
            to = %to,
            "task status changed"
        );
        self.task.status = to;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.task.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ErrorClass;
    use pretty_assertions::assert_eq;

    fn plan(steps: Vec<PlannedStep>, policy: FailurePolicy) -> TaskStateMachine {
        let mut m = TaskStateMachine::plan("demo", steps, 2, policy).unwrap();
        m.start().unwrap();
        m
    }

    fn record(m: &TaskStateMachine, id: StepId, success: bool) -> ExecutionRecord {
        let step = m.step(id).unwrap();
        ExecutionRecord {
            id: Uuid::new_v4(),
            task_id: Some(m.id().to_string()),
            step_id: Some(id),
            attempt: step.retry_count,
            language: "python".into(),
            code: "print(1)".into(),
            stdout: if success { "1\n".into() } else { String::new() },
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: Some(if success { 0 } else { 1 }),
            duration_ms: 1,
            success,
            error: (!success).then(|| ErrorClass {
                kind: ErrorKind::Runtime,
                message: "boom".into(),
                exception: None,
            }),
            created_at: Utc::now(),
        }
    }

    fn run_ok(m: &mut TaskStateMachine, id: StepId) {
        m.begin_attempt(id).unwrap();
        let r = record(m, id, true);
        assert_eq!(m.complete_step(id, &r).unwrap(), StepStatus::Completed);
    }

    fn chain() -> Vec<PlannedStep> {
        vec![
            PlannedStep::new("a").with_id("a"),
            PlannedStep::new("b").with_id("b").depends_on("a"),
            PlannedStep::new("c").with_id("c"),
            PlannedStep::new("d").with_id("d").depends_on("b"),
        ]
    }

    #[test]
    fn advance_is_idempotent_and_ordered() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        assert_eq!(m.advance(), vec![StepId(0), StepId(2)]);
        assert_eq!(m.advance(), vec![StepId(0), StepId(2)]);
    }

    #[test]
    fn every_step_becomes_ready_exactly_once() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        let mut started = Vec::new();
        loop {
            let ready = m.advance();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                started.push(id);
                run_ok(&mut m, id);
            }
        }
        started.sort();
        assert_eq!(started, vec![StepId(0), StepId(1), StepId(2), StepId(3)]);
        assert_eq!(m.status(), TaskStatus::Completed);
    }

    /// Deterministic generator so every run walks the same graphs.
    struct Lcg(u64);

    impl Lcg {
        fn next_u64(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            self.0 >> 33
        }

        fn below(&mut self, n: usize) -> usize {
            (self.next_u64() % n as u64) as usize
        }
    }

    /// Random DAG: edges only point from higher to lower rank, and the creation
    /// order is shuffled so dependencies appear on both sides of a step.
    fn random_dag(rng: &mut Lcg) -> Vec<PlannedStep> {
        let n = 1 + rng.below(12);
        let mut steps: Vec<PlannedStep> = Vec::with_capacity(n);
        for i in 0..n {
            let mut step = PlannedStep::new(format!("s{i}")).with_id(format!("s{i}"));
            for j in 0..i {
                if rng.below(3) == 0 {
                    step = step.depends_on(format!("s{j}"));
                }
            }
            steps.push(step);
        }
        for i in (1..n).rev() {
            let j = rng.below(i + 1);
            steps.swap(i, j);
        }
        steps
    }

    #[test]
    fn generated_graphs_release_each_step_exactly_once() {
        let mut rng = Lcg(0x5eed);
        for round in 0..200 {
            let mut m = plan(random_dag(&mut rng), FailurePolicy::IsolateBranch);
            let n = m.task().steps.len();
            let mut runs = vec![0usize; n];
            loop {
                let ready = m.advance();
                if ready.is_empty() {
                    break;
                }
                // Start a random non-empty subset; the rest must still be Ready next time.
                for (k, id) in ready.into_iter().enumerate() {
                    if k > 0 && rng.below(2) == 0 {
                        continue;
                    }
                    let step = m.step(id).unwrap();
                    assert!(step
                        .dependencies
                        .iter()
                        .all(|d| m.step(*d).unwrap().status == StepStatus::Completed));
                    runs[id.0] += 1;
                    run_ok(&mut m, id);
                }
            }
            assert!(runs.iter().all(|&r| r == 1), "round {round}: {runs:?}");
            assert_eq!(m.status(), TaskStatus::Completed, "round {round}");
        }
    }

    #[test]
    fn unmet_dependency_blocks_running() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        m.advance();
        let err = m.begin_attempt(StepId(1)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Transition(TransitionError::DependenciesUnmet { .. })
        ));
    }

    #[test]
    fn failure_retries_until_counter_is_spent() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        m.advance();
        let a = StepId(0);

        assert_eq!(m.begin_attempt(a).unwrap(), 1);
        let r = record(&m, a, false);
        assert_eq!(m.complete_step(a, &r).unwrap(), StepStatus::Pending);

        assert_eq!(m.begin_attempt(a).unwrap(), 2);
        let r = record(&m, a, false);
        assert_eq!(m.complete_step(a, &r).unwrap(), StepStatus::Failed);

        assert!(m.begin_attempt(a).is_err());
        assert_eq!(m.step(a).unwrap().artifacts.records.len(), 2);
    }

    #[test]
    fn isolate_branch_keeps_independent_work_going() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        m.advance();
        m.fail_step(StepId(0), ErrorKind::SafetyRejected, "nope").unwrap();

        let b = m.step(StepId(1)).unwrap();
        assert_eq!(b.status, StepStatus::Skipped);
        assert_eq!(b.skip_reason, Some(SkipReason::DependencyFailed));
        assert_eq!(m.step(StepId(3)).unwrap().status, StepStatus::Skipped);
        assert_eq!(m.status(), TaskStatus::Running);

        assert_eq!(m.advance(), vec![StepId(2)]);
        run_ok(&mut m, StepId(2));
        assert_eq!(m.status(), TaskStatus::Failed);
    }

    #[test]
    fn fail_fast_stops_everything() {
        let mut m = plan(chain(), FailurePolicy::FailFast);
        m.advance();
        m.fail_step(StepId(0), ErrorKind::UnsupportedLanguage, "cobol").unwrap();
        assert_eq!(m.status(), TaskStatus::Failed);
        assert_eq!(m.step(StepId(2)).unwrap().status, StepStatus::Skipped);
    }

    #[test]
    fn requested_skip_still_completes_task() {
        let mut m = plan(
            vec![PlannedStep::new("x"), PlannedStep::new("y")],
            FailurePolicy::IsolateBranch,
        );
        m.advance();
        run_ok(&mut m, StepId(0));
        m.skip_step(StepId(1)).unwrap();
        assert_eq!(m.status(), TaskStatus::Completed);
    }

    #[test]
    fn skipping_a_step_skips_its_subtree_distinctly() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        m.advance();
        m.skip_step(StepId(0)).unwrap();

        assert_eq!(m.step(StepId(0)).unwrap().skip_reason, Some(SkipReason::Requested));
        for dependent in [StepId(1), StepId(3)] {
            let s = m.step(dependent).unwrap();
            assert_eq!(s.status, StepStatus::Skipped);
            assert_eq!(s.skip_reason, Some(SkipReason::DependencySkipped));
        }
        assert_eq!(m.status(), TaskStatus::Running);

        assert_eq!(m.advance(), vec![StepId(2)]);
        run_ok(&mut m, StepId(2));
        assert_eq!(m.status(), TaskStatus::Completed);
    }

    #[test]
    fn cancel_skips_live_steps() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        m.advance();
        m.begin_attempt(StepId(0)).unwrap();
        m.cancel().unwrap();
        assert_eq!(m.status(), TaskStatus::Cancelled);
        assert!(m
            .task()
            .steps
            .iter()
            .all(|s| s.skip_reason == Some(SkipReason::Cancelled)));
        assert!(m.begin_attempt(StepId(2)).is_err());
    }

    #[test]
    fn paused_task_releases_nothing() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        m.pause().unwrap();
        assert!(m.advance().is_empty());
        m.start().unwrap();
        assert_eq!(m.advance().len(), 2);
    }

    #[test]
    fn snapshot_roundtrip_rebuilds_graph() {
        let mut m = plan(chain(), FailurePolicy::IsolateBranch);
        m.advance();
        m.begin_attempt(StepId(0)).unwrap();

        let json = serde_json::to_string(m.task()).unwrap();
        let task: Task = serde_json::from_str(&json).unwrap();
        let mut restored = TaskStateMachine::from_task(task, FailurePolicy::IsolateBranch).unwrap();

        assert_eq!(restored.reset_interrupted(), vec![StepId(0)]);
        assert_eq!(restored.step(StepId(0)).unwrap().retry_count, 1);
        assert_eq!(restored.advance(), vec![StepId(0), StepId(2)]);
        assert_eq!(restored.progress().total, 4);
    }

    #[test]
    fn numeric_plan_ids_resolve() {
        let planned = crate::task::parse_plan(
            r#"{"steps":[{"id":1,"description":"w"},{"id":2,"description":"r","dependencies":[1]}]}"#,
        )
        .unwrap();
        let m = TaskStateMachine::plan("files", planned, 3, FailurePolicy::IsolateBranch).unwrap();
        assert_eq!(m.step(StepId(1)).unwrap().dependencies, vec![StepId(0)]);
    }

    #[test]
    fn cyclic_plan_is_invalid() {
        let err = TaskStateMachine::plan(
            "loop",
            vec![
                PlannedStep::new("a").with_id("a").depends_on("b"),
                PlannedStep::new("b").with_id("b").depends_on("a"),
            ],
            3,
            FailurePolicy::IsolateBranch,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::CircularDependency(_)));
    }
}
