//! Pipeline orchestrator.
//!
//! One run per trigger. Stages inside a run are sequential awaits; separate
//! runs are independent tasks and only meet at environment locks. Every state
//! change is persisted to the [`RunStore`] and emitted to the [`EventSink`].
//!
//! A run carries exactly one digest from the moment it is built or resolved
//! until it finishes. Nothing downstream re-derives it from a tag.

mod events;
mod route;
mod runs;
mod state;
mod trigger;

pub use events::{EventSink, FanOut, RecordingSink, RunEvent, TracingSink};
pub use route::{Route, RouteError, RunKey};
pub use runs::{CancelRequest, ClaimError, PlanRef, RunFailure, RunRecord, RunRegistry, RunStore, generate_run_id};
pub use state::RunState;
pub use trigger::{ManualAction, Trigger, TriggerEvent, TriggerKind};

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::apply::{ApplyError, ApplyOutcome};
use crate::approval::ApprovalError;
use crate::artifact::{Digest, SourceRef, TagContext, TagError};
use crate::build::BuildError;
use crate::environment::Environment;
use crate::error::{Classify, FailureKind};
use crate::plan::{Plan, PlanError, PlanId, PlanRequest, PlanStatus};
use crate::promote::PromoteError;
use crate::record::RecordError;
use crate::resolve::{ResolveError, resolve};
use crate::services::{Services, ServicesError};
use crate::util::fs::JsonFileError;

/// Where in a run a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
  Route,
  Build,
  Resolve,
  Promote(String),
  Plan(String),
  Apply(String),
  Persist,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Stage::Route => f.write_str("route"),
      Stage::Build => f.write_str("build"),
      Stage::Resolve => f.write_str("resolve"),
      Stage::Promote(env) => write!(f, "promote({})", env),
      Stage::Plan(env) => write!(f, "plan({})", env),
      Stage::Apply(env) => write!(f, "apply({})", env),
      Stage::Persist => f.write_str("persist"),
    }
  }
}

/// The component error that stopped a run, unchanged.
#[derive(Debug, Error)]
pub enum StageError {
  #[error(transparent)]
  Route(#[from] RouteError),

  #[error(transparent)]
  Services(#[from] ServicesError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Promote(#[from] PromoteError),

  #[error(transparent)]
  Plan(#[from] PlanError),

  #[error(transparent)]
  Apply(#[from] ApplyError),

  #[error(transparent)]
  Record(#[from] RecordError),

  #[error(transparent)]
  RunStore(#[from] JsonFileError),

  #[error("tags for {environment}: {source}")]
  Tag {
    environment: String,
    #[source]
    source: TagError,
  },

  #[error(transparent)]
  Claim(#[from] ClaimError),

  #[error("run was cancelled")]
  Cancelled,
}

impl Classify for StageError {
  fn kind(&self) -> FailureKind {
    match self {
      StageError::Route(e) => e.kind(),
      StageError::Services(e) => e.kind(),
      StageError::Build(e) => e.kind(),
      StageError::Resolve(e) => e.kind(),
      StageError::Promote(e) => e.kind(),
      StageError::Plan(e) => e.kind(),
      StageError::Apply(e) => e.kind(),
      StageError::Record(e) => e.kind(),
      StageError::RunStore(_) => FailureKind::Storage,
      StageError::Tag { .. } => FailureKind::Configuration,
      StageError::Claim(e) => e.kind(),
      StageError::Cancelled => FailureKind::Cancelled,
    }
  }
}

#[derive(Debug, Error)]
#[error("run {run_id} failed at {stage}: {source}")]
pub struct PipelineError {
  pub run_id: String,
  pub stage: Stage,
  #[source]
  pub source: StageError,
}

impl Classify for PipelineError {
  fn kind(&self) -> FailureKind {
    self.source.kind()
  }
}

type StageResult<T> = Result<T, (Stage, StageError)>;

fn at<E: Into<StageError>>(stage: Stage) -> impl FnOnce(E) -> (Stage, StageError) {
  move |e| (stage, e.into())
}

/// Mutable view of one run while it executes.
struct Run<'a> {
  record: RunRecord,
  cancel: CancellationToken,
  orchestrator: &'a Orchestrator,
}

impl Run<'_> {
  fn enter(&mut self, state: RunState, detail: Option<String>) {
    self.record.state = state.clone();
    if let Err(e) = self.orchestrator.store.save(&self.record) {
      warn!(run_id = %self.record.run_id, error = %e, "failed to persist run state");
    }
    self.orchestrator.events.emit(&RunEvent {
      run_id: self.record.run_id.clone(),
      at: Utc::now(),
      state,
      detail,
    });
  }

  fn ensure_active(&self, stage: &Stage) -> StageResult<()> {
    if self.orchestrator.registry.cancel_requested(&self.record.run_id) {
      self.cancel.cancel();
    }
    if self.cancel.is_cancelled() {
      return Err((stage.clone(), StageError::Cancelled));
    }
    Ok(())
  }

  fn tag_context(&self, env: &Environment, source: Option<&SourceRef>, release: Option<&str>) -> TagContext {
    let mut ctx = TagContext::new(&env.name).run(&self.record.run_id);
    if let Some(source) = source {
      ctx = ctx.source(source);
    }
    if let Some(release) = release {
      ctx = ctx.release(release);
    }
    ctx
  }
}

pub struct Orchestrator {
  services: Arc<Services>,
  registry: RunRegistry,
  store: RunStore,
  events: Arc<dyn EventSink>,
}

impl Orchestrator {
  pub fn new(services: Arc<Services>, events: Arc<dyn EventSink>) -> Self {
    let store = RunStore::new(services.paths.runs());
    let registry = RunRegistry::new(store.clone()).with_poll(services.config.pipeline.lock_poll);
    Self {
      services,
      registry,
      store,
      events,
    }
  }

  pub fn services(&self) -> &Services {
    &self.services
  }

  pub fn runs(&self) -> &RunStore {
    &self.store
  }

  pub fn registry(&self) -> &RunRegistry {
    &self.registry
  }

  /// Run the pipeline for one trigger to a terminal state.
  pub async fn handle(&self, event: TriggerEvent) -> Result<RunRecord, PipelineError> {
    let run_id = generate_run_id();
    let trigger = event.kind();
    let services = &self.services;

    let route = Route::for_trigger(&event, &services.config.triggers, &services.chain).map_err(|e| PipelineError {
      run_id: run_id.clone(),
      stage: Stage::Route,
      source: e.into(),
    })?;
    let key = route.key(trigger);
    let gated = route.is_gated(&services.chain);

    let cancel = self
      .registry
      .register(&key, &run_id, gated)
      .await
      .map_err(|e| PipelineError {
        run_id: run_id.clone(),
        stage: Stage::Route,
        source: e.into(),
      })?;
    let watcher = self.registry.watch(&run_id, cancel.clone());

    info!(run_id = %run_id, trigger = %trigger, route = %route, actor = %event.actor, "run started");
    let mut run = Run {
      record: RunRecord::new(run_id.clone(), trigger, route.clone(), event.actor.clone()),
      cancel,
      orchestrator: self,
    };
    run.enter(RunState::Triggered, Some(route.to_string()));

    let result = self.execute(&mut run, &event, &route).await;
    watcher.abort();
    if let Err(e) = self.registry.finish(&key, &run_id).await {
      warn!(run_id = %run_id, key = %key, error = %e, "failed to release run claim");
    }

    match result {
      Ok(terminal) => {
        run.record.finished_at = Some(Utc::now());
        run.enter(terminal, None);
        info!(run_id = %run_id, state = %run.record.state, "run finished");
        Ok(run.record)
      }
      Err((stage, source)) => {
        let kind = source.kind();
        run.record.finished_at = Some(Utc::now());
        run.record.failure = Some(RunFailure {
          kind,
          stage: stage.to_string(),
          message: source.to_string(),
        });
        run.enter(RunState::for_failure(kind), Some(source.to_string()));
        Err(PipelineError { run_id, stage, source })
      }
    }
  }

  async fn execute(&self, run: &mut Run<'_>, event: &TriggerEvent, route: &Route) -> StageResult<RunState> {
    match (route, &event.trigger) {
      (Route::Review { environment }, Trigger::ChangeProposal { source } | Trigger::Merge { source }) => {
        let env = self.environment(environment, Stage::Build)?;
        let digest = self.build(run, env, source).await?;
        self.plan(run, env, &digest, None).await?;
        Ok(RunState::PlannedForReview)
      }
      (Route::Deploy { environments }, Trigger::Merge { source } | Trigger::ChangeProposal { source }) => {
        self.deploy(run, environments, source).await?;
        Ok(RunState::Completed)
      }
      (
        Route::Release {
          source,
          target,
          require_chain,
        },
        Trigger::ReleaseTag { tag },
      ) => {
        self.release(run, source, target, *require_chain, tag).await?;
        Ok(RunState::Completed)
      }
      (Route::Manual { environment, action }, _) => {
        let env = self.environment(environment, Stage::Plan(environment.clone()))?;
        match action {
          ManualAction::Plan { digest, promoted_from } => {
            run.record.digest = Some(digest.clone());
            self.plan(run, env, digest, promoted_from.as_deref()).await?;
            Ok(RunState::PlannedForReview)
          }
          ManualAction::Apply { plan_id } => {
            let plan = self
              .services
              .plans
              .load(plan_id)
              .map_err(|e| (Stage::Apply(env.name.clone()), ApplyError::from(e).into()))?;
            run.record.digest = Some(plan.digest().clone());
            self.apply(run, env, &plan).await?;
            Ok(RunState::Completed)
          }
        }
      }
      (route, _) => {
        warn!(route = %route, trigger = %event.kind(), "trigger does not fit route");
        Err((Stage::Route, RouteError::NotConfigured(event.kind()).into()))
      }
    }
  }

  fn environment(&self, name: &str, stage: Stage) -> StageResult<&Environment> {
    self.services.environment(name).map_err(at(stage))
  }

  async fn build(&self, run: &mut Run<'_>, env: &Environment, source: &SourceRef) -> StageResult<Digest> {
    run.ensure_active(&Stage::Build)?;
    run.enter(RunState::Building, Some(source.revision.clone()));

    let tags = env
      .render_tags(&run.tag_context(env, Some(source), None))
      .map_err(|source| {
        (
          Stage::Build,
          StageError::Tag {
            environment: env.name.clone(),
            source,
          },
        )
      })?;
    let registry = self.services.registry(&env.name).map_err(at(Stage::Build))?;
    let output = self
      .services
      .builder
      .build(source, registry.as_ref(), &tags)
      .await
      .map_err(at(Stage::Build))?;

    run.record.digest = Some(output.digest.clone());
    Ok(output.digest)
  }

  async fn deploy(&self, run: &mut Run<'_>, environments: &[String], source: &SourceRef) -> StageResult<()> {
    let Some((first, rest)) = environments.split_first() else {
      return Ok(());
    };

    let first_env = self.environment(first, Stage::Build)?;
    let digest = self.build(run, first_env, source).await?;
    let plan = self.plan(run, first_env, &digest, None).await?;
    self.apply(run, first_env, &plan).await?;

    let mut previous = first_env;
    for name in rest {
      let env = self.environment(name, Stage::Promote(name.clone()))?;
      self
        .services
        .check_chain(&env.name, &digest)
        .map_err(at(Stage::Promote(name.clone())))?;
      self.promote(run, previous, env, &digest, Some(source), None).await?;
      let plan = self.plan(run, env, &digest, Some(&previous.name)).await?;
      self.apply(run, env, &plan).await?;
      previous = env;
    }
    Ok(())
  }

  async fn release(
    &self,
    run: &mut Run<'_>,
    source: &str,
    target: &str,
    require_chain: bool,
    tag: &str,
  ) -> StageResult<()> {
    let source_env = self.environment(source, Stage::Resolve)?;
    let target_env = self.environment(target, Stage::Promote(target.to_string()))?;

    run.ensure_active(&Stage::Resolve)?;
    run.enter(RunState::Resolving, Some(tag.to_string()));
    let registry = self.services.registry(source).map_err(at(Stage::Resolve))?;
    let resolved = resolve(registry.as_ref(), tag, &self.services.config.retry)
      .await
      .map_err(at(Stage::Resolve))?;
    let digest = resolved.digest;
    run.record.digest = Some(digest.clone());

    if require_chain {
      self
        .services
        .check_chain(target, &digest)
        .map_err(at(Stage::Promote(target.to_string())))?;
    }

    self.promote(run, source_env, target_env, &digest, None, Some(tag)).await?;
    let plan = self.plan(run, target_env, &digest, Some(source)).await?;
    self.apply(run, target_env, &plan).await?;
    Ok(())
  }

  async fn promote(
    &self,
    run: &mut Run<'_>,
    from: &Environment,
    to: &Environment,
    digest: &Digest,
    source: Option<&SourceRef>,
    release: Option<&str>,
  ) -> StageResult<()> {
    let stage = Stage::Promote(to.name.clone());
    run.ensure_active(&stage)?;
    run.enter(RunState::Promoting(to.name.clone()), Some(digest.to_string()));

    let tags = to.render_tags(&run.tag_context(to, source, release)).map_err(|source| {
      (
        stage.clone(),
        StageError::Tag {
          environment: to.name.clone(),
          source,
        },
      )
    })?;
    let source_registry = self.services.registry(&from.name).map_err(at(stage.clone()))?;
    let target_registry = self.services.registry(&to.name).map_err(at(stage.clone()))?;

    self
      .services
      .promoter
      .promote(from, source_registry.as_ref(), to, target_registry.as_ref(), digest, &tags)
      .await
      .map_err(at(stage))?;
    Ok(())
  }

  async fn plan(
    &self,
    run: &mut Run<'_>,
    env: &Environment,
    digest: &Digest,
    promoted_from: Option<&str>,
  ) -> StageResult<Plan> {
    let stage = Stage::Plan(env.name.clone());
    run.ensure_active(&stage)?;
    run.enter(RunState::Planning(env.name.clone()), None);

    let mut request = PlanRequest::new(digest.clone(), run.record.actor.clone()).run(run.record.run_id.clone());
    if let Some(source) = promoted_from {
      request = request.promoted_from(source);
    }
    let plan = self.services.planner.plan(env, &request).await.map_err(at(stage))?;

    run.record.plans.push(PlanRef {
      environment: env.name.clone(),
      plan_id: plan.id.clone(),
    });
    Ok(plan)
  }

  async fn apply(&self, run: &mut Run<'_>, env: &Environment, plan: &Plan) -> StageResult<ApplyOutcome> {
    let stage = Stage::Apply(env.name.clone());
    run.ensure_active(&stage)?;

    let mut ctx = self.services.apply_context(&run.record.actor);
    ctx.run_id = Some(run.record.run_id.clone());
    ctx.wait_for_approval = true;
    ctx.cancel = run.cancel.clone();

    if plan.body.requires_approval {
      run.enter(RunState::Approving(env.name.clone()), Some(plan.id.to_string()));
      let gate = &self.services.gate;
      if let Err(e) = gate.wait(plan, ctx.approval_poll, ctx.approval_timeout, &ctx.cancel).await {
        if matches!(e, ApprovalError::Rejected { .. })
          && let Err(store_err) = self
            .services
            .plans
            .set_status(&plan.id, PlanStatus::Rejected, Some(e.to_string()))
        {
          warn!(plan_id = %plan.id, error = %store_err, "failed to mark plan rejected");
        }
        return Err((stage, ApplyError::from(e).into()));
      }
    }

    run.enter(RunState::Applying(env.name.clone()), Some(plan.id.to_string()));
    self.services.applier.apply(env, &plan.id, &ctx).await.map_err(at(stage))
  }

  /// Plan id of the run's plan for `environment`, if it got that far.
  pub fn plan_of(&self, run_id: &str, environment: &str) -> Result<Option<PlanId>, JsonFileError> {
    Ok(self.store.load(run_id)?.and_then(|r| r.plan_for(environment).cloned()))
  }
}
