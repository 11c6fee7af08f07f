//! Stage pipeline
//!
//! A fixed, ordered list of stages run one after another on the shared
//! resources. Every stage except the final upload may fail without stopping
//! the run; its fact is then simply missing from the summary.

use crate::context::DaemonContext;
use crate::error::StageError;
use crate::executor::{self, ExecutorConfig, StageReport};
use crate::registry::{ModuleEntry, ModuleId, Registry};
use crate::resources::SharedResources;
use tracing::{info, warn};

/// What a stage hands its worker as argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput {
    None,
    /// A fixed status line
    Status(String),
    /// The summary of every fact gathered so far
    Summary,
}

/// Which fact a successful stage contributes to the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEffect {
    None,
    StoreImei,
    StorePhone,
    StoreMac,
    MarkCleaned,
}

/// What a failure of this stage means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and move on
    Continue,
    /// Stop the run and exit non-zero
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub module: ModuleId,
    pub input: StageInput,
    pub effect: StageEffect,
    pub policy: FailurePolicy,
}

impl Stage {
    #[must_use]
    pub fn new(module: ModuleId, input: StageInput, effect: StageEffect) -> Self {
        Stage {
            module,
            input,
            effect,
            policy: FailurePolicy::Continue,
        }
    }

    #[must_use]
    pub fn aborting(mut self) -> Self {
        self.policy = FailurePolicy::Abort;
        self
    }

    fn argument(&self, ctx: &DaemonContext) -> Option<String> {
        match &self.input {
            StageInput::None => None,
            StageInput::Status(line) => Some(line.clone()),
            StageInput::Summary => Some(ctx.summary()),
        }
    }
}

/// How a pipeline run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Every aborting stage succeeded
    Completed(DaemonContext),
    /// An aborting stage failed; gathered facts are discarded
    Aborted { module: ModuleId, error: StageError },
}

impl PipelineOutcome {
    /// Daemon exit status for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Completed(_) => 0,
            PipelineOutcome::Aborted { .. } => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    #[must_use]
    pub fn new(stages: Vec<Stage>) -> Self {
        Pipeline { stages }
    }

    /// The daemon flow: announce, clean, gather identities, announce, upload.
    #[must_use]
    pub fn standard() -> Self {
        Pipeline::new(vec![
            Stage::new(
                ModuleId::Logger,
                StageInput::Status("Starting daemon flow".into()),
                StageEffect::None,
            ),
            Stage::new(ModuleId::DbCleaner, StageInput::None, StageEffect::MarkCleaned),
            Stage::new(ModuleId::Imei, StageInput::None, StageEffect::StoreImei),
            Stage::new(ModuleId::Phone, StageInput::None, StageEffect::StorePhone),
            Stage::new(ModuleId::Mac, StageInput::None, StageEffect::StoreMac),
            Stage::new(
                ModuleId::Logger,
                StageInput::Status("All modules completed".into()),
                StageEffect::None,
            ),
            Stage::new(ModuleId::Sender, StageInput::Summary, StageEffect::None).aborting(),
        ])
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run every stage in order. Never reorders and never retries.
    pub fn run<E: ModuleEntry>(
        &self,
        resources: &mut SharedResources,
        registry: &Registry<E>,
        config: &ExecutorConfig,
    ) -> PipelineOutcome {
        let mut ctx = DaemonContext::new();

        for stage in &self.stages {
            let arg = stage.argument(&ctx);
            let report = executor::execute_stage(
                resources,
                registry,
                stage.module,
                arg.as_deref(),
                config,
            );

            if report.is_success() {
                apply(&mut ctx, stage.effect, &report);
                continue;
            }
            let Err(error) = report.outcome else {
                continue;
            };
            match stage.policy {
                FailurePolicy::Continue => {
                    warn!("{} failed, continuing: {}", stage.module, error);
                }
                FailurePolicy::Abort => {
                    warn!("{} failed, aborting run: {}", stage.module, error);
                    return PipelineOutcome::Aborted {
                        module: stage.module,
                        error,
                    };
                }
            }
        }

        info!("Pipeline completed: {}", ctx.summary());
        PipelineOutcome::Completed(ctx)
    }
}

fn apply(ctx: &mut DaemonContext, effect: StageEffect, report: &StageReport) {
    let slot = match effect {
        StageEffect::None => return,
        StageEffect::MarkCleaned => {
            ctx.db_cleaned = true;
            return;
        }
        StageEffect::StoreImei => &mut ctx.imei,
        StageEffect::StorePhone => &mut ctx.phone,
        StageEffect::StoreMac => &mut ctx.mac,
    };
    match report.text() {
        Some(value) => {
            info!("{}: {}", report.module, value);
            *slot = Some(value);
        }
        None => warn!("{} succeeded without a value", report.module),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::ipc::{Channel, Message};
    use crate::registry::{Identity, ModuleDescriptor};
    use nix::unistd;
    use std::time::Duration;

    enum Scripted {
        Reply(&'static str),
        Hang,
    }

    impl ModuleEntry for Scripted {
        fn run(&self, channel: &Channel, _arg: Option<&str>) -> Result<(), ProtocolError> {
            match self {
                Scripted::Reply(text) => {
                    let mut msg = Message::new();
                    msg.set_data(Some(text.as_bytes()));
                    channel.send(&msg)
                }
                Scripted::Hang => loop {
                    std::thread::sleep(Duration::from_secs(60));
                },
            }
        }
    }

    fn me() -> Identity {
        Identity {
            uid: unistd::getuid().as_raw(),
            gid: unistd::getgid().as_raw(),
            label: None,
        }
    }

    fn fast() -> ExecutorConfig {
        ExecutorConfig {
            ipc_timeout: Duration::from_millis(300),
            exit_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_standard_plan_order() {
        let plan = Pipeline::standard();
        let modules: Vec<_> = plan.stages().iter().map(|s| s.module).collect();
        assert_eq!(
            modules,
            vec![
                ModuleId::Logger,
                ModuleId::DbCleaner,
                ModuleId::Imei,
                ModuleId::Phone,
                ModuleId::Mac,
                ModuleId::Logger,
                ModuleId::Sender,
            ]
        );
        let aborting: Vec<_> = plan
            .stages()
            .iter()
            .filter(|s| s.policy == FailurePolicy::Abort)
            .map(|s| s.module)
            .collect();
        assert_eq!(aborting, vec![ModuleId::Sender]);
    }

    #[test]
    fn test_failed_gather_stage_is_skipped() {
        let registry = Registry::new([
            ModuleDescriptor::new(ModuleId::Imei, me(), Scripted::Reply("X")),
            ModuleDescriptor::new(ModuleId::Phone, me(), Scripted::Hang),
            ModuleDescriptor::new(ModuleId::Sender, me(), Scripted::Reply("ok")),
        ])
        .unwrap();
        let pipeline = Pipeline::new(vec![
            Stage::new(ModuleId::Imei, StageInput::None, StageEffect::StoreImei),
            Stage::new(ModuleId::Phone, StageInput::None, StageEffect::StorePhone),
            Stage::new(ModuleId::Sender, StageInput::Summary, StageEffect::None).aborting(),
        ]);

        let mut resources = SharedResources::new().unwrap();
        let outcome = pipeline.run(&mut resources, &registry, &fast());

        assert_eq!(outcome.exit_code(), 0);
        match outcome {
            PipelineOutcome::Completed(ctx) => {
                assert_eq!(ctx.imei.as_deref(), Some("X"));
                assert!(ctx.phone.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(resources.active_registrations(), 0);
    }

    #[test]
    fn test_failed_upload_aborts_run() {
        let registry = Registry::new([
            ModuleDescriptor::new(ModuleId::Imei, me(), Scripted::Reply("X")),
            ModuleDescriptor::new(ModuleId::Sender, me(), Scripted::Hang),
        ])
        .unwrap();
        let pipeline = Pipeline::new(vec![
            Stage::new(ModuleId::Imei, StageInput::None, StageEffect::StoreImei),
            Stage::new(ModuleId::Sender, StageInput::Summary, StageEffect::None).aborting(),
        ]);

        let mut resources = SharedResources::new().unwrap();
        let outcome = pipeline.run(&mut resources, &registry, &fast());

        assert_ne!(outcome.exit_code(), 0);
        assert!(matches!(
            outcome,
            PipelineOutcome::Aborted {
                module: ModuleId::Sender,
                error: StageError::Timeout,
            }
        ));
    }

    #[test]
    fn test_summary_argument_reflects_gathered_facts() {
        let ctx = DaemonContext {
            imei: Some("1".into()),
            ..DaemonContext::default()
        };
        let upload = Stage::new(ModuleId::Sender, StageInput::Summary, StageEffect::None);
        assert_eq!(
            upload.argument(&ctx).as_deref(),
            Some("IMEI:1|PHONE:N/A|MAC:N/A|DB:0")
        );
        let none = Stage::new(ModuleId::Imei, StageInput::None, StageEffect::StoreImei);
        assert!(none.argument(&ctx).is_none());
    }
}
