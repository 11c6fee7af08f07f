//! CLI output styling for wardend

use colored::Colorize;
use warden::{
    FailurePolicy, ModuleBody, Pipeline, PipelineOutcome, Registry, StageEffect, StageInput,
};

/// Print the wardend banner
pub fn print_banner(silent: bool) {
    if silent {
        return;
    }
    let title = "wardend".truecolor(204, 102, 0).bold();
    let ver = format!("v{}", env!("CARGO_PKG_VERSION")).white();
    eprintln!();
    eprintln!("  {} {}", title, ver);
    eprintln!();
}

/// Print every registered module with the identity its worker assumes.
pub fn print_registry(registry: &Registry<ModuleBody>) {
    eprintln!("{}", "Modules:".white().bold());
    for desc in registry.iter() {
        let label = match &desc.identity.label {
            Some(l) => l.as_str().cyan(),
            None => "(no label)".truecolor(150, 150, 150),
        };
        eprintln!(
            "  {:<10} uid={:<5} gid={:<5} {}",
            desc.name().bold(),
            desc.identity.uid,
            desc.identity.gid,
            label
        );
    }
    eprintln!();
}

/// Print the stage plan in execution order.
pub fn print_plan(pipeline: &Pipeline) {
    eprintln!("{}", "Stages:".white().bold());
    for (i, stage) in pipeline.stages().iter().enumerate() {
        let input = match &stage.input {
            StageInput::None => String::new(),
            StageInput::Status(line) => format!("\"{line}\""),
            StageInput::Summary => "<summary>".to_string(),
        };
        let effect = match stage.effect {
            StageEffect::None => "",
            StageEffect::StoreImei => "-> imei",
            StageEffect::StorePhone => "-> phone",
            StageEffect::StoreMac => "-> mac",
            StageEffect::MarkCleaned => "-> db cleaned",
        };
        let policy = match stage.policy {
            FailurePolicy::Continue => "continue".green(),
            FailurePolicy::Abort => "abort".red(),
        };
        eprintln!(
            "  {}. {:<10} {:<24} {:<14} [{}]",
            i + 1,
            stage.module.name(),
            input,
            effect,
            policy
        );
    }
    eprintln!();
}

/// Print how the run ended.
pub fn print_outcome(outcome: &PipelineOutcome, silent: bool) {
    if silent {
        return;
    }
    match outcome {
        PipelineOutcome::Completed(ctx) => {
            eprintln!("{} {}", "Completed:".green().bold(), ctx.summary());
        }
        PipelineOutcome::Aborted { module, error } => {
            eprintln!("{} {} failed: {}", "Aborted:".red().bold(), module, error);
        }
    }
}
