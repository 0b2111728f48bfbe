use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::{Context, Result};

use crate::ir::Module;
use crate::passes::{ExecutionThreadSet, ModulePass, PassResult};
use crate::trace::{emit_pass_event, PassEvent, PassEventKind, PassStats};

pub enum Step {
    Pass(Arc<dyn ModulePass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn ModulePass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Vec<Step> {
        self.steps
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline-level switches, defaulting to the process environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub log_stats: bool,
    pub max_iters: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_stats: crate::env::pass_stats_enabled(),
            max_iters: crate::env::pipeline_max_iters(),
        }
    }
}

/// Ordered list of passes applied to a module.
pub struct PassPipeline {
    steps: Vec<Step>,
    config: PipelineConfig,
    run_counter: AtomicUsize,
}

impl PassPipeline {
    pub fn new(steps: Vec<Step>, config: PipelineConfig) -> Self {
        Self {
            steps,
            config,
            run_counter: AtomicUsize::new(0),
        }
    }

    /// Builds a pipeline with `build`, using environment defaults.
    pub fn build<F>(build: F) -> Self
    where
        F: FnOnce(&mut PipelineBuilder, &PipelineConfig),
    {
        let config = PipelineConfig::default();
        let mut builder = PipelineBuilder::new();
        build(&mut builder, &config);
        Self::new(builder.finish(), config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every step in order; a failing pass aborts the pipeline.
    pub fn run(&self, module: &mut Module, threads: &ExecutionThreadSet) -> Result<PassResult> {
        let track_run_id = self.config.log_stats || crate::trace::current_sink().is_some();
        let run_id = if track_run_id {
            Some(self.run_counter.fetch_add(1, Ordering::Relaxed))
        } else {
            None
        };

        let mut totals = PassResult::default();
        let mut ctx = RunContext {
            threads,
            run_id,
            log_stats: self.config.log_stats,
        };
        run_steps(&self.steps, module, &mut ctx, &mut totals)?;
        Ok(totals)
    }
}

struct RunContext<'a> {
    threads: &'a ExecutionThreadSet,
    run_id: Option<usize>,
    log_stats: bool,
}

fn run_steps(
    steps: &[Step],
    module: &mut Module,
    ctx: &mut RunContext<'_>,
    totals: &mut PassResult,
) -> Result<bool> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass
                    .run(module, ctx.threads)
                    .with_context(|| format!("pass `{}` failed on module `{}`", pass.name(), module.name))?;
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                tracing::debug!(
                    pass = pass.name(),
                    changed = stats.changed,
                    rewrites = stats.rewrites_applied,
                    "pass finished"
                );
                if ctx.log_stats || crate::trace::current_sink().is_some() {
                    emit_pass_stats(pass.name(), module, ctx.run_id, stats);
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        tracing::debug!(max_iters, "fixed point hit iteration bound");
                        break;
                    }
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, module, ctx, &mut local)?;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}

fn emit_pass_stats(name: &str, module: &Module, run_id: Option<usize>, stats: PassResult) {
    emit_pass_event(PassEvent::now(PassEventKind::PassStats {
        run_id,
        module: module.name.clone(),
        pass: name.to_string(),
        stats: PassStats {
            changed: stats.changed,
            iterations: stats.iterations,
            rewrites_applied: stats.rewrites_applied,
            erased_insts: stats.erased_insts,
            module_len: module.instruction_count(),
        },
    }));
}
