//! Ordered step execution.
//!
//! Pod startup and teardown, on both sides of the stager boundary, are lists
//! of named steps run against a shared context. [`Pipeline::run`] halts on the
//! first failing step and reports which one failed; [`Pipeline::run_all`] runs
//! every step regardless and collects the failures.

use std::fmt;

use async_trait::async_trait;

use crate::errors::PodliteError;
use crate::PodliteResult;

/// One named step of a pipeline.
#[async_trait]
pub trait PipelineTask<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut C) -> PodliteResult<()>;
}

/// A step that returned an error.
#[derive(Debug)]
pub struct StepFailure {
    pub step: &'static str,
    pub error: PodliteError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

pub struct Pipeline<C: Send> {
    name: &'static str,
    tasks: Vec<Box<dyn PipelineTask<C>>>,
}

impl<C: Send> Pipeline<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Vec::new(),
        }
    }

    pub fn task(mut self, task: impl PipelineTask<C> + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    /// Step names in execution order.
    pub fn steps(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Runs the steps in order, stopping at the first failure.
    pub async fn run(&self, ctx: &mut C) -> Result<(), StepFailure> {
        for task in &self.tasks {
            let step = task.name();
            tracing::trace!(pipeline = self.name, step, "Running step");
            if let Err(error) = task.run(ctx).await {
                return Err(StepFailure { step, error });
            }
        }
        Ok(())
    }

    /// Runs every step, returning the failures in order.
    pub async fn run_all(&self, ctx: &mut C) -> Vec<StepFailure> {
        let mut failures = Vec::new();
        for task in &self.tasks {
            let step = task.name();
            tracing::trace!(pipeline = self.name, step, "Running step");
            if let Err(error) = task.run(ctx).await {
                failures.push(StepFailure { step, error });
            }
        }
        failures
    }
}

/// Declares a unit-struct pipeline step that calls an async method on the
/// context.
///
/// ```ignore
/// pipeline_task!(GetStager, "get_stager", StartupCtx, get_stager);
/// ```
#[macro_export]
macro_rules! pipeline_task {
    ($ty:ident, $name:literal, $ctx:ty, $method:ident) => {
        struct $ty;

        #[async_trait::async_trait]
        impl $crate::pipeline::PipelineTask<$ctx> for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            async fn run(&self, ctx: &mut $ctx) -> $crate::PodliteResult<()> {
                ctx.$method().await
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace {
        ran: Vec<&'static str>,
        fail_at: Option<&'static str>,
    }

    impl Trace {
        async fn step(&mut self, name: &'static str) -> PodliteResult<()> {
            self.ran.push(name);
            if self.fail_at == Some(name) {
                return Err(PodliteError::Internal(format!("{} broke", name)));
            }
            Ok(())
        }

        async fn first(&mut self) -> PodliteResult<()> {
            self.step("first").await
        }

        async fn second(&mut self) -> PodliteResult<()> {
            self.step("second").await
        }

        async fn third(&mut self) -> PodliteResult<()> {
            self.step("third").await
        }
    }

    pipeline_task!(First, "first", Trace, first);
    pipeline_task!(Second, "second", Trace, second);
    pipeline_task!(Third, "third", Trace, third);

    fn pipeline() -> Pipeline<Trace> {
        Pipeline::new("test").task(First).task(Second).task(Third)
    }

    #[tokio::test]
    async fn run_halts_and_names_the_failing_step() {
        let mut trace = Trace {
            fail_at: Some("second"),
            ..Default::default()
        };
        let failure = pipeline().run(&mut trace).await.unwrap_err();
        assert_eq!(failure.step, "second");
        assert_eq!(failure.to_string(), "second: internal error: second broke");
        assert_eq!(trace.ran, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn run_all_continues_past_failures() {
        let mut trace = Trace {
            fail_at: Some("first"),
            ..Default::default()
        };
        let failures = pipeline().run_all(&mut trace).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(trace.ran, vec!["first", "second", "third"]);
    }

    #[test]
    fn steps_in_order() {
        assert_eq!(pipeline().steps(), vec!["first", "second", "third"]);
    }
}
