use crate::slicer::{Slicer, SlicerError};
use crate::utils::default_output_path;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// What happened when a job was run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The model was validated and G-code was written.
    Sliced,
    /// The job had already produced its output; the slicer was not run.
    AlreadySliced,
}

/// One model on its way to G-code.
///
/// `sliced` only ever goes from false to true. Failed steps leave both flags
/// as they were so the operator can retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceJob {
    source: PathBuf,
    output: PathBuf,
    validated: bool,
    sliced: bool,
}

impl SliceJob {
    pub fn new(source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            validated: false,
            sliced: false,
        }
    }

    /// A job writing next to the source, e.g. `part.stl` -> `part.gcode`.
    pub fn with_default_output(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let output = default_output_path(&source);
        Self::new(source, output)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn is_sliced(&self) -> bool {
        self.sliced
    }

    pub fn validate(&mut self, slicer: &dyn Slicer) -> Result<(), SlicerError> {
        slicer.validate(&self.source)?;
        self.validated = true;
        tracing::info!("Model validation successful: {}", self.source.display());
        Ok(())
    }

    /// Validates then slices, unless this job was already sliced.
    pub fn run(&mut self, slicer: &dyn Slicer) -> Result<JobOutcome, SlicerError> {
        if self.sliced {
            tracing::info!("Model already sliced: {}", self.source.display());
            return Ok(JobOutcome::AlreadySliced);
        }
        self.validate(slicer)?;
        slicer.slice(&self.source, &self.output)?;
        self.sliced = true;
        tracing::info!(
            "Slice to G-code successful: {} -> {}",
            self.source.display(),
            self.output.display()
        );
        Ok(JobOutcome::Sliced)
    }
}

/// Jobs of one operator session, one per source model.
#[derive(Debug, Default)]
pub struct SliceSession {
    jobs: HashMap<PathBuf, SliceJob>,
}

impl SliceSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session's job for `source`, created with `output` on first use.
    /// A job that exists keeps its original output path.
    pub fn take_job(&mut self, source: &Path, output: Option<&Path>) -> SliceJob {
        self.jobs.remove(source).unwrap_or_else(|| match output {
            Some(output) => SliceJob::new(source, output),
            None => SliceJob::with_default_output(source),
        })
    }

    /// Puts a job back after running it.
    pub fn store(&mut self, job: SliceJob) {
        self.jobs.insert(job.source.clone(), job);
    }
}
