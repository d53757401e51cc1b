use crate::constants::{
    DEFAULT_SLICER_PROGRAM, PROCESS_POLL_INTERVAL, SLICER_OUTPUT_FLAG, SLICER_PROBE_ARG,
};
use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors reported by the external slicer.
#[derive(Error, Debug)]
pub enum SlicerError {
    #[error("Slicer '{program}' not found. Is mandoline installed?")]
    NotFound { program: String },
    #[error("Model validation failed: {}", stderr.trim())]
    ValidationFailed { stderr: String },
    #[error("Slicing to G-code failed: {}", stderr.trim())]
    SliceFailed { stderr: String },
    #[error("Slicer timed out after {timeout:?}")]
    TimedOut { timeout: Duration },
    #[error("Failed to run slicer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// The two operations the job orchestration needs from a slicer.
pub trait Slicer: Send + Sync {
    /// Checks that `source` is a model the slicer accepts.
    fn validate(&self, source: &Path) -> Result<(), SlicerError>;
    /// Writes machine code for `source` to `output`.
    fn slice(&self, source: &Path, output: &Path) -> Result<(), SlicerError>;
}

#[derive(Debug, Clone)]
pub struct SlicerOptions {
    /// Executable to run, looked up on `PATH` when not a path.
    pub program: OsString,
    /// Arguments placed before the operation's own, e.g. `-m mandoline` for an interpreter.
    pub leading_args: Vec<OsString>,
    /// Collect standard error for error reports instead of inheriting it.
    pub capture_stderr: bool,
    /// Kill the child after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for SlicerOptions {
    fn default() -> Self {
        Self {
            program: OsString::from(DEFAULT_SLICER_PROGRAM),
            leading_args: Vec::new(),
            capture_stderr: true,
            timeout: None,
        }
    }
}

/// Exit status and captured diagnostics of one slicer run.
struct RunOutput {
    status: ExitStatus,
    stderr: String,
}

/// Runs the mandoline command-line slicer.
///
/// Stateless: every call starts a fresh child process and blocks until it exits.
#[derive(Debug, Clone, Default)]
pub struct SlicerInvoker {
    options: SlicerOptions,
}

impl SlicerInvoker {
    pub fn new(options: SlicerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SlicerOptions {
        &self.options
    }

    fn program_name(&self) -> String {
        self.options.program.to_string_lossy().into_owned()
    }

    /// Checks that the slicer can be started at all. Its exit status is ignored,
    /// but a configured timeout still applies.
    pub fn probe(&self) -> Result<(), SlicerError> {
        let mut child = Command::new(&self.options.program)
            .args(&self.options.leading_args)
            .arg(SLICER_PROBE_ARG)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        match self.options.timeout {
            Some(timeout) => self.wait_with_timeout(child, timeout).map(|_| ()),
            None => child.wait().map(|_| ()).map_err(|e| SlicerError::Spawn {
                program: self.program_name(),
                source: e,
            }),
        }
    }

    fn spawn_error(&self, e: io::Error) -> SlicerError {
        match e.kind() {
            io::ErrorKind::NotFound => SlicerError::NotFound {
                program: self.program_name(),
            },
            _ => SlicerError::Spawn {
                program: self.program_name(),
                source: e,
            },
        }
    }

    fn run(&self, args: &[&OsStr]) -> Result<RunOutput, SlicerError> {
        let mut cmd = Command::new(&self.options.program);
        cmd.args(&self.options.leading_args)
            .args(args)
            .stdin(Stdio::null());
        if self.options.capture_stderr {
            cmd.stderr(Stdio::piped());
        }

        tracing::info!(
            "Running {} {}",
            self.program_name(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let output = match self.options.timeout {
            Some(timeout) => self.wait_with_timeout(child, timeout)?,
            None => {
                let output = child.wait_with_output().map_err(|e| SlicerError::Spawn {
                    program: self.program_name(),
                    source: e,
                })?;
                RunOutput {
                    status: output.status,
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }
            }
        };

        tracing::info!(
            "{} finished with {} in {:.2}s",
            self.program_name(),
            output.status,
            start.elapsed().as_secs_f64()
        );
        Ok(output)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        timeout: Duration,
    ) -> Result<RunOutput, SlicerError> {
        // Drain stderr on a separate thread so a chatty child cannot block on a full pipe.
        let reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });
        let collect = |reader: Option<std::thread::JoinHandle<String>>| {
            reader
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default()
        };

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Ok(RunOutput {
                        status,
                        stderr: collect(reader),
                    });
                }
                Ok(None) if start.elapsed() < timeout => {
                    std::thread::sleep(PROCESS_POLL_INTERVAL);
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SlicerError::Spawn {
                        program: self.program_name(),
                        source: e,
                    });
                }
            }
        }

        // The reader is left detached: grandchildren may still hold the pipe open.
        let _ = child.kill();
        let _ = child.wait();
        tracing::warn!("{} killed after {:?}", self.program_name(), timeout);
        Err(SlicerError::TimedOut { timeout })
    }
}

impl Slicer for SlicerInvoker {
    fn validate(&self, source: &Path) -> Result<(), SlicerError> {
        let output = self.run(&[source.as_os_str()])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SlicerError::ValidationFailed {
                stderr: output.stderr,
            })
        }
    }

    fn slice(&self, source: &Path, output_path: &Path) -> Result<(), SlicerError> {
        let output = self.run(&[
            OsStr::new(SLICER_OUTPUT_FLAG),
            output_path.as_os_str(),
            source.as_os_str(),
        ])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SlicerError::SliceFailed {
                stderr: output.stderr,
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    /// A fake slicer: a shell script run through `sh`, so nothing needs exec permission.
    fn fake_slicer(body: &str) -> (TempDir, SlicerInvoker) {
        let dir = tempdir().unwrap();
        let script = dir.path().join("mandoline.sh");
        fs::write(&script, format!("{}\n", body)).unwrap();
        let invoker = SlicerInvoker::new(SlicerOptions {
            program: OsString::from("sh"),
            leading_args: vec![script.into_os_string()],
            ..SlicerOptions::default()
        });
        (dir, invoker)
    }

    fn args_file(dir: &TempDir) -> PathBuf {
        dir.path().join("args")
    }

    #[test]
    fn test_validate_success() {
        let (_dir, slicer) = fake_slicer("exit 0");
        assert!(slicer.validate(Path::new("/models/part.stl")).is_ok());
    }

    #[test]
    fn test_validate_failure_carries_stderr() {
        let (_dir, slicer) = fake_slicer("echo 'mesh is not manifold' >&2\nexit 2");
        let err = slicer.validate(Path::new("part.stl")).unwrap_err();
        match err {
            SlicerError::ValidationFailed { stderr } => {
                assert_eq!(stderr.trim(), "mesh is not manifold")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validate_passes_only_the_source_path() {
        let dir = tempdir().unwrap();
        let record = args_file(&dir);
        let (_script_dir, slicer) =
            fake_slicer(&format!("echo \"$@\" > '{}'", record.display()));
        slicer.validate(Path::new("/models/part.stl")).unwrap();
        assert_eq!(fs::read_to_string(&record).unwrap().trim(), "/models/part.stl");
    }

    #[test]
    fn test_slice_argument_order() {
        let dir = tempdir().unwrap();
        let record = args_file(&dir);
        let (_script_dir, slicer) =
            fake_slicer(&format!("echo \"$@\" > '{}'", record.display()));
        slicer
            .slice(Path::new("/models/part.stl"), Path::new("/out/part.gcode"))
            .unwrap();
        assert_eq!(
            fs::read_to_string(&record).unwrap().trim(),
            "-o /out/part.gcode /models/part.stl"
        );
    }

    #[test]
    fn test_slice_failure_carries_stderr() {
        let (_dir, slicer) = fake_slicer("echo 'cannot write output' >&2\nexit 1");
        let err = slicer
            .slice(Path::new("part.stl"), Path::new("part.gcode"))
            .unwrap_err();
        assert!(matches!(err, SlicerError::SliceFailed { ref stderr } if stderr.contains("cannot write output")));
        assert!(err.to_string().contains("cannot write output"));
    }

    #[test]
    fn test_stderr_capture_can_be_disabled() {
        let (_dir, mut slicer) = fake_slicer("exit 1");
        slicer.options.capture_stderr = false;
        let err = slicer
            .slice(Path::new("part.stl"), Path::new("part.gcode"))
            .unwrap_err();
        assert!(matches!(err, SlicerError::SliceFailed { ref stderr } if stderr.is_empty()));
    }

    #[test]
    fn test_missing_executable() {
        let slicer = SlicerInvoker::new(SlicerOptions {
            program: OsString::from("/nonexistent/dir/mandoline"),
            ..SlicerOptions::default()
        });
        assert!(matches!(
            slicer.validate(Path::new("part.stl")),
            Err(SlicerError::NotFound { .. })
        ));
        assert!(matches!(slicer.probe(), Err(SlicerError::NotFound { .. })));
    }

    #[test]
    fn test_probe_ignores_exit_status() {
        let (_dir, slicer) = fake_slicer("exit 4");
        assert!(slicer.probe().is_ok());
    }

    #[test]
    fn test_timeout_kills_child() {
        let (_dir, mut slicer) = fake_slicer("exec sleep 10");
        slicer.options.timeout = Some(Duration::from_millis(300));
        let start = Instant::now();
        let err = slicer.validate(Path::new("part.stl")).unwrap_err();
        assert!(matches!(err, SlicerError::TimedOut { timeout } if timeout == Duration::from_millis(300)));
        assert_eq!(err.to_string(), "Slicer timed out after 300ms");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_check_honors_timeout() {
        let (_dir, mut slicer) = fake_slicer("exec sleep 10");
        slicer.options.timeout = Some(Duration::from_millis(300));
        let start = Instant::now();
        assert!(matches!(slicer.probe(), Err(SlicerError::TimedOut { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_killed_by_signal_is_a_failure() {
        let (_dir, mut slicer) = fake_slicer("echo died >&2\nkill -9 $$");
        let err = slicer.validate(Path::new("part.stl")).unwrap_err();
        assert!(matches!(err, SlicerError::ValidationFailed { ref stderr } if stderr.trim() == "died"));

        slicer.options.timeout = Some(Duration::from_secs(10));
        let err = slicer
            .slice(Path::new("part.stl"), Path::new("part.gcode"))
            .unwrap_err();
        assert!(matches!(err, SlicerError::SliceFailed { ref stderr } if stderr.trim() == "died"));
    }

    #[test]
    fn test_timeout_not_reached() {
        let (_dir, mut slicer) = fake_slicer("echo warn >&2\nexit 3");
        slicer.options.timeout = Some(Duration::from_secs(10));
        let err = slicer.validate(Path::new("part.stl")).unwrap_err();
        assert!(matches!(err, SlicerError::ValidationFailed { ref stderr } if stderr.trim() == "warn"));
    }

    #[test]
    fn test_invoker_is_reusable() {
        let (_dir, slicer) = fake_slicer("exit 0");
        for _ in 0..3 {
            slicer.validate(Path::new("part.stl")).unwrap();
        }
    }
}
