//! External state-diff measurement.
//!
//! The diff tool reports what changed on disk since its previous invocation,
//! so two measurements must never overlap. [`MeasurementSlot`] owns the
//! command and hands out one [`MeasurementPermit`] at a time; a measurement
//! can only be taken through a permit.

use std::{io, process::Stdio, time::Duration};

use tokio::{
    process::Command,
    sync::{Mutex as AsyncMutex, MutexGuard},
};

use crate::config::MeasureConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDiffCommand {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl StateDiffCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn from_config(config: &MeasureConfig) -> anyhow::Result<Self> {
        let Some((program, args)) = config.command.split_first() else {
            anyhow::bail!("`measure.command` must name a program");
        };
        Ok(Self::new(program.clone(), args.to_vec())
            .with_timeout(config.timeout_ms.map(Duration::from_millis)))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn run(&self) -> Measurement {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, command.output()).await {
                Ok(output) => output,
                Err(_) => return Measurement::Failed(MeasurementFailure::TimedOut(timeout)),
            },
            None => command.output().await,
        };

        match output {
            Ok(output) if output.status.success() => Measurement::Measured {
                bytes: output.stdout.len() as u64,
            },
            Ok(output) => Measurement::Failed(MeasurementFailure::ExitStatus {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Measurement::Failed(MeasurementFailure::NotFound)
            }
            Err(err) => Measurement::Failed(MeasurementFailure::Spawn(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Measurement {
    Measured { bytes: u64 },
    Failed(MeasurementFailure),
}

impl Measurement {
    /// Value recorded in the run log. Failed measurements record `0`.
    pub fn statediff_size(&self) -> u64 {
        match self {
            Self::Measured { bytes } => *bytes,
            Self::Failed(_) => 0,
        }
    }

    pub fn is_measured(&self) -> bool {
        matches!(self, Self::Measured { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasurementFailure {
    NotFound,
    ExitStatus { code: Option<i32>, stderr: String },
    Spawn(String),
    TimedOut(Duration),
}

impl std::fmt::Display for MeasurementFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("measurement command not found"),
            Self::ExitStatus {
                code: Some(code),
                stderr,
            } => write!(f, "measurement command failed with code {code}: {stderr}"),
            Self::ExitStatus { code: None, stderr } => {
                write!(f, "measurement command terminated by signal: {stderr}")
            }
            Self::Spawn(message) => write!(f, "measurement command could not run: {message}"),
            Self::TimedOut(timeout) => write!(
                f,
                "measurement command timed out after {}ms",
                timeout.as_millis()
            ),
        }
    }
}

impl std::error::Error for MeasurementFailure {}

#[derive(Debug)]
pub struct MeasurementSlot {
    command: AsyncMutex<StateDiffCommand>,
}

impl MeasurementSlot {
    pub fn new(command: StateDiffCommand) -> Self {
        Self {
            command: AsyncMutex::new(command),
        }
    }

    /// Waits until no other exchange holds the slot.
    pub async fn acquire(&self) -> MeasurementPermit<'_> {
        MeasurementPermit {
            command: self.command.lock().await,
        }
    }
}

/// Exclusive right to run the diff tool. Held until the exchange's log row
/// has been written.
#[derive(Debug)]
pub struct MeasurementPermit<'a> {
    command: MutexGuard<'a, StateDiffCommand>,
}

impl MeasurementPermit<'_> {
    pub async fn measure(&mut self) -> Measurement {
        let measurement = self.command.run().await;
        match &measurement {
            Measurement::Measured { bytes } => {
                tracing::debug!(statediff_size = bytes, "state diff measured");
            }
            Measurement::Failed(failure @ MeasurementFailure::NotFound) => {
                tracing::error!(command = %self.command.display(), "{failure}");
            }
            Measurement::Failed(failure) => {
                tracing::warn!(command = %self.command.display(), "{failure}");
            }
        }
        measurement
    }
}
