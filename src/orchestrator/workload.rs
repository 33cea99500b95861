//! Target workloads
//!
//! The monitored program runs as a child process, so a crashing workload
//! cannot take the sampler thread down with it.

use crate::Result;
use anyhow::Context;
use std::path::PathBuf;
use std::process::Command;

/// Something the orchestrator runs between the start and stop signals
pub trait Workload {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Run to completion; an error aborts the monitored run
    fn run(&mut self) -> Result<()>;
}

/// A script or executable run as a child process
#[derive(Debug, Clone)]
pub struct ScriptWorkload {
    script: PathBuf,
    args: Vec<String>,
    /// Program used to run the script (`python3`, `bash`); `None` executes it directly
    interpreter: Option<String>,
}

impl ScriptWorkload {
    pub fn new(script: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            script: script.into(),
            args,
            interpreter: None,
        }
    }

    pub fn with_interpreter(mut self, interpreter: Option<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn script(&self) -> &PathBuf {
        &self.script
    }

    fn command(&self) -> Command {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&self.script);
                c
            }
            None => Command::new(&self.script),
        };
        command.args(&self.args);
        command
    }
}

impl Workload for ScriptWorkload {
    fn describe(&self) -> String {
        let mut parts: Vec<String> = self.interpreter.iter().cloned().collect();
        parts.push(self.script.display().to_string());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn run(&mut self) -> Result<()> {
        let status = self
            .command()
            .status()
            .with_context(|| format!("Failed to launch '{}'", self.describe()))?;

        if !status.success() {
            anyhow::bail!("'{}' exited with {}", self.describe(), status);
        }
        Ok(())
    }
}

/// A closure run in-process
pub struct FnWorkload<F> {
    name: String,
    body: F,
}

impl<F> FnWorkload<F>
where
    F: FnMut() -> Result<()>,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> Workload for FnWorkload<F>
where
    F: FnMut() -> Result<()>,
{
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn run(&mut self) -> Result<()> {
        (self.body)()
    }
}
