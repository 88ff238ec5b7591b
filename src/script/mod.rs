//! # Script Rendering
//!
//! Builds the external invocation a leaf processor hands to the process
//! runner: an ordered sequence of command tokens plus an environment map.
//! Flags are emitted in the order they were registered, and an already-set
//! environment variable can be extended rather than replaced, which is how
//! dynamic-library search paths are composed across tool wrappers.

use std::path::PathBuf;

use crate::error::Result;
use crate::model::ServiceRecord;

/// Platform path-list separator used when extending environment variables
#[cfg(unix)]
const ENV_PATH_SEPARATOR: &str = ":";
#[cfg(windows)]
const ENV_PATH_SEPARATOR: &str = ";";

/// A fully rendered external invocation: one executable, its ordered
/// arguments, and the environment it runs under.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Environment entries in registration order
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

/// Ordered builder for [`ExternalInvocation`]
#[derive(Debug, Clone)]
pub struct InvocationBuilder {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl InvocationBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Append a single positional token
    pub fn arg(mut self, token: impl Into<String>) -> Self {
        self.args.push(token.into());
        self
    }

    /// Append every token from an iterator, preserving order
    pub fn args<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(tokens.into_iter().map(Into::into));
        self
    }

    /// Append a `name value` flag pair
    pub fn flag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push(name.into());
        self.args.push(value.into());
        self
    }

    /// Set an environment variable, replacing any previous value
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.env.retain(|(existing, _)| *existing != name);
        self.env.push((name, value.into()));
        self
    }

    /// Extend a path-list environment variable instead of replacing it.
    ///
    /// The new entry is prepended to a value set earlier on this builder, or
    /// to the inherited process value when the builder has none. This is the
    /// convention for variables like a dynamic-library search path.
    pub fn extend_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();

        let existing = self
            .env
            .iter()
            .position(|(existing, _)| *existing == name)
            .map(|index| self.env.remove(index).1)
            .or_else(|| std::env::var(&name).ok())
            .filter(|current| !current.is_empty());

        let combined = match existing {
            Some(current) => format!("{value}{ENV_PATH_SEPARATOR}{current}"),
            None => value,
        };
        self.env.push((name, combined));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> ExternalInvocation {
        ExternalInvocation {
            program: self.program,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
        }
    }
}

/// Collaborator that turns a service record into a single executable
/// invocation plus environment map.
///
/// Implementations own the flag schema of the wrapped tool; the engine only
/// requires the rendered result.
pub trait ScriptRenderer: Send + Sync {
    fn render(&self, record: &ServiceRecord) -> Result<ExternalInvocation>;
}

/// Renderer that passes the record's arguments straight through to a fixed
/// program, running in the record workspace.
///
/// Useful for tools whose submitters already speak the tool's flag syntax,
/// and as the fixture renderer in tests.
#[derive(Debug, Clone)]
pub struct PassthroughRenderer {
    program: String,
}

impl PassthroughRenderer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ScriptRenderer for PassthroughRenderer {
    fn render(&self, record: &ServiceRecord) -> Result<ExternalInvocation> {
        let mut builder = InvocationBuilder::new(&self.program).args(record.normalized_args());
        if let Some(workspace) = &record.workspace {
            builder = builder.working_dir(workspace);
        }
        Ok(builder.build())
    }
}
