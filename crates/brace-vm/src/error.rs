//! Runtime failure shapes (spec §7) plus the combined compile/run error the
//! CLI boundary matches on to pick an exit code.

use brace_compiler::CompileError;

/// One active call frame at the moment a runtime error was raised, deepest
/// first — used to render the "in `<name>()`"/"in script" trace lines.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub name: Option<String>,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(n) => write!(f, "[line {}] in {n}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        RuntimeError { message: message.into(), trace }
    }

    /// Renders the message followed by a deepest-first stack trace, one
    /// frame per line, matching spec §7's runtime error format.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for frame in &self.trace {
            out.push('\n');
            out.push_str(&frame.to_string());
        }
        out
    }
}

/// What the CLI binary actually matches on to choose an exit code: 65 for a
/// source with any compile error, 70 for a runtime failure (spec §6).
#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile(Vec<CompileError>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
