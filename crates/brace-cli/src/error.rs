//! The one CLI-local failure shape (spec §2.1's ambient-stack note) — every
//! other error (`CompileError`, `RuntimeError`) is already a `thiserror`
//! type from `brace-compiler`/`brace-vm`; this crate's own surface is just
//! "couldn't even read the script".

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("cannot read script '{path}'")]
    ReadScript {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
