//! Binary entry point. Setup only — see `lib.rs::run` for the actual CLI.

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: color-eyre failed to install: {e}");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match brace_cli::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("brace: {err:?}");
            std::process::exit(1);
        }
    }
}
