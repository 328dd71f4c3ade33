//! braise-cli/src/main.rs
//!
//! Point d'entrée du binaire `braise`. Met en place la journalisation puis
//! délègue tout le reste à `braise_cli::run`, qui renvoie un code de sortie
//! `sysexits.h` (64/65/70/74) plutôt qu'une simple erreur opaque — c'est ce
//! code, pas le `Result` d'`anyhow`, que les scripts appelants observent.

use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match braise_cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}
