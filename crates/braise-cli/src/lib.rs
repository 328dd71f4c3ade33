//! braise-cli — REPL, exécuteur de script et désassembleur pour Braise.
//!
//! Deux modes, à la `clox`: sans argument, un REPL qui réutilise la même
//! `Vm` d'une ligne à l'autre (les globales survivent) ; avec un chemin de
//! script, compilation puis exécution en un coup, ou désassemblage seul
//! avec `--disassemble`. Les codes de sortie suivent `sysexits.h` : 64
//! (usage), 65 (erreur de compilation), 70 (erreur à l'exécution), 74
//! (E/S) — c'est la convention de l'implémentation de référence, pas une
//! invention de ce crate.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

mod repl;

use std::fs;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::Parser;

use braise_compiler::compile;
use braise_vm::{Vm, VmOptions};

/// Argument(s) mal formés : mauvais nombre de positionnels, flag inconnu.
pub const EX_USAGE: u8 = 64;
/// Le script ne compile pas.
pub const EX_DATAERR: u8 = 65;
/// Le script compile mais échoue à l'exécution.
pub const EX_SOFTWARE: u8 = 70;
/// Le fichier n'a pas pu être lu.
pub const EX_IOERR: u8 = 74;

/// Compilateur bytecode et VM à pile pour un petit langage à classes.
#[derive(Parser, Debug)]
#[command(name = "braise", version, about)]
struct Cli {
    /// Script à exécuter. Sans argument, démarre un REPL interactif.
    script: Option<PathBuf>,

    /// Affiche chaque instruction exécutée et l'état de la pile.
    #[arg(long)]
    trace: bool,

    /// Force une collecte du GC avant chaque allocation (pour l'exercer).
    #[arg(long = "stress-gc")]
    stress_gc: bool,

    /// Désassemble le script au lieu de l'exécuter.
    #[arg(long)]
    disassemble: bool,
}

pub fn run() -> Result<(), u8> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => Ok(()),
                _ => Err(EX_USAGE),
            };
        }
    };

    let options = VmOptions::default().with_trace(cli.trace).with_stress_gc(cli.stress_gc);

    match cli.script {
        Some(path) => run_file(&path, options, cli.disassemble),
        None => {
            repl::run(options);
            Ok(())
        }
    }
}

fn run_file(path: &Path, options: VmOptions, disassemble: bool) -> Result<(), u8> {
    let source = fs::read_to_string(path).map_err(|err| {
        tracing::error!(path = %path.display(), %err, "impossible de lire le script");
        eprintln!("braise: {}: {err}", path.display());
        EX_IOERR
    })?;

    let mut vm = Vm::with_options(options);
    let script = compile(&source, vm.heap_mut()).map_err(|errors| {
        eprintln!("{errors}");
        EX_DATAERR
    })?;

    if disassemble {
        print!("{}", braise_vm::disassemble_program(vm.heap_mut(), script));
        return Ok(());
    }

    vm.interpret(script).map_err(|err| {
        eprintln!("{err}");
        EX_SOFTWARE
    })
}
