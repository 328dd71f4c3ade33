//! braise-vm — pile d'exécution pour le bytecode Braise.
//!
//! Boucle de dispatch à pile + cadres d'appel (`CallFrame`), plus le
//! pilotage du garbage collector de `braise_core::gc` : chaque site
//! d'allocation demande à la VM (pas au compilateur) de décider si une
//! collecte est nécessaire, puisque c'est la VM qui connaît l'ensemble des
//! racines vivantes à l'exécution.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod disasm;
pub mod value_fmt;
pub mod vm;

pub use disasm::disassemble_program;
pub use vm::{RuntimeError, Vm, VmOptions};
