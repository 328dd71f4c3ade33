//! repl.rs — boucle interactive ligne par ligne.
//!
//! Une seule `Vm` pour toute la session : les globales et les classes
//! déclarées à une invite restent visibles aux suivantes, comme dans le
//! REPL de l'implémentation de référence. `rustyline` fournit l'édition de
//! ligne et l'historique ; une ligne vide est ignorée plutôt qu'envoyée au
//! compilateur.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use braise_compiler::compile;
use braise_vm::{Vm, VmOptions};

pub fn run(options: VmOptions) {
    let mut vm = Vm::with_options(options);
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("braise: impossible d'initialiser la ligne de commande: {err}");
            return;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                eval_line(&mut vm, &line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("braise: erreur de lecture: {err}");
                break;
            }
        }
    }
}

fn eval_line(vm: &mut Vm, line: &str) {
    match compile(line, vm.heap_mut()) {
        Ok(script) => {
            if let Err(err) = vm.interpret(script) {
                eprintln!("{err}");
            }
        }
        Err(errors) => eprintln!("{errors}"),
    }
}
