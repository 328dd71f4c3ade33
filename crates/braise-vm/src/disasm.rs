//! disasm.rs — désassembleur texte du bytecode compilé.
//!
//! Une passe purement en lecture sur un `Chunk` : chaque instruction est
//! reformée à partir de son octet d'opcode et de ses opérandes, avec un
//! aperçu des constantes et des fermetures via `value_fmt`. Utilisé par
//! `braise-cli --disassemble`, jamais par la boucle de dispatch elle-même
//! (qui a sa propre trace, plus légère, dans `vm::trace_instruction`).

use std::collections::HashSet;
use std::fmt::Write as _;

use braise_core::object::Obj;
use braise_core::{Chunk, Heap, ObjRef, OpCode, Value};

use crate::value_fmt::format_value;

/// Désassemble une fonction et, récursivement, toutes les fonctions
/// trouvées dans son pool de constantes (closures imbriquées, méthodes).
pub fn disassemble_program(heap: &Heap, script: ObjRef) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();
    walk_function(heap, script, &mut out, &mut seen);
    out
}

fn walk_function(heap: &Heap, func_ref: ObjRef, out: &mut String, seen: &mut HashSet<ObjRef>) {
    if !seen.insert(func_ref) {
        return;
    }
    let f = match heap.get(func_ref) {
        Obj::Function(f) => f,
        _ => return,
    };
    let name = match f.name {
        Some(n) => heap.get_string(n).value.to_string(),
        None => "<script>".to_string(),
    };
    out.push_str(&disassemble_chunk(heap, &f.chunk, &name));
    out.push('\n');

    let nested: Vec<ObjRef> = f
        .chunk
        .constants
        .iter()
        .filter_map(|c| match c {
            Value::Obj(r) if matches!(heap.get(*r), Obj::Function(_)) => Some(*r),
            _ => None,
        })
        .collect();
    for r in nested {
        walk_function(heap, r, out, seen);
    }
}

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let line = chunk.line_at(offset);
    if offset > 0 && line == chunk.line_at(offset - 1) {
        let _ = write!(out, "{offset:04}    | ");
    } else {
        let _ = write!(out, "{offset:04} {line:4} ");
    }

    let op = match OpCode::from_byte(chunk.code[offset]) {
        Some(op) => op,
        None => {
            let _ = writeln!(out, "unknown opcode {}", chunk.code[offset]);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(heap, chunk, op, offset, out),
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(op, chunk, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(heap, chunk, op, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(op, 1, chunk, offset, out),
        OpCode::Loop => jump_instruction(op, -1, chunk, offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        _ => simple_instruction(op, offset, out),
    }
}

fn simple_instruction(op: OpCode, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{}", op.mnemonic());
    offset + 1
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<18} {slot:4}", op.mnemonic());
    offset + 2
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let preview = format_value(heap, &chunk.constants[index]);
    let _ = writeln!(out, "{:<18} {index:4} '{preview}'", op.mnemonic());
    offset + 2
}

fn invoke_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    let preview = format_value(heap, &chunk.constants[index]);
    let _ =
        writeln!(out, "{:<18} ({arg_count} args) {index:4} '{preview}'", op.mnemonic());
    offset + 3
}

fn jump_instruction(op: OpCode, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    let _ = writeln!(out, "{:<18} {offset:4} -> {target}", op.mnemonic());
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let mut cursor = offset + 1;
    let index = chunk.code[cursor] as usize;
    cursor += 1;
    let constant = &chunk.constants[index];
    let preview = format_value(heap, constant);
    let _ = writeln!(out, "{:<18} {index:4} '{preview}'", OpCode::Closure.mnemonic());

    let upvalue_count = match constant {
        Value::Obj(r) => match heap.get(*r) {
            Obj::Function(f) => f.upvalue_count,
            _ => 0,
        },
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor];
        cursor += 1;
        let upvalue_index = chunk.code[cursor];
        cursor += 1;
        let kind = if is_local == 1 { "local" } else { "upvalue" };
        let _ = writeln!(out, "{cursor:04}      |                     {kind} {upvalue_index}");
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use braise_compiler::compile;

    #[test]
    fn disassembles_constant_and_arithmetic() {
        let mut heap = Heap::new();
        let script = compile("print 1 + 2;", &mut heap).expect("compiles");
        let out = disassemble_program(&heap, script);
        assert!(out.contains("== <script> =="));
        assert!(out.contains("OP_CONSTANT"));
        assert!(out.contains("OP_ADD"));
        assert!(out.contains("OP_PRINT"));
    }

    #[test]
    fn disassembles_nested_function_separately() {
        let mut heap = Heap::new();
        let script = compile("fun greet() { print \"hi\"; } greet();", &mut heap).expect("compiles");
        let out = disassemble_program(&heap, script);
        assert!(out.contains("== <script> =="));
        assert!(out.contains("== greet =="));
        assert!(out.contains("OP_CALL"));
    }

    #[test]
    fn annotates_jump_targets() {
        let mut heap = Heap::new();
        let script = compile("if (true) { print 1; } else { print 2; }", &mut heap).expect("compiles");
        let out = disassemble_program(&heap, script);
        assert!(out.contains("OP_JUMP_IF_FALSE"));
        assert!(out.contains("->"));
    }
}
