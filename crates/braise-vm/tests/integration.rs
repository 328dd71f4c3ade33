//! tests/integration.rs — scénarios source → sortie de bout en bout.
//!
//! Complète les tests unitaires de `src/vm.rs` (qui couvrent chaque
//! fonctionnalité isolément) avec des programmes plus longs, pour exercer
//! les interactions entre boucles, récursion, champs d'instance et GC.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use braise_core::Heap;
use braise_vm::{Vm, VmOptions};

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_capturing(source: &str, options: VmOptions) -> String {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_writer(options, buffer.clone());
    let script = braise_compiler::compile(source, vm.heap_mut()).expect("script compiles");
    vm.interpret(script).expect("script runs without error");
    let bytes = buffer.0.borrow().clone();
    String::from_utf8(bytes).expect("output is utf-8")
}

#[test]
fn while_loop_accumulates() {
    let out = run_capturing(
        r#"
        var total = 0;
        var i = 1;
        while (i <= 5) {
            total = total + i;
            i = i + 1;
        }
        print total;
        "#,
        VmOptions::default(),
    );
    assert_eq!(out, "15\n");
}

#[test]
fn for_loop_and_recursive_function() {
    let out = run_capturing(
        r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        for (var i = 0; i < 8; i = i + 1) {
            print fib(i);
        }
        "#,
        VmOptions::default(),
    );
    assert_eq!(out, "0\n1\n1\n2\n3\n5\n8\n13\n");
}

#[test]
fn instance_fields_are_independent_per_object() {
    let out = run_capturing(
        r#"
        class Counter {
            init() {
                this.value = 0;
            }
            bump() {
                this.value = this.value + 1;
                return this.value;
            }
        }
        var a = Counter();
        var b = Counter();
        a.bump();
        a.bump();
        b.bump();
        print a.value;
        print b.value;
        "#,
        VmOptions::default(),
    );
    assert_eq!(out, "2\n1\n");
}

#[test]
fn stress_gc_does_not_corrupt_long_running_program() {
    let out = run_capturing(
        r#"
        fun make(n) {
            var parts = "";
            for (var i = 0; i < n; i = i + 1) {
                parts = parts + "x";
            }
            return parts;
        }
        print make(64);
        "#,
        VmOptions::default().with_stress_gc(true),
    );
    assert_eq!(out, "x".repeat(64) + "\n");
}

#[test]
fn heap_survives_direct_compilation_without_interpretation() {
    // `compile` alone must not require a live VM: garbage collection only
    // ever runs on allocation inside the VM, never during compilation.
    let mut heap = Heap::new();
    let result = braise_compiler::compile("var x = 1 + 2;", &mut heap);
    assert!(result.is_ok());
}
