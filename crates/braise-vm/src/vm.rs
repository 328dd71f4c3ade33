//! vm.rs — boucle de dispatch, cadres d'appel, pilotage du GC.
//!
//! `Vm` ne connaît pas le compilateur : elle exécute une fonction déjà
//! compilée (`interpret(script)`), ce qui la garde testable et réutilisable
//! indépendamment de la façon dont le bytecode a été produit.

use std::fmt;
use std::io::{self, Write};

use braise_core::gc::{collect_garbage, RootSet};
use braise_core::object::{LBoundMethod, LClass, LClosure, LInstance, LNative, NativeFn, Obj, UpvalueState};
use braise_core::table::Table;
use braise_core::{Chunk, Heap, ObjRef, OpCode, Value};

use crate::value_fmt::format_value;

const MAX_FRAMES: usize = 64;

#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for line in &self.trace {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    pub trace: bool,
    pub stress_gc: bool,
}

impl VmOptions {
    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    pub fn with_stress_gc(mut self, on: bool) -> Self {
        self.stress_gc = on;
        self
    }
}

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slot_base: usize,
}

enum Signal {
    Continue,
    Done,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    options: VmOptions,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::build(VmOptions::default(), Box::new(io::stdout()))
    }

    pub fn with_options(options: VmOptions) -> Self {
        Self::build(options, Box::new(io::stdout()))
    }

    pub fn with_writer(options: VmOptions, writer: impl Write + 'static) -> Self {
        Self::build(options, Box::new(writer))
    }

    fn build(options: VmOptions, out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            options,
            out,
        };
        vm.define_native("clock", native_clock);
        vm
    }

    /// Accès au tas, pour que l'appelant puisse y compiler un script avant
    /// de l'exécuter (`braise_compiler::compile(source, vm.heap_mut())`).
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_ref = self.heap.intern(name);
        let native_ref = self.heap.alloc(Obj::Native(LNative { name: name_ref, function }));
        let hash = self.heap.get_string(name_ref).hash;
        self.globals.set(name_ref, hash, Value::Obj(native_ref));
    }

    /// Exécute une fonction déjà compilée (le "script" top-level).
    pub fn interpret(&mut self, script: ObjRef) -> Result<(), RuntimeError> {
        let closure_ref = self.heap.alloc(Obj::Closure(LClosure { function: script, upvalues: Vec::new() }));
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base: 0 });
        self.run()
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.options.trace {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(&format!("invalid opcode byte {byte}"))),
            };
            match self.dispatch(op)? {
                Signal::Continue => {}
                Signal::Done => return Ok(()),
            }
        }
    }

    // ---- pile ----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("compiler keeps the stack balanced")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- lecture de bytecode ----

    fn current_closure(&self) -> ObjRef {
        self.frames.last().expect("interpret() pushes a frame before run()").closure
    }

    fn current_function_ref(&self) -> ObjRef {
        match self.heap.get(self.current_closure()) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("CallFrame.closure always references a Closure"),
        }
    }

    fn with_chunk<R>(&self, f: impl FnOnce(&Chunk) -> R) -> R {
        let function_ref = self.current_function_ref();
        match self.heap.get(function_ref) {
            Obj::Function(func) => f(&func.chunk),
            _ => unreachable!("Closure.function always references a Function"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frames.last().unwrap().ip;
        let byte = self.with_chunk(|c| c.code[ip]);
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte();
        self.with_chunk(|c| c.constants[index as usize])
    }

    fn read_string_constant(&mut self) -> ObjRef {
        self.read_constant().as_obj().expect("compiler only loads string constants for names")
    }

    // ---- erreurs ----

    fn runtime_error(&self, message: &str) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function_ref = match self.heap.get(frame.closure) {
                Obj::Closure(c) => c.function,
                _ => unreachable!(),
            };
            match self.heap.get(function_ref) {
                Obj::Function(f) => {
                    let line = f.chunk.line_at(frame.ip.saturating_sub(1));
                    let name = match f.name {
                        Some(n) => format!("{}()", self.heap.get_string(n).value),
                        None => "script".to_string(),
                    };
                    trace.push(format!("[line {line}] in {name}"));
                }
                _ => unreachable!(),
            }
        }
        RuntimeError { message: message.to_string(), trace }
    }

    // ---- garbage collection ----

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect(self.options.stress_gc) {
            return;
        }
        let roots: Vec<ObjRef> = self
            .frames
            .iter()
            .map(|f| f.closure)
            .chain(self.open_upvalues.iter().copied())
            .chain(std::iter::once(self.init_string))
            .collect();
        let report = collect_garbage(
            &mut self.heap,
            RootSet { values: &self.stack, objects: &roots, tables: &[&self.globals] },
        );
        if self.options.trace {
            tracing::debug!(freed = report.freed_objects, bytes_after = report.bytes_after, "gc pass");
        }
    }

    fn trace_instruction(&self) {
        let ip = self.frames.last().unwrap().ip;
        let (line, byte) = self.with_chunk(|c| (c.line_at(ip), c.code[ip]));
        let stack_repr: String =
            self.stack.iter().map(|v| format!("[ {} ]", format_value(&self.heap, v))).collect();
        match OpCode::from_byte(byte) {
            Some(op) => eprintln!("{stack_repr}  {ip:04} line {line} {}", op.mnemonic()),
            None => eprintln!("{stack_repr}  {ip:04} line {line} <byte {byte}>"),
        }
    }

    // ---- dispatch ----

    fn dispatch(&mut self, op: OpCode) -> Result<Signal, RuntimeError> {
        match op {
            OpCode::Constant => {
                let value = self.read_constant();
                self.push(value);
            }
            OpCode::Nil => self.push(Value::Nil),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Pop => {
                self.pop();
            }
            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().unwrap().slot_base;
                self.push(self.stack[base + slot]);
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().unwrap().slot_base;
                self.stack[base + slot] = self.peek(0);
            }
            OpCode::GetGlobal => {
                let name_ref = self.read_string_constant();
                let hash = self.heap.get_string(name_ref).hash;
                match self.globals.get(name_ref, hash).copied() {
                    Some(value) => self.push(value),
                    None => {
                        let name = self.heap.get_string(name_ref).value.to_string();
                        return Err(self.runtime_error(&format!("Undefined variable '{name}'.")));
                    }
                }
            }
            OpCode::DefineGlobal => {
                let name_ref = self.read_string_constant();
                let hash = self.heap.get_string(name_ref).hash;
                let value = self.pop();
                self.globals.set(name_ref, hash, value);
            }
            OpCode::SetGlobal => {
                let name_ref = self.read_string_constant();
                let hash = self.heap.get_string(name_ref).hash;
                let value = self.peek(0);
                if self.globals.set(name_ref, hash, value) {
                    self.globals.delete(name_ref, hash);
                    let name = self.heap.get_string(name_ref).value.to_string();
                    return Err(self.runtime_error(&format!("Undefined variable '{name}'.")));
                }
            }
            OpCode::GetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue_ref = self.closure_upvalue(slot);
                let value = match self.heap.get(upvalue_ref) {
                    Obj::Upvalue(u) => match u.state {
                        UpvalueState::Open(stack_slot) => self.stack[stack_slot],
                        UpvalueState::Closed(v) => v,
                    },
                    _ => unreachable!(),
                };
                self.push(value);
            }
            OpCode::SetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue_ref = self.closure_upvalue(slot);
                let value = self.peek(0);
                let open_slot = match self.heap.get_mut(upvalue_ref) {
                    Obj::Upvalue(u) => match &mut u.state {
                        UpvalueState::Open(stack_slot) => Some(*stack_slot),
                        UpvalueState::Closed(v) => {
                            *v = value;
                            None
                        }
                    },
                    _ => unreachable!(),
                };
                if let Some(s) = open_slot {
                    self.stack[s] = value;
                }
            }
            OpCode::GetProperty => self.get_property()?,
            OpCode::SetProperty => self.set_property()?,
            OpCode::GetSuper => {
                let name_ref = self.read_string_constant();
                let superclass_ref = self.pop().as_obj().expect("compiler only emits GET_SUPER under a class body");
                self.bind_method(superclass_ref, name_ref)?;
            }
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b));
            }
            OpCode::Greater => self.binary_numeric(|a, b| Value::Bool(a > b))?,
            OpCode::Less => self.binary_numeric(|a, b| Value::Bool(a < b))?,
            OpCode::Add => self.add()?,
            OpCode::Subtract => self.binary_numeric(|a, b| Value::Number(a - b))?,
            OpCode::Multiply => self.binary_numeric(|a, b| Value::Number(a * b))?,
            OpCode::Divide => self.binary_numeric(|a, b| Value::Number(a / b))?,
            OpCode::Not => {
                let v = self.pop();
                self.push(Value::Bool(v.is_falsey()));
            }
            OpCode::Negate => match self.peek(0).as_number() {
                Some(n) => {
                    self.pop();
                    self.push(Value::Number(-n));
                }
                None => return Err(self.runtime_error("Operand must be a number.")),
            },
            OpCode::Print => {
                let value = self.pop();
                let text = format_value(&self.heap, &value);
                let _ = writeln!(self.out, "{text}");
            }
            OpCode::Jump => {
                let offset = self.read_u16();
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16();
                if self.peek(0).is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16();
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }
            OpCode::Call => {
                let arg_count = self.read_byte();
                let callee = self.peek(arg_count as usize);
                self.call_value(callee, arg_count)?;
            }
            OpCode::Invoke => {
                let name_ref = self.read_string_constant();
                let arg_count = self.read_byte();
                self.invoke(name_ref, arg_count)?;
            }
            OpCode::SuperInvoke => {
                let name_ref = self.read_string_constant();
                let arg_count = self.read_byte();
                let superclass_ref =
                    self.pop().as_obj().expect("compiler only emits SUPER_INVOKE under a class body");
                self.invoke_from_class(superclass_ref, name_ref, arg_count)?;
            }
            OpCode::Closure => self.make_closure(),
            OpCode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }
            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("run() never pops past the script frame");
                self.close_upvalues(frame.slot_base);
                if self.frames.is_empty() {
                    return Ok(Signal::Done);
                }
                self.stack.truncate(frame.slot_base);
                self.push(result);
            }
            OpCode::Class => {
                let name_ref = self.read_string_constant();
                self.maybe_collect();
                let class_ref = self.heap.alloc(Obj::Class(LClass { name: name_ref, methods: Table::new() }));
                self.push(Value::Obj(class_ref));
            }
            OpCode::Inherit => self.inherit()?,
            OpCode::Method => {
                let name_ref = self.read_string_constant();
                let method = self.pop();
                let hash = self.heap.get_string(name_ref).hash;
                let class_ref = self.peek(0).as_obj().expect("compiler only emits METHOD inside a class body");
                match self.heap.get_mut(class_ref) {
                    Obj::Class(c) => {
                        c.methods.set(name_ref, hash, method);
                    }
                    _ => unreachable!(),
                }
            }
        }
        Ok(Signal::Continue)
    }

    fn closure_upvalue(&self, slot: usize) -> ObjRef {
        match self.heap.get(self.current_closure()) {
            Obj::Closure(c) => c.upvalues[slot],
            _ => unreachable!(),
        }
    }

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn is_string(&self, value: Value) -> bool {
        matches!(value.as_obj(), Some(r) if matches!(self.heap.get(r), Obj::String(_)))
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let (a, b) = (self.peek(1), self.peek(0));
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(x + y));
                Ok(())
            }
            _ if self.is_string(a) && self.is_string(b) => self.concatenate(),
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn concatenate(&mut self) -> Result<(), RuntimeError> {
        let a_ref = self.peek(1).as_obj().unwrap();
        let b_ref = self.peek(0).as_obj().unwrap();
        let combined = format!("{}{}", self.heap.get_string(a_ref).value, self.heap.get_string(b_ref).value);
        self.maybe_collect();
        let result = self.heap.intern(&combined);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
        Ok(())
    }

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let name_ref = self.read_string_constant();
        let instance_ref = self.require_instance(self.peek(0), "Only instances have properties.")?;
        let hash = self.heap.get_string(name_ref).hash;
        let field = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.fields.get(name_ref, hash).copied(),
            _ => unreachable!(),
        };
        match field {
            Some(value) => {
                self.pop();
                self.push(value);
            }
            None => {
                let class_ref = match self.heap.get(instance_ref) {
                    Obj::Instance(i) => i.class,
                    _ => unreachable!(),
                };
                self.bind_method(class_ref, name_ref)?;
            }
        }
        Ok(())
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let name_ref = self.read_string_constant();
        let instance_ref = self.require_instance(self.peek(1), "Only instances have fields.")?;
        let hash = self.heap.get_string(name_ref).hash;
        let value = self.peek(0);
        match self.heap.get_mut(instance_ref) {
            Obj::Instance(i) => {
                i.fields.set(name_ref, hash, value);
            }
            _ => unreachable!(),
        }
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn require_instance(&self, value: Value, message: &str) -> Result<ObjRef, RuntimeError> {
        match value.as_obj() {
            Some(r) if matches!(self.heap.get(r), Obj::Instance(_)) => Ok(r),
            _ => Err(self.runtime_error(message)),
        }
    }

    fn bind_method(&mut self, class_ref: ObjRef, name_ref: ObjRef) -> Result<(), RuntimeError> {
        let hash = self.heap.get_string(name_ref).hash;
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(name_ref, hash).copied(),
            _ => unreachable!(),
        };
        let method_ref = match method {
            Some(Value::Obj(r)) => r,
            _ => {
                let name = self.heap.get_string(name_ref).value.to_string();
                return Err(self.runtime_error(&format!("Undefined property '{name}'.")));
            }
        };
        let receiver = self.peek(0);
        self.maybe_collect();
        let bound_ref = self.heap.alloc(Obj::BoundMethod(LBoundMethod { receiver, method: method_ref }));
        self.pop();
        self.push(Value::Obj(bound_ref));
        Ok(())
    }

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass_ref = match self.peek(1).as_obj() {
            Some(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let subclass_ref = self.peek(0).as_obj().expect("compiler only emits INHERIT with a class on top");
        let super_methods = match self.heap.get(superclass_ref) {
            Obj::Class(c) => c.methods.clone(),
            _ => unreachable!(),
        };
        match self.heap.get_mut(subclass_ref) {
            Obj::Class(c) => c.methods.copy_from(&super_methods),
            _ => unreachable!(),
        }
        self.pop();
        Ok(())
    }

    fn make_closure(&mut self) {
        let function_ref = self.read_constant().as_obj().expect("compiler always loads a Function constant for CLOSURE");
        let upvalue_count = match self.heap.get(function_ref) {
            Obj::Function(f) => f.upvalue_count,
            _ => unreachable!(),
        };
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = self.read_byte();
            if is_local {
                let base = self.frames.last().unwrap().slot_base;
                upvalues.push(self.capture_upvalue(base + index as usize));
            } else {
                upvalues.push(self.closure_upvalue(index as usize));
            }
        }
        self.maybe_collect();
        let closure_ref = self.heap.alloc(Obj::Closure(LClosure { function: function_ref, upvalues }));
        self.push(Value::Obj(closure_ref));
    }

    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjRef {
        let existing = self
            .open_upvalues
            .iter()
            .find(|&&r| {
                matches!(self.heap.get(r), Obj::Upvalue(u) if matches!(u.state, UpvalueState::Open(s) if s == stack_slot))
            })
            .copied();
        if let Some(r) = existing {
            return r;
        }
        self.maybe_collect();
        let up_ref = self.heap.alloc(Obj::Upvalue(braise_core::object::LUpvalue { state: UpvalueState::Open(stack_slot) }));
        self.open_upvalues.push(up_ref);
        up_ref
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            let open_slot = match self.heap.get(r) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Open(s) => Some(s),
                    UpvalueState::Closed(_) => None,
                },
                _ => unreachable!(),
            };
            match open_slot {
                Some(s) if s >= from_slot => {
                    let value = self.stack[s];
                    if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                        u.state = UpvalueState::Closed(value);
                    }
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        let obj_ref = match callee.as_obj() {
            Some(r) => r,
            None => return Err(self.runtime_error("Can only call functions and classes.")),
        };

        enum Kind {
            Closure,
            Native(NativeFn),
            Class,
            BoundMethod(Value, ObjRef),
            Uncallable,
        }

        let kind = match self.heap.get(obj_ref) {
            Obj::Closure(_) => Kind::Closure,
            Obj::Native(n) => Kind::Native(n.function),
            Obj::Class(_) => Kind::Class,
            Obj::BoundMethod(b) => Kind::BoundMethod(b.receiver, b.method),
            _ => Kind::Uncallable,
        };

        match kind {
            Kind::Closure => self.call_closure(obj_ref, arg_count),
            Kind::Native(function) => self.call_native(function, arg_count),
            Kind::Class => self.call_class(obj_ref, arg_count),
            Kind::BoundMethod(receiver, method) => {
                let start = self.stack.len() - arg_count as usize - 1;
                self.stack[start] = receiver;
                self.call_closure(method, arg_count)
            }
            Kind::Uncallable => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_native(&mut self, function: NativeFn, arg_count: u8) -> Result<(), RuntimeError> {
        let start = self.stack.len() - arg_count as usize;
        let args = self.stack[start..].to_vec();
        match function(&args) {
            Ok(result) => {
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(&message)),
        }
    }

    fn call_class(&mut self, class_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        self.maybe_collect();
        let instance_ref = self.heap.alloc(Obj::Instance(LInstance { class: class_ref, fields: Table::new() }));
        let start = self.stack.len() - arg_count as usize - 1;
        self.stack[start] = Value::Obj(instance_ref);

        let hash = self.heap.get_string(self.init_string).hash;
        let initializer = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(self.init_string, hash).copied(),
            _ => unreachable!(),
        };
        match initializer {
            Some(Value::Obj(method_ref)) => self.call_closure(method_ref, arg_count),
            Some(_) => unreachable!("methods table only ever stores closures"),
            None => {
                if arg_count != 0 {
                    return Err(self.runtime_error(&format!("Expected 0 arguments but got {arg_count}.")));
                }
                Ok(())
            }
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let function_ref = match self.heap.get(closure_ref) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let arity = match self.heap.get(function_ref) {
            Obj::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if arg_count != arity {
            return Err(self.runtime_error(&format!("Expected {arity} arguments but got {arg_count}.")));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base });
        Ok(())
    }

    fn invoke(&mut self, name_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let instance_ref = self.require_instance(self.peek(arg_count as usize), "Only instances have methods.")?;
        let hash = self.heap.get_string(name_ref).hash;
        let field = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.fields.get(name_ref, hash).copied(),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        let class_ref = match self.heap.get(instance_ref) {
            Obj::Instance(i) => i.class,
            _ => unreachable!(),
        };
        self.invoke_from_class(class_ref, name_ref, arg_count)
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let hash = self.heap.get_string(name_ref).hash;
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(name_ref, hash).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(method_ref)) => self.call_closure(method_ref, arg_count),
            _ => {
                let name = self.heap.get_string(name_ref).value.to_string();
                Err(self.runtime_error(&format!("Undefined property '{name}'.")))
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| e.to_string())?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_capturing(source: &str) -> String {
        let buffer = SharedBuffer::default();
        let mut vm = Vm::with_writer(VmOptions::default(), buffer.clone());
        let script = braise_compiler::compile(source, vm.heap_mut()).expect("should compile");
        vm.interpret(script).expect("should run without error");
        let bytes = buffer.0.borrow().clone();
        String::from_utf8(bytes).expect("print only ever writes UTF-8 text")
    }

    #[test]
    fn arithmetic_and_print() {
        let out = run_capturing("print 1 + 2 * 3;");
        assert_eq!(out, "7\n");
    }

    #[test]
    fn string_concatenation_and_equality() {
        let out = run_capturing(r#"print "foo" + "bar"; print "x" == "x";"#);
        assert_eq!(out, "foobar\ntrue\n");
    }

    #[test]
    fn closures_share_mutable_upvalue() {
        let source = r#"
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
            var counter = makeCounter();
            print counter();
            print counter();
        "#;
        let out = run_capturing(source);
        assert_eq!(out, "1\n2\n");
    }

    #[test]
    fn classes_inheritance_and_super() {
        let source = r#"
            class Animal {
                speak() { return "..."; }
                describe() { return "I say " + this.speak(); }
            }
            class Dog < Animal {
                speak() { return "woof"; }
                describe() { return super.describe() + "!"; }
            }
            print Dog().describe();
        "#;
        let out = run_capturing(source);
        assert_eq!(out, "I say woof!\n");
    }

    #[test]
    fn initializer_returns_instance_implicitly() {
        let source = r#"
            class Point {
                init(x, y) {
                    this.x = x;
                    this.y = y;
                }
            }
            var p = Point(1, 2);
            print p.x + p.y;
        "#;
        let out = run_capturing(source);
        assert_eq!(out, "3\n");
    }

    #[test]
    fn runtime_error_reports_stack_trace() {
        let mut vm = Vm::with_writer(VmOptions::default(), SharedBuffer::default());
        let source = r#"
            fun broken() {
                return 1 + "two";
            }
            broken();
        "#;
        let script = braise_compiler::compile(source, vm.heap_mut()).expect("should compile");
        let err = vm.interpret(script).expect_err("adding a number and a string must fail");
        assert!(err.message.contains("Operands must be"));
        assert!(err.trace.iter().any(|line| line.contains("broken()")));
    }
}
