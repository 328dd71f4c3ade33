//! compiler.rs — compilateur Pratt mono-passe, de la source au bytecode.
//!
//! Pas d'AST : chaque règle de grammaire émet directement dans le `Chunk`
//! de la fonction actuellement compilée (`Frame::chunk`). La pile de
//! `Frame` suit l'imbrication des déclarations `fun`/méthodes ; la pile de
//! `ClassState` suit l'imbrication des déclarations `class`, pour que
//! `this` et `super` résolvent dans le bon contexte et pour interdire
//! l'héritage d'une classe par elle-même.

use std::fmt;

use braise_core::object::{LFunction, Obj};
use braise_core::{Chunk, Heap, ObjRef, OpCode, Value};

use crate::scanner::{Scanner, Token, TokenKind};

const MAX_LOCALS: usize = u8::MAX as usize + 1;
const MAX_ARGS: usize = u8::MAX as usize;

#[derive(Debug, thiserror::Error)]
#[error("[line {line}] Error{at}: {message}")]
pub struct CompileError {
    pub line: u32,
    pub at: String,
    pub message: String,
}

#[derive(Debug)]
pub struct CompileErrors(pub Vec<CompileError>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        LeftParen | Dot => Precedence::Call,
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `None` tant que l'initialiseur de la variable n'est pas encore
    /// compilé, pour rejeter `var a = a;`.
    depth: Option<i32>,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueInfo {
    index: u8,
    is_local: bool,
}

struct Frame<'src> {
    function_name: Option<ObjRef>,
    chunk: Chunk,
    arity: u8,
    function_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueInfo>,
    scope_depth: i32,
}

impl<'src> Frame<'src> {
    fn new(function_type: FunctionType, function_name: Option<ObjRef>) -> Self {
        // Slot 0 est réservé : le récepteur pour les méthodes, une valeur
        // `nil` invisible pour les fonctions/le script top-level.
        let receiver_name = if matches!(function_type, FunctionType::Method | FunctionType::Initializer) {
            "this"
        } else {
            ""
        };
        Frame {
            function_name,
            chunk: Chunk::new(),
            arity: 0,
            function_type,
            locals: vec![Local { name: receiver_name, depth: Some(0), is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'heap mut Heap,
    frames: Vec<Frame<'src>>,
    classes: Vec<ClassState>,
}

/// Compile un programme complet en une fonction top-level (le "script").
/// Renvoie l'`ObjRef` de cette fonction, prête à être enveloppée dans une
/// fermeture et exécutée par la VM.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileErrors> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: Token { kind: TokenKind::Eof, lexeme: "", line: 0 },
        current: Token { kind: TokenKind::Eof, lexeme: "", line: 0 },
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        heap,
        frames: vec![Frame::new(FunctionType::Script, None)],
        classes: Vec::new(),
    };

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");

    let script = compiler.end_frame();
    if compiler.had_error {
        Err(CompileErrors(compiler.errors))
    } else {
        Ok(script)
    }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    // ---- jetons ----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme.to_string());
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message.to_string());
    }

    fn error_at_current(&mut self, message: String) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message.to_string());
    }

    fn error_at(&mut self, token: Token<'src>, message: String) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(CompileError { line: token.line, at, message });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- émission ----

    fn frame(&mut self) -> &mut Frame<'src> {
        self.frames.last_mut().expect("at least the script frame")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.frame().chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_constant(&mut self, value: Value) {
        match self.chunk().add_constant(value) {
            Ok(index) => self.emit_op_byte(OpCode::Constant, index),
            Err(_) => self.error("Too many constants in one chunk."),
        }
    }

    fn make_string_constant(&mut self, text: &str) -> u8 {
        let obj_ref = self.heap.intern(text);
        match self.chunk().add_constant(Value::Obj(obj_ref)) {
            Ok(index) => index,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    /// Émet un saut conditionnel ou inconditionnel avec un opérande 16-bit
    /// placeholder ; renvoie l'offset à corriger via `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let [hi, lo] = (jump as u16).to_be_bytes();
        self.chunk().code[offset] = hi;
        self.chunk().code[offset + 1] = lo;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn emit_return(&mut self) {
        if self.frame().function_type == FunctionType::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Termine la compilation de la fonction courante et renvoie son
    /// `ObjRef` (allouée dans le tas, jamais désallouée par cette passe :
    /// elle vit au moins jusqu'à ce que le script l'utilise).
    fn end_frame(&mut self) -> ObjRef {
        self.emit_return();
        let frame = self.frames.pop().expect("frame pushed by caller");
        let function = LFunction {
            arity: frame.arity,
            upvalue_count: frame.upvalues.len() as u8,
            chunk: frame.chunk,
            name: frame.function_name,
        };
        self.heap.alloc(Obj::Function(function))
    }

    // ---- scopes et variables locales ----

    fn begin_scope(&mut self) {
        self.frame().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame().scope_depth -= 1;
        let depth = self.frame().scope_depth;
        while let Some(local) = self.frame().locals.last() {
            if local.depth.map(|d| d > depth).unwrap_or(false) {
                if self.frame().locals.last().unwrap().is_captured {
                    self.emit_op(OpCode::CloseUpvalue);
                } else {
                    self.emit_op(OpCode::Pop);
                }
                self.frame().locals.pop();
            } else {
                break;
            }
        }
    }

    fn identifier_equal(a: &str, b: &str) -> bool {
        a == b
    }

    fn resolve_local(&mut self, depth_back: usize, name: &str) -> Option<u8> {
        let frame_idx = self.frames.len() - 1 - depth_back;
        let mut found: Option<(usize, bool)> = None;
        {
            let frame = &self.frames[frame_idx];
            for (i, local) in frame.locals.iter().enumerate().rev() {
                if Self::identifier_equal(local.name, name) {
                    found = Some((i, local.depth.is_none()));
                    break;
                }
            }
        }
        let (index, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(index as u8)
    }

    fn resolve_upvalue(&mut self, depth_back: usize, name: &str) -> Option<u8> {
        if depth_back + 1 >= self.frames.len() {
            return None; // pas d'enclosing frame
        }
        if let Some(local_index) = self.resolve_local(depth_back + 1, name) {
            let enclosing_idx = self.frames.len() - 1 - (depth_back + 1);
            self.frames[enclosing_idx].locals[local_index as usize].is_captured = true;
            return Some(self.add_upvalue(depth_back, local_index, true));
        }
        if let Some(upvalue_index) = self.resolve_upvalue(depth_back + 1, name) {
            return Some(self.add_upvalue(depth_back, upvalue_index, false));
        }
        None
    }

    fn add_upvalue(&mut self, depth_back: usize, index: u8, is_local: bool) -> u8 {
        let frame_idx = self.frames.len() - 1 - depth_back;
        let frame = &mut self.frames[frame_idx];
        for (i, existing) in frame.upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return i as u8;
            }
        }
        if frame.upvalues.len() >= MAX_LOCALS {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueInfo { index, is_local });
        (frame.upvalues.len() - 1) as u8
    }

    fn add_local(&mut self, name: &'src str) {
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame().locals.push(Local { name, depth: None, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.frame().scope_depth;
        let mut duplicate = false;
        {
            let frame = self.frame();
            for local in frame.locals.iter().rev() {
                if local.depth.map(|d| d < depth).unwrap_or(false) {
                    break;
                }
                if Self::identifier_equal(local.name, name) {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.frame().scope_depth > 0 {
            return 0;
        }
        self.make_string_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        if let Some(local) = self.frame().locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    // ---- déclarations ----

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.make_string_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if Self::identifier_equal(class_name.lexeme, self.previous.lexeme) {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // la copie de `named_variable` laissée sur la pile

        let class = self.classes.pop().unwrap();
        if class.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let name_constant = self.make_string_constant(name);
        let function_type =
            if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.compile_function(function_type);
        self.emit_op_byte(OpCode::Method, name_constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.compile_function(FunctionType::Function);
        self.define_variable(global);
    }

    fn compile_function(&mut self, function_type: FunctionType) {
        let name = self.previous.lexeme;
        let name_ref = self.heap.intern(name);
        self.frames.push(Frame::new(function_type, Some(name_ref)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.frame().arity += 1;
                if self.frame().arity as usize > MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.".to_string());
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = self.frame().upvalues.clone();
        let function_ref = self.end_frame();
        let index = self.make_constant_objref(function_ref);
        self.emit_op_byte(OpCode::Closure, index);
        for up in upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    fn make_constant_objref(&mut self, obj_ref: ObjRef) -> u8 {
        match self.chunk().add_constant(Value::Obj(obj_ref)) {
            Ok(index) => index,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    // ---- instructions ----

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.frame().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // pas d'initialiseur
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string(),
            True | False | Nil => self.literal(kind),
            Identifier => self.variable(can_assign),
            This => self.this_expr(),
            Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | EqualEqual | BangEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(kind),
            And => self.and_expr(),
            Or => self.or_expr(),
            Dot => self.dot(can_assign),
            LeftParen => self.call(),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary() only called for - and !"),
        }
    }

    fn binary(&mut self, op_kind: TokenKind) {
        let precedence = infix_precedence(op_kind);
        self.parse_precedence(precedence.next());
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!("binary() only called for binary operator tokens"),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.make_string_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().expect("scanner guarantees a valid number");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let raw = self.previous.lexeme;
        let unescaped = unescape(&raw[1..raw.len() - 1]);
        let obj_ref = self.heap.intern(&unescaped);
        self.emit_constant(Value::Obj(obj_ref));
    }

    fn literal(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() only called for true/false/nil"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(0, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(0, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let constant = self.make_string_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expr(&mut self) {
        let superclass_state = self.classes.last().map(|c| c.has_superclass);
        match superclass_state {
            None => self.error("Can't use 'super' outside of a class."),
            Some(false) => self.error("Can't use 'super' in a class with no superclass."),
            Some(true) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_name = self.make_string_constant(self.previous.lexeme);

        let this_token = Token { kind: TokenKind::This, lexeme: "this", line: self.previous.line };
        let super_token =
            Token { kind: TokenKind::Super, lexeme: "super", line: self.previous.line };
        self.named_variable(this_token, false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_op_byte(OpCode::SuperInvoke, method_name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(super_token, false);
            self.emit_op_byte(OpCode::GetSuper, method_name);
        }
    }
}

/// Traite les échappements `\n \t \r \" \\` d'un littéral de chaîne ;
/// toute autre séquence est laissée telle quelle.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use braise_core::object::Obj;

    fn compile_ok(source: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        let script = compile(source, &mut heap).expect("should compile");
        (script, heap)
    }

    #[test]
    fn compiles_arithmetic_and_print() {
        let (script, heap) = compile_ok("print 1 + 2 * 3;");
        match heap.get(script) {
            Obj::Function(f) => {
                assert!(f.chunk.code.contains(&(OpCode::Print as u8)));
                assert!(f.chunk.code.contains(&(OpCode::Add as u8)));
                assert!(f.chunk.code.contains(&(OpCode::Multiply as u8)));
            }
            _ => panic!("expected a function"),
        }
    }

    #[test]
    fn reports_unexpected_character() {
        let mut heap = Heap::new();
        let result = compile("print 1 @ 2;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn reports_return_outside_function() {
        let mut heap = Heap::new();
        let result = compile("return 1;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn compiles_class_with_method_and_superclass() {
        let source = r#"
            class A {
                greet() { return "hi"; }
            }
            class B < A {
                init() { this.x = 1; }
            }
        "#;
        let (_, _heap) = compile_ok(source);
    }

    #[test]
    fn rejects_self_inheriting_class() {
        let mut heap = Heap::new();
        let result = compile("class A < A {}", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn compiles_closures_capturing_locals() {
        let source = r#"
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
        "#;
        let (_, _heap) = compile_ok(source);
    }

    #[test]
    fn resolves_for_loop_desugaring() {
        let (_, _heap) = compile_ok("for (var i = 0; i < 3; i = i + 1) print i;");
    }
}
