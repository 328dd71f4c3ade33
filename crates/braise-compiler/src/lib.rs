//! braise-compiler — scanner et compilateur de Braise vers le bytecode
//! `braise-core`.
//!
//! Compilation mono-passe, à la Pratt : pas d'arbre de syntaxe
//! intermédiaire, chaque règle de grammaire émet directement dans le
//! `Chunk` de la fonction en cours de compilation. Le scanner (`scanner`)
//! est paresseux ; le compilateur (`compiler`) ne garde qu'un jeton de
//! lookahead.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod compiler;
pub mod scanner;

pub use compiler::{compile, CompileError, CompileErrors};
