//! braise-core — cœur du langage Braise
//!
//! Ce crate fournit tout ce qu'il faut pour représenter un programme
//! compilé sans dépendre du compilateur ou de la VM :
//!
//! - `value`   : la valeur dynamique `Value` (nil/bool/number/objet) et
//!               les règles de falsiness / égalité.
//! - `object`  : le modèle d'objets tas (`Obj`) — chaînes internées,
//!               fonctions, upvalues, fermetures, classes, instances,
//!               méthodes liées, fonctions natives — et le `Heap` qui les
//!               possède (une arène adressée par indices stables, jamais
//!               par pointeur brut : voir `heap`).
//! - `chunk`   : l'unité de bytecode compilée (`Chunk`) — code, lignes,
//!               pool de constantes.
//! - `opcode`  : le jeu d'instructions à un octet.
//! - `table`   : table de hachage à adressage ouvert (utilisée pour les
//!               globales et les champs d'instance).
//! - `gc`      : la passe de collecte mark-sweep, paramétrée par un
//!               ensemble de racines fourni par l'appelant (compilateur ou
//!               VM), pour que les deux partagent la même implémentation.
//!
//! Aucun `unsafe` n'est requis : le tas est une arène `Vec` dont les objets
//! sont adressés par `ObjRef` (un indice stable), jamais déplacés.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod chunk;
pub mod gc;
pub mod object;
pub mod opcode;
pub mod table;
pub mod value;

pub use chunk::Chunk;
pub use gc::{collect_garbage, GcReport, RootSet};
pub use object::{Heap, Obj, ObjRef};
pub use opcode::OpCode;
pub use value::Value;
