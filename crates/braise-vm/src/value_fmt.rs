//! value_fmt.rs — rendu textuel d'une `Value`, avec accès au tas.
//!
//! `braise_core::Value`'s `Display` ne peut pas nommer un objet (une chaîne,
//! une classe...) sans consulter le `Heap` qui le possède ; ce module ajoute
//! cette couche, utilisée par `print` et par les messages d'erreur.

use braise_core::object::Obj;
use braise_core::{Heap, ObjRef, Value};

pub fn format_value(heap: &Heap, value: &Value) -> String {
    match value {
        Value::Obj(r) => format_obj(heap, *r),
        other => other.to_string(),
    }
}

fn format_obj(heap: &Heap, r: ObjRef) -> String {
    match heap.get(r) {
        Obj::String(s) => s.value.to_string(),
        Obj::Function(f) => match f.name {
            Some(name) => format!("<fn {}>", heap.get_string(name).value),
            None => "<script>".to_string(),
        },
        Obj::Closure(c) => format_obj(heap, c.function),
        Obj::Upvalue(_) => "<upvalue>".to_string(),
        Obj::Class(c) => heap.get_string(c.name).value.to_string(),
        Obj::Instance(i) => {
            let class_name = match heap.get(i.class) {
                Obj::Class(c) => c.name,
                _ => unreachable!("LInstance::class always references a Class object"),
            };
            format!("{} instance", heap.get_string(class_name).value)
        }
        Obj::BoundMethod(b) => format_obj(heap, b.method),
        Obj::Native(_) => "<native fn>".to_string(),
    }
}
