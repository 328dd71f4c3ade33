//! object.rs — modèle d'objets tas et arène qui les possède.
//!
//! Les huit natures d'objet (String, Function, Upvalue, Closure, Class,
//! Instance, BoundMethod, Native) partagent un header conceptuel (tag +
//! bit `marked` + chaînage dans la liste d'objets vivants). Plutôt qu'une
//! liste chaînée de pointeurs bruts — ce que `unsafe_code = "forbid"`
//! interdit ici — le tas est une arène `Vec<Slot>` adressée par indices
//! stables (`ObjRef`), adaptés aux langages cibles qui peuvent exprimer un
//! tas sûr sans pointeurs bruts.
//!
//! L'ordre d'allocation dans le `Vec` joue le rôle de la "liste d'objets"
//! du tas ; le balayage (`sweep`) la parcourt dans cet ordre.

use std::fmt;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Référence stable vers un objet du tas. Un indice d'arène, jamais
/// déplacé par le GC (non-déplaçant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<obj #{}>", self.0)
    }
}

/// Chaîne immuable et internée. Stocke sa longueur (implicite via `Box<str>`)
/// et son hash FNV-1a 32 bits, calculé une fois à l'internement.
#[derive(Debug, Clone)]
pub struct LString {
    pub value: Box<str>,
    pub hash: u32,
}

/// Fonction compilée : jamais invoquée directement (toujours via une
/// `LClosure`), arité et nombre d'upvalues bornés à 255.
#[derive(Debug, Clone)]
pub struct LFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` pour le script top-level (affiché `<script>`).
    pub name: Option<ObjRef>,
}

/// État d'un upvalue : ouvert (pointe vers une case de pile vivante) ou
/// fermé (possède sa valeur, copiée au moment de la fermeture).
#[derive(Debug, Clone)]
pub enum UpvalueState {
    /// Indice absolu dans la pile de valeurs de la VM.
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct LUpvalue {
    pub state: UpvalueState,
}

/// Fermeture : fonction + upvalues capturées (un par entrée de
/// `function.upvalue_count`, garanti non-nul après `OP_CLOSURE`).
#[derive(Debug, Clone)]
pub struct LClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct LClass {
    pub name: ObjRef,
    pub methods: Table,
}

#[derive(Debug, Clone)]
pub struct LInstance {
    pub class: ObjRef,
    pub fields: Table,
}

#[derive(Debug, Clone, Copy)]
pub struct LBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// Fonction native hôte : `(argc, argv) -> Result<Value, message>`.
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub struct LNative {
    pub name: ObjRef,
    pub function: NativeFn,
}

impl fmt::Debug for LNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LNative").field("name", &self.name).finish()
    }
}

/// Une des huit natures d'objet tas.
#[derive(Debug, Clone)]
pub enum Obj {
    String(LString),
    Function(LFunction),
    Upvalue(LUpvalue),
    Closure(LClosure),
    Class(LClass),
    Instance(LInstance),
    BoundMethod(LBoundMethod),
    Native(LNative),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Closure(_) => "closure",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
            Obj::Native(_) => "native function",
        }
    }

    /// Poids approximatif en octets, pour la comptabilité `bytes_allocated`.
    /// Une convention de mesure interne au crate — ce qui compte est
    /// qu'elle soit appliquée de façon cohérente à l'allocation et à la
    /// libération, pas qu'elle reflète l'allocateur système.
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.value.len(),
            Obj::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>(),
            Obj::Upvalue(_) => 0,
            Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            Obj::Class(c) => c.methods.capacity() * std::mem::size_of::<(ObjRef, Value)>(),
            Obj::Instance(i) => i.fields.capacity() * std::mem::size_of::<(ObjRef, Value)>(),
            Obj::BoundMethod(_) => 0,
            Obj::Native(_) => 0,
        }
    }
}

enum Slot {
    Occupied { obj: Obj, marked: bool },
    Free { next: Option<u32> },
}

/// Facteur de croissance du seuil de collecte.
pub const HEAP_GROWTH_FACTOR: usize = 2;
/// Seuil initial avant la première collecte.
const INITIAL_NEXT_GC: usize = 1 << 20;

/// L'arène qui possède tous les objets tas de la VM, plus la table des
/// chaînes internées. Toute chaîne passe par `intern`, sans exception :
/// c'est ce qui rend l'égalité de chaîne une comparaison d'`ObjRef`.
pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    strings: StringInterner,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            strings: StringInterner::new(),
        }
    }

    /// Devrait-on lancer une collecte avant la prochaine allocation ?
    /// Le mode "stress" force une collecte systématique, utile pour
    /// exercer le GC sous des charges qui ne l'atteindraient jamais sinon.
    pub fn should_collect(&self, stress: bool) -> bool {
        stress || self.bytes_allocated > self.next_gc
    }

    /// À appeler juste après une collecte : recalibre le seuil.
    pub fn update_next_gc(&mut self) {
        self.next_gc = self.bytes_allocated * HEAP_GROWTH_FACTOR;
    }

    fn raw_alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.approx_size();
        if let Some(free) = self.free_head {
            let idx = free as usize;
            let next = match &self.slots[idx] {
                Slot::Free { next } => *next,
                Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            self.free_head = next;
            self.slots[idx] = Slot::Occupied { obj, marked: false };
            ObjRef(free)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot::Occupied { obj, marked: false });
            ObjRef(idx)
        }
    }

    /// Alloue un objet quelconque autre qu'une chaîne (les chaînes passent
    /// par `intern`, qui garantit l'unicité).
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        debug_assert!(!matches!(obj, Obj::String(_)), "use Heap::intern for strings");
        self.raw_alloc(obj)
    }

    /// Interne une chaîne : renvoie la référence existante si une chaîne de
    /// contenu identique est déjà internée, sinon en alloue une nouvelle et
    /// l'enregistre. L'internement n'est pas une simple optimisation : sans
    /// elle, l'égalité de chaîne ne pourrait pas se réduire à l'égalité
    /// d'`ObjRef`.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        let hash = fnv1a_32(s.as_bytes());
        if let Some(existing) = self.strings.find(&self.slots, s, hash) {
            return existing;
        }
        let obj_ref = self.raw_alloc(Obj::String(LString { value: s.into(), hash }));
        self.strings.insert(obj_ref, hash, &self.slots);
        obj_ref
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.0 as usize] {
            Slot::Occupied { obj, .. } => obj,
            Slot::Free { .. } => panic!("dangling ObjRef {r}"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.0 as usize] {
            Slot::Occupied { obj, .. } => obj,
            Slot::Free { .. } => panic!("dangling ObjRef {r}"),
        }
    }

    pub fn get_string(&self, r: ObjRef) -> &LString {
        get_string_in(&self.slots, r)
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        matches!(self.slots[r.0 as usize], Slot::Occupied { marked: true, .. })
    }

    /// Marque un objet. Renvoie `true` s'il n'était pas déjà marqué (pour
    /// piloter la pile grise sans retraiter un objet déjà noirci).
    pub fn mark(&mut self, r: ObjRef) -> bool {
        match &mut self.slots[r.0 as usize] {
            Slot::Occupied { marked, .. } if !*marked => {
                *marked = true;
                true
            }
            _ => false,
        }
    }

    /// Énumère les références directes d'un objet. Ne marque rien
    /// elle-même : la pile grise appartient à l'appelant.
    pub fn children_of(&self, r: ObjRef) -> Vec<ObjRef> {
        match self.get(r) {
            Obj::String(_) | Obj::Native(_) => Vec::new(),
            Obj::Function(f) => {
                let mut out: Vec<ObjRef> = f.name.into_iter().collect();
                for c in &f.chunk.constants {
                    if let Value::Obj(o) = c {
                        out.push(*o);
                    }
                }
                out
            }
            Obj::Closure(c) => {
                let mut out = vec![c.function];
                out.extend(c.upvalues.iter().copied());
                out
            }
            Obj::Upvalue(u) => match &u.state {
                UpvalueState::Closed(Value::Obj(o)) => vec![*o],
                _ => Vec::new(),
            },
            Obj::Class(c) => {
                let mut out = vec![c.name];
                out.extend(c.methods.object_refs());
                out
            }
            Obj::Instance(i) => {
                let mut out = vec![i.class];
                out.extend(i.fields.object_refs());
                out
            }
            Obj::BoundMethod(b) => {
                let mut out = vec![b.method];
                if let Value::Obj(o) = b.receiver {
                    out.push(o);
                }
                out
            }
        }
    }

    /// Nettoie la table des chaînes internées des entrées non marquées.
    /// Doit être appelé après le parcours de marquage et avant `sweep`, sans
    /// quoi une chaîne morte resterait trouvable par `intern` alors que son
    /// slot est sur le point d'être recyclé.
    pub fn clean_string_interner(&mut self) {
        self.strings.retain_marked(&self.slots);
    }

    /// Balaye l'arène : libère les objets non marqués, démarque les
    /// survivants. Renvoie le nombre d'objets libérés.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for idx in 0..self.slots.len() {
            match &mut self.slots[idx] {
                Slot::Occupied { marked: true, .. } => {
                    if let Slot::Occupied { marked, .. } = &mut self.slots[idx] {
                        *marked = false;
                    }
                }
                Slot::Occupied { marked: false, .. } => {
                    let size = match &self.slots[idx] {
                        Slot::Occupied { obj, .. } => obj.approx_size(),
                        Slot::Free { .. } => 0,
                    };
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                    self.slots[idx] = Slot::Free { next: self.free_head };
                    self.free_head = Some(idx as u32);
                    freed += 1;
                }
                Slot::Free { .. } => {}
            }
        }
        freed
    }

    /// Nombre d'objets actuellement vivants (pour les tests/invariants).
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Occupied { .. })).count()
    }
}

fn get_string_in(slots: &[Slot], r: ObjRef) -> &LString {
    match &slots[r.0 as usize] {
        Slot::Occupied { obj: Obj::String(s), .. } => s,
        Slot::Occupied { obj, .. } => panic!("expected string, found {}", obj.kind_name()),
        Slot::Free { .. } => panic!("dangling ObjRef {r}"),
    }
}

/// 32-bit FNV-1a (offset basis 2166136261, prime 16777619).
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Table des chaînes internées : adressage ouvert, sondage linéaire — même
/// discipline que `Table`, mais la comparaison de clé se fait sur le
/// contenu d'octets (via le tas), pas sur l'identité d'objet, puisque
/// c'est ici qu'on décide si une chaîne existe déjà.
struct StringInterner {
    slots: Vec<Option<ObjRef>>,
    count: usize, // occupés + tombstones (représentés par aucune entrée ici: on ne pose jamais de tombstone explicite, voir retain_marked)
}

impl StringInterner {
    fn new() -> Self {
        Self { slots: vec![None; 8], count: 0 }
    }

    fn find(&self, heap_slots: &[Slot], chars: &str, hash: u32) -> Option<ObjRef> {
        if self.slots.is_empty() {
            return None;
        }
        let cap = self.slots.len();
        let mut idx = (hash as usize) & (cap - 1);
        for _ in 0..cap {
            match self.slots[idx] {
                None => return None,
                Some(r) => {
                    let s = get_string_in(heap_slots, r);
                    if s.hash == hash && &*s.value == chars {
                        return Some(r);
                    }
                }
            }
            idx = (idx + 1) & (cap - 1);
        }
        None
    }

    fn insert(&mut self, obj_ref: ObjRef, hash: u32, heap_slots: &[Slot]) {
        if (self.count + 1) as f64 > self.slots.len() as f64 * 0.75 {
            self.grow(heap_slots);
        }
        let cap = self.slots.len();
        let mut idx = (hash as usize) & (cap - 1);
        loop {
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(obj_ref);
                self.count += 1;
                return;
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    fn grow(&mut self, heap_slots: &[Slot]) {
        let new_cap = (self.slots.len() * 2).max(8);
        let old = std::mem::replace(&mut self.slots, vec![None; new_cap]);
        self.count = 0;
        for slot in old.into_iter().flatten() {
            let hash = get_string_in(heap_slots, slot).hash;
            self.insert_no_grow(slot, hash);
        }
    }

    fn insert_no_grow(&mut self, obj_ref: ObjRef, hash: u32) {
        let cap = self.slots.len();
        let mut idx = (hash as usize) & (cap - 1);
        loop {
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(obj_ref);
                self.count += 1;
                return;
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    /// Retire les entrées dont l'objet n'est plus marqué. Appelé par
    /// `Heap::clean_string_interner` avant le balayage.
    fn retain_marked(&mut self, slots: &[Slot]) {
        for slot in self.slots.iter_mut() {
            if let Some(r) = *slot {
                let still_marked = matches!(slots[r.0 as usize], Slot::Occupied { marked: true, .. });
                if !still_marked {
                    *slot = None;
                    self.count = self.count.saturating_sub(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_by_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b, "same content must yield the same object");
        let c = heap.intern("world");
        assert_ne!(a, c);
    }

    #[test]
    fn sweep_frees_unmarked_and_keeps_marked() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let _drop = heap.intern("drop-me");
        heap.mark(keep);
        heap.clean_string_interner();
        let freed = heap.sweep();
        assert_eq!(freed, 1);
        assert_eq!(heap.live_count(), 1);
        assert!(heap.strings.find(&heap.slots, "keep", fnv1a_32(b"keep")).is_some());
        assert!(heap.strings.find(&heap.slots, "drop-me", fnv1a_32(b"drop-me")).is_none());
    }

    #[test]
    fn reinterning_after_sweep_reuses_freed_slot() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        heap.intern("temp");
        heap.mark(keep);
        heap.clean_string_interner();
        heap.sweep();
        let fresh = heap.intern("temp");
        assert_eq!(heap.get_string(fresh).value.as_ref(), "temp");
    }

    #[test]
    fn fnv1a_matches_reference_constants() {
        // valeurs de test croisées avec l'algorithme FNV-1a standard
        assert_eq!(fnv1a_32(b""), 2166136261);
    }
}
