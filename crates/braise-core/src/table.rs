//! table.rs — table de hachage à adressage ouvert, sondage linéaire.
//!
//! Utilisée pour les globales de la VM, les champs d'instance et les
//! tables de méthodes de classe. Les clés sont des chaînes déjà internées
//! (`ObjRef`) : comme deux chaînes de même contenu sont toujours le même
//! objet, l'égalité de clé se réduit à l'égalité d'`ObjRef`, et le hash est
//! celui déjà calculé lors de l'internement (passé par l'appelant, jamais
//! recalculé ici).
//!
//! Capacité toujours une puissance de deux ; redimensionnement au-delà
//! d'un facteur de charge de 0.75 ; les tombstones comptent dans la charge
//! mais ne sont pas recopiés lors d'un redimensionnement.

use crate::object::ObjRef;
use crate::value::Value;

const LOAD_FACTOR_MAX: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, hash: u32, value: Value },
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    slots: Vec<Slot>,
    /// Occupés + tombstones ("count" suit la charge du tableau de sondage,
    /// pas seulement le nombre d'entrées visibles).
    count: usize,
}

/// Résultat de `find_entry`: soit une entrée correspondante ou réutilisable.
enum Found {
    Match(usize),
    Insertable(usize),
}

impl Table {
    pub fn new() -> Self {
        Self { slots: Vec::new(), count: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Occupied { .. })).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_entry(slots: &[Slot], key: ObjRef, hash: u32) -> Found {
        let cap = slots.len();
        let mut idx = (hash as usize) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &slots[idx] {
                Slot::Empty => {
                    return Found::Insertable(first_tombstone.unwrap_or(idx));
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied { key: k, .. } if *k == key => return Found::Match(idx),
                Slot::Occupied { .. } => {}
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    fn grow(&mut self) {
        let new_cap = (self.slots.len() * 2).max(INITIAL_CAPACITY);
        let mut new_slots: Vec<Slot> = (0..new_cap).map(|_| Slot::Empty).collect();
        let mut new_count = 0;
        for slot in self.slots.drain(..) {
            if let Slot::Occupied { key, hash, value } = slot {
                match Self::find_entry(&new_slots, key, hash) {
                    Found::Insertable(idx) => {
                        new_slots[idx] = Slot::Occupied { key, hash, value };
                        new_count += 1;
                    }
                    Found::Match(_) => unreachable!("fresh table cannot already contain key"),
                }
            }
        }
        self.slots = new_slots;
        self.count = new_count;
    }

    /// Insère ou remplace. Renvoie `true` si la clé est nouvelle.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.slots.is_empty() || (self.count + 1) as f64 > self.slots.len() as f64 * LOAD_FACTOR_MAX {
            self.grow();
        }
        match Self::find_entry(&self.slots, key, hash) {
            Found::Match(idx) => {
                if let Slot::Occupied { value: v, .. } = &mut self.slots[idx] {
                    *v = value;
                }
                false
            }
            Found::Insertable(idx) => {
                let is_new_bucket = matches!(self.slots[idx], Slot::Empty);
                self.slots[idx] = Slot::Occupied { key, hash, value };
                if is_new_bucket {
                    self.count += 1;
                }
                true
            }
        }
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<&Value> {
        if self.slots.is_empty() {
            return None;
        }
        match Self::find_entry(&self.slots, key, hash) {
            Found::Match(idx) => match &self.slots[idx] {
                Slot::Occupied { value, .. } => Some(value),
                _ => None,
            },
            Found::Insertable(_) => None,
        }
    }

    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Retire une entrée en posant un tombstone.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        match Self::find_entry(&self.slots, key, hash) {
            Found::Match(idx) => {
                self.slots[idx] = Slot::Tombstone;
                true
            }
            Found::Insertable(_) => false,
        }
    }

    /// Copie toutes les entrées de `other` dans `self` (utilisé par
    /// `OP_INHERIT` pour recopier les méthodes de la superclasse).
    pub fn copy_from(&mut self, other: &Table) {
        for slot in &other.slots {
            if let Slot::Occupied { key, hash, value } = slot {
                self.set(*key, *hash, *value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &Value)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((*key, value)),
            _ => None,
        })
    }

    /// Toutes les clés, plus les valeurs qui sont elles-mêmes des objets —
    /// utilisé par le traçage du GC (`Heap::children_of`).
    pub fn object_refs(&self) -> Vec<ObjRef> {
        let mut out = Vec::new();
        for slot in &self.slots {
            if let Slot::Occupied { key, value, .. } = slot {
                out.push(*key);
                if let Value::Obj(o) = value {
                    out.push(*o);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let k_a = heap.intern("a");
        let k_b = heap.intern("b");
        let hash_a = heap.get_string(k_a).hash;
        let hash_b = heap.get_string(k_b).hash;

        let mut t = Table::new();
        assert!(t.set(k_a, hash_a, Value::Number(1.0)));
        assert!(!t.set(k_a, hash_a, Value::Number(2.0)), "overwrite reports not-new");
        assert_eq!(t.get(k_a, hash_a), Some(&Value::Number(2.0)));
        assert_eq!(t.get(k_b, hash_b), None);

        assert!(t.delete(k_a, hash_a));
        assert_eq!(t.get(k_a, hash_a), None);
        assert!(!t.delete(k_a, hash_a), "double delete reports false");
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut t = Table::new();
        for i in 0..40 {
            let name = format!("k{i}");
            let key = heap.intern(&name);
            let hash = heap.get_string(key).hash;
            t.set(key, hash, Value::Number(i as f64));
        }
        assert_eq!(t.len(), 40);
        assert!(t.capacity() >= 40 * 4 / 3);
    }

    #[test]
    fn copy_from_merges_entries() {
        let mut heap = Heap::new();
        let k_a = heap.intern("a");
        let hash_a = heap.get_string(k_a).hash;
        let mut base = Table::new();
        base.set(k_a, hash_a, Value::Bool(true));

        let mut derived = Table::new();
        derived.copy_from(&base);
        assert_eq!(derived.get(k_a, hash_a), Some(&Value::Bool(true)));
    }
}
