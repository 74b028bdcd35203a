//! Handle-based object heap.
//!
//! Objects live in a slot table addressed by `HeapHandle`; values hold
//! handles, never pointers, so the table can reuse slots freely. A freed
//! slot keeps its `DESTROYED` flag until it is reallocated, which lets the
//! collector and interpreter distinguish "dangling handle" (a VM bug worth
//! panicking over) from ordinary missing data.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::name_hash;
use crate::vm::value::Value;

/// Index into the heap's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(pub u32);

/// GC mark bit.
pub const FLAG_ALIVE: u8 = 0x01;
/// Set when a slot's object has been freed.
pub const FLAG_DESTROYED: u8 = 0x02;

/// Heap-allocated object payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    Str(String),
    Array { elements: Vec<Value> },
    /// A view into a live array; reads and writes go through to the
    /// backing elements.
    Slice {
        array: HeapHandle,
        start: usize,
        len: usize,
    },
    /// Raw byte storage, indexed from script like an array of uint8.
    Buffer { bytes: Vec<u8> },
    /// Key-value pairs in insertion order. Built and populated by host
    /// natives; scripts read and write entries by index syntax.
    Map { entries: Vec<(Value, Value)> },
    /// A class instance, type object, or closure environment. Members are
    /// stored in declaration order so same-class access can go by index;
    /// the hash column serves base-class and dynamic access.
    Object {
        type_name: String,
        members: Vec<ObjectMember>,
        proto: Option<HeapHandle>,
    },
    /// Opaque host data owned by the embedding application.
    UserData(UserData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMember {
    pub hash: u32,
    pub name: String,
    pub value: Value,
}

/// Host-owned payload stored on the heap. Identity, not contents, decides
/// equality: two handles are equal only when they share the same allocation.
#[derive(Clone)]
pub struct UserData {
    type_name: &'static str,
    data: Arc<dyn Any + Send + Sync>,
}

impl UserData {
    pub fn new<T: Any + Send + Sync>(type_name: &'static str, data: T) -> Self {
        UserData {
            type_name,
            data: Arc::new(data),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({})", self.type_name)
    }
}

impl PartialEq for UserData {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl HeapObject {
    pub fn object(type_name: impl Into<String>) -> Self {
        HeapObject::Object {
            type_name: type_name.into(),
            members: Vec::new(),
            proto: None,
        }
    }

    /// Runtime type identification, as reported to scripts.
    pub fn type_name(&self) -> &str {
        match self {
            HeapObject::Str(_) => "string",
            HeapObject::Array { .. } => "array",
            HeapObject::Slice { .. } => "slice",
            HeapObject::Buffer { .. } => "buffer",
            HeapObject::Map { .. } => "map",
            HeapObject::Object { type_name, .. } => type_name,
            HeapObject::UserData(data) => data.type_name(),
        }
    }

    /// Member value by hash, not following the proto chain.
    pub fn own_member(&self, hash: u32) -> Option<&Value> {
        match self {
            HeapObject::Object { members, .. } => {
                members.iter().find(|m| m.hash == hash).map(|m| &m.value)
            }
            _ => None,
        }
    }

    pub fn member_by_index(&self, index: usize) -> Option<&Value> {
        match self {
            HeapObject::Object { members, .. } => members.get(index).map(|m| &m.value),
            _ => None,
        }
    }

    /// Set a member by hash, appending it if absent.
    pub fn set_member(&mut self, hash: u32, name: &str, value: Value) -> bool {
        match self {
            HeapObject::Object { members, .. } => {
                if let Some(member) = members.iter_mut().find(|m| m.hash == hash) {
                    member.value = value;
                } else {
                    members.push(ObjectMember {
                        hash,
                        name: name.to_string(),
                        value,
                    });
                }
                true
            }
            _ => false,
        }
    }

    /// Map entry lookup; keys compare by value.
    pub fn map_get(&self, key: &Value) -> Option<Value> {
        match self {
            HeapObject::Map { entries } => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
            }
            _ => None,
        }
    }

    /// Insert or replace a map entry, keeping insertion order for new keys.
    pub fn map_set(&mut self, key: Value, value: Value) -> bool {
        match self {
            HeapObject::Map { entries } => {
                if let Some(entry) = entries.iter_mut().find(|(k, _)| *k == key) {
                    entry.1 = value;
                } else {
                    entries.push((key, value));
                }
                true
            }
            _ => false,
        }
    }

    pub fn set_member_by_index(&mut self, index: usize, value: Value) -> bool {
        match self {
            HeapObject::Object { members, .. } => match members.get_mut(index) {
                Some(member) => {
                    member.value = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

#[derive(Debug)]
struct HeapSlot {
    flags: u8,
    value: Option<HeapObject>,
}

/// The object heap.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
    /// Allocations since the last collection; the interpreter uses this to
    /// pace GC.
    pub allocations_since_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: HeapObject) -> HeapHandle {
        self.allocations_since_gc += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.flags = 0;
            slot.value = Some(object);
            HeapHandle(index)
        } else {
            self.slots.push(HeapSlot {
                flags: 0,
                value: Some(object),
            });
            HeapHandle((self.slots.len() - 1) as u32)
        }
    }

    pub fn get(&self, handle: HeapHandle) -> Option<&HeapObject> {
        self.slots.get(handle.0 as usize).and_then(|s| {
            if s.flags & FLAG_DESTROYED != 0 {
                None
            } else {
                s.value.as_ref()
            }
        })
    }

    pub fn get_mut(&mut self, handle: HeapHandle) -> Option<&mut HeapObject> {
        self.slots.get_mut(handle.0 as usize).and_then(|s| {
            if s.flags & FLAG_DESTROYED != 0 {
                None
            } else {
                s.value.as_mut()
            }
        })
    }

    /// True when the handle points at a freed slot. Distinct from an
    /// out-of-range handle, which is always a corruption.
    pub fn is_destroyed(&self, handle: HeapHandle) -> bool {
        self.slots
            .get(handle.0 as usize)
            .map(|s| s.flags & FLAG_DESTROYED != 0)
            .unwrap_or(false)
    }

    pub fn flags(&self, handle: HeapHandle) -> u8 {
        self.slots.get(handle.0 as usize).map(|s| s.flags).unwrap_or(0)
    }

    pub fn set_flag(&mut self, handle: HeapHandle, flag: u8) {
        if let Some(slot) = self.slots.get_mut(handle.0 as usize) {
            slot.flags |= flag;
        }
    }

    pub fn clear_flag(&mut self, handle: HeapHandle, flag: u8) {
        if let Some(slot) = self.slots.get_mut(handle.0 as usize) {
            slot.flags &= !flag;
        }
    }

    pub fn free(&mut self, handle: HeapHandle) {
        if let Some(slot) = self.slots.get_mut(handle.0 as usize) {
            if slot.flags & FLAG_DESTROYED == 0 {
                slot.flags = FLAG_DESTROYED;
                slot.value = None;
                self.free.push(handle.0);
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.flags & FLAG_DESTROYED == 0 && s.value.is_some())
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over every live handle.
    pub fn handles(&self) -> impl Iterator<Item = HeapHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            if s.flags & FLAG_DESTROYED == 0 && s.value.is_some() {
                Some(HeapHandle(i as u32))
            } else {
                None
            }
        })
    }

    /// Allocate a string object.
    pub fn alloc_str(&mut self, value: impl Into<String>) -> HeapHandle {
        self.alloc(HeapObject::Str(value.into()))
    }

    /// Allocate a byte buffer.
    pub fn alloc_buffer(&mut self, bytes: Vec<u8>) -> HeapHandle {
        self.alloc(HeapObject::Buffer { bytes })
    }

    /// Allocate an empty map.
    pub fn alloc_map(&mut self) -> HeapHandle {
        self.alloc(HeapObject::Map {
            entries: Vec::new(),
        })
    }

    /// Allocate host data behind a handle.
    pub fn alloc_user_data<T: std::any::Any + Send + Sync>(
        &mut self,
        type_name: &'static str,
        data: T,
    ) -> HeapHandle {
        self.alloc(HeapObject::UserData(UserData::new(type_name, data)))
    }

    /// Member lookup by hash following the proto chain.
    pub fn member(&self, handle: HeapHandle, hash: u32) -> Option<Value> {
        let mut current = Some(handle);
        // Proto chains are shallow; the bound guards against cycles.
        for _ in 0..32 {
            let object = self.get(current?)?;
            if let Some(value) = object.own_member(hash) {
                return Some(*value);
            }
            current = match object {
                HeapObject::Object { proto, .. } => *proto,
                _ => None,
            };
        }
        None
    }

    /// Member lookup by name; hashes and delegates to [`Heap::member`].
    pub fn member_named(&self, handle: HeapHandle, name: &str) -> Option<Value> {
        self.member(handle, name_hash(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_get() {
        let mut heap = Heap::new();
        let h = heap.alloc_str("hello");
        assert_eq!(heap.get(h), Some(&HeapObject::Str("hello".into())));
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_free_slot_is_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc_str("a");
        let _b = heap.alloc_str("b");
        heap.free(a);
        assert!(heap.is_destroyed(a));
        assert_eq!(heap.get(a), None);

        let c = heap.alloc_str("c");
        assert_eq!(c, a);
        assert!(!heap.is_destroyed(c));
        assert_eq!(heap.capacity(), 2);
    }

    #[test]
    fn test_member_access_by_index_and_hash() {
        let mut heap = Heap::new();
        let mut object = HeapObject::object("Point");
        object.set_member(name_hash("x"), "x", Value::F64(1.0));
        object.set_member(name_hash("y"), "y", Value::F64(2.0));
        let h = heap.alloc(object);

        assert_eq!(
            heap.get(h).unwrap().member_by_index(1),
            Some(&Value::F64(2.0))
        );
        assert_eq!(heap.member_named(h, "x"), Some(Value::F64(1.0)));
        assert_eq!(heap.member_named(h, "z"), None);
    }

    #[test]
    fn test_member_lookup_follows_proto() {
        let mut heap = Heap::new();
        let mut base = HeapObject::object("Entity");
        base.set_member(name_hash("id"), "id", Value::I64(7));
        let base_h = heap.alloc(base);

        let derived_h = heap.alloc(HeapObject::Object {
            type_name: "Point".into(),
            members: Vec::new(),
            proto: Some(base_h),
        });

        assert_eq!(heap.member_named(derived_h, "id"), Some(Value::I64(7)));
    }

    #[test]
    fn test_map_entries_keep_insertion_order() {
        let mut heap = Heap::new();
        let h = heap.alloc_map();
        let map = heap.get_mut(h).unwrap();
        assert!(map.map_set(Value::I32(1), Value::I32(10)));
        assert!(map.map_set(Value::I32(2), Value::I32(20)));
        assert!(map.map_set(Value::I32(1), Value::I32(11)));

        assert_eq!(map.map_get(&Value::I32(1)), Some(Value::I32(11)));
        assert_eq!(map.map_get(&Value::I32(3)), None);
        match heap.get(h).unwrap() {
            HeapObject::Map { entries } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, Value::I32(1));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_user_data_compares_by_identity() {
        let mut heap = Heap::new();
        let a = heap.alloc_user_data("Texture", 42u32);
        let b = heap.alloc_user_data("Texture", 42u32);
        assert_ne!(heap.get(a), heap.get(b));
        assert_eq!(heap.get(a), heap.get(a));

        match heap.get(a).unwrap() {
            HeapObject::UserData(data) => {
                assert_eq!(data.type_name(), "Texture");
                assert_eq!(data.downcast::<u32>(), Some(&42));
                assert_eq!(data.downcast::<String>(), None);
            }
            other => panic!("expected user data, got {:?}", other),
        }
    }

    #[test]
    fn test_runtime_type_names() {
        let mut heap = Heap::new();
        let s = heap.alloc_str("x");
        let b = heap.alloc_buffer(vec![1, 2, 3]);
        let o = heap.alloc(HeapObject::object("Point"));
        assert_eq!(heap.get(s).unwrap().type_name(), "string");
        assert_eq!(heap.get(b).unwrap().type_name(), "buffer");
        assert_eq!(heap.get(o).unwrap().type_name(), "Point");
    }

    #[test]
    fn test_gc_flags() {
        let mut heap = Heap::new();
        let h = heap.alloc_str("x");
        assert_eq!(heap.flags(h) & FLAG_ALIVE, 0);
        heap.set_flag(h, FLAG_ALIVE);
        assert_ne!(heap.flags(h) & FLAG_ALIVE, 0);
        heap.clear_flag(h, FLAG_ALIVE);
        assert_eq!(heap.flags(h) & FLAG_ALIVE, 0);
    }
}
