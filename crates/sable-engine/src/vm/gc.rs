//! Mark-and-sweep garbage collector.
//!
//! Marking uses an explicit worklist, so arbitrarily deep (and cyclic)
//! object graphs terminate: a handle already carrying the ALIVE flag is
//! never pushed again. Reaching a DESTROYED slot during marking means a
//! live value still refers to freed memory; that is heap corruption and the
//! collector panics rather than continue on a broken heap.

use crate::vm::heap::{Heap, HeapHandle, HeapObject, FLAG_ALIVE, FLAG_DESTROYED};
use crate::vm::value::Value;

/// Run a full collection. `roots` is every value slot the interpreter can
/// still reach (registers, stack, statics, exports). Returns the number of
/// objects freed.
pub fn collect<'a>(heap: &mut Heap, roots: impl Iterator<Item = &'a Value>) -> usize {
    let mut worklist: Vec<HeapHandle> = roots
        .filter_map(|value| match value {
            Value::HeapPtr(handle) => Some(*handle),
            _ => None,
        })
        .collect();

    mark(heap, &mut worklist);
    let freed = sweep(heap);
    heap.allocations_since_gc = 0;
    freed
}

fn mark(heap: &mut Heap, worklist: &mut Vec<HeapHandle>) {
    while let Some(handle) = worklist.pop() {
        if heap.is_destroyed(handle) {
            panic!(
                "heap corruption: reachable value refers to destroyed object #{}",
                handle.0
            );
        }
        if heap.flags(handle) & FLAG_ALIVE != 0 {
            continue;
        }
        heap.set_flag(handle, FLAG_ALIVE);

        match heap.get(handle) {
            Some(HeapObject::Str(_))
            | Some(HeapObject::Buffer { .. })
            | Some(HeapObject::UserData(_))
            | None => {}
            Some(HeapObject::Array { elements }) => {
                worklist.extend(elements.iter().filter_map(Value::as_heap));
            }
            Some(HeapObject::Slice { array, .. }) => {
                worklist.push(*array);
            }
            Some(HeapObject::Map { entries }) => {
                for (key, value) in entries {
                    worklist.extend(key.as_heap());
                    worklist.extend(value.as_heap());
                }
            }
            Some(HeapObject::Object { members, proto, .. }) => {
                worklist.extend(members.iter().filter_map(|m| m.value.as_heap()));
                if let Some(proto) = proto {
                    worklist.push(*proto);
                }
            }
        }
    }
}

fn sweep(heap: &mut Heap) -> usize {
    let dead: Vec<HeapHandle> = heap
        .handles()
        .filter(|h| heap.flags(*h) & FLAG_ALIVE == 0)
        .collect();
    let freed = dead.len();
    for handle in dead {
        heap.free(handle);
    }

    // Clear marks for the next cycle.
    let live: Vec<HeapHandle> = heap.handles().collect();
    for handle in live {
        heap.clear_flag(handle, FLAG_ALIVE);
    }
    freed
}

/// Debug check: true when no live slot still carries a mark and no freed
/// slot lost its DESTROYED flag.
#[allow(dead_code)]
pub fn heap_is_consistent(heap: &Heap) -> bool {
    heap.handles().all(|h| {
        let flags = heap.flags(h);
        flags & FLAG_ALIVE == 0 && flags & FLAG_DESTROYED == 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_objects_are_freed() {
        let mut heap = Heap::new();
        let kept = heap.alloc_str("kept");
        let _dropped = heap.alloc_str("dropped");

        let roots = [Value::HeapPtr(kept)];
        let freed = collect(&mut heap, roots.iter());
        assert_eq!(freed, 1);
        assert_eq!(heap.live_count(), 1);
        assert!(heap.get(kept).is_some());
    }

    #[test]
    fn test_members_keep_objects_alive() {
        let mut heap = Heap::new();
        let inner = heap.alloc_str("inner");
        let mut holder = HeapObject::object("Holder");
        holder.set_member(crate::name_hash("v"), "v", Value::HeapPtr(inner));
        let outer = heap.alloc(holder);

        let roots = [Value::HeapPtr(outer)];
        let freed = collect(&mut heap, roots.iter());
        assert_eq!(freed, 0);
        assert!(heap.get(inner).is_some());
    }

    #[test]
    fn test_cycles_terminate_and_collect() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapObject::object("A"));
        let b = heap.alloc(HeapObject::object("B"));
        heap.get_mut(a)
            .unwrap()
            .set_member(crate::name_hash("other"), "other", Value::HeapPtr(b));
        heap.get_mut(b)
            .unwrap()
            .set_member(crate::name_hash("other"), "other", Value::HeapPtr(a));

        // Rooted: marking must terminate despite the cycle.
        let roots = [Value::HeapPtr(a)];
        assert_eq!(collect(&mut heap, roots.iter()), 0);
        assert_eq!(heap.live_count(), 2);

        // Unrooted: the whole cycle goes.
        let no_roots: [Value; 0] = [];
        assert_eq!(collect(&mut heap, no_roots.iter()), 2);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_array_elements_are_traced() {
        let mut heap = Heap::new();
        let element = heap.alloc_str("element");
        let array = heap.alloc(HeapObject::Array {
            elements: vec![Value::HeapPtr(element), Value::I32(1)],
        });

        let roots = [Value::HeapPtr(array)];
        assert_eq!(collect(&mut heap, roots.iter()), 0);
        assert!(heap.get(element).is_some());
    }

    #[test]
    fn test_map_keys_and_values_are_traced() {
        let mut heap = Heap::new();
        let key = heap.alloc_str("key");
        let value = heap.alloc_str("value");
        let map = heap.alloc_map();
        heap.get_mut(map)
            .unwrap()
            .map_set(Value::HeapPtr(key), Value::HeapPtr(value));

        let roots = [Value::HeapPtr(map)];
        assert_eq!(collect(&mut heap, roots.iter()), 0);
        assert!(heap.get(key).is_some());
        assert!(heap.get(value).is_some());
    }

    #[test]
    fn test_slice_keeps_backing_array_alive() {
        let mut heap = Heap::new();
        let array = heap.alloc(HeapObject::Array {
            elements: vec![Value::I32(1), Value::I32(2), Value::I32(3)],
        });
        let slice = heap.alloc(HeapObject::Slice {
            array,
            start: 1,
            len: 2,
        });

        let roots = [Value::HeapPtr(slice)];
        assert_eq!(collect(&mut heap, roots.iter()), 0);
        assert!(heap.get(array).is_some());
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn test_marking_destroyed_object_panics() {
        let mut heap = Heap::new();
        let h = heap.alloc_str("gone");
        heap.free(h);
        // A root still pointing at the freed slot is a VM invariant
        // violation.
        let roots = [Value::HeapPtr(h)];
        collect(&mut heap, roots.iter());
    }

    #[test]
    fn test_marks_cleared_after_collection() {
        let mut heap = Heap::new();
        let h = heap.alloc_str("x");
        let roots = [Value::HeapPtr(h)];
        collect(&mut heap, roots.iter());
        assert!(heap_is_consistent(&heap));
    }
}
