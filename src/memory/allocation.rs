//! This module contains the allocator handing out object descriptors, and
//! the allocation record that pins dynamic allocations to the same objects
//! when a skipped callee is re-executed during recovery.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::{
    constant::{
        ALLOCATION_ALIGNMENT,
        GLOBAL_ADDRESS_BASE,
        HEAP_ADDRESS_BASE,
        STACK_ADDRESS_BASE,
    },
    ir::AllocSite,
    memory::object::{MemoryObject, ObjectId},
};

/// The classes of storage an allocation can come from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageClass {
    /// A global variable, bound at program initialisation.
    Global,
    /// A stack allocation belonging to a frame.
    Stack,
    /// A heap allocation from `malloc` and friends.
    Heap,
}

/// The bump allocator handing out object descriptors.
///
/// Each worker owns exactly one allocator; descriptor addresses are
/// deterministic within a worker, which is what allows the allocation
/// record to reproduce identical addresses during recovery.
#[derive(Clone, Debug)]
pub struct MemoryAllocator {
    next_id:     u64,
    next_global: u64,
    next_stack:  u64,
    next_heap:   u64,
}

impl MemoryAllocator {
    /// Constructs an allocator with empty address ranges.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id:     1,
            next_global: GLOBAL_ADDRESS_BASE,
            next_stack:  STACK_ADDRESS_BASE,
            next_heap:   HEAP_ADDRESS_BASE,
        }
    }

    /// Allocates a descriptor of `size` bytes in the given storage
    /// `class`.
    pub fn allocate(
        &mut self,
        size: u64,
        class: StorageClass,
        is_read_only: bool,
        alloc_site: AllocSite,
    ) -> Rc<MemoryObject> {
        let bump = |cursor: &mut u64| {
            let address = *cursor;
            let advance = size.max(1);
            *cursor += (advance + ALLOCATION_ALIGNMENT - 1) / ALLOCATION_ALIGNMENT
                * ALLOCATION_ALIGNMENT;
            address
        };

        let address = match class {
            StorageClass::Global => bump(&mut self.next_global),
            StorageClass::Stack => bump(&mut self.next_stack),
            StorageClass::Heap => bump(&mut self.next_heap),
        };

        let id = ObjectId(self.next_id);
        self.next_id += 1;

        Rc::new(MemoryObject {
            id,
            address,
            size,
            is_local: class == StorageClass::Stack,
            is_global: class == StorageClass::Global,
            is_read_only,
            alloc_site,
        })
    }
}

impl Default for MemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The calling context of a dynamic allocation: the chain of call-site
/// instructions on the stack plus the allocating instruction itself.
///
/// Two executions that reach the same allocation through the same calls
/// produce equal contexts, which is what lets a recovery state re-execute
/// a `malloc` and land on the very object the original execution produced.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AllocationContext {
    /// The instruction identifiers of the call sites on the stack,
    /// outermost first.
    pub call_trace: Vec<u64>,

    /// The instruction identifier of the allocation itself.
    pub alloc_instruction: u64,
}

/// The record of dynamic allocations performed in a context.
///
/// A `None` entry records that the allocation was refused (bound to null),
/// so re-execution refuses it identically.
#[derive(Clone, Debug, Default)]
pub struct AllocationRecord {
    entries: FxHashMap<AllocationContext, Option<Rc<MemoryObject>>>,
}

impl AllocationRecord {
    /// Constructs an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether an allocation was recorded for `context`.
    #[must_use]
    pub fn exists(&self, context: &AllocationContext) -> bool {
        self.entries.contains_key(context)
    }

    /// Gets the object recorded for `context`, where the outer [`Option`]
    /// distinguishes "never recorded" from "recorded as refused".
    #[must_use]
    pub fn get(&self, context: &AllocationContext) -> Option<Option<Rc<MemoryObject>>> {
        self.entries.get(context).cloned()
    }

    /// Records `object` (or a refusal) for `context`.
    pub fn add(&mut self, context: AllocationContext, object: Option<Rc<MemoryObject>>) {
        self.entries.insert(context, object);
    }

    /// Gets the number of recorded allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether the record is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut allocator = MemoryAllocator::new();
        let a = allocator.allocate(24, StorageClass::Heap, false, AllocSite::Instruction(1));
        let b = allocator.allocate(8, StorageClass::Heap, false, AllocSite::Instruction(2));

        assert_eq!(a.address % ALLOCATION_ALIGNMENT, 0);
        assert_eq!(b.address % ALLOCATION_ALIGNMENT, 0);
        assert!(b.address >= a.address + a.size);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn record_distinguishes_missing_from_refused() {
        let mut record = AllocationRecord::new();
        let context = AllocationContext {
            call_trace:        vec![10, 20],
            alloc_instruction: 30,
        };
        assert_eq!(record.get(&context), None);

        record.add(context.clone(), None);
        assert_eq!(record.get(&context), Some(None));
        assert!(record.exists(&context));
    }
}
