//! This module contains the memory model: object descriptors, per-object
//! byte stores, the per-state address space, and the allocation machinery
//! that keeps addresses stable across recovery re-execution.

pub mod address_space;
pub mod allocation;
pub mod object;

pub use address_space::AddressSpace;
pub use allocation::{AllocationContext, AllocationRecord, MemoryAllocator};
pub use object::{MemoryObject, ObjectId, ObjectState};
