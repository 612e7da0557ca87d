//! This module contains the per-state address space: the mapping from
//! memory objects to the byte stores the state sees in them.

use std::{collections::BTreeMap, rc::Rc};

use rustc_hash::FxHashMap;

use crate::{
    error::execution::Error,
    memory::object::{MemoryObject, ObjectId, ObjectState},
};

/// The address space of one execution state.
///
/// Object descriptors are shared; object contents are shared too until a
/// state writes, at which point [`AddressSpace::get_writeable`] unshares
/// just that object. Cloning an address space is therefore cheap and is
/// what makes forking and snapshotting affordable.
#[derive(Clone, Debug, Default)]
pub struct AddressSpace {
    objects:    FxHashMap<ObjectId, (Rc<MemoryObject>, Rc<ObjectState>)>,
    by_address: BTreeMap<u64, ObjectId>,
}

impl AddressSpace {
    /// Constructs an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `object` with the given initial `contents`.
    pub fn bind(&mut self, object: Rc<MemoryObject>, contents: ObjectState) {
        self.by_address.insert(object.address, object.id);
        self.objects
            .insert(object.id, (object, Rc::new(contents)));
    }

    /// Unbinds the object behind `id`, dropping this state's view of its
    /// contents.
    pub fn unbind(&mut self, id: ObjectId) {
        if let Some((object, _)) = self.objects.remove(&id) {
            self.by_address.remove(&object.address);
        }
    }

    /// Checks whether the object behind `id` is bound.
    #[must_use]
    pub fn is_bound(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Gets the object and contents behind `id`.
    #[must_use]
    pub fn find_object(&self, id: ObjectId) -> Option<(&Rc<MemoryObject>, &Rc<ObjectState>)> {
        self.objects.get(&id).map(|(o, s)| (o, s))
    }

    /// Resolves a concrete `address` to the single object containing it.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if no bound object maps the address.
    pub fn resolve_one(&self, address: u64) -> Result<&Rc<MemoryObject>, Error> {
        self.by_address
            .range(..=address)
            .next_back()
            .and_then(|(_, id)| self.objects.get(id))
            .map(|(object, _)| object)
            .filter(|object| object.contains(address))
            .ok_or(Error::UnmappedAddress { address })
    }

    /// Resolves every bound object overlapping the byte range
    /// `[start, end)`.
    #[must_use]
    pub fn resolve_range(&self, start: u64, end: u64) -> Vec<&Rc<MemoryObject>> {
        let scan_from = self
            .by_address
            .range(..=start)
            .next_back()
            .map_or(start, |(base, _)| *base);
        self.by_address
            .range(scan_from..end)
            .filter_map(|(_, id)| self.objects.get(id))
            .map(|(object, _)| object)
            .filter(|object| object.address < end && object.address + object.size > start)
            .collect()
    }

    /// Gets a mutable view of the contents of the object behind `id`,
    /// unsharing them if they are currently shared with another state.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not bound; resolution always precedes writing, so
    /// this is a programmer bug.
    pub fn get_writeable(&mut self, id: ObjectId) -> &mut ObjectState {
        let (_, contents) = self
            .objects
            .get_mut(&id)
            .expect("object was resolved before being written");
        Rc::make_mut(contents)
    }

    /// Iterates over the bound objects and their contents.
    pub fn objects(&self) -> impl Iterator<Item = (&Rc<MemoryObject>, &Rc<ObjectState>)> {
        self.objects.values().map(|(o, s)| (o, s))
    }

    /// Estimates the heap footprint of this state's unshared view, used
    /// for the memory cap.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.objects
            .values()
            .map(|(_, contents)| {
                // Shared contents are only charged to one owner.
                if Rc::strong_count(contents) == 1 {
                    contents.footprint()
                } else {
                    0
                }
            })
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        expr::{Expr, Width},
        ir::AllocSite,
    };

    fn object(id: u64, address: u64, size: u64) -> Rc<MemoryObject> {
        Rc::new(MemoryObject {
            id: ObjectId(id),
            address,
            size,
            is_local: false,
            is_global: false,
            is_read_only: false,
            alloc_site: AllocSite::Instruction(id),
        })
    }

    #[test]
    fn resolves_addresses_within_objects() {
        let mut space = AddressSpace::new();
        space.bind(object(1, 0x1000, 16), ObjectState::zeroed(16));
        space.bind(object(2, 0x2000, 16), ObjectState::zeroed(16));

        assert_eq!(space.resolve_one(0x1008).expect("mapped").id, ObjectId(1));
        assert_eq!(space.resolve_one(0x2000).expect("mapped").id, ObjectId(2));
        assert!(space.resolve_one(0x1800).is_err());
    }

    #[test]
    fn writes_do_not_leak_into_sharing_states() {
        let mut a = AddressSpace::new();
        a.bind(object(1, 0x1000, 8), ObjectState::zeroed(8));
        let mut b = a.clone();

        b.get_writeable(ObjectId(1))
            .write(0, Expr::constant(9, Width::B64))
            .expect("write is in bounds");

        let (_, contents_a) = a.find_object(ObjectId(1)).expect("bound");
        let read = contents_a.read(0, Width::B64).expect("read is in bounds");
        assert_eq!(read.as_const(), Some(0));
    }

    #[test]
    fn unbind_removes_address_mapping() {
        let mut space = AddressSpace::new();
        space.bind(object(1, 0x1000, 8), ObjectState::zeroed(8));
        space.unbind(ObjectId(1));
        assert!(space.resolve_one(0x1000).is_err());
    }

    #[test]
    fn range_resolution_finds_overlapping_objects() {
        let mut space = AddressSpace::new();
        space.bind(object(1, 0x1000, 16), ObjectState::zeroed(16));
        space.bind(object(2, 0x1010, 16), ObjectState::zeroed(16));
        space.bind(object(3, 0x2000, 16), ObjectState::zeroed(16));

        let overlapping = space.resolve_range(0x1008, 0x1018);
        let ids: Vec<ObjectId> = overlapping.iter().map(|o| o.id).collect();
        assert!(ids.contains(&ObjectId(1)));
        assert!(ids.contains(&ObjectId(2)));
        assert!(!ids.contains(&ObjectId(3)));
    }
}
