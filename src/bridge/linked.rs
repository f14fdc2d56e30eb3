use super::driver::PollEvent;
use crate::event::TraceBuilder;
use std::{
    cell::RefCell,
    mem,
    rc::{Rc, Weak},
};

/// A listener as seen from the driver that last polled it.
pub(crate) trait LinkedListener {
    /// The driver is going away or has completed; forget the link without touching the group.
    fn orphan(&self);

    fn trace_promise(&self, builder: &mut TraceBuilder);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct LinkKey {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    member: Option<Weak<dyn LinkedListener>>,
}

#[derive(Default)]
struct Members {
    slots: Vec<Slot>,
    free: Vec<usize>,
    len: usize,
}

/// The driver's side of the weak back-reference relation: an arena of the listeners that will
/// arm the driver when their promise settles.
///
/// Neither side owns the other. Keys carry a generation so a stale key held by a listener can
/// never remove a slot that has since been reused.
#[derive(Default)]
pub(crate) struct LinkedGroup {
    members: RefCell<Members>,
}

impl LinkedGroup {
    pub fn insert(&self, member: Weak<dyn LinkedListener>) -> LinkKey {
        let mut members = self.members.borrow_mut();
        members.len += 1;

        if let Some(index) = members.free.pop() {
            let slot = &mut members.slots[index];
            debug_assert!(slot.member.is_none());
            slot.member = Some(member);
            return LinkKey {
                index,
                generation: slot.generation,
            };
        }

        let index = members.slots.len();
        members.slots.push(Slot {
            generation: 0,
            member: Some(member),
        });

        LinkKey {
            index,
            generation: 0,
        }
    }

    /// Returns false if `key` no longer refers to a member.
    pub fn remove(&self, key: LinkKey) -> bool {
        let mut members = self.members.borrow_mut();
        let slot = match members.slots.get_mut(key.index) {
            Some(slot) if slot.generation == key.generation && slot.member.is_some() => slot,
            _ => return false,
        };

        slot.member = None;
        slot.generation = slot.generation.wrapping_add(1);
        members.free.push(key.index);
        members.len -= 1;
        true
    }

    pub fn len(&self) -> usize {
        self.members.borrow().len
    }

    fn live_members(&self) -> Vec<Rc<dyn LinkedListener>> {
        self.members
            .borrow()
            .slots
            .iter()
            .filter_map(|slot| slot.member.as_ref().and_then(Weak::upgrade))
            .collect()
    }

    /// Unlinks every member. Each one is told it has been orphaned.
    pub fn clear(&self) {
        let orphans = {
            let mut members = self.members.borrow_mut();
            let slots = mem::take(&mut members.slots);
            members.free.clear();
            members.len = 0;
            slots
        };

        for member in orphans.into_iter().filter_map(|slot| slot.member) {
            if let Some(member) = member.upgrade() {
                member.orphan();
            }
        }
    }

    pub fn trace(&self, builder: &mut TraceBuilder) {
        for member in self.live_members() {
            member.trace_promise(builder);
        }
    }
}

/// The listener's side of the relation. Dropping a `Link` unlinks it from the group.
pub(crate) struct Link {
    driver: Weak<dyn PollEvent>,
    key: LinkKey,
}

impl Link {
    pub fn new(driver: &Rc<dyn PollEvent>, member: Weak<dyn LinkedListener>) -> Self {
        Self {
            driver: Rc::downgrade(driver),
            key: driver.links().insert(member),
        }
    }

    pub fn is_linked_to(&self, driver: &Rc<dyn PollEvent>) -> bool {
        Weak::as_ptr(&self.driver) as *const () == Rc::as_ptr(driver) as *const ()
    }

    pub fn driver(&self) -> Option<Rc<dyn PollEvent>> {
        self.driver.upgrade()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.upgrade() {
            driver.links().remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct Member {
        orphaned: Cell<bool>,
    }

    impl LinkedListener for Member {
        fn orphan(&self) {
            self.orphaned.set(true);
        }

        fn trace_promise(&self, builder: &mut TraceBuilder) {
            builder.add("member", None);
        }
    }

    fn weak(member: &Rc<Member>) -> Weak<dyn LinkedListener> {
        let member: Rc<dyn LinkedListener> = member.clone();
        Rc::downgrade(&member)
    }

    #[test]
    fn insert_remove_reuses_slots() {
        let group = LinkedGroup::default();
        let (m1, m2) = (Rc::new(Member::default()), Rc::new(Member::default()));

        let k1 = group.insert(weak(&m1));
        let k2 = group.insert(weak(&m2));
        assert_eq!(group.len(), 2);

        assert!(group.remove(k1));
        assert!(!group.remove(k1));
        assert_eq!(group.len(), 1);

        let k3 = group.insert(weak(&m1));
        assert_ne!(k1, k3);
        assert!(!group.remove(k1));
        assert!(group.remove(k3));
        assert!(group.remove(k2));
        assert_eq!(group.len(), 0);
    }

    #[test]
    fn clear_orphans_live_members() {
        let group = LinkedGroup::default();
        let (m1, m2) = (Rc::new(Member::default()), Rc::new(Member::default()));

        let k1 = group.insert(weak(&m1));
        group.insert(weak(&m2));
        drop(m2);

        let mut builder = TraceBuilder::new();
        group.trace(&mut builder);
        assert_eq!(builder.len(), 1);

        group.clear();
        assert_eq!(group.len(), 0);
        assert!(m1.orphaned.get());
        assert!(!group.remove(k1));
    }
}
