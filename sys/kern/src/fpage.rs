// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flexpages and memory spaces.
//!
//! A flexpage describes one contiguous physical range with R/W/X permissions
//! and an eviction priority; a memory space is the set of flexpages that
//! constitutes one task's view of memory. On context switch the incoming
//! task's space is *activated*: its pages are loaded into PMP slots, pushing
//! out the previous task's pages and -- when the space holds more pages than
//! the hardware has free slots -- evicting its own least-precious resident
//! pages.
//!
//! Everything here is arena-allocated: pages and spaces live in fixed pools
//! and refer to each other by `u16` index through three embedded forward
//! links (owning-space list, delegation chain, PMP-loaded list). The arena
//! is a kernel singleton; all mutation happens in kernel context.

use abi::{Kerr, RegionAttributes, RegionPriority};

use crate::pmp::{PmpBank, PmpRegion, PmpSink};

/// Capacity of the flexpage arena.
pub const FPAGE_COUNT: usize = 64;
/// Capacity of the memory-space arena.
pub const MEMSPACE_COUNT: usize = 8;

/// Software descriptor for one protected physical range.
#[derive(Copy, Clone, Debug)]
pub struct FlexPage {
    live: bool,
    /// Inclusive start of the range.
    pub base: u32,
    /// Exclusive end of the range.
    pub end: u32,
    pub attributes: RegionAttributes,
    pub priority: RegionPriority,
    /// Hardware slot currently holding this page, or `None` while not
    /// resident.
    pmp_slot: Option<u8>,
    /// LRU stamp; bumped every time the page is loaded.
    used: u32,
    /// The memory space owning this page.
    owner_space: Option<u16>,
    /// Next page in the owning space's page list (or stack list).
    owner_next: Option<u16>,
    /// Delegation chain: the page this one was mapped from, walking toward
    /// the original grantor. `None` for an original page.
    map_next: Option<u16>,
    /// Next page in the owning space's PMP-loaded list.
    loaded_next: Option<u16>,
}

impl FlexPage {
    const FREE: Self = FlexPage {
        live: false,
        base: 0,
        end: 0,
        attributes: RegionAttributes::empty(),
        priority: RegionPriority::Temporary,
        pmp_slot: None,
        used: 0,
        owner_space: None,
        owner_next: None,
        map_next: None,
        loaded_next: None,
    };

    pub fn is_resident(&self) -> bool {
        self.pmp_slot.is_some()
    }

    pub fn pmp_slot(&self) -> Option<u8> {
        self.pmp_slot
    }
}

/// One task's collection of flexpages.
#[derive(Copy, Clone, Debug)]
pub struct MemSpace {
    live: bool,
    /// Creator-chosen address-space identifier.
    pub id: u16,
    /// Shared spaces may be referenced by more than one task.
    pub shared: bool,
    /// Head of the general page list.
    fpages: Option<u16>,
    /// Head of the stack-priority page list, kept separate so stacks load
    /// first on activation.
    stacks: Option<u16>,
    /// Head of the PMP-loaded list.
    loaded: Option<u16>,
}

impl MemSpace {
    const FREE: Self = MemSpace {
        live: false,
        id: 0,
        shared: false,
        fpages: None,
        stacks: None,
        loaded: None,
    };
}

/// The kernel's flexpage arena plus activation state.
pub struct FpagePool {
    pages: [FlexPage; FPAGE_COUNT],
    spaces: [MemSpace; MEMSPACE_COUNT],
    /// Space whose pages currently occupy the task-owned PMP slots.
    active: Option<u16>,
    /// Monotonic stamp source for the LRU `used` field.
    use_clock: u32,
}

impl FpagePool {
    pub const fn new() -> Self {
        FpagePool {
            pages: [FlexPage::FREE; FPAGE_COUNT],
            spaces: [MemSpace::FREE; MEMSPACE_COUNT],
            active: None,
            use_clock: 0,
        }
    }

    pub fn page(&self, idx: u16) -> &FlexPage {
        &self.pages[usize::from(idx)]
    }

    pub fn space(&self, idx: u16) -> &MemSpace {
        &self.spaces[usize::from(idx)]
    }

    pub fn active_space(&self) -> Option<u16> {
        self.active
    }

    /// Allocates a flexpage describing `[base, base + size)`.
    ///
    /// The page is not yet owned by any space; see [`FpagePool::attach`].
    pub fn create(
        &mut self,
        base: u32,
        size: u32,
        attributes: RegionAttributes,
        priority: RegionPriority,
    ) -> Result<u16, Kerr> {
        let end = match base.checked_add(size) {
            Some(e) if size > 0 => e,
            _ => return Err(Kerr::PmpAddrRange),
        };
        let idx = self
            .pages
            .iter()
            .position(|p| !p.live)
            .ok_or(Kerr::Fail)?;
        self.pages[idx] = FlexPage {
            live: true,
            base,
            end,
            attributes,
            priority,
            ..FlexPage::FREE
        };
        Ok(idx as u16)
    }

    /// Links a page into a memory space. Stack-priority pages go on the
    /// space's stack list, everything else on the general list.
    pub fn attach(&mut self, space: u16, page: u16) -> Result<(), Kerr> {
        let s = usize::from(space);
        let p = usize::from(page);
        if !self.spaces[s].live || !self.pages[p].live {
            return Err(Kerr::Fail);
        }
        uassert!(self.pages[p].owner_space.is_none());
        self.pages[p].owner_space = Some(space);
        let head = if self.pages[p].priority == RegionPriority::Stack {
            &mut self.spaces[s].stacks
        } else {
            &mut self.spaces[s].fpages
        };
        self.pages[p].owner_next = *head;
        *head = Some(page);
        Ok(())
    }

    /// Delegates `page` into `dst_space`: creates a child descriptor for the
    /// same physical range, chained to its grantor through the delegation
    /// link, and owned by the destination space at `Shared` priority.
    pub fn map(&mut self, page: u16, dst_space: u16) -> Result<u16, Kerr> {
        let parent = usize::from(page);
        if !self.pages[parent].live {
            return Err(Kerr::Fail);
        }
        let (base, end, attributes) = {
            let p = &self.pages[parent];
            (p.base, p.end, p.attributes)
        };
        let child = self.create(
            base,
            end - base,
            attributes,
            RegionPriority::Shared,
        )?;
        self.pages[usize::from(child)].map_next = Some(page);
        self.attach(dst_space, child)?;
        Ok(child)
    }

    /// Destroys a flexpage: evicts it if resident, unlinks it from its
    /// owning space, and destroys every page that was delegated from it.
    ///
    /// Destroying an already-free slot is a no-op that reports success, so
    /// teardown paths can be sloppy about double-destroy.
    pub fn destroy_page(
        &mut self,
        bank: &mut PmpBank,
        sink: &mut impl PmpSink,
        page: u16,
    ) -> Result<(), Kerr> {
        if usize::from(page) >= FPAGE_COUNT {
            return Err(Kerr::Fail);
        }
        if !self.pages[usize::from(page)].live {
            return Ok(());
        }

        // Tear down delegated children first. Children point *at* their
        // grantor, so we find them by scanning; the arena is small.
        let mut doomed = [0u16; FPAGE_COUNT];
        let mut n = 0;
        doomed[n] = page;
        n += 1;
        let mut cursor = 0;
        while cursor < n {
            let grantor = doomed[cursor];
            cursor += 1;
            for (i, p) in self.pages.iter().enumerate() {
                if p.live && p.map_next == Some(grantor) {
                    doomed[n] = i as u16;
                    n += 1;
                }
            }
        }

        for &idx in doomed[..n].iter().rev() {
            self.free_one(bank, sink, idx)?;
        }
        Ok(())
    }

    /// Releases a single page slot with no delegation bookkeeping.
    fn free_one(
        &mut self,
        bank: &mut PmpBank,
        sink: &mut impl PmpSink,
        page: u16,
    ) -> Result<(), Kerr> {
        if self.pages[usize::from(page)].is_resident() {
            self.evict(bank, sink, page)?;
        }
        if let Some(space) = self.pages[usize::from(page)].owner_space {
            self.unlink_from_owner(space, page);
        }
        self.pages[usize::from(page)] = FlexPage::FREE;
        Ok(())
    }

    fn unlink_from_owner(&mut self, space: u16, page: u16) {
        let s = usize::from(space);
        let stack = self.pages[usize::from(page)].priority
            == RegionPriority::Stack;
        let mut cursor = if stack {
            self.spaces[s].stacks
        } else {
            self.spaces[s].fpages
        };
        let mut prev: Option<u16> = None;
        while let Some(c) = cursor {
            let next = self.pages[usize::from(c)].owner_next;
            if c == page {
                match prev {
                    None if stack => self.spaces[s].stacks = next,
                    None => self.spaces[s].fpages = next,
                    Some(p) => self.pages[usize::from(p)].owner_next = next,
                }
                self.pages[usize::from(c)].owner_next = None;
                self.pages[usize::from(c)].owner_space = None;
                return;
            }
            prev = cursor;
            cursor = next;
        }
    }

    /// Allocates a memory space.
    pub fn memspace_create(
        &mut self,
        id: u16,
        shared: bool,
    ) -> Result<u16, Kerr> {
        let idx = self
            .spaces
            .iter()
            .position(|s| !s.live)
            .ok_or(Kerr::Fail)?;
        self.spaces[idx] = MemSpace {
            live: true,
            id,
            shared,
            ..MemSpace::FREE
        };
        Ok(idx as u16)
    }

    /// Destroys a memory space and every flexpage it owns (which in turn
    /// destroys pages delegated out of them).
    pub fn memspace_destroy(
        &mut self,
        bank: &mut PmpBank,
        sink: &mut impl PmpSink,
        space: u16,
    ) -> Result<(), Kerr> {
        let s = usize::from(space);
        if s >= MEMSPACE_COUNT {
            return Err(Kerr::Fail);
        }
        if !self.spaces[s].live {
            return Ok(());
        }
        while let Some(head) = self.spaces[s].stacks {
            self.destroy_page(bank, sink, head)?;
        }
        while let Some(head) = self.spaces[s].fpages {
            self.destroy_page(bank, sink, head)?;
        }
        if self.active == Some(space) {
            self.active = None;
        }
        self.spaces[s] = MemSpace::FREE;
        Ok(())
    }

    /// Installs a flexpage into the given hardware slot and links it onto
    /// its space's loaded list.
    pub fn load(
        &mut self,
        bank: &mut PmpBank,
        sink: &mut impl PmpSink,
        page: u16,
        slot: u8,
    ) -> Result<(), Kerr> {
        let p = usize::from(page);
        if !self.pages[p].live || self.pages[p].is_resident() {
            return Err(Kerr::Fail);
        }
        let space = self.pages[p].owner_space.ok_or(Kerr::Fail)?;

        bank.set_region(
            sink,
            &PmpRegion {
                index: slot,
                start: self.pages[p].base,
                end: self.pages[p].end,
                attributes: self.pages[p].attributes,
                priority: self.pages[p].priority,
                locked: false,
            },
        )?;

        self.use_clock = self.use_clock.wrapping_add(1);
        let page_ref = &mut self.pages[p];
        page_ref.pmp_slot = Some(slot);
        page_ref.used = self.use_clock;
        page_ref.loaded_next = self.spaces[usize::from(space)].loaded;
        self.spaces[usize::from(space)].loaded = Some(page);
        Ok(())
    }

    /// Evicts a flexpage: disables its hardware slot, unlinks it from the
    /// loaded list, and clears its slot assignment.
    pub fn evict(
        &mut self,
        bank: &mut PmpBank,
        sink: &mut impl PmpSink,
        page: u16,
    ) -> Result<(), Kerr> {
        let p = usize::from(page);
        let slot = self.pages[p].pmp_slot.ok_or(Kerr::Fail)?;
        let space = self.pages[p].owner_space.ok_or(Kerr::Fail)?;

        bank.disable_region(sink, slot)?;

        // Unlink from the space's loaded list.
        let s = usize::from(space);
        let mut cursor = self.spaces[s].loaded;
        let mut prev: Option<u16> = None;
        while let Some(c) = cursor {
            let next = self.pages[usize::from(c)].loaded_next;
            if c == page {
                match prev {
                    None => self.spaces[s].loaded = next,
                    Some(q) => {
                        self.pages[usize::from(q)].loaded_next = next
                    }
                }
                break;
            }
            prev = cursor;
            cursor = next;
        }
        self.pages[p].loaded_next = None;
        self.pages[p].pmp_slot = None;
        Ok(())
    }

    /// Picks a victim among `space`'s resident pages and evicts it, freeing
    /// its slot for reuse. The victim is the resident page with the highest
    /// (least important) priority tag; ties go to the least recently used.
    /// Kernel-priority pages are never evicted, and neither is any page more
    /// important than `floor` -- a page never displaces one the task needs
    /// more. Returns the freed slot.
    fn evict_by_policy(
        &mut self,
        bank: &mut PmpBank,
        sink: &mut impl PmpSink,
        space: u16,
        floor: RegionPriority,
    ) -> Option<u8> {
        let mut victim: Option<u16> = None;
        let mut cursor = self.spaces[usize::from(space)].loaded;
        while let Some(c) = cursor {
            let p = &self.pages[usize::from(c)];
            if p.priority != RegionPriority::Kernel && p.priority >= floor {
                victim = match victim {
                    None => Some(c),
                    Some(v) => {
                        let vp = &self.pages[usize::from(v)];
                        if p.priority > vp.priority
                            || (p.priority == vp.priority
                                && p.used < vp.used)
                        {
                            Some(c)
                        } else {
                            Some(v)
                        }
                    }
                };
            }
            cursor = p.loaded_next;
        }
        let victim = victim?;
        let slot = self.pages[usize::from(victim)].pmp_slot;
        self.evict(bank, sink, victim).ok()?;
        slot
    }

    /// Makes `space` the resident memory space.
    ///
    /// The previously active space's pages are evicted (none of them carry
    /// `Kernel` priority; the kernel's own pools live directly in the bank
    /// and are not flexpages). Then every page of the incoming space is
    /// loaded, stacks first; if the hardware runs out of slots, the space's
    /// own least-precious resident pages are evicted to make room, and pages
    /// that still don't fit stay non-resident.
    pub fn activate(
        &mut self,
        bank: &mut PmpBank,
        sink: &mut impl PmpSink,
        space: u16,
    ) -> Result<(), Kerr> {
        if self.active == Some(space) {
            return Ok(());
        }
        if !self.spaces[usize::from(space)].live {
            return Err(Kerr::Fail);
        }

        if let Some(prev) = self.active {
            while let Some(head) = self.spaces[usize::from(prev)].loaded {
                self.evict(bank, sink, head)?;
            }
        }
        self.active = Some(space);

        // Stacks first: the task faults instantly without one.
        let lists = [
            self.spaces[usize::from(space)].stacks,
            self.spaces[usize::from(space)].fpages,
        ];
        for head in lists.iter() {
            let mut cursor = *head;
            while let Some(page) = cursor {
                cursor = self.pages[usize::from(page)].owner_next;
                if self.pages[usize::from(page)].is_resident() {
                    continue;
                }
                let floor = self.pages[usize::from(page)].priority;
                let slot = match bank.alloc_slot() {
                    Some(s) => Some(s),
                    None => self.evict_by_policy(bank, sink, space, floor),
                };
                match slot {
                    Some(s) => self.load(bank, sink, page, s)?,
                    None => {
                        klog!(
                            "fpage: no slot for page {} in space {}",
                            page,
                            space
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmp::PMP_CFG_REGS;
    use crate::pmp::PMP_REGIONS;

    #[derive(Default)]
    struct FakeSink {
        cfg: [u32; PMP_CFG_REGS],
        addr: [u32; PMP_REGIONS],
    }

    impl PmpSink for FakeSink {
        fn read_cfg(&self, csr: usize) -> u32 {
            self.cfg[csr]
        }
        fn write_cfg(&mut self, csr: usize, v: u32) {
            self.cfg[csr] = v;
        }
        fn write_addr(&mut self, slot: usize, end: u32) {
            self.addr[slot] = end;
        }
    }

    fn rw() -> RegionAttributes {
        RegionAttributes::READ | RegionAttributes::WRITE
    }

    /// Bank with `free` slots left: the rest are parked on dummy regions.
    fn bank_with_free_slots(
        sink: &mut FakeSink,
        free: usize,
    ) -> PmpBank {
        let mut bank = PmpBank::new();
        bank.init(sink);
        for i in 0..(PMP_REGIONS - free) as u8 {
            bank.set_region(
                sink,
                &PmpRegion {
                    index: i,
                    start: 0x8000_0000 + u32::from(i) * 0x1000,
                    end: 0x8000_1000 + u32::from(i) * 0x1000,
                    attributes: RegionAttributes::READ,
                    priority: RegionPriority::Kernel,
                    locked: false,
                },
            )
            .unwrap();
        }
        bank
    }

    #[test]
    fn create_attach_destroy() {
        let mut sink = FakeSink::default();
        let mut bank = bank_with_free_slots(&mut sink, 8);
        let mut pool = FpagePool::new();

        let space = pool.memspace_create(1, false).unwrap();
        let page = pool
            .create(0x2000_0000, 0x1000, rw(), RegionPriority::Temporary)
            .unwrap();
        pool.attach(space, page).unwrap();
        assert_eq!(pool.page(page).owner_space, Some(space));

        pool.destroy_page(&mut bank, &mut sink, page).unwrap();
        assert!(!pool.page(page).live);
        assert_eq!(pool.space(space).fpages, None);
        // double destroy is a polite no-op
        pool.destroy_page(&mut bank, &mut sink, page).unwrap();
    }

    #[test]
    fn create_rejects_degenerate_ranges() {
        let mut pool = FpagePool::new();
        assert_eq!(
            pool.create(0x1000, 0, rw(), RegionPriority::Temporary),
            Err(Kerr::PmpAddrRange)
        );
        assert_eq!(
            pool.create(u32::MAX - 4, 64, rw(), RegionPriority::Temporary),
            Err(Kerr::PmpAddrRange)
        );
    }

    #[test]
    fn load_and_evict_maintain_links() {
        let mut sink = FakeSink::default();
        let mut bank = bank_with_free_slots(&mut sink, 8);
        let mut pool = FpagePool::new();

        let space = pool.memspace_create(1, false).unwrap();
        let a = pool
            .create(0x2000_0000, 0x1000, rw(), RegionPriority::Temporary)
            .unwrap();
        let b = pool
            .create(0x2000_1000, 0x1000, rw(), RegionPriority::Temporary)
            .unwrap();
        pool.attach(space, a).unwrap();
        pool.attach(space, b).unwrap();

        let slot_a = bank.alloc_slot().unwrap();
        pool.load(&mut bank, &mut sink, a, slot_a).unwrap();
        let slot_b = bank.alloc_slot().unwrap();
        assert_ne!(slot_a, slot_b);
        pool.load(&mut bank, &mut sink, b, slot_b).unwrap();

        assert_eq!(pool.page(a).pmp_slot(), Some(slot_a));
        let got = bank.get_region(slot_a).unwrap();
        assert_eq!((got.start, got.end), (0x2000_0000, 0x2000_1000));

        pool.evict(&mut bank, &mut sink, a).unwrap();
        assert!(!pool.page(a).is_resident());
        assert!(bank.get_region(slot_a).unwrap().is_disabled());
        // b stays linked and resident
        assert_eq!(pool.space(space).loaded, Some(b));
        // evicting again fails: the page is no longer resident
        assert_eq!(
            pool.evict(&mut bank, &mut sink, a),
            Err(Kerr::Fail)
        );
    }

    #[test]
    fn memspace_destroy_cascades() {
        let mut sink = FakeSink::default();
        let mut bank = bank_with_free_slots(&mut sink, 8);
        let mut pool = FpagePool::new();

        let donor = pool.memspace_create(1, false).unwrap();
        let borrower = pool.memspace_create(2, true).unwrap();
        let page = pool
            .create(0x2000_0000, 0x1000, rw(), RegionPriority::Shared)
            .unwrap();
        pool.attach(donor, page).unwrap();
        let child = pool.map(page, borrower).unwrap();
        assert_eq!(pool.page(child).owner_space, Some(borrower));

        // Destroying the donor space takes the delegated view with it.
        pool.memspace_destroy(&mut bank, &mut sink, donor).unwrap();
        assert!(!pool.page(page).live);
        assert!(!pool.page(child).live);
        assert_eq!(pool.space(borrower).fpages, None);
    }

    #[test]
    fn activation_swaps_spaces() {
        let mut sink = FakeSink::default();
        let mut bank = bank_with_free_slots(&mut sink, 8);
        let mut pool = FpagePool::new();

        let s1 = pool.memspace_create(1, false).unwrap();
        let s2 = pool.memspace_create(2, false).unwrap();
        let p1 = pool
            .create(0x2000_0000, 0x1000, rw(), RegionPriority::Stack)
            .unwrap();
        let p2 = pool
            .create(0x3000_0000, 0x1000, rw(), RegionPriority::Stack)
            .unwrap();
        pool.attach(s1, p1).unwrap();
        pool.attach(s2, p2).unwrap();

        pool.activate(&mut bank, &mut sink, s1).unwrap();
        assert!(pool.page(p1).is_resident());
        assert_eq!(pool.active_space(), Some(s1));

        pool.activate(&mut bank, &mut sink, s2).unwrap();
        assert!(!pool.page(p1).is_resident());
        assert!(pool.page(p2).is_resident());

        // Re-activating the live space is a no-op.
        pool.activate(&mut bank, &mut sink, s2).unwrap();
        assert!(pool.page(p2).is_resident());
    }

    #[test]
    fn eviction_prefers_high_priority_tags_then_lru() {
        let mut sink = FakeSink::default();
        // Two free slots for a three-page space.
        let mut bank = bank_with_free_slots(&mut sink, 2);
        let mut pool = FpagePool::new();

        let space = pool.memspace_create(1, false).unwrap();
        let stack = pool
            .create(0x2000_0000, 0x1000, rw(), RegionPriority::Stack)
            .unwrap();
        let temp = pool
            .create(0x2000_1000, 0x1000, rw(), RegionPriority::Temporary)
            .unwrap();
        let shared = pool
            .create(0x2000_2000, 0x1000, rw(), RegionPriority::Shared)
            .unwrap();
        pool.attach(space, stack).unwrap();
        pool.attach(space, temp).unwrap();
        pool.attach(space, shared).unwrap();

        pool.activate(&mut bank, &mut sink, space).unwrap();

        // The stack loads first. One slot remains for shared and temp; the
        // shared page takes it, and the temporary page cannot displace any
        // more-important resident, so it is the one left standing outside.
        assert!(pool.page(stack).is_resident());
        assert!(pool.page(shared).is_resident());
        assert!(!pool.page(temp).is_resident());
    }

    #[test]
    fn lru_breaks_priority_ties() {
        let mut sink = FakeSink::default();
        let mut bank = bank_with_free_slots(&mut sink, 2);
        let mut pool = FpagePool::new();

        let space = pool.memspace_create(1, false).unwrap();
        let old = pool
            .create(0x2000_0000, 0x1000, rw(), RegionPriority::Temporary)
            .unwrap();
        let newer = pool
            .create(0x2000_1000, 0x1000, rw(), RegionPriority::Temporary)
            .unwrap();
        pool.attach(space, old).unwrap();
        pool.attach(space, newer).unwrap();

        let slot = bank.alloc_slot().unwrap();
        pool.load(&mut bank, &mut sink, old, slot).unwrap();
        let slot = bank.alloc_slot().unwrap();
        pool.load(&mut bank, &mut sink, newer, slot).unwrap();

        // Both slots taken, same priority: the earliest-loaded page is the
        // LRU victim.
        let third = pool
            .create(0x2000_2000, 0x1000, rw(), RegionPriority::Temporary)
            .unwrap();
        pool.attach(space, third).unwrap();
        let freed = pool
            .evict_by_policy(
                &mut bank,
                &mut sink,
                space,
                RegionPriority::Temporary,
            )
            .unwrap();
        pool.load(&mut bank, &mut sink, third, freed).unwrap();

        assert!(!pool.page(old).is_resident());
        assert!(pool.page(newer).is_resident());
        assert!(pool.page(third).is_resident());
    }
}
