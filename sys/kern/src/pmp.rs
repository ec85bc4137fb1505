// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical Memory Protection region engine.
//!
//! The PMP gives us up to 16 hardware regions per hart. We drive them
//! exclusively in Top-Of-Range mode: the per-slot address register holds the
//! *exclusive upper bound* of the region, and the implicit lower bound is
//! the previous slot's upper bound. That buys arbitrary sizes and
//! byte-granular endpoints at the cost of slot ordering being meaningful.
//!
//! `PmpBank` is the software model: a shadow table of all 16 regions plus
//! allocation bookkeeping. The shadow's `start` field is a software
//! convenience only -- hardware never sees it -- but the shadow otherwise
//! reflects the last successful hardware write, which is what makes
//! `check_access` and `get_region` trustworthy without CSR reads.
//!
//! Actual CSR traffic goes through the [`PmpSink`] trait, implemented over
//! the real configuration registers by `arch` and by a recording fake in
//! the tests. The bank is owned process-wide by the kernel and only mutated
//! from kernel context, so no locking is involved.

use abi::{Kerr, MemoryPool, RegionAttributes, RegionPriority};

/// Number of PMP regions the hardware provides.
pub const PMP_REGIONS: usize = 16;

/// Number of 32-bit `pmpcfg` registers covering those regions (4 config
/// bytes per register).
pub const PMP_CFG_REGS: usize = PMP_REGIONS / 4;

// Configuration byte layout, per the privileged spec: bit 7 is L, bits 4:3
// select the address-matching mode, bits 2:0 are X/W/R.
const CFG_A_TOR: u8 = 0b01 << 3;
const CFG_LOCK: u8 = 1 << 7;
const CFG_PERM_MASK: u8 = 0b111;

/// Computes the 8-bit configuration value for a region.
fn cfg_byte(attributes: RegionAttributes, locked: bool) -> u8 {
    // RegionAttributes deliberately uses the PMP's R/W/X bit positions.
    let perms = attributes.bits() as u8 & CFG_PERM_MASK;
    perms | CFG_A_TOR | if locked { CFG_LOCK } else { 0 }
}

/// Hardware write surface for the bank.
///
/// `csr` is the index of a `pmpcfg` register (0..4); `slot` is a region
/// index (0..16). Addresses are byte addresses; the implementation is
/// responsible for the grain shift the CSR encoding wants.
pub trait PmpSink {
    fn read_cfg(&self, csr: usize) -> u32;
    fn write_cfg(&mut self, csr: usize, v: u32);
    fn write_addr(&mut self, slot: usize, end: u32);
}

/// Software model of one PMP region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PmpRegion {
    /// Hardware slot this region occupies, 0..16.
    pub index: u8,
    /// Inclusive start address. Software bookkeeping only; in TOR mode the
    /// hardware infers the lower bound from the previous slot.
    pub start: u32,
    /// Exclusive end address -- the value actually written to the address
    /// register.
    pub end: u32,
    /// Permitted access within the region.
    pub attributes: RegionAttributes,
    /// Eviction priority tag, consumed by the flexpage layer.
    pub priority: RegionPriority,
    /// Once set, the region refuses all further mutation until reset.
    pub locked: bool,
}

impl PmpRegion {
    const DISABLED: Self = PmpRegion {
        index: 0,
        start: 0,
        end: 0,
        attributes: RegionAttributes::empty(),
        priority: RegionPriority::Temporary,
        locked: false,
    };

    /// A region whose shadow reads all-zero is disabled, whatever the
    /// hardware A bits happen to say. `check_access` relies on this
    /// convention and skips such entries.
    pub fn is_disabled(&self) -> bool {
        self.start == 0 && self.end == 0 && self.attributes.is_empty()
    }
}

/// Shadow state for the whole PMP, plus allocation bookkeeping.
pub struct PmpBank {
    regions: [PmpRegion; PMP_REGIONS],
    /// One past the highest slot index ever configured.
    region_count: u8,
    /// Rotating hint for `alloc_slot`, so freshly-evicted slots get reused
    /// before the scan wraps.
    next_region_idx: u8,
    initialized: bool,
}

impl PmpBank {
    pub const fn new() -> Self {
        PmpBank {
            regions: [PmpRegion::DISABLED; PMP_REGIONS],
            region_count: 0,
            next_region_idx: 0,
            initialized: false,
        }
    }

    /// Resets every hardware slot (config bytes and address registers) and
    /// the shadow table.
    pub fn init(&mut self, sink: &mut impl PmpSink) {
        for csr in 0..PMP_CFG_REGS {
            sink.write_cfg(csr, 0);
        }
        for slot in 0..PMP_REGIONS {
            sink.write_addr(slot, 0);
        }
        *self = PmpBank::new();
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of slots in use (one past the highest configured index).
    pub fn region_count(&self) -> u8 {
        self.region_count
    }

    /// Writes one region to hardware and the shadow.
    ///
    /// Fails with `PmpInvalidRegion` for a slot index out of range,
    /// `PmpAddrRange` for an inverted or empty address range, and
    /// `PmpLocked` if the slot was locked by an earlier write.
    pub fn set_region(
        &mut self,
        sink: &mut impl PmpSink,
        region: &PmpRegion,
    ) -> Result<(), Kerr> {
        let idx = usize::from(region.index);
        if idx >= PMP_REGIONS {
            return Err(Kerr::PmpInvalidRegion);
        }
        if region.start >= region.end {
            return Err(Kerr::PmpAddrRange);
        }
        if self.regions[idx].locked {
            return Err(Kerr::PmpLocked);
        }

        let csr = idx / 4;
        let shift = (idx % 4) * 8;

        let mut cfg = sink.read_cfg(csr);
        cfg &= !(0xff << shift);
        cfg |= u32::from(cfg_byte(region.attributes, region.locked)) << shift;

        // Address first, then configuration: the region must not become
        // active with a stale bound.
        sink.write_addr(idx, region.end);
        sink.write_cfg(csr, cfg);

        self.regions[idx] = *region;
        if self.region_count < region.index + 1 {
            self.region_count = region.index + 1;
        }
        self.next_region_idx = ((idx + 1) % PMP_REGIONS) as u8;
        Ok(())
    }

    /// Turns a slot off: clears its configuration byte (address mode becomes
    /// OFF) and zeroes the shadow entry. Refuses locked slots.
    pub fn disable_region(
        &mut self,
        sink: &mut impl PmpSink,
        index: u8,
    ) -> Result<(), Kerr> {
        let idx = usize::from(index);
        if idx >= PMP_REGIONS {
            return Err(Kerr::PmpInvalidRegion);
        }
        if self.regions[idx].locked {
            return Err(Kerr::PmpLocked);
        }

        let csr = idx / 4;
        let shift = (idx % 4) * 8;
        let cfg = sink.read_cfg(csr) & !(0xff << shift);
        sink.write_cfg(csr, cfg);

        self.regions[idx] = PmpRegion::DISABLED;
        Ok(())
    }

    /// Sets the lock bit on a slot. Irreversible until the next `init`.
    pub fn lock_region(
        &mut self,
        sink: &mut impl PmpSink,
        index: u8,
    ) -> Result<(), Kerr> {
        let idx = usize::from(index);
        if idx >= PMP_REGIONS {
            return Err(Kerr::PmpInvalidRegion);
        }

        let csr = idx / 4;
        let shift = (idx % 4) * 8;
        let cfg = sink.read_cfg(csr) | (u32::from(CFG_LOCK) << shift);
        sink.write_cfg(csr, cfg);

        self.regions[idx].locked = true;
        Ok(())
    }

    /// Reads a region back from the shadow.
    pub fn get_region(&self, index: u8) -> Result<PmpRegion, Kerr> {
        let idx = usize::from(index);
        if idx >= PMP_REGIONS {
            return Err(Kerr::PmpInvalidRegion);
        }
        Ok(self.regions[idx])
    }

    /// Checks whether an access of `size` bytes at `addr` would be permitted
    /// by the configured regions.
    ///
    /// Active regions are scanned in slot order; the first one that fully
    /// contains `[addr, addr + size)` decides, matching the hardware's
    /// lowest-index-wins rule. Disabled shadow entries are skipped -- the
    /// shadow's all-zero convention, not the hardware A bits, is what marks
    /// them. If no region contains the range, the access is denied.
    pub fn check_access(
        &self,
        addr: u32,
        size: u32,
        is_write: bool,
        is_execute: bool,
    ) -> bool {
        let end = match addr.checked_add(size) {
            Some(e) => e,
            None => return false,
        };
        for region in &self.regions[..usize::from(self.region_count)] {
            if region.is_disabled() {
                continue;
            }
            if region.start <= addr && end <= region.end {
                let mut need = RegionAttributes::READ;
                if is_write {
                    need = RegionAttributes::WRITE;
                }
                if is_execute {
                    need = RegionAttributes::EXECUTE;
                }
                return region.attributes.contains(need);
            }
        }
        false
    }

    /// Configures one slot per pool descriptor, starting at slot 0. Used at
    /// boot to cover the kernel's own memory.
    pub fn init_pools(
        &mut self,
        sink: &mut impl PmpSink,
        pools: &[MemoryPool],
    ) -> Result<(), Kerr> {
        for (i, pool) in pools.iter().enumerate() {
            self.set_region(
                sink,
                &PmpRegion {
                    index: i as u8,
                    start: pool.start,
                    end: pool.end,
                    attributes: pool.attributes,
                    priority: pool.priority,
                    locked: false,
                },
            )?;
        }
        Ok(())
    }

    /// Boot-time bring-up: resets the bank and installs the standard kernel
    /// pools (text, data, bss, heap, stack).
    pub fn init_kernel(
        &mut self,
        sink: &mut impl PmpSink,
        pools: &[MemoryPool],
    ) -> Result<(), Kerr> {
        self.init(sink);
        self.init_pools(sink, pools)
    }

    /// Finds a free (disabled, unlocked) slot, preferring slots at or after
    /// the rotation hint. Returns `None` when the hardware is full.
    pub fn alloc_slot(&self) -> Option<u8> {
        for off in 0..PMP_REGIONS {
            let i = (usize::from(self.next_region_idx) + off) % PMP_REGIONS;
            if self.regions[i].is_disabled() && !self.regions[i].locked {
                return Some(i as u8);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recording sink: behaves like the CSR file, remembers every write.
    #[derive(Default)]
    struct FakeSink {
        cfg: [u32; PMP_CFG_REGS],
        addr: [u32; PMP_REGIONS],
        writes: usize,
    }

    impl PmpSink for FakeSink {
        fn read_cfg(&self, csr: usize) -> u32 {
            self.cfg[csr]
        }
        fn write_cfg(&mut self, csr: usize, v: u32) {
            self.cfg[csr] = v;
            self.writes += 1;
        }
        fn write_addr(&mut self, slot: usize, end: u32) {
            self.addr[slot] = end;
            self.writes += 1;
        }
    }

    fn rwx(bits: u32) -> RegionAttributes {
        RegionAttributes::from_bits_truncate(bits)
    }

    fn region(index: u8, start: u32, end: u32, bits: u32) -> PmpRegion {
        PmpRegion {
            index,
            start,
            end,
            attributes: rwx(bits),
            priority: RegionPriority::Temporary,
            locked: false,
        }
    }

    fn kernel_pools() -> [MemoryPool; 5] {
        // Mirrors the linker-script pool layout: text then data then bss
        // then heap then stack, contiguous, so the TOR chain is sound.
        [
            MemoryPool {
                name: "kernel_text",
                start: 0x8000_0000,
                end: 0x8000_4000,
                attributes: RegionAttributes::READ | RegionAttributes::EXECUTE,
                priority: RegionPriority::Kernel,
            },
            MemoryPool {
                name: "kernel_data",
                start: 0x8000_4000,
                end: 0x8000_5000,
                attributes: RegionAttributes::READ | RegionAttributes::WRITE,
                priority: RegionPriority::Kernel,
            },
            MemoryPool {
                name: "kernel_bss",
                start: 0x8000_5000,
                end: 0x8000_6000,
                attributes: RegionAttributes::READ | RegionAttributes::WRITE,
                priority: RegionPriority::Kernel,
            },
            MemoryPool {
                name: "kernel_heap",
                start: 0x8000_6000,
                end: 0x8000_8000,
                attributes: RegionAttributes::READ | RegionAttributes::WRITE,
                priority: RegionPriority::Kernel,
            },
            MemoryPool {
                name: "kernel_stack",
                start: 0x8000_8000,
                end: 0x8000_9000,
                attributes: RegionAttributes::READ | RegionAttributes::WRITE,
                priority: RegionPriority::Kernel,
            },
        ]
    }

    /// Decodes one config byte back out of the fake CSR file.
    fn hw_cfg_byte(sink: &FakeSink, idx: usize) -> u8 {
        (sink.cfg[idx / 4] >> ((idx % 4) * 8)) as u8
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut sink = FakeSink::default();
        let mut bank = PmpBank::new();
        bank.init(&mut sink);

        let r = region(3, 0x1000, 0x2000, 0b011);
        bank.set_region(&mut sink, &r).unwrap();
        assert_eq!(bank.get_region(3).unwrap(), r);
        assert_eq!(bank.region_count(), 4);
    }

    #[test]
    fn shadow_matches_hardware_bytes() {
        let mut sink = FakeSink::default();
        let mut bank = PmpBank::new();
        bank.init(&mut sink);

        for (i, bits) in [0b101u32, 0b011, 0b001].iter().enumerate() {
            bank.set_region(
                &mut sink,
                &region(i as u8, 0x1000 * (i as u32 + 1), 0x1000 * (i as u32 + 2), *bits),
            )
            .unwrap();
        }

        for i in 0..3 {
            let shadow = bank.get_region(i as u8).unwrap();
            let byte = hw_cfg_byte(&sink, i);
            assert_eq!(byte & 0b111, shadow.attributes.bits() as u8 & 0b111);
            assert_eq!(byte & (0b11 << 3), 0b01 << 3, "A field must be TOR");
            assert_eq!(sink.addr[i], shadow.end);
        }
    }

    #[test]
    fn rejects_bad_arguments() {
        let mut sink = FakeSink::default();
        let mut bank = PmpBank::new();
        bank.init(&mut sink);

        assert_eq!(
            bank.set_region(&mut sink, &region(16, 0x1000, 0x2000, 0b011)),
            Err(Kerr::PmpInvalidRegion)
        );
        assert_eq!(
            bank.set_region(&mut sink, &region(0, 0x2000, 0x1000, 0b011)),
            Err(Kerr::PmpAddrRange)
        );
        assert_eq!(
            bank.set_region(&mut sink, &region(0, 0x2000, 0x2000, 0b011)),
            Err(Kerr::PmpAddrRange)
        );
        assert_eq!(bank.get_region(16), Err(Kerr::PmpInvalidRegion));
        // None of the rejected calls may have touched the hardware.
        let baseline = sink.writes;
        assert_eq!(baseline, PMP_CFG_REGS + PMP_REGIONS); // init only
    }

    #[test]
    fn locked_region_refuses_mutation() {
        let mut sink = FakeSink::default();
        let mut bank = PmpBank::new();
        bank.init(&mut sink);

        bank.set_region(&mut sink, &region(1, 0x1000, 0x2000, 0b001))
            .unwrap();
        bank.lock_region(&mut sink, 1).unwrap();
        assert!(hw_cfg_byte(&sink, 1) & 0x80 != 0);

        assert_eq!(
            bank.set_region(&mut sink, &region(1, 0x3000, 0x4000, 0b001)),
            Err(Kerr::PmpLocked)
        );
        assert_eq!(bank.disable_region(&mut sink, 1), Err(Kerr::PmpLocked));
        // Shadow still describes the original range.
        let r = bank.get_region(1).unwrap();
        assert_eq!((r.start, r.end), (0x1000, 0x2000));
        assert!(r.locked);

        // init is the one way out.
        bank.init(&mut sink);
        assert!(!bank.get_region(1).unwrap().locked);
    }

    #[test]
    fn disable_clears_slot() {
        let mut sink = FakeSink::default();
        let mut bank = PmpBank::new();
        bank.init(&mut sink);

        bank.set_region(&mut sink, &region(2, 0x1000, 0x2000, 0b111))
            .unwrap();
        bank.disable_region(&mut sink, 2).unwrap();
        assert_eq!(hw_cfg_byte(&sink, 2), 0);
        assert!(bank.get_region(2).unwrap().is_disabled());
        // Address-register contents are don't-care for an OFF slot; only the
        // config byte matters.
    }

    #[test]
    fn check_access_first_match_wins() {
        let mut sink = FakeSink::default();
        let mut bank = PmpBank::new();
        bank.init(&mut sink);

        // Slot 0 grants read-only over a range; slot 2 grants RW over a
        // superset. Lowest index decides, so writes inside slot 0's range
        // are denied even though slot 2 would allow them.
        bank.set_region(&mut sink, &region(0, 0x1000, 0x2000, 0b001))
            .unwrap();
        bank.set_region(&mut sink, &region(2, 0x1000, 0x8000, 0b011))
            .unwrap();

        assert!(bank.check_access(0x1800, 4, false, false));
        assert!(!bank.check_access(0x1800, 4, true, false));
        assert!(bank.check_access(0x3000, 4, true, false));
        // Straddling the first region's end falls through to slot 2.
        assert!(bank.check_access(0x1ffc, 8, true, false));
        // Outside every region: denied.
        assert!(!bank.check_access(0x9000, 4, false, false));
        // Execute never granted here.
        assert!(!bank.check_access(0x1800, 4, false, true));
    }

    #[test]
    fn check_access_skips_disabled_entries() {
        let mut sink = FakeSink::default();
        let mut bank = PmpBank::new();
        bank.init(&mut sink);

        bank.set_region(&mut sink, &region(0, 0x1000, 0x2000, 0b011))
            .unwrap();
        bank.set_region(&mut sink, &region(1, 0x1000, 0x2000, 0b111))
            .unwrap();
        bank.disable_region(&mut sink, 0).unwrap();

        // Slot 0 is disabled; slot 1 must now decide.
        assert!(bank.check_access(0x1800, 4, false, true));
    }

    #[test]
    fn kernel_pools_prime_slot_zero() {
        let pools = kernel_pools();
        let mut sink = FakeSink::default();
        let mut bank = PmpBank::new();
        bank.init_kernel(&mut sink, &pools).unwrap();

        // The boot smoke test: config byte 0 is live and pmpaddr0 holds the
        // end of kernel text.
        assert_ne!(sink.cfg[0], 0);
        assert_eq!(sink.addr[0], pools[0].end);
        assert_eq!(bank.region_count(), 5);
        assert!(bank.is_initialized());

        // Kernel text is executable-not-writable, data the reverse.
        assert!(bank.check_access(0x8000_1000, 4, false, true));
        assert!(!bank.check_access(0x8000_1000, 4, true, false));
        assert!(bank.check_access(0x8000_4800, 4, true, false));

        // Next free slot comes after the pools.
        assert_eq!(bank.alloc_slot(), Some(5));
    }
}
