//! Linear-scan register allocation.
//!
//! The builder walks its node list once to give every virtual register a
//! live interval in instruction half-positions (use = 2n, def = 2n + 1, so
//! an instruction's destination may reuse a register that dies in one of
//! its sources). The scan then hands out physical registers from per-class
//! pools ordered caller-saved first, spilling the interval with the
//! furthest end when a pool runs dry.

use log::trace;

use crate::reg::RegClass;
use crate::result::{CodegenError, CodegenResult};

/// A position in the flattened instruction order; two half-steps per node.
pub type Pos = u32;

/// Interval and constraint data for one virtual register.
#[derive(Clone, Debug)]
pub struct VRegData {
    pub class: RegClass,
    /// First position touching the register, or `None` if unused.
    pub start: Option<Pos>,
    pub end: Pos,
    /// Preferred physical register (incoming-argument location).
    pub hint: Option<u8>,
}

impl VRegData {
    pub fn new(class: RegClass) -> VRegData {
        VRegData {
            class,
            start: None,
            end: 0,
            hint: None,
        }
    }

    /// Extend the interval to cover `pos`.
    pub fn extend(&mut self, pos: Pos) {
        match self.start {
            None => {
                self.start = Some(pos);
                self.end = pos;
            }
            Some(start) => {
                if pos < start {
                    self.start = Some(pos);
                }
                if pos > self.end {
                    self.end = pos;
                }
            }
        }
    }
}

/// Where a virtual register ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// A physical register (hardware encoding).
    Reg(u8),
    /// A spill slot: byte offset from the top of the spill area.
    Slot(u32),
}

/// The physical registers available to the allocator for one target.
#[derive(Clone, Debug)]
pub struct RegPools {
    /// Allocatable GPRs, caller-saved first.
    pub gp: Vec<u8>,
    /// Allocatable vector registers, caller-saved first.
    pub vec: Vec<u8>,
    /// Callee-saved subset of `gp`, for clobber bookkeeping.
    pub callee_gp: Vec<u8>,
    /// Callee-saved subset of `vec`.
    pub callee_vec: Vec<u8>,
}

impl RegPools {
    fn pool(&self, class: RegClass) -> &[u8] {
        match class {
            RegClass::Gp => &self.gp,
            RegClass::Vec => &self.vec,
        }
    }

    fn is_callee_saved(&self, class: RegClass, enc: u8) -> bool {
        match class {
            RegClass::Gp => self.callee_gp.contains(&enc),
            RegClass::Vec => self.callee_vec.contains(&enc),
        }
    }
}

fn slot_size(class: RegClass) -> u32 {
    match class {
        RegClass::Gp => 8,
        RegClass::Vec => 16,
    }
}

/// Output of the scan.
#[derive(Clone, Debug)]
pub struct AllocResult {
    /// Per virtual register; `None` for registers that are never used.
    pub assignments: Vec<Option<Assignment>>,
    /// Total spill-area size in bytes.
    pub spill_bytes: u32,
    /// Callee-saved GPRs handed out, in pool order.
    pub used_callee_gp: Vec<u8>,
    /// Callee-saved vector registers handed out.
    pub used_callee_vec: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
struct Active {
    vreg: u32,
    end: Pos,
    enc: u8,
}

/// Run the linear scan over the computed intervals.
pub fn linear_scan(vregs: &[VRegData], pools: &RegPools) -> CodegenResult<AllocResult> {
    let mut order: Vec<u32> = (0..vregs.len() as u32)
        .filter(|&i| vregs[i as usize].start.is_some())
        .collect();
    order.sort_by_key(|&i| (vregs[i as usize].start.unwrap(), i));

    let mut assignments: Vec<Option<Assignment>> = vec![None; vregs.len()];
    let mut active: Vec<Active> = Vec::new(); // sorted by ascending end
    let mut free: Vec<Vec<u8>> = vec![pools.gp.clone(), pools.vec.clone()];
    let mut spill_bytes = 0u32;
    let mut used_callee_gp = Vec::new();
    let mut used_callee_vec = Vec::new();

    let mut alloc_slot = |class: RegClass, spill_bytes: &mut u32| {
        let size = slot_size(class);
        let off = spill_bytes.next_multiple_of(size);
        *spill_bytes = off + size;
        Assignment::Slot(off)
    };

    for &idx in &order {
        let data = &vregs[idx as usize];
        let class = data.class;
        let start = data.start.unwrap();
        if pools.pool(class).is_empty() {
            return Err(CodegenError::IllegalVirtReg);
        }

        // Expire intervals that ended before this one starts.
        let mut i = 0;
        while i < active.len() {
            if active[i].end < start {
                let expired = active.remove(i);
                let cls = vregs[expired.vreg as usize].class;
                let pool = &mut free[cls as usize];
                // Return in preference order.
                let rank = |e: u8| pools.pool(cls).iter().position(|&p| p == e).unwrap();
                let pos = pool
                    .iter()
                    .position(|&p| rank(p) > rank(expired.enc))
                    .unwrap_or(pool.len());
                pool.insert(pos, expired.enc);
            } else {
                i += 1;
            }
        }

        let free_pool = &mut free[class as usize];
        let enc = if let Some(hint) = data.hint.filter(|h| free_pool.contains(h)) {
            free_pool.retain(|&e| e != hint);
            Some(hint)
        } else if free_pool.is_empty() {
            None
        } else {
            Some(free_pool.remove(0))
        };

        match enc {
            Some(enc) => {
                if pools.is_callee_saved(class, enc) {
                    let used = match class {
                        RegClass::Gp => &mut used_callee_gp,
                        RegClass::Vec => &mut used_callee_vec,
                    };
                    if !used.contains(&enc) {
                        used.push(enc);
                    }
                }
                assignments[idx as usize] = Some(Assignment::Reg(enc));
                let pos = active
                    .iter()
                    .position(|a| a.end > data.end)
                    .unwrap_or(active.len());
                active.insert(
                    pos,
                    Active {
                        vreg: idx,
                        end: data.end,
                        enc,
                    },
                );
                trace!("regalloc: v{idx} -> p{enc} [{start}, {}]", data.end);
            }
            None => {
                // Spill at furthest use: evict the active interval of this
                // class with the furthest end if it outlives the new one.
                let victim = active
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, a)| vregs[a.vreg as usize].class == class);
                match victim {
                    Some((vi, v)) if v.end > data.end => {
                        let v = *v;
                        active.remove(vi);
                        assignments[v.vreg as usize] = Some(alloc_slot(class, &mut spill_bytes));
                        trace!("regalloc: evict v{} to slot, v{idx} -> p{}", v.vreg, v.enc);
                        assignments[idx as usize] = Some(Assignment::Reg(v.enc));
                        let pos = active
                            .iter()
                            .position(|a| a.end > data.end)
                            .unwrap_or(active.len());
                        active.insert(
                            pos,
                            Active {
                                vreg: idx,
                                end: data.end,
                                enc: v.enc,
                            },
                        );
                    }
                    _ => {
                        assignments[idx as usize] = Some(alloc_slot(class, &mut spill_bytes));
                        trace!("regalloc: v{idx} spilled");
                    }
                }
            }
        }
    }

    Ok(AllocResult {
        assignments,
        spill_bytes,
        used_callee_gp,
        used_callee_vec,
    })
}
