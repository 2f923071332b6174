//! Software transfer engine.
//!
//! Implements [`RegisterAccess`] with an in-memory register file and walks
//! the descriptor ring exactly as hardware would: it fetches from the
//! programmed base, follows LINK descriptors, moves data to and from a
//! per-destination remote memory model, and writes each finished
//! descriptor's bus address into the completion queue. Progress only
//! happens when [`SimEngine::simulate_progress`] is called, which makes
//! fault scenarios reproducible.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Core::alloc::{bus_to_virt, bus_window_base, DmaRegion};
use crate::Core::regs::*;
use crate::Core::SharedMemory::attach_shared_memory;
use crate::DMA::Ring::Ring::{wp_add, wp_reached, STS_ENTRY_SIZE, STS_ROW_ENTRIES};
use crate::DMA::Structs::Descriptor_Structs::{
    DescKind, Descriptor, DmaOpcode, DESC_SIZE, INLINE_MAX,
};

/// Fault injection bits for [`SimEngine::simulate_progress`].
pub const SIM_INJECT_TIMEOUT: u32 = 1 << 0;
pub const SIM_INJECT_RIO_ERR: u32 = 1 << 1;
pub const SIM_INJECT_IMPL_ERR: u32 = 1 << 2;
pub const SIM_INJECT_PCIE_ERR: u32 = 1 << 3;

/// Byte offset of the inline payload inside a descriptor.
const INLINE_OFFSET: usize = 32;

const REG_COUNT: usize = (DMA_REG_SPAN / 4) as usize;

/// Simulator tunables.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Let the channel service loop advance the simulator on its own.
    pub auto_progress: bool,
    /// Descriptors processed per service pass when auto-progressing.
    pub step: u32,
    /// Bytes of remote memory modelled per destination ID.
    pub remote_window: usize,
    /// Name prefix used to map bulk buffers owned by other processes.
    pub shm_prefix: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            auto_progress: true,
            step: 64,
            remote_window: 1 << 20,
            shm_prefix: "fdma_".to_string(),
        }
    }
}

impl SimConfig {
    /// Nothing moves unless the caller steps the simulator.
    pub fn manual() -> Self {
        Self {
            auto_progress: false,
            ..Self::default()
        }
    }
}

pub struct SimEngine {
    pub(crate) config: SimConfig,
    pub(crate) state: Mutex<SimState>,
    pub(crate) processed: AtomicU64,
    pub(crate) links: AtomicU64,
}

pub(crate) struct SimState {
    regs: [u32; REG_COUNT],
    /// Next completion entry to write.
    sts_wr: u32,
    armed_mask: u32,
    /// Position at or after which the armed fault fires.
    fault_at: Option<u32>,
    remote: HashMap<u16, Vec<u8>>,
    /// Bulk buffers of other processes mapped on demand.
    foreign: Vec<DmaRegion>,
}

impl SimState {
    #[inline]
    fn reg(&self, offset: u32) -> u32 {
        self.regs[(offset / 4) as usize]
    }

    #[inline]
    fn set(&mut self, offset: u32, value: u32) {
        self.regs[(offset / 4) as usize] = value;
    }

    fn reg64(&self, lo: u32, hi: u32) -> u64 {
        self.reg(lo) as u64 | ((self.reg(hi) as u64) << 32)
    }

    fn set64(&mut self, lo: u32, hi: u32, value: u64) {
        self.set(lo, value as u32);
        self.set(hi, (value >> 32) as u32);
    }

    fn abort(&mut self, code: u32) {
        let status = self.reg(DMA_STS) & !(DMA_STS_RUN | DMA_STS_CODE_MASK);
        self.set(DMA_STS, status | DMA_STS_ABORT | (code & DMA_STS_CODE_MASK));
    }

    fn translate(&mut self, prefix: &str, bus: u64, len: usize) -> Option<*mut u8> {
        if let Some(p) = bus_to_virt(bus, len) {
            return Some(p);
        }
        let base = bus_window_base(bus);
        if self.foreign.iter().any(|r| r.bus_addr() == base) {
            return None;
        }
        let mem = attach_shared_memory(&format!("{prefix}{base:x}"), 0).ok()?;
        let size = mem.size();
        log::debug!("sim: mapped foreign buffer {:#x} ({} bytes)", base, size);
        self.foreign.push(DmaRegion::new(mem, base, size));
        bus_to_virt(bus, len)
    }
}

/// Abort code for the lowest set injection bit.
fn inject_code(mask: u32) -> u32 {
    if mask & SIM_INJECT_TIMEOUT != 0 {
        ABORT_CODE_TIMEOUT
    } else if mask & SIM_INJECT_RIO_ERR != 0 {
        ABORT_CODE_RIO_ERR
    } else if mask & SIM_INJECT_IMPL_ERR != 0 {
        ABORT_CODE_IMPL_ERR
    } else {
        ABORT_CODE_PCIE
    }
}

impl SimEngine {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState {
                regs: [0; REG_COUNT],
                sts_wr: 0,
                armed_mask: 0,
                fault_at: None,
                remote: HashMap::new(),
                foreign: Vec::new(),
            }),
            processed: AtomicU64::new(0),
            links: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Fault the first data descriptor at or after `position` (or the
    /// next one, for `None`) the next time the simulator runs.
    pub fn arm_fault(&self, mask: u32, position: Option<u32>) {
        let mut st = self.state.lock();
        st.armed_mask = mask;
        st.fault_at = position;
    }

    /// Advance using whatever fault is armed.
    pub fn step(&self, max_descriptors: u32) -> u32 {
        let mask = self.state.lock().armed_mask;
        self.simulate_progress(max_descriptors, mask)
    }

    /// Process up to `max_descriptors` data descriptors.
    ///
    /// LINK descriptors are followed without counting against the budget.
    /// With a non-zero `fault_bitmask`, the first data descriptor at or
    /// after the armed fault position is not executed: the channel halts
    /// with the matching abort code and the count processed so far is
    /// returned.
    pub fn simulate_progress(&self, max_descriptors: u32, fault_bitmask: u32) -> u32 {
        let prefix = self.config.shm_prefix.as_str();
        let window = self.config.remote_window;
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if st.reg(DMA_STS) & DMA_STS_RUN == 0 {
            return 0;
        }

        let wr = st.reg(DMA_DWRCNT);
        let capacity = st.reg(DMA_DSSZ).max(1);
        let sts_base = st.reg64(DMA_SBL, DMA_SBH);
        let sts_entries = st.reg(DMA_SSZ) * STS_ROW_ENTRIES as u32;
        let mut rd = st.reg(DMA_DRDCNT);
        let mut cur = st.reg64(DMA_DPTRL, DMA_DPTRH);
        let mut processed = 0u32;
        let mut hops = 0u32;

        while processed < max_descriptors && rd != wr {
            let Some(desc_ptr) = st.translate(prefix, cur, DESC_SIZE) else {
                log::warn!("sim: descriptor fetch from unmapped bus {:#x}", cur);
                st.abort(ABORT_CODE_PCIE);
                break;
            };
            std::sync::atomic::fence(Ordering::Acquire);
            let desc = unsafe { ptr::read_volatile(desc_ptr as *const Descriptor) };

            if desc.is_link() {
                hops += 1;
                if hops > capacity {
                    log::warn!("sim: LINK loop at bus {:#x}", cur);
                    st.abort(ABORT_CODE_PCIE);
                    break;
                }
                rd = wp_add(rd, 1);
                cur = desc.local;
                self.links.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            hops = 0;

            if fault_bitmask != 0 && st.fault_at.map_or(true, |k| wp_reached(rd, k)) {
                log::debug!("sim: injecting fault {:#x} at position {}", fault_bitmask, rd);
                st.fault_at = None;
                st.armed_mask = 0;
                st.abort(inject_code(fault_bitmask));
                break;
            }

            if sts_entries == 0 {
                st.abort(ABORT_CODE_PCIE);
                break;
            }
            let entry_bus = sts_base + (st.sts_wr as usize * STS_ENTRY_SIZE) as u64;
            let Some(entry_ptr) = st.translate(prefix, entry_bus, STS_ENTRY_SIZE) else {
                st.abort(ABORT_CODE_PCIE);
                break;
            };
            let entry = unsafe { &*(entry_ptr as *const AtomicU64) };
            if entry.load(Ordering::Acquire) != 0 {
                // Completion queue full; wait for software to consume
                break;
            }

            if let Err(code) = execute(st, prefix, window, desc_ptr, &desc) {
                st.abort(code);
                break;
            }

            entry.store(cur, Ordering::Release);
            st.sts_wr = (st.sts_wr + 1) % sts_entries;
            rd = wp_add(rd, 1);
            cur += DESC_SIZE as u64;
            processed += 1;
        }

        st.set(DMA_DRDCNT, rd);
        st.set64(DMA_DPTRL, DMA_DPTRH, cur);
        let row = st.sts_wr / STS_ROW_ENTRIES as u32;
        st.set(DMA_SWRP, row);
        self.processed
            .fetch_add(processed as u64, Ordering::Relaxed);
        processed
    }

    /// Total data descriptors executed.
    pub fn processed_total(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Total LINK descriptors followed.
    pub fn links_followed(&self) -> u64 {
        self.links.load(Ordering::Relaxed)
    }

    /// Contents of remote memory at `dest_id`.
    pub fn remote_read(&self, dest_id: u16, raddr: u64, len: usize) -> Option<Vec<u8>> {
        let st = self.state.lock();
        let mem = st.remote.get(&dest_id)?;
        let start = usize::try_from(raddr).ok()?;
        mem.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// Preload remote memory at `dest_id`.
    pub fn remote_write(&self, dest_id: u16, raddr: u64, data: &[u8]) -> bool {
        let window = self.config.remote_window;
        let mut st = self.state.lock();
        let mem = st
            .remote
            .entry(dest_id)
            .or_insert_with(|| vec![0u8; window]);
        let Some(start) = usize::try_from(raddr).ok() else {
            return false;
        };
        match start.checked_add(data.len()).and_then(|end| mem.get_mut(start..end)) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> u32 {
        self.state.lock().reg(DMA_STS)
    }

    pub(crate) fn remote_destinations(&self) -> usize {
        self.state.lock().remote.len()
    }
}

/// Move one descriptor's data. `Err` carries the abort code.
fn execute(
    st: &mut SimState,
    prefix: &str,
    window: usize,
    desc_ptr: *mut u8,
    desc: &Descriptor,
) -> Result<(), u32> {
    let opcode = desc.opcode().ok_or(ABORT_CODE_IMPL_ERR)?;
    let kind = desc.kind().ok_or(ABORT_CODE_PCIE)?;
    let len = desc.len as usize;

    let start = usize::try_from(desc.raddr).map_err(|_| ABORT_CODE_RIO_ERR)?;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= window)
        .ok_or(ABORT_CODE_RIO_ERR)?;

    let local = match kind {
        DescKind::Bulk => Some(st.translate(prefix, desc.local, len).ok_or(ABORT_CODE_PCIE)?),
        DescKind::Inline if len <= INLINE_MAX => None,
        _ => return Err(ABORT_CODE_IMPL_ERR),
    };

    let mem = st
        .remote
        .entry(desc.dest_id)
        .or_insert_with(|| vec![0u8; window]);
    let remote = &mut mem[start..end];

    unsafe {
        match (opcode, local) {
            (DmaOpcode::Read, None) => {
                ptr::copy_nonoverlapping(remote.as_ptr(), desc_ptr.add(INLINE_OFFSET), len);
            }
            (DmaOpcode::Read, Some(local)) => {
                ptr::copy_nonoverlapping(remote.as_ptr(), local, len);
            }
            (_, None) => remote.copy_from_slice(&desc.inline[..len]),
            (_, Some(local)) => {
                ptr::copy_nonoverlapping(local as *const u8, remote.as_mut_ptr(), len);
            }
        }
    }
    Ok(())
}

impl RegisterAccess for SimEngine {
    fn read32(&self, offset: u32) -> u32 {
        if offset >= DMA_REG_SPAN {
            return 0;
        }
        self.state.lock().reg(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        if offset >= DMA_REG_SPAN {
            return;
        }
        let mut st = self.state.lock();
        match offset {
            DMA_CTL => {
                if value & DMA_CTL_INIT != 0 {
                    let base = st.reg64(DMA_DSBL, DMA_DSBH);
                    st.set(DMA_DRDCNT, 0);
                    st.set(DMA_DWRCNT, 0);
                    st.set(DMA_SWRP, 0);
                    st.set(DMA_SRDP, 0);
                    st.set64(DMA_DPTRL, DMA_DPTRH, base);
                    st.set(DMA_STS, DMA_STS_RUN);
                    st.sts_wr = 0;
                }
                if value & DMA_CTL_SUSPEND != 0 {
                    let status = st.reg(DMA_STS);
                    if status & DMA_STS_RUN != 0 {
                        st.set(DMA_STS, (status & !DMA_STS_RUN) | DMA_STS_SUSPENDED);
                    }
                }
                st.set(DMA_CTL, 0);
            }
            // Hardware-owned
            DMA_STS | DMA_DRDCNT | DMA_DPTRL | DMA_DPTRH | DMA_SWRP => {}
            _ => st.set(offset, value),
        }
    }
}

impl std::fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_sim_engine(self, f)
    }
}
