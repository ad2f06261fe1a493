//! Process control blocks: the OS-side record of every process.

use crate::hw::cpu::{Cpu, RegFile};
use crate::hw::device::DeviceId;
use crate::inst::{regs, Reg};
use crate::Word;

/// A process id.
pub type Pid = Word;

/// The pid reserved for idle processes.
pub const IDLE_PID: Pid = 999;

/// The I/O operation a blocked process is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    /// Waiting to open a busy non-sharable device.
    Open,
    /// Waiting for a read completion.
    Read,
    /// Waiting for a write completion.
    Write,
}

/// Why a process is blocked. Devices are referenced by id and resolved
/// through the device table, never by holding the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockState {
    /// The device being waited on.
    pub device: DeviceId,
    /// The operation in flight.
    pub op: BlockOp,
    /// The address of the request; ignored for `Open`.
    pub addr: Word,
}

/// The saved state and scheduling bookkeeping of one process.
///
/// While a process is running its registers live on the CPU and the
/// copy here is stale; every context switch copies them in and out,
/// so the two are never aliased. The saved `PC` always denotes the
/// next instruction the process will execute on resume.
#[derive(Debug, Clone)]
pub struct Pcb {
    pid: Pid,
    regs: RegFile,
    block: Option<BlockState>,
    priority: Word,
    last_ready_tick: u64,
    num_ready_entries: u64,
    max_starve_ticks: u64,
    avg_starve_ticks: f64,
}

impl Pcb {
    /// Creates a PCB in the ready state as of `tick`.
    pub fn new(pid: Pid, priority: Word, tick: u64) -> Pcb {
        Pcb {
            pid,
            regs: RegFile::new(),
            block: None,
            priority,
            last_ready_tick: tick,
            num_ready_entries: 0,
            max_starve_ticks: 0,
            avg_starve_ticks: 0.0,
        }
    }

    /// The process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether this is an idle process.
    pub fn is_idle(&self) -> bool {
        self.pid == IDLE_PID
    }

    /// Saves the CPU registers into this PCB. `pc_adjust` is added to
    /// the saved `PC` to account for a post-increment still pending in
    /// the current step.
    pub fn save(&mut self, cpu: &Cpu, pc_adjust: Word) {
        self.regs = *cpu.registers();
        self.regs[regs::PC] = self.regs[regs::PC].wrapping_add(pc_adjust);
    }

    /// Restores this PCB's registers onto the CPU. `pc_adjust` is
    /// subtracted from the restored `PC` so that a pending
    /// post-increment lands exactly on the saved resume point.
    pub fn restore(&self, cpu: &mut Cpu, pc_adjust: Word) {
        *cpu.registers_mut() = self.regs;
        cpu.set_pc(cpu.pc().wrapping_sub(pc_adjust));
    }

    /// A saved register value.
    pub fn reg(&self, r: Reg) -> Word {
        self.regs[r]
    }

    /// Overwrites a saved register value.
    pub fn set_reg(&mut self, r: Reg, value: Word) {
        self.regs[r] = value;
    }

    /// The saved window base.
    pub fn base(&self) -> Word {
        self.regs[regs::BASE]
    }

    /// The saved window length.
    pub fn lim(&self) -> Word {
        self.regs[regs::LIM]
    }

    /// The saved stack pointer (relative to base).
    pub fn sp(&self) -> Word {
        self.regs[regs::SP]
    }

    /// Whether `addr` lies inside this process's saved window.
    pub fn window_contains(&self, addr: Word) -> bool {
        let base = i64::from(self.base());
        let lim = i64::from(self.lim());
        i64::from(addr) >= base && i64::from(addr) < base + lim
    }

    /// Relocates the saved window by `shift` words: `BASE` and the
    /// absolute `PC` move, `LIM` and the relative `SP` do not.
    pub fn shift_window(&mut self, shift: Word) {
        self.regs[regs::BASE] += shift;
        self.regs[regs::PC] = self.regs[regs::PC].wrapping_add(shift);
    }

    /// Marks the process blocked on `state`.
    pub fn block(&mut self, state: BlockState) {
        self.block = Some(state);
    }

    /// Moves the process from blocked back to ready as of `tick`.
    pub fn unblock(&mut self, tick: u64) {
        self.block = None;
        self.mark_ready(tick);
    }

    /// Whether the process is blocked.
    pub fn is_blocked(&self) -> bool {
        self.block.is_some()
    }

    /// The block reason, if blocked.
    pub fn block_state(&self) -> Option<BlockState> {
        self.block
    }

    /// Whether the process is blocked for the given device and
    /// operation. The address must also match, except for `Open`
    /// waits, which carry no meaningful address.
    pub fn is_blocked_for(&self, device: DeviceId, op: BlockOp, addr: Word) -> bool {
        match self.block {
            Some(b) => b.device == device && b.op == op && (op == BlockOp::Open || b.addr == addr),
            None => false,
        }
    }

    /// The scheduling priority.
    pub fn priority(&self) -> Word {
        self.priority
    }

    /// Raises (or lowers) the priority.
    pub fn add_priority(&mut self, delta: Word) {
        self.priority = self.priority.saturating_add(delta);
    }

    /// Records that the process (re-)entered the ready state.
    pub fn mark_ready(&mut self, tick: u64) {
        self.last_ready_tick = tick;
    }

    /// Records a dispatch at `tick` and folds the time spent ready
    /// into the starvation statistics.
    pub fn record_dispatch(&mut self, tick: u64) {
        let starve = tick.saturating_sub(self.last_ready_tick);
        self.num_ready_entries += 1;
        self.max_starve_ticks = self.max_starve_ticks.max(starve);
        self.avg_starve_ticks +=
            (starve as f64 - self.avg_starve_ticks) / self.num_ready_entries as f64;
    }

    /// How many times the process has been dispatched.
    pub fn num_ready_entries(&self) -> u64 {
        self.num_ready_entries
    }

    /// The longest observed wait between becoming ready and running.
    pub fn max_starve_ticks(&self) -> u64 {
        self.max_starve_ticks
    }

    /// The average wait between becoming ready and running.
    pub fn avg_starve_ticks(&self) -> f64 {
        self.avg_starve_ticks
    }
}

impl std::fmt::Display for Pcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Process {} ", self.pid)?;
        match self.block {
            Some(b) => {
                match b.op {
                    BlockOp::Open => write!(f, "is BLOCKED for OPEN")?,
                    BlockOp::Read => write!(f, "is BLOCKED for READ @{}", b.addr)?,
                    BlockOp::Write => write!(f, "is BLOCKED for WRITE @{}", b.addr)?,
                }
                write!(f, " on device #{}: ", b.device)?;
            }
            None => write!(f, "is READY: ")?,
        }
        for i in 0..5 {
            write!(f, "r{i}={} ", self.reg(Reg(i as u8)))?;
        }
        write!(
            f,
            "PC={} SP={} BASE={} LIM={} prio={}",
            self.reg(regs::PC),
            self.sp(),
            self.base(),
            self.lim(),
            self.priority
        )
    }
}
