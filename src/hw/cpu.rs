//! The processor chip: register file, fetch-decode-execute stepping,
//! and the trap capability it raises into the operating system.
//!
//! The CPU is a single-threaded cooperative executor of one
//! instruction per step. Each step, in strict order: poll the
//! interrupt controller, fetch and decode at `PC`, execute,
//! unconditionally advance `PC` by [`INSTRSIZE`], then tick the clock
//! and raise the clock interrupt on period boundaries. Branches
//! compensate for the post-increment by writing `target - INSTRSIZE`.

use crate::inst::{regs, Instr, Reg, INSTRSIZE, NUMREG};
use crate::{Halt, Word};

use super::device::DeviceId;
use super::intc::{InterruptController, IoEvent};
use super::ram::Ram;

/// Default number of ticks between clock interrupts.
pub const DEFAULT_CLOCK_FREQ: u64 = 5;

/// The capability the operating system hands the CPU so that traps,
/// system calls and interrupts can transfer control to it.
///
/// The first three callbacks report conditions that are fatal for the
/// whole simulation; they return the [`Halt`] the simulation stops
/// with. The remainder run OS code between instructions and may
/// themselves stop the machine (e.g. when the last process exits).
pub trait TrapHandler {
    /// A data access or branch target fell outside `[BASE, BASE+LIM)`.
    fn illegal_memory_access(&mut self, addr: Word) -> Halt;
    /// A `DIV` instruction was executed with a zero divisor.
    fn divide_by_zero(&mut self) -> Halt;
    /// A fetched word tuple did not decode to a known instruction.
    fn illegal_instruction(&mut self, words: [Word; 4]) -> Halt;
    /// A `TRAP` instruction was executed; the handler pops the
    /// system-call id from the current process's stack itself.
    fn system_call(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt>;
    /// A device finished a read and `data` is ready for the process
    /// blocked on `(dev, READ, addr)`.
    fn io_read_complete(
        &mut self,
        cpu: &mut Cpu,
        ram: &mut Ram,
        dev: DeviceId,
        addr: Word,
        data: Word,
    ) -> Result<(), Halt>;
    /// A device finished a write issued against `(dev, WRITE, addr)`.
    fn io_write_complete(
        &mut self,
        cpu: &mut Cpu,
        ram: &mut Ram,
        dev: DeviceId,
        addr: Word,
    ) -> Result<(), Halt>;
    /// The clock fired; fires once every `clock_freq` ticks, after the
    /// PC has already advanced past the instruction just executed.
    fn interrupt_clock(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt>;
}

/// The register file: five general registers plus `PC`, `SP`, `BASE`
/// and `LIM`, addressed by [`Reg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegFile([Word; NUMREG]);

impl RegFile {
    /// Creates a zeroed register file.
    pub fn new() -> RegFile {
        RegFile([0; NUMREG])
    }
}

impl Default for RegFile {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Index<Reg> for RegFile {
    type Output = Word;

    fn index(&self, index: Reg) -> &Self::Output {
        &self.0[index.index()]
    }
}

impl std::ops::IndexMut<Reg> for RegFile {
    fn index_mut(&mut self, index: Reg) -> &mut Self::Output {
        &mut self.0[index.index()]
    }
}

/// The simulated processor.
#[derive(Debug)]
pub struct Cpu {
    regs: RegFile,
    ticks: u64,
    clock_freq: u64,
    verbose: bool,
}

impl Cpu {
    /// Creates a CPU with zeroed registers and the given clock period.
    pub fn new(clock_freq: u64) -> Cpu {
        Cpu {
            regs: RegFile::new(),
            ticks: 0,
            clock_freq: clock_freq.max(1),
            verbose: false,
        }
    }

    /// The full register file; used by PCB save.
    pub fn registers(&self) -> &RegFile {
        &self.regs
    }

    /// Mutable access to the register file; used by PCB restore.
    pub fn registers_mut(&mut self) -> &mut RegFile {
        &mut self.regs
    }

    /// The program counter (absolute).
    pub fn pc(&self) -> Word {
        self.regs[regs::PC]
    }

    /// Sets the program counter.
    pub fn set_pc(&mut self, v: Word) {
        self.regs[regs::PC] = v;
    }

    /// The stack pointer (relative to `BASE`).
    pub fn sp(&self) -> Word {
        self.regs[regs::SP]
    }

    /// Sets the stack pointer.
    pub fn set_sp(&mut self, v: Word) {
        self.regs[regs::SP] = v;
    }

    /// The low bound of the accessible window.
    pub fn base(&self) -> Word {
        self.regs[regs::BASE]
    }

    /// Sets the window's low bound.
    pub fn set_base(&mut self, v: Word) {
        self.regs[regs::BASE] = v;
    }

    /// The length of the accessible window.
    pub fn lim(&self) -> Word {
        self.regs[regs::LIM]
    }

    /// Sets the window's length.
    pub fn set_lim(&mut self, v: Word) {
        self.regs[regs::LIM] = v;
    }

    /// The monotonically increasing tick counter.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Charges extra ticks, modelling work (such as a context switch)
    /// that consumes time without executing instructions.
    pub fn add_ticks(&mut self, n: u64) {
        self.ticks += n;
    }

    /// Ticks between clock interrupts.
    pub fn clock_freq(&self) -> u64 {
        self.clock_freq
    }

    /// Toggles diagnostic tracing of every step.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Whether `addr` lies inside the current `[BASE, BASE+LIM)` window.
    pub fn in_bounds(&self, addr: Word) -> bool {
        let base = i64::from(self.base());
        let lim = i64::from(self.lim());
        (i64::from(addr)) >= base && (i64::from(addr)) < base + lim
    }

    /// Validates a process memory access: the address must lie inside
    /// the window *and* inside physical RAM (a program can corrupt its
    /// own `BASE`/`LIM` through ordinary register writes, and that
    /// must trap rather than index RAM out of range). Address
    /// arithmetic is done in `i64` so corrupted registers cannot
    /// overflow it.
    fn checked_addr(&self, ram: &Ram, addr: i64) -> Option<usize> {
        let base = i64::from(self.base());
        let lim = i64::from(self.lim());
        if addr < base || addr >= base + lim {
            return None;
        }
        if addr < 0 || addr >= ram.size() as i64 {
            return None;
        }
        Some(addr as usize)
    }

    /// Prints the registers; used by verbose tracing and COREDUMP.
    pub fn reg_dump(&self) {
        for i in 0..5 {
            print!("r{i}={} ", self.regs.0[i]);
        }
        println!(
            "PC={} SP={} BASE={} LIM={}",
            self.pc(),
            self.sp(),
            self.base(),
            self.lim()
        );
    }

    /// Pushes a value onto the process stack: bounds-check, decrement
    /// `SP`, then write at `BASE + SP`. `Err` carries the offending
    /// absolute address.
    pub fn try_push(&mut self, ram: &mut Ram, value: Word) -> Result<(), Word> {
        let target = i64::from(self.base()) + i64::from(self.sp()) - 1;
        let Some(addr) = self.checked_addr(ram, target) else {
            return Err(target as Word);
        };
        self.set_sp(self.sp() - 1);
        ram.write(addr, value);
        Ok(())
    }

    /// Pops the top of the process stack: read at `BASE + SP`, then
    /// increment `SP`. The stack is empty when `SP == LIM - 1`, and
    /// popping it is a bounds violation. `Err` carries the offending
    /// absolute address.
    pub fn try_pop(&mut self, ram: &Ram) -> Result<Word, Word> {
        let top = i64::from(self.base()) + i64::from(self.sp());
        let Some(addr) = self.checked_addr(ram, top) else {
            return Err(top as Word);
        };
        if self.checked_addr(ram, top + 1).is_none() {
            return Err((top + 1) as Word);
        }
        let value = ram.read(addr);
        self.set_sp(self.sp() + 1);
        Ok(value)
    }

    /// Executes one step: interrupt poll, fetch, decode, execute,
    /// PC advance, clock tick.
    pub fn step(
        &mut self,
        ram: &mut Ram,
        intc: &InterruptController,
        os: &mut dyn TrapHandler,
    ) -> Result<(), Halt> {
        self.check_for_io_interrupt(ram, intc, os)?;

        let pc = self.pc();
        let fetch = self
            .checked_addr(ram, i64::from(pc))
            .filter(|_| self.checked_addr(ram, i64::from(pc) + i64::from(INSTRSIZE) - 1).is_some());
        let Some(fetch_addr) = fetch else {
            return Err(os.illegal_memory_access(pc));
        };
        let words = ram.fetch_instruction(fetch_addr);
        let instr = match Instr::decode(words) {
            Ok(instr) => instr,
            Err(_) => return Err(os.illegal_instruction(words)),
        };

        if self.verbose {
            self.reg_dump();
            println!("{instr}");
        }

        self.execute(instr, ram, os)?;

        // The PC advances unconditionally; branches and the OS's
        // context-switch bookkeeping compensate for it. Wrapping: a
        // program may have clobbered its PC, and the next fetch's
        // bounds check is what catches that.
        self.set_pc(self.pc().wrapping_add(INSTRSIZE));

        self.ticks += 1;
        if self.ticks % self.clock_freq == 0 {
            os.interrupt_clock(self, ram)?;
        }
        Ok(())
    }

    fn check_for_io_interrupt(
        &mut self,
        ram: &mut Ram,
        intc: &InterruptController,
        os: &mut dyn TrapHandler,
    ) -> Result<(), Halt> {
        let Some(event) = intc.take() else {
            return Ok(());
        };
        if self.verbose {
            println!("CPU received interrupt: {event:?}");
        }
        match event {
            IoEvent::ReadDone { dev, addr, data } => os.io_read_complete(self, ram, dev, addr, data),
            IoEvent::WriteDone { dev, addr } => os.io_write_complete(self, ram, dev, addr),
        }
    }

    fn execute(&mut self, instr: Instr, ram: &mut Ram, os: &mut dyn TrapHandler) -> Result<(), Halt> {
        match instr {
            Instr::Set(r, imm) => self.regs[r] = imm,
            Instr::Add(d, s1, s2) => self.regs[d] = self.regs[s1].wrapping_add(self.regs[s2]),
            Instr::Sub(d, s1, s2) => self.regs[d] = self.regs[s1].wrapping_sub(self.regs[s2]),
            Instr::Mul(d, s1, s2) => self.regs[d] = self.regs[s1].wrapping_mul(self.regs[s2]),
            Instr::Div(d, s1, s2) => {
                if self.regs[s2] == 0 {
                    return Err(os.divide_by_zero());
                }
                self.regs[d] = self.regs[s1].wrapping_div(self.regs[s2]);
            }
            Instr::Copy(d, s) => self.regs[d] = self.regs[s],
            Instr::Branch(rel) => self.branch_to(rel, ram, os)?,
            Instr::Bne(a, b, rel) => {
                if self.regs[a] != self.regs[b] {
                    self.branch_to(rel, ram, os)?;
                }
            }
            Instr::Blt(a, b, rel) => {
                if self.regs[a] < self.regs[b] {
                    self.branch_to(rel, ram, os)?;
                }
            }
            Instr::Pop(r) => {
                let value = self.try_pop(ram).map_err(|a| os.illegal_memory_access(a))?;
                self.regs[r] = value;
            }
            Instr::Push(r) => {
                let value = self.regs[r];
                self.try_push(ram, value)
                    .map_err(|a| os.illegal_memory_access(a))?;
            }
            Instr::Load(d, s) => {
                let target = i64::from(self.base()) + i64::from(self.regs[s]);
                let Some(addr) = self.checked_addr(ram, target) else {
                    return Err(os.illegal_memory_access(target as Word));
                };
                self.regs[d] = ram.read(addr);
            }
            Instr::Save(s, d) => {
                let target = i64::from(self.base()) + i64::from(self.regs[d]);
                let Some(addr) = self.checked_addr(ram, target) else {
                    return Err(os.illegal_memory_access(target as Word));
                };
                ram.write(addr, self.regs[s]);
            }
            Instr::Trap => os.system_call(self, ram)?,
        }
        Ok(())
    }

    /// Writes the (bounds-checked) branch target minus [`INSTRSIZE`],
    /// so the post-increment lands on `BASE + rel`.
    fn branch_to(&mut self, rel: Word, ram: &Ram, os: &mut dyn TrapHandler) -> Result<(), Halt> {
        let target = i64::from(self.base()) + i64::from(rel);
        let Some(addr) = self.checked_addr(ram, target) else {
            return Err(os.illegal_memory_access(target as Word));
        };
        self.set_pc(addr as Word - INSTRSIZE);
        Ok(())
    }
}
