//! The simulated operating system.
//!
//! [`Os`] owns the process table, the device table, the program
//! registry and the free list, and implements the [`TrapHandler`]
//! capability through which the CPU hands it control between
//! instructions. All OS code runs synchronously inside those
//! callbacks; the CPU resumes whichever process the OS left in the
//! registers when the callback returns.

pub mod mem;
pub mod pcb;
pub mod program;
pub mod sched;
mod syscall;

use crate::hw::cpu::{Cpu, RegFile, TrapHandler};
use crate::hw::device::{Device, DeviceId};
use crate::hw::ram::Ram;
use crate::inst::{encode_all, regs, Instr, INSTRSIZE};
use crate::{Halt, Word};

use mem::{MemBlock, MemoryManager};
use pcb::{BlockOp, Pcb, Pid, IDLE_PID};
use program::Program;
use sched::{SchedParams, Scheduler};

/// System call: exit the current process.
pub const SYSCALL_EXIT: Word = 0;
/// System call: print a number.
pub const SYSCALL_OUTPUT: Word = 1;
/// System call: push the current process id.
pub const SYSCALL_GETPID: Word = 2;
/// System call: open a device.
pub const SYSCALL_OPEN: Word = 3;
/// System call: close a device.
pub const SYSCALL_CLOSE: Word = 4;
/// System call: read from a device.
pub const SYSCALL_READ: Word = 5;
/// System call: write to a device.
pub const SYSCALL_WRITE: Word = 6;
/// System call: spawn a new process from a registered program.
pub const SYSCALL_EXEC: Word = 7;
/// System call: yield the CPU.
pub const SYSCALL_YIELD: Word = 8;
/// System call: print process state and exit.
pub const SYSCALL_COREDUMP: Word = 9;

/// Status: the call succeeded.
pub const SUCCESS: Word = 0;
/// Status: no device with the given id is registered.
pub const DEVICE_NOT_FOUND: Word = -1;
/// Status: the device cannot be shared.
pub const DEVICE_NOT_SHARABLE: Word = -2;
/// Status: the process already holds the device open.
pub const DEVICE_ALREADY_OPEN: Word = -3;
/// Status: the process has not opened the device.
pub const DEVICE_NOT_OPEN: Word = -4;
/// Status: the device does not service writes.
pub const DEVICE_READ_ONLY: Word = -5;
/// Status: the device does not service reads.
pub const DEVICE_WRITE_ONLY: Word = -6;

/// Pid of the first user process.
const FIRST_PID: Pid = 1001;

/// Address-space size of an idle process: its 16-word program plus
/// slack for the stack.
const IDLE_ALLOC: Word = 32;

/// Where in an execution step a context switch is happening. Inside
/// trap handling the CPU's post-increment of the PC is still pending;
/// inside the clock interrupt (and at boot) it is not. Saved PCs
/// always denote the resume point, so saves and restores adjust by
/// the pending amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchPoint {
    Trap,
    Clock,
    Boot,
}

impl SwitchPoint {
    fn pc_adjust(self) -> Word {
        match self {
            SwitchPoint::Trap => INSTRSIZE,
            SwitchPoint::Clock | SwitchPoint::Boot => 0,
        }
    }
}

/// A registered device and the processes currently holding it open.
/// Openers are tracked by pid and resolved through the process table.
struct DeviceRecord {
    id: DeviceId,
    device: Box<dyn Device>,
    openers: Vec<Pid>,
}

/// The operating system.
pub struct Os {
    processes: Vec<Pcb>,
    current: Option<Pid>,
    devices: Vec<DeviceRecord>,
    programs: Vec<Program>,
    mm: MemoryManager,
    sched: Scheduler,
    next_pid: Pid,
    verbose: bool,
}

impl Os {
    /// Creates an OS managing `ram_size` words of memory.
    pub fn new(ram_size: usize, params: SchedParams) -> Os {
        Os {
            processes: Vec::new(),
            current: None,
            devices: Vec::new(),
            programs: Vec::new(),
            mm: MemoryManager::new(ram_size),
            sched: Scheduler::new(params),
            next_pid: FIRST_PID,
            verbose: false,
        }
    }

    /// Toggles diagnostic output.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
        self.mm.set_verbose(verbose);
    }

    /// Adds a device to the device table under `id`.
    pub fn register_device(&mut self, mut device: Box<dyn Device>, id: DeviceId) {
        device.set_id(id);
        self.devices.push(DeviceRecord { id, device, openers: Vec::new() });
    }

    /// Registers a program for use by `EXEC` and [`Os::boot`].
    pub fn add_program(&mut self, prog: Program) {
        self.programs.push(prog);
    }

    /// The registered programs.
    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    /// The process table.
    pub fn processes(&self) -> &[Pcb] {
        &self.processes
    }

    /// Looks up a process by pid.
    pub fn process(&self, pid: Pid) -> Option<&Pcb> {
        self.processes.iter().find(|p| p.pid() == pid)
    }

    /// The pid of the running process, if any.
    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    /// The current free blocks.
    pub fn free_blocks(&self) -> &[MemBlock] {
        self.mm.free_blocks()
    }

    /// The pids holding `dev` open.
    pub fn openers_of(&self, dev: DeviceId) -> &[Pid] {
        self.device_index(dev)
            .map(|i| self.devices[i].openers.as_slice())
            .unwrap_or(&[])
    }

    fn current_index(&self) -> Option<usize> {
        let cur = self.current?;
        self.processes.iter().position(|p| p.pid() == cur)
    }

    fn device_index(&self, id: DeviceId) -> Option<usize> {
        self.devices.iter().position(|d| d.id == id)
    }

    /// The index of a process blocked for the given device operation,
    /// if any; the selection rule of `CLOSE` and the I/O completion
    /// handlers.
    fn select_blocked_process(&self, dev: DeviceId, op: BlockOp, addr: Word) -> Option<usize> {
        self.processes.iter().position(|p| p.is_blocked_for(dev, op, addr))
    }

    fn debugln(&self, msg: std::fmt::Arguments<'_>) {
        if self.verbose {
            println!("{msg}");
        }
    }

    /// Prints the process table when verbose.
    pub fn print_process_table(&self) {
        if !self.verbose {
            return;
        }
        println!("Process Table ({} processes)", self.processes.len());
        for p in &self.processes {
            match self.current {
                Some(cur) if cur == p.pid() => println!("    {p} (running)"),
                _ => println!("    {p}"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Process management
    // ------------------------------------------------------------------

    /// Creates the first process from registered program `index` and
    /// installs it on the CPU. Fails with [`Halt::OutOfMemory`] when
    /// the program cannot be placed.
    pub fn boot(&mut self, cpu: &mut Cpu, ram: &mut Ram, index: usize) -> Result<Pid, Halt> {
        let alloc_size = self.programs[index].alloc_size();
        self.create_process(cpu, ram, index, alloc_size, SwitchPoint::Boot)
    }

    /// Loads program `prog_index` into a freshly allocated window and
    /// makes the new process current. The previous current process, if
    /// any, is saved first (the allocation may compact RAM, which
    /// rewrites every saved window).
    fn create_process(
        &mut self,
        cpu: &mut Cpu,
        ram: &mut Ram,
        prog_index: usize,
        alloc_size: Word,
        point: SwitchPoint,
    ) -> Result<Pid, Halt> {
        self.save_current(cpu, point);

        // the window must at least hold the program image
        let size = alloc_size.max(self.programs[prog_index].len());
        let base = self
            .mm
            .alloc(size, ram, &mut self.processes)
            .map_err(|_| Halt::OutOfMemory(size))?;
        ram.load(base as usize, self.programs[prog_index].words());

        let pid = self.next_pid;
        self.next_pid += 1;
        self.install(cpu, pid, base, size, point);
        self.debugln(format_args!(
            "Installed program of size {size} with process id {pid} at position {base}"
        ));
        Ok(pid)
    }

    /// Creates the canned idle process: it pushes the EXIT id and
    /// traps, yielding the CPU back as soon as it runs. Used when no
    /// user process is runnable.
    fn create_idle_process(
        &mut self,
        cpu: &mut Cpu,
        ram: &mut Ram,
        point: SwitchPoint,
    ) -> Result<(), Halt> {
        let image = encode_all(&[
            Instr::Set(regs::R0, 0),
            Instr::Set(regs::R0, 0),
            Instr::Push(regs::R0),
            Instr::Trap,
        ]);
        let base = self
            .mm
            .alloc(IDLE_ALLOC, ram, &mut self.processes)
            .map_err(|_| Halt::OutOfMemory(IDLE_ALLOC))?;
        ram.load(base as usize, &image);

        self.install(cpu, IDLE_PID, base, IDLE_ALLOC, point);
        self.debugln(format_args!("Created idle process at position {base}"));
        Ok(())
    }

    /// Points the CPU at a freshly loaded process image and records it
    /// as current.
    fn install(&mut self, cpu: &mut Cpu, pid: Pid, base: Word, size: Word, point: SwitchPoint) {
        *cpu.registers_mut() = RegFile::new();
        cpu.set_base(base);
        cpu.set_lim(size);
        cpu.set_sp(size - 1);
        cpu.set_pc(base - point.pc_adjust());

        let mut pcb = Pcb::new(pid, self.sched.params.initial_priority, cpu.ticks());
        pcb.record_dispatch(cpu.ticks());
        self.processes.push(pcb);
        self.current = Some(pid);
    }

    /// Saves the running process's registers into its PCB (charging
    /// the switch cost) and, unless it is blocked, marks it ready.
    fn save_current(&mut self, cpu: &mut Cpu, point: SwitchPoint) {
        let Some(i) = self.current_index() else {
            return;
        };
        let tick = cpu.ticks();
        let pcb = &mut self.processes[i];
        pcb.save(cpu, point.pc_adjust());
        if !pcb.is_blocked() {
            pcb.mark_ready(tick);
        }
        cpu.add_ticks(self.sched.params.switch_cost);
    }

    /// Removes the current process, frees its memory, releases any
    /// devices it held open, and schedules a successor.
    fn remove_current_process(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        let Some(i) = self.current_index() else {
            return Err(Halt::Finished);
        };
        let pcb = self.processes.remove(i);
        self.debugln(format_args!(
            "Removing process with id {} at {}",
            pcb.pid(),
            cpu.base()
        ));

        // the exiting process's registers are live on the CPU
        self.mm.free(cpu.base(), cpu.lim());
        self.release_devices_of(pcb.pid(), cpu.ticks());
        self.current = None;

        self.schedule_new_process(cpu, ram, SwitchPoint::Trap)
    }

    /// Drops `pid` from every opener set, waking one OPEN waiter per
    /// released device, exactly as an explicit `CLOSE` would.
    fn release_devices_of(&mut self, pid: Pid, tick: u64) {
        for di in 0..self.devices.len() {
            let Some(pos) = self.devices[di].openers.iter().position(|&p| p == pid) else {
                continue;
            };
            self.devices[di].openers.remove(pos);
            let dev = self.devices[di].id;
            if let Some(w) = self.select_blocked_process(dev, BlockOp::Open, 0) {
                self.processes[w].unblock(tick);
            }
        }
    }

    /// Saves the current process and hands the CPU to the scheduler's
    /// choice. When nothing is runnable, an idle process fills in;
    /// when the table is empty, the simulation is over.
    fn schedule_new_process(
        &mut self,
        cpu: &mut Cpu,
        ram: &mut Ram,
        point: SwitchPoint,
    ) -> Result<(), Halt> {
        if self.processes.is_empty() {
            self.debugln(format_args!("No more processes to run. Stopping."));
            return Err(Halt::Finished);
        }

        let clock_count = cpu.ticks() / cpu.clock_freq();
        match self.sched.pick(&mut self.processes, self.current, clock_count) {
            None => {
                self.save_current(cpu, point);
                self.current = None;
                self.create_idle_process(cpu, ram, point)
            }
            Some(i) if Some(self.processes[i].pid()) == self.current => Ok(()),
            Some(i) => {
                let pid = self.processes[i].pid();
                self.save_current(cpu, point);
                let pcb = &mut self.processes[i];
                pcb.record_dispatch(cpu.ticks());
                pcb.restore(cpu, point.pc_adjust());
                cpu.add_ticks(self.sched.params.switch_cost);
                self.current = Some(pid);
                self.debugln(format_args!("Switched to process {pid}"));
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Stack helpers
    // ------------------------------------------------------------------

    /// Pops a word from the current process's stack; underflow
    /// degrades to a fatal illegal-memory-access trap.
    fn pop_word(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<Word, Halt> {
        cpu.try_pop(ram)
            .map_err(|addr| self.illegal_memory_access(addr))
    }

    /// Pushes a word onto the current process's stack.
    fn push_word(&mut self, cpu: &mut Cpu, ram: &mut Ram, value: Word) -> Result<(), Halt> {
        cpu.try_push(ram, value)
            .map_err(|addr| self.illegal_memory_access(addr))
    }

    /// Pushes a word onto a blocked process's *saved* stack, following
    /// the same discipline as the hardware push: decrement the saved
    /// SP, then write at `BASE + SP`.
    fn push_saved(pcb: &mut Pcb, ram: &mut Ram, value: Word) -> Result<(), Halt> {
        let target = i64::from(pcb.base()) + i64::from(pcb.sp()) - 1;
        let in_ram = target >= 0 && target < ram.size() as i64;
        if !in_ram || !pcb.window_contains(target as Word) {
            return Err(Halt::IllegalMemoryAccess(target as Word));
        }
        pcb.set_reg(regs::SP, pcb.sp() - 1);
        ram.write(target as usize, value);
        Ok(())
    }
}

impl TrapHandler for Os {
    fn illegal_memory_access(&mut self, addr: Word) -> Halt {
        println!("ERROR: Illegal memory access attempt at {addr}.");
        Halt::IllegalMemoryAccess(addr)
    }

    fn divide_by_zero(&mut self) -> Halt {
        println!("ERROR: Cannot divide by zero.");
        Halt::DivideByZero
    }

    fn illegal_instruction(&mut self, words: [Word; 4]) -> Halt {
        println!("ERROR: Illegal instruction {words:?}.");
        Halt::IllegalInstruction(words)
    }

    fn system_call(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        let id = self.pop_word(cpu, ram)?;
        match id {
            SYSCALL_EXIT => self.syscall_exit(cpu, ram),
            SYSCALL_OUTPUT => self.syscall_output(cpu, ram),
            SYSCALL_GETPID => self.syscall_getpid(cpu, ram),
            SYSCALL_OPEN => self.syscall_open(cpu, ram),
            SYSCALL_CLOSE => self.syscall_close(cpu, ram),
            SYSCALL_READ => self.syscall_read(cpu, ram),
            SYSCALL_WRITE => self.syscall_write(cpu, ram),
            SYSCALL_EXEC => self.syscall_exec(cpu, ram),
            SYSCALL_YIELD => self.syscall_yield(cpu, ram),
            SYSCALL_COREDUMP => self.syscall_coredump(cpu, ram),
            _ => {
                println!("ERROR: Illegal system call {id}.");
                Err(Halt::IllegalSystemCall(id))
            }
        }
    }

    fn io_read_complete(
        &mut self,
        cpu: &mut Cpu,
        ram: &mut Ram,
        dev: DeviceId,
        addr: Word,
        data: Word,
    ) -> Result<(), Halt> {
        // a completion whose requester already exited is dropped
        let Some(i) = self.select_blocked_process(dev, BlockOp::Read, addr) else {
            return Ok(());
        };
        let tick = cpu.ticks();
        let pcb = &mut self.processes[i];
        pcb.unblock(tick);
        Self::push_saved(pcb, ram, data)?;
        Self::push_saved(pcb, ram, SUCCESS)?;
        let pid = pcb.pid();
        self.debugln(format_args!(
            "Process {pid} unblocked: read from device #{dev} @{addr} complete"
        ));
        Ok(())
    }

    fn io_write_complete(
        &mut self,
        cpu: &mut Cpu,
        ram: &mut Ram,
        dev: DeviceId,
        addr: Word,
    ) -> Result<(), Halt> {
        let Some(i) = self.select_blocked_process(dev, BlockOp::Write, addr) else {
            return Ok(());
        };
        let tick = cpu.ticks();
        let pcb = &mut self.processes[i];
        pcb.unblock(tick);
        Self::push_saved(pcb, ram, SUCCESS)?;
        let pid = pcb.pid();
        self.debugln(format_args!(
            "Process {pid} unblocked: write to device #{dev} @{addr} complete"
        ));
        Ok(())
    }

    fn interrupt_clock(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        // let a running idle process exit on its own
        if self.current_index().is_some_and(|i| self.processes[i].is_idle()) {
            return Ok(());
        }
        self.schedule_new_process(cpu, ram, SwitchPoint::Clock)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::inst::regs::R0;

    /// A scriptable device; requests are recorded for inspection and
    /// completions are injected by the test itself.
    struct StubDevice {
        id: DeviceId,
        sharable: bool,
        readable: bool,
        writeable: bool,
        available: bool,
        reads: Arc<Mutex<Vec<Word>>>,
        writes: Arc<Mutex<Vec<(Word, Word)>>>,
    }

    impl StubDevice {
        fn new() -> StubDevice {
            StubDevice {
                id: -999,
                sharable: false,
                readable: true,
                writeable: true,
                available: true,
                reads: Arc::default(),
                writes: Arc::default(),
            }
        }
    }

    impl Device for StubDevice {
        fn id(&self) -> DeviceId {
            self.id
        }

        fn set_id(&mut self, id: DeviceId) {
            self.id = id;
        }

        fn is_sharable(&self) -> bool {
            self.sharable
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn is_readable(&self) -> bool {
            self.readable
        }

        fn is_writeable(&self) -> bool {
            self.writeable
        }

        fn read(&mut self, addr: Word) -> Word {
            self.reads.lock().unwrap().push(addr);
            0
        }

        fn write(&mut self, addr: Word, data: Word) {
            self.writes.lock().unwrap().push((addr, data));
        }
    }

    const DEV: DeviceId = 7;

    /// An OS with one looping program registered and a stub device.
    fn setup(ram_size: usize) -> (Cpu, Ram, Os, Arc<Mutex<Vec<Word>>>) {
        let mut os = Os::new(ram_size, SchedParams::default());
        os.add_program(Program::from_instrs(&[Instr::Branch(0)], 64));
        let dev = StubDevice::new();
        let reads = Arc::clone(&dev.reads);
        os.register_device(Box::new(dev), DEV);
        (Cpu::new(5), Ram::new(ram_size), os, reads)
    }

    /// Pushes `args` then `id` and enters the system-call dispatcher,
    /// as a TRAP instruction would.
    fn trap(os: &mut Os, cpu: &mut Cpu, ram: &mut Ram, args: &[Word], id: Word) -> Result<(), Halt> {
        for &a in args {
            cpu.try_push(ram, a).unwrap();
        }
        cpu.try_push(ram, id).unwrap();
        os.system_call(cpu, ram)
    }

    /// Saves the running process and puts `pid` on the CPU, as the
    /// scheduler would between steps.
    fn switch_to(os: &mut Os, cpu: &mut Cpu, pid: Pid) {
        os.save_current(cpu, SwitchPoint::Boot);
        let i = os.processes.iter().position(|p| p.pid() == pid).unwrap();
        os.processes[i].restore(cpu, 0);
        os.current = Some(pid);
    }

    #[test]
    fn getpid_pushes_current_pid() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        let pid = os.boot(&mut cpu, &mut ram, 0).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[], SYSCALL_GETPID).unwrap();
        assert_eq!(cpu.try_pop(&ram), Ok(pid));
    }

    #[test]
    fn open_of_unknown_device_pushes_not_found() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        os.boot(&mut cpu, &mut ram, 0).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[55], SYSCALL_OPEN).unwrap();
        assert_eq!(cpu.try_pop(&ram), Ok(DEVICE_NOT_FOUND));
    }

    #[test]
    fn double_open_pushes_already_open() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        os.boot(&mut cpu, &mut ram, 0).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        assert_eq!(cpu.try_pop(&ram), Ok(SUCCESS));
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        assert_eq!(cpu.try_pop(&ram), Ok(DEVICE_ALREADY_OPEN));
    }

    #[test]
    fn second_opener_of_nonsharable_device_blocks_until_close() {
        let (mut cpu, mut ram, mut os, _) = setup(512);
        let p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        let p2 = os.boot(&mut cpu, &mut ram, 0).unwrap();

        switch_to(&mut os, &mut cpu, p1);
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        assert_eq!(cpu.try_pop(&ram), Ok(SUCCESS));

        switch_to(&mut os, &mut cpu, p2);
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        // p2 is parked and the CPU went back to p1
        assert!(os.process(p2).unwrap().is_blocked_for(DEV, BlockOp::Open, 0));
        assert_eq!(os.current_pid(), Some(p1));
        assert_eq!(os.openers_of(DEV), &[p1, p2]);

        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_CLOSE).unwrap();
        assert_eq!(cpu.try_pop(&ram), Ok(SUCCESS));
        assert!(!os.process(p2).unwrap().is_blocked());
        assert_eq!(os.openers_of(DEV), &[p2]);
    }

    #[test]
    fn read_blocks_and_completion_pushes_data_then_status() {
        let (mut cpu, mut ram, mut os, reads) = setup(256);
        let p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        assert_eq!(cpu.try_pop(&ram), Ok(SUCCESS));

        trap(&mut os, &mut cpu, &mut ram, &[DEV, 5], SYSCALL_READ).unwrap();
        assert_eq!(*reads.lock().unwrap(), vec![5]);
        assert!(os.process(p1).unwrap().is_blocked_for(DEV, BlockOp::Read, 5));
        // nothing else to run: an idle process filled in
        assert_eq!(os.current_pid(), Some(IDLE_PID));

        os.io_read_complete(&mut cpu, &mut ram, DEV, 5, 42).unwrap();
        let pcb = os.process(p1).unwrap();
        assert!(!pcb.is_blocked());
        let sp = pcb.sp() + pcb.base();
        assert_eq!(ram.read(sp as usize), SUCCESS);
        assert_eq!(ram.read(sp as usize + 1), 42);
    }

    #[test]
    fn read_reward_raises_priority() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        let p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        let before = os.process(p1).unwrap().priority();
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        cpu.try_pop(&ram).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV, 0], SYSCALL_READ).unwrap();
        assert_eq!(
            os.process(p1).unwrap().priority(),
            before + os.sched.params.read_priority
        );
    }

    /// An OS whose stub device has been customized before registration.
    fn setup_with_device(ram_size: usize, dev: StubDevice) -> (Cpu, Ram, Os) {
        let mut os = Os::new(ram_size, SchedParams::default());
        os.add_program(Program::from_instrs(&[Instr::Branch(0)], 64));
        os.register_device(Box::new(dev), DEV);
        (Cpu::new(5), Ram::new(ram_size), os)
    }

    #[test]
    fn unavailable_device_rewinds_pc_and_restores_stack() {
        let mut dev = StubDevice::new();
        dev.available = false;
        let (mut cpu, mut ram, mut os) = setup_with_device(256, dev);
        let p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        cpu.try_pop(&ram).unwrap();

        let pc_before = cpu.pc();
        trap(&mut os, &mut cpu, &mut ram, &[DEV, 3], SYSCALL_READ).unwrap();
        assert!(!os.process(p1).unwrap().is_blocked());
        assert_eq!(cpu.pc(), pc_before - INSTRSIZE);
        // the argument stack is back in place for the retried TRAP
        assert_eq!(cpu.try_pop(&ram), Ok(SYSCALL_READ));
        assert_eq!(cpu.try_pop(&ram), Ok(3));
        assert_eq!(cpu.try_pop(&ram), Ok(DEV));
    }

    #[test]
    fn read_of_write_only_device_pushes_write_only() {
        let mut dev = StubDevice::new();
        dev.readable = false;
        let (mut cpu, mut ram, mut os) = setup_with_device(256, dev);
        os.boot(&mut cpu, &mut ram, 0).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        cpu.try_pop(&ram).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV, 0], SYSCALL_READ).unwrap();
        assert_eq!(cpu.try_pop(&ram), Ok(DEVICE_WRITE_ONLY));
    }

    #[test]
    fn write_completion_pushes_status_once() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        let p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        cpu.try_pop(&ram).unwrap();

        trap(&mut os, &mut cpu, &mut ram, &[DEV, 2, 88], SYSCALL_WRITE).unwrap();
        assert!(os.process(p1).unwrap().is_blocked_for(DEV, BlockOp::Write, 2));

        let sp_before = os.process(p1).unwrap().sp();
        os.io_write_complete(&mut cpu, &mut ram, DEV, 2).unwrap();
        let pcb = os.process(p1).unwrap();
        assert_eq!(pcb.sp(), sp_before - 1);
        assert_eq!(ram.read((pcb.base() + pcb.sp()) as usize), SUCCESS);
    }

    #[test]
    fn completion_for_exited_process_is_dropped() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        os.boot(&mut cpu, &mut ram, 0).unwrap();
        // no one is blocked for this read
        os.io_read_complete(&mut cpu, &mut ram, DEV, 0, 11).unwrap();
        os.io_write_complete(&mut cpu, &mut ram, DEV, 0).unwrap();
    }

    #[test]
    fn exit_of_last_process_finishes_the_simulation() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        os.boot(&mut cpu, &mut ram, 0).unwrap();
        let err = trap(&mut os, &mut cpu, &mut ram, &[], SYSCALL_EXIT).unwrap_err();
        assert_eq!(err, Halt::Finished);
        assert!(os.processes().is_empty());
        assert_eq!(os.free_blocks(), &[MemBlock { addr: 0, size: 256 }]);
    }

    #[test]
    fn exit_releases_devices_and_wakes_open_waiter() {
        let (mut cpu, mut ram, mut os, _) = setup(512);
        let p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        let p2 = os.boot(&mut cpu, &mut ram, 0).unwrap();

        switch_to(&mut os, &mut cpu, p1);
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        cpu.try_pop(&ram).unwrap();
        switch_to(&mut os, &mut cpu, p2);
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        assert_eq!(os.current_pid(), Some(p1));

        // p1 exits without closing; p2 must not wait forever
        trap(&mut os, &mut cpu, &mut ram, &[], SYSCALL_EXIT).unwrap();
        assert!(!os.process(p2).unwrap().is_blocked());
        assert_eq!(os.openers_of(DEV), &[p2]);
        assert_eq!(os.current_pid(), Some(p2));
    }

    #[test]
    fn exec_prefers_least_called_program_and_compacts() {
        let mut os = Os::new(400, SchedParams::default());
        os.add_program(Program::from_instrs(&[Instr::Branch(0)], 100));
        os.add_program(Program::from_instrs(&[Instr::Branch(0)], 150));
        let mut cpu = Cpu::new(5);
        let mut ram = Ram::new(400);

        let p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        let p2 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        let p3 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        assert_eq!(cpu.base(), 200);
        assert_eq!(os.free_blocks(), &[MemBlock { addr: 300, size: 100 }]);

        // sentinel word inside the process that compaction will move
        ram.write(250, 777);

        // the middle process exits, leaving a 100-word hole
        switch_to(&mut os, &mut cpu, p2);
        trap(&mut os, &mut cpu, &mut ram, &[], SYSCALL_EXIT).unwrap();
        assert_eq!(os.free_blocks().len(), 2);
        assert_eq!(os.processes().len(), 2);

        // steer EXEC toward the 150-word program
        os.programs[0].bump_call_count();
        trap(&mut os, &mut cpu, &mut ram, &[], SYSCALL_EXEC).unwrap();

        // the allocation required compaction: survivors slid down and
        // the newcomer landed after them
        assert_eq!(os.processes().len(), 3);
        assert_eq!(os.programs[1].call_count(), 1);
        assert_eq!(cpu.base(), 200);
        assert_eq!(cpu.lim(), 150);
        assert_eq!(os.process(p1).unwrap().base(), 0);
        assert_eq!(os.process(p3).unwrap().base(), 100);
        assert_eq!(ram.read(150), 777);
        assert_eq!(os.free_blocks(), &[MemBlock { addr: 350, size: 50 }]);
    }

    #[test]
    fn exec_without_room_leaves_caller_running() {
        let mut os = Os::new(200, SchedParams::default());
        os.add_program(Program::from_instrs(&[Instr::Branch(0)], 150));
        let mut cpu = Cpu::new(5);
        let mut ram = Ram::new(200);
        let caller = os.boot(&mut cpu, &mut ram, 0).unwrap();

        trap(&mut os, &mut cpu, &mut ram, &[], SYSCALL_EXEC).unwrap();
        assert_eq!(os.processes().len(), 1);
        assert_eq!(os.current_pid(), Some(caller));
    }

    #[test]
    fn yield_with_single_process_keeps_it_running() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        let p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        let pc = cpu.pc();
        trap(&mut os, &mut cpu, &mut ram, &[], SYSCALL_YIELD).unwrap();
        assert_eq!(os.current_pid(), Some(p1));
        assert_eq!(cpu.pc(), pc);
    }

    #[test]
    fn coredump_prints_and_exits() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        os.boot(&mut cpu, &mut ram, 0).unwrap();
        for v in [10, 20, 30] {
            cpu.try_push(&mut ram, v).unwrap();
        }
        let err = trap(&mut os, &mut cpu, &mut ram, &[], SYSCALL_COREDUMP).unwrap_err();
        assert_eq!(err, Halt::Finished);
        assert!(os.processes().is_empty());
    }

    #[test]
    fn unknown_syscall_id_is_fatal() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        os.boot(&mut cpu, &mut ram, 0).unwrap();
        let err = trap(&mut os, &mut cpu, &mut ram, &[], 42).unwrap_err();
        assert_eq!(err, Halt::IllegalSystemCall(42));
    }

    #[test]
    fn output_pops_its_argument() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        os.boot(&mut cpu, &mut ram, 0).unwrap();
        let sp = cpu.sp();
        trap(&mut os, &mut cpu, &mut ram, &[123], SYSCALL_OUTPUT).unwrap();
        assert_eq!(cpu.sp(), sp);
        assert_eq!(cpu.registers()[R0], 0);
    }

    #[test]
    fn idle_process_fills_in_and_windows_tile_ram() {
        let (mut cpu, mut ram, mut os, _) = setup(256);
        let _p1 = os.boot(&mut cpu, &mut ram, 0).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV], SYSCALL_OPEN).unwrap();
        cpu.try_pop(&ram).unwrap();
        trap(&mut os, &mut cpu, &mut ram, &[DEV, 0], SYSCALL_READ).unwrap();
        assert_eq!(os.current_pid(), Some(IDLE_PID));

        // every word of RAM is either some process's window or free
        let mut ranges: Vec<(Word, Word)> = os
            .processes()
            .iter()
            .map(|p| {
                if os.current_pid() == Some(p.pid()) {
                    (cpu.base(), cpu.lim())
                } else {
                    (p.base(), p.lim())
                }
            })
            .chain(os.free_blocks().iter().map(|b| (b.addr, b.size)))
            .collect();
        ranges.sort();
        let mut next = 0;
        for (addr, size) in ranges {
            assert_eq!(addr, next);
            next += size;
        }
        assert_eq!(next, 256);
    }
}
