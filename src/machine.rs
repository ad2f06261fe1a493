//! The assembled microcomputer: hardware and operating system wired
//! together and stepped as one unit.

use crate::hw::cpu::{Cpu, DEFAULT_CLOCK_FREQ};
use crate::hw::device::{Device, DeviceId};
use crate::hw::intc::{IntcHandle, InterruptController};
use crate::hw::ram::Ram;
use crate::os::pcb::Pid;
use crate::os::program::Program;
use crate::os::sched::SchedParams;
use crate::os::Os;
use crate::Halt;

/// Pending completion records the controller holds before posting
/// devices start queueing at their own end.
const INTC_DEPTH: usize = 32;

/// A complete machine: CPU, RAM, interrupt controller, and the OS.
pub struct Computer {
    cpu: Cpu,
    ram: Ram,
    intc: InterruptController,
    os: Os,
}

impl Computer {
    /// Creates a machine with `ram_size` words of RAM and default
    /// clock and scheduler tuning.
    pub fn new(ram_size: usize) -> Computer {
        Computer::with_params(ram_size, DEFAULT_CLOCK_FREQ, SchedParams::default())
    }

    /// Creates a machine with explicit clock and scheduler tuning.
    pub fn with_params(ram_size: usize, clock_freq: u64, params: SchedParams) -> Computer {
        Computer {
            cpu: Cpu::new(clock_freq),
            ram: Ram::new(ram_size),
            intc: InterruptController::new(INTC_DEPTH),
            os: Os::new(ram_size, params),
        }
    }

    /// A posting handle for wiring up devices.
    pub fn intc_handle(&self) -> IntcHandle {
        self.intc.handle()
    }

    /// Registers a device with the OS under `id`.
    pub fn register_device(&mut self, device: Box<dyn Device>, id: DeviceId) {
        self.os.register_device(device, id);
    }

    /// Registers a program for `EXEC` and [`Computer::boot`].
    pub fn add_program(&mut self, prog: Program) {
        self.os.add_program(prog);
    }

    /// Creates a process from registered program `index` (which must
    /// exist) and installs it on the CPU.
    pub fn boot(&mut self, index: usize) -> Result<Pid, Halt> {
        self.os.boot(&mut self.cpu, &mut self.ram, index)
    }

    /// Executes one CPU step.
    pub fn step(&mut self) -> Result<(), Halt> {
        self.cpu.step(&mut self.ram, &self.intc, &mut self.os)
    }

    /// Runs until the machine stops. A clean shutdown (every process
    /// exited) is `Ok`; fatal traps are returned as errors.
    pub fn run(&mut self) -> Result<(), Halt> {
        loop {
            match self.step() {
                Ok(()) => {}
                Err(Halt::Finished) => return Ok(()),
                Err(halt) => return Err(halt),
            }
        }
    }

    /// Toggles diagnostic tracing machine-wide.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.cpu.set_verbose(verbose);
        self.os.set_verbose(verbose);
    }

    /// The processor.
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// The RAM.
    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    /// The operating system.
    pub fn os(&self) -> &Os {
        &self.os
    }
}
