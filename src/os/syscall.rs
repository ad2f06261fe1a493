//! The system-call layer.
//!
//! Calling convention: the program pushes arguments in declaration
//! order and the system-call id last; the id is popped by the trap
//! dispatcher before these handlers run, and each handler pops its own
//! arguments (top of stack first). Results are pushed back before the
//! process resumes, or, for blocking calls, onto the saved stack when
//! the completion arrives.

use crate::hw::cpu::Cpu;
use crate::hw::ram::Ram;
use crate::inst::INSTRSIZE;
use crate::{Halt, Word};

use super::pcb::{BlockOp, BlockState};
use super::{
    Os, SwitchPoint, DEVICE_ALREADY_OPEN, DEVICE_NOT_FOUND, DEVICE_NOT_OPEN, DEVICE_READ_ONLY,
    DEVICE_WRITE_ONLY, SUCCESS, SYSCALL_READ, SYSCALL_WRITE,
};

impl Os {
    /// `EXIT`: remove the current process and schedule a successor.
    pub(super) fn syscall_exit(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        self.remove_current_process(cpu, ram)
    }

    /// `OUTPUT value`: print the value to the console.
    pub(super) fn syscall_output(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        let value = self.pop_word(cpu, ram)?;
        println!("OUTPUT: {value}");
        Ok(())
    }

    /// `GETPID`: push the current process id.
    pub(super) fn syscall_getpid(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        let Some(pid) = self.current_pid() else {
            return Ok(());
        };
        self.push_word(cpu, ram, pid)
    }

    /// `OPEN dev_id`: join the device's opener set. Opening a busy
    /// non-sharable device parks the caller until a CLOSE releases it;
    /// the success status is pushed before blocking so it is on the
    /// caller's stack when it eventually resumes.
    pub(super) fn syscall_open(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        let dev_id = self.pop_word(cpu, ram)?;
        let Some(di) = self.device_index(dev_id) else {
            println!("ERROR: Device #{dev_id} to open not found.");
            return self.push_word(cpu, ram, DEVICE_NOT_FOUND);
        };
        let Some(pid) = self.current_pid() else {
            return Ok(());
        };
        if self.devices[di].openers.contains(&pid) {
            println!("ERROR: Device #{dev_id} is already open.");
            return self.push_word(cpu, ram, DEVICE_ALREADY_OPEN);
        }

        self.push_word(cpu, ram, SUCCESS)?;

        let busy = !self.devices[di].openers.is_empty() && !self.devices[di].device.is_sharable();
        self.devices[di].openers.push(pid);
        if busy {
            self.debugln(format_args!(
                "Process {pid} blocked waiting to open device #{dev_id}"
            ));
            if let Some(ci) = self.current_index() {
                self.processes[ci].block(BlockState { device: dev_id, op: BlockOp::Open, addr: 0 });
            }
            return self.schedule_new_process(cpu, ram, SwitchPoint::Trap);
        }
        Ok(())
    }

    /// `CLOSE dev_id`: leave the opener set and wake one process
    /// waiting to open the device.
    pub(super) fn syscall_close(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        let dev_id = self.pop_word(cpu, ram)?;
        let Some(di) = self.device_index(dev_id) else {
            println!("ERROR: Device #{dev_id} to close not found.");
            return self.push_word(cpu, ram, DEVICE_NOT_FOUND);
        };
        let Some(pid) = self.current_pid() else {
            return Ok(());
        };
        let Some(pos) = self.devices[di].openers.iter().position(|&p| p == pid) else {
            println!("ERROR: Cannot close an unopened device.");
            return self.push_word(cpu, ram, DEVICE_NOT_OPEN);
        };
        self.devices[di].openers.remove(pos);

        if let Some(w) = self.select_blocked_process(dev_id, BlockOp::Open, 0) {
            let tick = cpu.ticks();
            self.processes[w].unblock(tick);
            let waiter = self.processes[w].pid();
            self.debugln(format_args!("Process {waiter} has been unblocked."));
        }

        self.push_word(cpu, ram, SUCCESS)
    }

    /// `READ dev_id, addr`: validate, dispatch the device request,
    /// reward the caller's priority, and block until the completion
    /// interrupt pushes `(data, status)` onto the saved stack. An
    /// unavailable device makes the caller retry the whole TRAP later.
    pub(super) fn syscall_read(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        let addr = self.pop_word(cpu, ram)?;
        let dev_id = self.pop_word(cpu, ram)?;

        let Some(di) = self.device_index(dev_id) else {
            println!("ERROR: Device #{dev_id} to read not found.");
            return self.push_word(cpu, ram, DEVICE_NOT_FOUND);
        };
        let Some(pid) = self.current_pid() else {
            return Ok(());
        };
        if !self.devices[di].openers.contains(&pid) {
            println!("ERROR: Cannot read an unopened device.");
            return self.push_word(cpu, ram, DEVICE_NOT_OPEN);
        }
        if !self.devices[di].device.is_readable() {
            println!("ERROR: Device #{dev_id} is not readable.");
            return self.push_word(cpu, ram, DEVICE_WRITE_ONLY);
        }
        if !self.devices[di].device.is_available() {
            return self.retry_later(cpu, ram, &[dev_id, addr], SYSCALL_READ);
        }

        self.devices[di].device.read(addr);

        let reward = self.sched.params.read_priority;
        if let Some(ci) = self.current_index() {
            self.processes[ci].add_priority(reward);
            self.processes[ci].block(BlockState { device: dev_id, op: BlockOp::Read, addr });
        }
        self.debugln(format_args!(
            "Process {pid} blocked reading device #{dev_id} @{addr}"
        ));
        self.schedule_new_process(cpu, ram, SwitchPoint::Trap)
    }

    /// `WRITE dev_id, addr, value`: symmetric to `READ`; the
    /// completion interrupt pushes the status onto the saved stack.
    pub(super) fn syscall_write(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        let value = self.pop_word(cpu, ram)?;
        let addr = self.pop_word(cpu, ram)?;
        let dev_id = self.pop_word(cpu, ram)?;

        let Some(di) = self.device_index(dev_id) else {
            println!("ERROR: Device #{dev_id} to write not found.");
            return self.push_word(cpu, ram, DEVICE_NOT_FOUND);
        };
        let Some(pid) = self.current_pid() else {
            return Ok(());
        };
        if !self.devices[di].openers.contains(&pid) {
            println!("ERROR: Cannot write to an unopened device.");
            return self.push_word(cpu, ram, DEVICE_NOT_OPEN);
        }
        if !self.devices[di].device.is_writeable() {
            println!("ERROR: Device #{dev_id} is not writeable.");
            return self.push_word(cpu, ram, DEVICE_READ_ONLY);
        }
        if !self.devices[di].device.is_available() {
            return self.retry_later(cpu, ram, &[dev_id, addr, value], SYSCALL_WRITE);
        }

        self.devices[di].device.write(addr, value);

        let reward = self.sched.params.write_priority;
        if let Some(ci) = self.current_index() {
            self.processes[ci].add_priority(reward);
            self.processes[ci].block(BlockState { device: dev_id, op: BlockOp::Write, addr });
        }
        self.debugln(format_args!(
            "Process {pid} blocked writing device #{dev_id} @{addr}"
        ));
        self.schedule_new_process(cpu, ram, SwitchPoint::Trap)
    }

    /// Restores a blocking call's consumed arguments, rewinds the PC
    /// so the TRAP re-executes when the caller next runs, and
    /// reschedules.
    fn retry_later(
        &mut self,
        cpu: &mut Cpu,
        ram: &mut Ram,
        args: &[Word],
        id: Word,
    ) -> Result<(), Halt> {
        for &arg in args {
            self.push_word(cpu, ram, arg)?;
        }
        self.push_word(cpu, ram, id)?;
        cpu.set_pc(cpu.pc() - INSTRSIZE);
        self.schedule_new_process(cpu, ram, SwitchPoint::Trap)
    }

    /// `EXEC`: launch the least-called registered program. On
    /// allocation failure the caller simply continues past the trap.
    pub(super) fn syscall_exec(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        if self.programs.is_empty() {
            return Ok(());
        }
        let mut pi = 0;
        for (i, p) in self.programs.iter().enumerate() {
            if p.call_count() < self.programs[pi].call_count() {
                pi = i;
            }
        }
        self.programs[pi].bump_call_count();
        let alloc_size = self.programs[pi].alloc_size();

        match self.create_process(cpu, ram, pi, alloc_size, SwitchPoint::Trap) {
            Ok(_) => Ok(()),
            Err(Halt::OutOfMemory(size)) => {
                self.debugln(format_args!(
                    "EXEC failed: no room for a {size}-word process"
                ));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `YIELD`: hand the CPU back to the scheduler.
    pub(super) fn syscall_yield(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        self.schedule_new_process(cpu, ram, SwitchPoint::Trap)
    }

    /// `COREDUMP`: print the registers, then pop and print the top
    /// three stack values, then exit.
    pub(super) fn syscall_coredump(&mut self, cpu: &mut Cpu, ram: &mut Ram) -> Result<(), Halt> {
        cpu.reg_dump();
        for _ in 0..3 {
            let value = self.pop_word(cpu, ram)?;
            println!("{value}");
        }
        self.syscall_exit(cpu, ram)
    }
}
