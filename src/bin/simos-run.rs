//! Demo runner: boots a few canned programs against the bundled
//! keyboard and console devices.

use std::process::ExitCode;

use clap::Parser;

use simos::hw::device::{ConsoleDevice, KeyboardDevice};
use simos::inst::regs::{R0, R1, R2};
use simos::inst::Instr;
use simos::os::program::Program;
use simos::os::sched::SchedParams;
use simos::os::{
    SYSCALL_CLOSE, SYSCALL_EXIT, SYSCALL_OPEN, SYSCALL_OUTPUT, SYSCALL_READ, SYSCALL_WRITE,
};
use simos::Computer;

const CONSOLE_ID: i32 = 1;
const KEYBOARD_ID: i32 = 2;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Words of RAM.
    #[arg(long, default_value_t = 1024)]
    ram_size: usize,

    /// Ticks between clock interrupts.
    #[arg(long, default_value_t = 5)]
    clock_freq: u64,

    /// Trace every step and OS decision.
    #[arg(short, long)]
    verbose: bool,
}

/// Pushes the value of `R0` set to `v`.
fn push_imm(prog: &mut Vec<Instr>, v: i32) {
    prog.push(Instr::Set(R0, v));
    prog.push(Instr::Push(R0));
}

fn trap(prog: &mut Vec<Instr>, id: i32) {
    push_imm(prog, id);
    prog.push(Instr::Trap);
}

/// Computes 7 + 5 and prints the sum.
fn sum_program() -> Program {
    let mut p = vec![
        Instr::Set(R0, 7),
        Instr::Set(R1, 5),
        Instr::Add(R2, R0, R1),
        Instr::Push(R2),
    ];
    trap(&mut p, SYSCALL_OUTPUT);
    trap(&mut p, SYSCALL_EXIT);
    Program::from_instrs(&p, 0)
}

/// Opens the keyboard, reads one word, prints it, closes, exits.
fn keyboard_program() -> Program {
    let mut p = Vec::new();
    push_imm(&mut p, KEYBOARD_ID);
    trap(&mut p, SYSCALL_OPEN);
    p.push(Instr::Pop(R0)); // open status

    push_imm(&mut p, KEYBOARD_ID);
    push_imm(&mut p, 0); // address
    trap(&mut p, SYSCALL_READ);
    p.push(Instr::Pop(R0)); // read status
    p.push(Instr::Pop(R2)); // data

    p.push(Instr::Push(R2));
    trap(&mut p, SYSCALL_OUTPUT);

    push_imm(&mut p, KEYBOARD_ID);
    trap(&mut p, SYSCALL_CLOSE);
    p.push(Instr::Pop(R0)); // close status

    trap(&mut p, SYSCALL_EXIT);
    Program::from_instrs(&p, 0)
}

/// Opens the console, writes one word to it, closes, exits.
fn console_program() -> Program {
    let mut p = Vec::new();
    push_imm(&mut p, CONSOLE_ID);
    trap(&mut p, SYSCALL_OPEN);
    p.push(Instr::Pop(R0));

    push_imm(&mut p, CONSOLE_ID);
    push_imm(&mut p, 0); // address
    push_imm(&mut p, 777); // value
    trap(&mut p, SYSCALL_WRITE);
    p.push(Instr::Pop(R0)); // write status

    push_imm(&mut p, CONSOLE_ID);
    trap(&mut p, SYSCALL_CLOSE);
    p.push(Instr::Pop(R0));

    trap(&mut p, SYSCALL_EXIT);
    Program::from_instrs(&p, 0)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut computer = Computer::with_params(args.ram_size, args.clock_freq, SchedParams::default());
    computer.set_verbose(args.verbose);

    let handle = computer.intc_handle();
    computer.register_device(Box::new(ConsoleDevice::new(handle.clone())), CONSOLE_ID);
    computer.register_device(Box::new(KeyboardDevice::new(handle)), KEYBOARD_ID);

    computer.add_program(sum_program());
    computer.add_program(keyboard_program());
    computer.add_program(console_program());

    for index in 0..3 {
        if let Err(halt) = computer.boot(index) {
            eprintln!("boot failed: {halt}");
            return ExitCode::FAILURE;
        }
    }

    match computer.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(halt) => {
            eprintln!("machine halted: {halt}");
            ExitCode::FAILURE
        }
    }
}
