//! The fixed-width instruction set of the simulated chip.
//!
//! Every instruction occupies [`INSTRSIZE`] consecutive words in RAM:
//! an opcode word followed by three operand words (operands an opcode
//! does not use are ignored). [`Instr`] is the decoded, tagged form the
//! CPU executes; the raw four-word tuple exists only at the RAM-fetch
//! boundary.

use thiserror::Error;

use crate::Word;

/// Number of words occupied by one instruction and its operands.
pub const INSTRSIZE: Word = 4;

/// Number of registers on the chip.
pub const NUMREG: usize = 9;

/// Number of general-purpose registers; the only ones instruction
/// operands may name. `PC`, `SP`, `BASE` and `LIM` are reachable only
/// through their dedicated instructions (branches, stack ops), which
/// is what makes base/limit isolation enforceable.
pub const NUMGENREG: usize = 5;

const OP_SET: Word = 0;
const OP_ADD: Word = 1;
const OP_SUB: Word = 2;
const OP_MUL: Word = 3;
const OP_DIV: Word = 4;
const OP_COPY: Word = 5;
const OP_BRANCH: Word = 6;
const OP_BNE: Word = 7;
const OP_BLT: Word = 8;
const OP_POP: Word = 9;
const OP_PUSH: Word = 10;
const OP_LOAD: Word = 11;
const OP_SAVE: Word = 12;
const OP_TRAP: Word = 15;

/// A validated register index; always safe to index the file with.
///
/// Instruction operands are restricted to the general registers (see
/// [`NUMGENREG`]); the full nine-register range exists for the OS and
/// for tooling that inspects the whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub(crate) u8);

impl Reg {
    /// Validates a register-file index, returning `None` when the word
    /// does not name one of the [`NUMREG`] registers.
    pub fn from_word(w: Word) -> Option<Reg> {
        (0..NUMREG as Word).contains(&w).then(|| Reg(w as u8))
    }

    /// Validates an instruction operand, which may only name one of
    /// the [`NUMGENREG`] general registers.
    pub fn general_from_word(w: Word) -> Option<Reg> {
        (0..NUMGENREG as Word).contains(&w).then(|| Reg(w as u8))
    }

    /// The register's index into the register file.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            regs::PC => f.write_str("PC"),
            regs::SP => f.write_str("SP"),
            regs::BASE => f.write_str("BASE"),
            regs::LIM => f.write_str("LIM"),
            Reg(n) => write!(f, "R{n}"),
        }
    }
}

/// Constants for each register on the chip.
pub mod regs {
    use super::Reg;

    /// General-purpose register 0.
    pub const R0: Reg = Reg(0);
    /// General-purpose register 1.
    pub const R1: Reg = Reg(1);
    /// General-purpose register 2.
    pub const R2: Reg = Reg(2);
    /// General-purpose register 3.
    pub const R3: Reg = Reg(3);
    /// General-purpose register 4.
    pub const R4: Reg = Reg(4);
    /// The program counter (held absolute).
    pub const PC: Reg = Reg(5);
    /// The stack pointer (relative to `BASE`, grows downward).
    pub const SP: Reg = Reg(6);
    /// The low bound of the process's memory window.
    pub const BASE: Reg = Reg(7);
    /// The length of the process's memory window.
    pub const LIM: Reg = Reg(8);
}

/// Instructions that map one-to-one to their four-word RAM form.
///
/// Branch targets are program-relative addresses; the CPU rebases them
/// against `BASE` and compensates for its unconditional post-increment
/// of the PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    /// `R[r] <- imm`.
    Set(Reg, Word),
    /// `R[d] <- R[s1] + R[s2]`.
    Add(Reg, Reg, Reg),
    /// `R[d] <- R[s1] - R[s2]`.
    Sub(Reg, Reg, Reg),
    /// `R[d] <- R[s1] * R[s2]`.
    Mul(Reg, Reg, Reg),
    /// `R[d] <- R[s1] / R[s2]`; a zero divisor raises the
    /// divide-by-zero trap.
    Div(Reg, Reg, Reg),
    /// `R[d] <- R[s]`.
    Copy(Reg, Reg),
    /// `PC <- BASE + rel`.
    Branch(Word),
    /// `PC <- BASE + rel` if `R[a] != R[b]`.
    Bne(Reg, Reg, Word),
    /// `PC <- BASE + rel` if `R[a] < R[b]`.
    Blt(Reg, Reg, Word),
    /// Pop the top of the stack into `R[r]`.
    Pop(Reg),
    /// Push `R[r]` onto the stack.
    Push(Reg),
    /// `R[d] <- RAM[BASE + R[s]]`.
    Load(Reg, Reg),
    /// `RAM[BASE + R[d]] <- R[s]`.
    Save(Reg, Reg),
    /// System call; control transfers to the operating system, which
    /// pops its own argument from the process's stack.
    Trap,
}

/// Error from decoding a four-word tuple that names no instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal instruction {0:?}")]
pub struct IllegalInstr(pub [Word; 4]);

impl Instr {
    /// Converts a four-word RAM tuple into an `Instr`.
    ///
    /// Errors if the opcode is unknown or a register operand does not
    /// name a general register; operand words the opcode does not use
    /// are ignored.
    pub fn decode(words: [Word; 4]) -> Result<Instr, IllegalInstr> {
        let reg = |w: Word| Reg::general_from_word(w).ok_or(IllegalInstr(words));
        let [op, a, b, c] = words;

        let instr = match op {
            OP_SET => Instr::Set(reg(a)?, b),
            OP_ADD => Instr::Add(reg(a)?, reg(b)?, reg(c)?),
            OP_SUB => Instr::Sub(reg(a)?, reg(b)?, reg(c)?),
            OP_MUL => Instr::Mul(reg(a)?, reg(b)?, reg(c)?),
            OP_DIV => Instr::Div(reg(a)?, reg(b)?, reg(c)?),
            OP_COPY => Instr::Copy(reg(a)?, reg(b)?),
            OP_BRANCH => Instr::Branch(a),
            OP_BNE => Instr::Bne(reg(a)?, reg(b)?, c),
            OP_BLT => Instr::Blt(reg(a)?, reg(b)?, c),
            OP_POP => Instr::Pop(reg(a)?),
            OP_PUSH => Instr::Push(reg(a)?),
            OP_LOAD => Instr::Load(reg(a)?, reg(b)?),
            OP_SAVE => Instr::Save(reg(a)?, reg(b)?),
            OP_TRAP => Instr::Trap,
            _ => return Err(IllegalInstr(words)),
        };
        Ok(instr)
    }

    /// Encodes this instruction as its four-word RAM form.
    pub fn encode(&self) -> [Word; 4] {
        match *self {
            Instr::Set(r, imm) => [OP_SET, r.0.into(), imm, 0],
            Instr::Add(d, s1, s2) => [OP_ADD, d.0.into(), s1.0.into(), s2.0.into()],
            Instr::Sub(d, s1, s2) => [OP_SUB, d.0.into(), s1.0.into(), s2.0.into()],
            Instr::Mul(d, s1, s2) => [OP_MUL, d.0.into(), s1.0.into(), s2.0.into()],
            Instr::Div(d, s1, s2) => [OP_DIV, d.0.into(), s1.0.into(), s2.0.into()],
            Instr::Copy(d, s) => [OP_COPY, d.0.into(), s.0.into(), 0],
            Instr::Branch(rel) => [OP_BRANCH, rel, 0, 0],
            Instr::Bne(a, b, rel) => [OP_BNE, a.0.into(), b.0.into(), rel],
            Instr::Blt(a, b, rel) => [OP_BLT, a.0.into(), b.0.into(), rel],
            Instr::Pop(r) => [OP_POP, r.0.into(), 0, 0],
            Instr::Push(r) => [OP_PUSH, r.0.into(), 0, 0],
            Instr::Load(d, s) => [OP_LOAD, d.0.into(), s.0.into(), 0],
            Instr::Save(s, d) => [OP_SAVE, s.0.into(), d.0.into(), 0],
            Instr::Trap => [OP_TRAP, 0, 0, 0],
        }
    }
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Instr::Set(r, imm) => write!(f, "SET {r} = {imm}"),
            Instr::Add(d, s1, s2) => write!(f, "ADD {d} = {s1} + {s2}"),
            Instr::Sub(d, s1, s2) => write!(f, "SUB {d} = {s1} - {s2}"),
            Instr::Mul(d, s1, s2) => write!(f, "MUL {d} = {s1} * {s2}"),
            Instr::Div(d, s1, s2) => write!(f, "DIV {d} = {s1} / {s2}"),
            Instr::Copy(d, s) => write!(f, "COPY {d} = {s}"),
            Instr::Branch(rel) => write!(f, "BRANCH @{rel}"),
            Instr::Bne(a, b, rel) => write!(f, "BNE ({a} != {b}) @{rel}"),
            Instr::Blt(a, b, rel) => write!(f, "BLT ({a} < {b}) @{rel}"),
            Instr::Pop(r) => write!(f, "POP {r}"),
            Instr::Push(r) => write!(f, "PUSH {r}"),
            Instr::Load(d, s) => write!(f, "LOAD {d} <-- @{s}"),
            Instr::Save(s, d) => write!(f, "SAVE {s} --> @{d}"),
            Instr::Trap => f.write_str("TRAP"),
        }
    }
}

/// Flattens a sequence of instructions into the word array a program
/// binary consists of.
pub fn encode_all(instrs: &[Instr]) -> Vec<Word> {
    instrs.iter().flat_map(Instr::encode).collect()
}
