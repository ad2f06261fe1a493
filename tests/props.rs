//! Randomized invariants: instruction round-trips, allocator
//! bookkeeping, and isolation under arbitrary instruction soup.

use proptest::prelude::*;

use simos::hw::cpu::Cpu;
use simos::hw::ram::Ram;
use simos::inst::{Instr, Reg};
use simos::os::mem::MemoryManager;
use simos::os::pcb::Pcb;
use simos::os::program::Program;
use simos::{Computer, Word};

fn arb_reg() -> impl Strategy<Value = Reg> {
    (0i32..5).prop_map(|i| Reg::general_from_word(i).unwrap())
}

fn arb_instr() -> impl Strategy<Value = Instr> {
    let r = arb_reg;
    let data = prop_oneof![
        (r(), any::<Word>()).prop_map(|(a, imm)| Instr::Set(a, imm)),
        (r(), r(), r()).prop_map(|(a, b, c)| Instr::Add(a, b, c)),
        (r(), r(), r()).prop_map(|(a, b, c)| Instr::Sub(a, b, c)),
        (r(), r(), r()).prop_map(|(a, b, c)| Instr::Mul(a, b, c)),
        (r(), r(), r()).prop_map(|(a, b, c)| Instr::Div(a, b, c)),
        (r(), r()).prop_map(|(a, b)| Instr::Copy(a, b)),
        (r(), r()).prop_map(|(a, b)| Instr::Load(a, b)),
        (r(), r()).prop_map(|(a, b)| Instr::Save(a, b)),
    ];
    let control = prop_oneof![
        any::<Word>().prop_map(Instr::Branch),
        (r(), r(), any::<Word>()).prop_map(|(a, b, rel)| Instr::Bne(a, b, rel)),
        (r(), r(), any::<Word>()).prop_map(|(a, b, rel)| Instr::Blt(a, b, rel)),
        r().prop_map(Instr::Pop),
        r().prop_map(Instr::Push),
        Just(Instr::Trap),
    ];
    prop_oneof![data, control]
}

/// A saved PCB owning the window `[base, base+size)`, as the OS would
/// leave one between steps.
fn saved_proc(pid: Word, base: Word, size: Word) -> Pcb {
    let mut cpu = Cpu::new(5);
    cpu.set_base(base);
    cpu.set_lim(size);
    cpu.set_pc(base);
    cpu.set_sp(size - 1);
    let mut pcb = Pcb::new(pid, 0, 0);
    pcb.save(&cpu, 0);
    pcb
}

proptest! {
    #[test]
    fn instruction_encode_decode_round_trip(instr in arb_instr()) {
        prop_assert_eq!(Instr::decode(instr.encode()), Ok(instr));
    }

    /// Free-list bookkeeping under random alloc/free interleavings:
    /// the windows and free blocks always tile RAM exactly, and no
    /// two free blocks are ever left adjacent.
    #[test]
    fn allocator_partitions_ram(ops in prop::collection::vec((1i32..40, any::<bool>()), 1..60)) {
        const RAM_SIZE: usize = 600;
        let mut mm = MemoryManager::new(RAM_SIZE);
        let mut ram = Ram::new(RAM_SIZE);
        let mut procs: Vec<Pcb> = Vec::new();
        let mut next_pid = 1;

        for (size, is_alloc) in ops {
            if is_alloc || procs.is_empty() {
                if let Ok(base) = mm.alloc(size, &mut ram, &mut procs) {
                    procs.push(saved_proc(next_pid, base, size));
                    next_pid += 1;
                }
            } else {
                let victim = procs.remove(size as usize % procs.len());
                mm.free(victim.base(), victim.lim());
            }

            // property: exact tiling of [0, RAM_SIZE)
            let mut ranges: Vec<(Word, Word)> = procs
                .iter()
                .map(|p| (p.base(), p.lim()))
                .chain(mm.free_blocks().iter().map(|b| (b.addr, b.size)))
                .collect();
            ranges.sort();
            let mut next = 0;
            for (addr, size) in ranges {
                prop_assert_eq!(addr, next, "gap or overlap at {}", addr);
                next += size;
            }
            prop_assert_eq!(next as usize, RAM_SIZE);

            // property: coalescing leaves no adjacent free blocks
            for w in mm.free_blocks().windows(2) {
                prop_assert_ne!(w[0].addr + w[0].size, w[1].addr);
            }
        }
    }

    /// Arbitrary word soup can trap or spin but never escapes its
    /// window: the machine neither panics nor corrupts the partition.
    #[test]
    fn random_programs_stay_isolated(words in prop::collection::vec(-20i32..20, 8..60)) {
        let len = words.len() - words.len() % 4;
        let mut computer = Computer::new(512);
        computer.add_program(Program::new(words[..len].to_vec(), 0));
        computer.boot(0).unwrap();

        for _ in 0..300 {
            match computer.step() {
                Ok(()) => {}
                Err(_) => break,
            }
        }

        let os = computer.os();
        let mut ranges: Vec<(Word, Word)> = os
            .processes()
            .iter()
            .map(|pcb| {
                if os.current_pid() == Some(pcb.pid()) {
                    (computer.cpu().base(), computer.cpu().lim())
                } else {
                    (pcb.base(), pcb.lim())
                }
            })
            .chain(os.free_blocks().iter().map(|b| (b.addr, b.size)))
            .collect();
        ranges.sort();
        let mut next = 0;
        for (addr, size) in ranges {
            prop_assert_eq!(addr, next);
            next += size;
        }
        prop_assert_eq!(next, 512);
    }

    /// Loading a program then fetching word-by-word yields it back.
    #[test]
    fn program_load_round_trips(instrs in prop::collection::vec(arb_instr(), 1..20)) {
        let prog = Program::from_instrs(&instrs, 0);
        let mut ram = Ram::new(1024);
        ram.load(100, prog.words());
        for (i, &w) in prog.words().iter().enumerate() {
            prop_assert_eq!(ram.read(100 + i), w);
        }
        // and instruction-sized fetches decode to the originals
        for (i, &instr) in instrs.iter().enumerate() {
            let fetched = ram.fetch_instruction(100 + 4 * i);
            prop_assert_eq!(Instr::decode(fetched), Ok(instr));
        }
    }
}
