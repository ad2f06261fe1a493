//! Process selection: priority scheduling with aging, an I/O reward,
//! and a hysteresis bias that keeps the current process on the CPU
//! until a challenger is decisively better.

use crate::Word;

use super::pcb::{Pcb, Pid};

/// Tunable scheduler parameters.
///
/// The defaults match the machine's canonical configuration; tests
/// override them to provoke specific behaviors.
#[derive(Debug, Clone, Copy)]
pub struct SchedParams {
    /// Clock interrupts between aging passes.
    pub aging_time: u64,
    /// Priority added to every ready, non-running process per pass.
    pub aging_priority: Word,
    /// How much better a challenger must be to preempt the current
    /// process.
    pub priority_threshold: Word,
    /// Priority reward for issuing a read request.
    pub read_priority: Word,
    /// Priority reward for issuing a write request.
    pub write_priority: Word,
    /// Ticks charged for each register save and each restore.
    pub switch_cost: u64,
    /// Priority assigned to newly created processes.
    pub initial_priority: Word,
}

impl Default for SchedParams {
    fn default() -> Self {
        SchedParams {
            aging_time: 1,
            aging_priority: 4,
            priority_threshold: 500,
            read_priority: 1,
            write_priority: 1,
            switch_cost: 30,
            initial_priority: 0,
        }
    }
}

/// The selection policy. Owns no processes; operates on the table the
/// OS passes in.
#[derive(Debug)]
pub struct Scheduler {
    /// The active tuning.
    pub params: SchedParams,
}

impl Scheduler {
    /// Creates a scheduler with the given tuning.
    pub fn new(params: SchedParams) -> Scheduler {
        Scheduler { params }
    }

    /// Ages ready processes (on aging-pass boundaries) and picks the
    /// index of the next process to run.
    ///
    /// The current process, when still runnable, starts as the
    /// incumbent with a bias of `priority_threshold`; a challenger
    /// must strictly exceed that to preempt it. Ties go to the
    /// earliest table index. Returns `None` when no runnable process
    /// exists.
    pub fn pick(&self, procs: &mut [Pcb], current: Option<Pid>, clock_count: u64) -> Option<usize> {
        if clock_count % self.params.aging_time == 0 {
            for p in procs.iter_mut() {
                if !p.is_blocked() && Some(p.pid()) != current {
                    p.add_priority(self.params.aging_priority);
                }
            }
        }

        let mut best: Option<usize> = None;
        let mut best_priority = i64::MIN;
        if let Some(cur) = current {
            if let Some(i) = procs.iter().position(|p| p.pid() == cur && !p.is_blocked()) {
                best = Some(i);
                best_priority =
                    i64::from(procs[i].priority()) + i64::from(self.params.priority_threshold);
            }
        }

        for (i, p) in procs.iter().enumerate() {
            if p.is_blocked() {
                continue;
            }
            if i64::from(p.priority()) > best_priority {
                best = Some(i);
                best_priority = i64::from(p.priority());
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::pcb::BlockOp;
    use crate::os::pcb::BlockState;

    fn table(priorities: &[Word]) -> Vec<Pcb> {
        priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let mut pcb = Pcb::new(1001 + i as Word, p, 0);
                pcb.mark_ready(0);
                pcb
            })
            .collect()
    }

    /// Aging disabled by picking a clock count off the pass boundary.
    const OFF_PASS: u64 = 1;

    fn sched() -> Scheduler {
        Scheduler::new(SchedParams { aging_time: 2, ..SchedParams::default() })
    }

    #[test]
    fn picks_strictly_highest_priority() {
        let mut procs = table(&[1, 5, 3]);
        assert_eq!(sched().pick(&mut procs, None, OFF_PASS), Some(1));
    }

    #[test]
    fn tie_goes_to_earliest_index() {
        let mut procs = table(&[5, 5, 5]);
        assert_eq!(sched().pick(&mut procs, None, OFF_PASS), Some(0));
    }

    #[test]
    fn hysteresis_keeps_the_current_process() {
        let mut procs = table(&[0, 400]);
        // 400 does not clear 0 + 500
        assert_eq!(sched().pick(&mut procs, Some(1001), OFF_PASS), Some(0));
        procs[1].add_priority(200);
        // 600 does
        assert_eq!(sched().pick(&mut procs, Some(1001), OFF_PASS), Some(1));
    }

    #[test]
    fn blocked_processes_are_never_chosen() {
        let mut procs = table(&[9, 1]);
        procs[0].block(BlockState { device: 1, op: BlockOp::Read, addr: 0 });
        assert_eq!(sched().pick(&mut procs, None, OFF_PASS), Some(1));
        procs[1].block(BlockState { device: 1, op: BlockOp::Open, addr: 0 });
        assert_eq!(sched().pick(&mut procs, None, OFF_PASS), None);
    }

    #[test]
    fn aging_bumps_ready_non_current_only() {
        let mut procs = table(&[0, 0, 0]);
        procs[2].block(BlockState { device: 1, op: BlockOp::Read, addr: 0 });
        let s = sched();
        s.pick(&mut procs, Some(1001), 0); // clock_count 0: aging pass
        assert_eq!(procs[0].priority(), 0); // current
        assert_eq!(procs[1].priority(), s.params.aging_priority);
        assert_eq!(procs[2].priority(), 0); // blocked
    }

    #[test]
    fn current_process_missing_from_table_is_ignored() {
        let mut procs = table(&[2, 3]);
        assert_eq!(sched().pick(&mut procs, Some(9999), OFF_PASS), Some(1));
    }
}
