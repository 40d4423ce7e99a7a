//! Word-exit history for the FSG search: a compact append-only table, the
//! grammar analogue of the backpointer table. Two entries reaching the same
//! destination state in the same frame coalesce onto the higher score.
use crate::mdef::PhoneId;

use super::lextree::CiMask;

pub const NO_HIST: i32 = -1;

#[derive(Debug, Clone)]
pub struct FsgHistEntry {
    pub frame: i32,
    /// Destination FSG state.
    pub to_state: i32,
    /// Word recognised on the way here; NO_WID for null transitions and
    /// the start-of-utterance dummy.
    pub wid: i32,
    pub score: i32,
    pub pred: i32,
    /// Final CI phone of the exited word (left context for successors).
    pub lc: PhoneId,
    /// Right contexts supported by the exit.
    pub rc: CiMask,
}

#[derive(Debug, Default)]
pub struct FsgHistory {
    entries: Vec<FsgHistEntry>,
    /// Per state: entry index for the current frame, or NO_HIST. Rebuilt
    /// every frame.
    state_entry: Vec<i32>,
    current_frame: i32,
}

impl FsgHistory {
    pub fn new(n_state: usize) -> FsgHistory {
        FsgHistory {
            entries: Vec::new(),
            state_entry: vec![NO_HIST; n_state],
            current_frame: -2,
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.state_entry.fill(NO_HIST);
        self.current_frame = -2;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, idx: i32) -> &FsgHistEntry {
        &self.entries[idx as usize]
    }

    /// Add a word exit, coalescing per (destination state, frame) onto the
    /// best score.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        frame: i32,
        to_state: i32,
        wid: i32,
        score: i32,
        pred: i32,
        lc: PhoneId,
        rc: CiMask,
    ) -> i32 {
        if frame != self.current_frame {
            self.state_entry.fill(NO_HIST);
            self.current_frame = frame;
        }
        let existing = self.state_entry[to_state as usize];
        if existing != NO_HIST {
            let e = &mut self.entries[existing as usize];
            if score > e.score {
                e.score = score;
                e.wid = wid;
                e.pred = pred;
                e.lc = lc;
                e.rc = rc;
            }
            return existing;
        }
        let idx = self.entries.len() as i32;
        self.entries.push(FsgHistEntry {
            frame,
            to_state,
            wid,
            score,
            pred,
            lc,
            rc,
        });
        self.state_entry[to_state as usize] = idx;
        idx
    }

    /// Backtrace of entry indices ending at `idx`, oldest first.
    pub fn backtrace(&self, mut idx: i32) -> Vec<i32> {
        let mut out = Vec::new();
        while idx != NO_HIST {
            out.push(idx);
            idx = self.entries[idx as usize].pred;
        }
        out.reverse();
        out
    }

    /// Best entry over the whole utterance, optionally restricted to final
    /// states, preferring later frames.
    pub fn best_exit(&self, is_final: impl Fn(i32) -> bool, require_final: bool) -> Option<i32> {
        let mut best: Option<i32> = None;
        for (i, e) in self.entries.iter().enumerate() {
            // The start dummy and its null propagations precede frame 0 and
            // are not word exits.
            if e.frame < 0 {
                continue;
            }
            if require_final && !is_final(e.to_state) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let be = &self.entries[b as usize];
                    e.frame > be.frame || (e.frame == be.frame && e.score > be.score)
                }
            };
            if better {
                best = Some(i as i32);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask() -> CiMask {
        CiMask::all(4)
    }

    #[test]
    fn coalesces_per_state_and_frame() {
        let mut h = FsgHistory::new(3);
        let a = h.add(0, 1, 7, -100, NO_HIST, 0, mask());
        let b = h.add(0, 1, 8, -50, NO_HIST, 1, mask());
        assert_eq!(a, b);
        assert_eq!(h.len(), 1);
        assert_eq!(h.entry(a).wid, 8);
        assert_eq!(h.entry(a).score, -50);
        // A different state gets its own entry.
        let c = h.add(0, 2, 7, -70, NO_HIST, 0, mask());
        assert_ne!(a, c);
        // A later frame starts fresh.
        let d = h.add(1, 1, 7, -200, a, 0, mask());
        assert_ne!(a, d);
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn best_exit_prefers_later_frames_and_final_states() {
        let mut h = FsgHistory::new(3);
        let root = h.add(0, 0, 5, -10, NO_HIST, 0, mask());
        h.add(1, 1, 6, -20, root, 0, mask());
        let late = h.add(2, 2, 7, -90, root, 0, mask());
        let finals = |s: i32| s == 2;
        assert_eq!(h.best_exit(finals, true), Some(late));
        // Without the final-state requirement the latest frame still wins.
        assert_eq!(h.best_exit(finals, false), Some(late));
        // No final-state entry at all.
        let finals_none = |_: i32| false;
        assert_eq!(h.best_exit(finals_none, true), None);
    }

    #[test]
    fn backtrace_walks_predecessors() {
        let mut h = FsgHistory::new(4);
        let a = h.add(0, 1, 5, -10, NO_HIST, 0, mask());
        let b = h.add(1, 2, 6, -20, a, 0, mask());
        let c = h.add(2, 3, 7, -30, b, 0, mask());
        assert_eq!(h.backtrace(c), vec![a, b, c]);
    }
}
