//! Backpointer table: the append-only log of word exits the tree and flat
//! passes write, and everything downstream (DAG, best path, N-best) reads.
//!
//! Entries for the same `(word, frame)` are coalesced: the best score wins,
//! and a per-entry stack keeps one exit score per distinct right-context
//! senone sequence of the word's final phone, because the final phone's
//! score depends on the first phone of whatever follows. Callers hold
//! indices, never references; the table grows by doubling and only an
//! allocation failure aborts the utterance.
use tracing::{info, warn};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::logmath::WORST_SCORE;
use crate::mdef::{PhoneId, TriphoneTable, NO_PHONE};

pub const NO_BP: i32 = -1;

#[derive(Debug, Clone)]
pub struct BpEntry {
    pub frame: i32,
    pub wid: i32,
    /// Predecessor entry, or NO_BP.
    pub bp: i32,
    /// Best path score over all right contexts.
    pub score: i32,
    /// Offset of this entry's right-context scores in the score stack.
    pub s_idx: i32,
    /// Number of right-context slots.
    pub n_rc: i32,
    /// Final CI phone, and the one before it (the left context of the final
    /// phone); NO_PHONE for single-phone and filler words, whose exit score
    /// applies to every right context.
    pub last_phone: PhoneId,
    pub prev_last_phone: PhoneId,
    /// Latest non-filler word ending at or before this entry, and its own
    /// non-filler predecessor. Cached so trigram lookups never walk filler
    /// chains.
    pub real_wid: i32,
    pub prev_real_wid: i32,
    /// Cleared by absolute pruning; invalid entries are skipped downstream.
    pub valid: bool,
    /// Acoustic / language decomposition, filled at utterance end.
    pub ascr: i32,
    pub lscr: i32,
}

#[derive(Debug)]
pub struct BpTable {
    entries: Vec<BpEntry>,
    bscore_stack: Vec<i32>,
    /// First entry index of each frame; one extra slot past the last frame.
    frame_idx: Vec<i32>,
    /// Per word: entry already created this frame, or NO_BP.
    word_lat_idx: Vec<i32>,
    /// Growth ceiling; hitting it is ResourceExhaustion.
    max_entries: usize,
}

impl BpTable {
    pub fn new(n_words: usize, initial: usize) -> BpTable {
        BpTable {
            entries: Vec::with_capacity(initial),
            bscore_stack: Vec::with_capacity(initial * 8),
            frame_idx: Vec::new(),
            word_lat_idx: vec![NO_BP; n_words],
            max_entries: 1 << 26,
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.bscore_stack.clear();
        self.frame_idx.clear();
        self.word_lat_idx.fill(NO_BP);
    }

    pub fn resize_words(&mut self, n_words: usize) {
        self.word_lat_idx = vec![NO_BP; n_words];
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, bp: i32) -> &BpEntry {
        &self.entries[bp as usize]
    }

    pub fn entry_mut(&mut self, bp: i32) -> &mut BpEntry {
        &mut self.entries[bp as usize]
    }

    /// Record where this frame's entries begin. Must be called once per
    /// frame, in order, before any `save` for that frame.
    pub fn mark_frame(&mut self, frame: i32) {
        let frame = frame as usize;
        while self.frame_idx.len() <= frame {
            self.frame_idx.push(self.entries.len() as i32);
        }
    }

    /// First entry index of `frame` (valid one past the last marked frame).
    pub fn frame_start(&self, frame: i32) -> i32 {
        if frame < 0 {
            return 0;
        }
        match self.frame_idx.get(frame as usize) {
            Some(&i) => i,
            None => self.entries.len() as i32,
        }
    }

    pub fn frame_end(&self, frame: i32) -> i32 {
        self.frame_start(frame + 1)
    }

    /// Entry ids created in `frame` so far.
    pub fn frame_entries(&self, frame: i32) -> std::ops::Range<i32> {
        self.frame_start(frame)..self.entries.len() as i32
    }

    /// Start frame of the word this entry closed.
    pub fn start_frame(&self, bp: i32) -> i32 {
        let e = &self.entries[bp as usize];
        if e.bp == NO_BP {
            0
        } else {
            self.entries[e.bp as usize].frame + 1
        }
    }

    /// Exit score of `bp` specific to right context `rc`, falling back to
    /// the shared slot for wildcard entries.
    pub fn rc_score(&self, bp: i32, rc: PhoneId, tt: &TriphoneTable) -> i32 {
        let e = &self.entries[bp as usize];
        if e.last_phone == NO_PHONE || e.n_rc == 1 {
            return self.bscore_stack[e.s_idx as usize];
        }
        let set = tt.rc_set(e.last_phone, e.prev_last_phone);
        let slot = set.cimap[rc as usize] as usize;
        self.bscore_stack[e.s_idx as usize + slot]
    }

    /// Record a word exit. Entries sharing `(wid, frame)` coalesce onto the
    /// best score; distinct right contexts land in separate stack slots,
    /// and a repeated save into the same slot also keeps the better score.
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &mut self,
        frame: i32,
        wid: i32,
        score: i32,
        path: i32,
        rc: usize,
        dict: &Dict,
        tt: &TriphoneTable,
    ) -> Result<i32> {
        debug_assert!(path == NO_BP || self.entries[path as usize].frame < frame);
        let existing = self.word_lat_idx[wid as usize];
        if existing != NO_BP {
            let s_idx = {
                let e = &mut self.entries[existing as usize];
                debug_assert_eq!(e.frame, frame);
                if score > e.score {
                    e.score = score;
                    if e.bp != path {
                        e.bp = path;
                        self.cache_real_wids(existing, dict);
                    }
                }
                let e = &self.entries[existing as usize];
                debug_assert!((rc as i32) < e.n_rc);
                e.s_idx as usize + rc
            };
            if score > self.bscore_stack[s_idx] {
                self.bscore_stack[s_idx] = score;
            }
            return Ok(existing);
        }

        if self.entries.len() >= self.max_entries {
            return Err(Error::ResourceExhaustion(format!(
                "backpointer table hit {} entries",
                self.max_entries
            )));
        }
        if self.entries.len() == self.entries.capacity() {
            let want = self.entries.capacity().max(64);
            self.entries
                .try_reserve(want)
                .map_err(|e| Error::ResourceExhaustion(e.to_string()))?;
            info!("resized backpointer table to {} entries", self.entries.capacity());
        }

        let w = dict.word(wid);
        let (last_phone, prev_last_phone, n_rc) = if w.phones.len() > 1 && !w.filler {
            let lp = w.phones[w.phones.len() - 1];
            let pp = w.phones[w.phones.len() - 2];
            (lp, pp, tt.rc_set(lp, pp).ssid.len())
        } else {
            (NO_PHONE, NO_PHONE, 1)
        };

        let bp = self.entries.len() as i32;
        let s_idx = self.bscore_stack.len() as i32;
        self.bscore_stack
            .try_reserve(n_rc)
            .map_err(|e| Error::ResourceExhaustion(e.to_string()))?;
        for _ in 0..n_rc {
            self.bscore_stack.push(WORST_SCORE);
        }
        debug_assert!(rc < n_rc);
        self.bscore_stack[s_idx as usize + rc] = score;

        self.entries.push(BpEntry {
            frame,
            wid,
            bp: path,
            score,
            s_idx,
            n_rc: n_rc as i32,
            last_phone,
            prev_last_phone,
            real_wid: wid,
            prev_real_wid: crate::dict::NO_WID,
            valid: true,
            ascr: 0,
            lscr: 0,
        });
        self.word_lat_idx[wid as usize] = bp;
        self.cache_real_wids(bp, dict);
        Ok(bp)
    }

    /// Fill `real_wid`/`prev_real_wid` by walking back over fillers.
    fn cache_real_wids(&mut self, bp: i32, dict: &Dict) {
        let mut prev = bp;
        let mut w = self.entries[bp as usize].wid;
        while dict.is_filler(w) {
            prev = self.entries[prev as usize].bp;
            if prev == NO_BP {
                break;
            }
            w = self.entries[prev as usize].wid;
        }
        let e_real = if prev == NO_BP || dict.is_filler(w) {
            crate::dict::NO_WID
        } else {
            dict.base_wid(w)
        };
        let prev_real = if prev == NO_BP {
            crate::dict::NO_WID
        } else {
            let pp = self.entries[prev as usize].bp;
            if pp == NO_BP {
                crate::dict::NO_WID
            } else {
                self.entries[pp as usize].real_wid
            }
        };
        let e = &mut self.entries[bp as usize];
        e.real_wid = e_real;
        e.prev_real_wid = prev_real;
    }

    /// Forget this frame's per-word coalescing handles; called after the
    /// word transitions that consumed them.
    pub fn clear_frame_handles(&mut self, frame: i32) {
        for bp in self.frame_entries(frame) {
            let wid = self.entries[bp as usize].wid;
            self.word_lat_idx[wid as usize] = NO_BP;
        }
    }

    /// Best-scoring exit at `frame`, searching backwards to the last frame
    /// that has any entries. Returns (bp, score).
    pub fn find_exit(&self, frame: i32) -> Option<(i32, i32)> {
        if self.entries.is_empty() {
            return None;
        }
        let mut frame = frame.min(self.frame_idx.len() as i32 - 1);
        let end = self.frame_end(frame);
        while frame >= 0 && self.frame_start(frame) == end {
            frame -= 1;
        }
        if frame < 0 {
            warn!("no word exits in backpointer table");
            return None;
        }
        let mut best = WORST_SCORE;
        let mut best_bp = NO_BP;
        for bp in self.frame_start(frame)..end {
            let e = &self.entries[bp as usize];
            if e.valid && e.score > best {
                best = e.score;
                best_bp = bp;
            }
        }
        if best_bp == NO_BP {
            None
        } else {
            Some((best_bp, best))
        }
    }

    /// Backtrace of entry ids ending at `bp`, in time order.
    pub fn backtrace(&self, mut bp: i32) -> Vec<i32> {
        let mut ids = Vec::new();
        while bp != NO_BP {
            ids.push(bp);
            bp = self.entries[bp as usize].bp;
        }
        ids.reverse();
        ids
    }

    /// Keep only the `maxwpf` best-scoring words exiting in `frame`,
    /// marking the rest invalid.
    pub fn prune_frame(&mut self, frame: i32, maxwpf: usize) {
        let range = self.frame_entries(frame);
        if (range.end - range.start) as usize <= maxwpf {
            return;
        }
        let mut scored: Vec<(i32, i32)> = range
            .clone()
            .map(|bp| (self.entries[bp as usize].score, bp))
            .collect();
        scored.sort_unstable_by_key(|&(s, _)| std::cmp::Reverse(s));
        for &(_, bp) in scored.iter().skip(maxwpf) {
            self.entries[bp as usize].valid = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::tests::toy_dict;
    use crate::mdef::tests::toy_mdef;
    use crate::mdef::TriphoneTable;

    fn fixture() -> (crate::mdef::Mdef, crate::dict::Dict) {
        let mdef = toy_mdef();
        let dict = toy_dict(&mdef);
        (mdef, dict)
    }

    #[test]
    fn coalesces_same_word_same_frame() {
        let (mdef, dict) = fixture();
        let tt = TriphoneTable::build(&mdef);
        let mut bp = BpTable::new(dict.n_words(), 4);
        // BEE = B IY: final IY with left context B has a distinct senone
        // sequence before SIL, so there are two right-context slots.
        let bee = dict.wid("BEE").unwrap();
        bp.mark_frame(0);
        let a = bp.save(0, bee, -100, NO_BP, 0, &dict, &tt).unwrap();
        let b = bp.save(0, bee, -50, NO_BP, 1, &dict, &tt).unwrap();
        assert_eq!(a, b);
        assert_eq!(bp.len(), 1);
        assert_eq!(bp.entry(a).score, -50);
        // Each right-context slot keeps its own score; rc_score resolves a
        // CI phone through the compressed map.
        let e = bp.entry(a);
        assert!(e.n_rc >= 2);
        let set = tt.rc_set(e.last_phone, e.prev_last_phone);
        let ci_of_slot0 = set.cimap.iter().position(|&m| m == 0).unwrap() as i32;
        let ci_of_slot1 = set.cimap.iter().position(|&m| m == 1).unwrap() as i32;
        assert_eq!(bp.rc_score(a, ci_of_slot0, &tt), -100);
        assert_eq!(bp.rc_score(a, ci_of_slot1, &tt), -50);
        // A worse repeat into an already-filled slot is ignored.
        bp.save(0, bee, -80, NO_BP, 1, &dict, &tt).unwrap();
        assert_eq!(bp.rc_score(a, ci_of_slot1, &tt), -50);
        assert_eq!(bp.entry(a).score, -50);
    }

    #[test]
    fn predecessors_have_lower_frames() {
        let (mdef, dict) = fixture();
        let tt = TriphoneTable::build(&mdef);
        let mut bp = BpTable::new(dict.n_words(), 4);
        let bay = dict.wid("BAY").unwrap();
        let bee = dict.wid("BEE").unwrap();
        bp.mark_frame(0);
        let a = bp.save(0, bay, -10, NO_BP, 0, &dict, &tt).unwrap();
        bp.clear_frame_handles(0);
        bp.mark_frame(1);
        bp.mark_frame(2);
        let b = bp.save(2, bee, -30, a, 0, &dict, &tt).unwrap();
        assert!(bp.entry(bp.entry(b).bp).frame < bp.entry(b).frame);
        assert_eq!(bp.start_frame(b), 1);
        assert_eq!(bp.backtrace(b), vec![a, b]);
    }

    #[test]
    fn real_wid_skips_fillers() {
        let (mdef, dict) = fixture();
        let tt = TriphoneTable::build(&mdef);
        let mut bp = BpTable::new(dict.n_words(), 4);
        let bay = dict.wid("BAY").unwrap();
        let sil = dict.silence_wid();
        let noise = dict.wid("<noise>").unwrap();
        bp.mark_frame(0);
        let a = bp.save(0, bay, -10, NO_BP, 0, &dict, &tt).unwrap();
        bp.clear_frame_handles(0);
        bp.mark_frame(1);
        let s = bp.save(1, sil, -20, a, 0, &dict, &tt).unwrap();
        bp.clear_frame_handles(1);
        bp.mark_frame(2);
        let n = bp.save(2, noise, -30, s, 0, &dict, &tt).unwrap();
        assert_eq!(bp.entry(n).real_wid, bay);
        assert_eq!(bp.entry(s).real_wid, bay);
        assert_eq!(bp.entry(a).real_wid, bay);
    }

    #[test]
    fn growth_at_capacity_loses_nothing() {
        let (mdef, dict) = fixture();
        let tt = TriphoneTable::build(&mdef);
        // Initial capacity of 2, then insert three distinct words.
        let mut bp = BpTable::new(dict.n_words(), 2);
        bp.mark_frame(0);
        let bay = dict.wid("BAY").unwrap();
        let bee = dict.wid("BEE").unwrap();
        let abbey = dict.wid("ABBEY").unwrap();
        for (i, w) in [bay, bee, abbey].into_iter().enumerate() {
            bp.save(0, w, -10 * (i as i32 + 1), NO_BP, 0, &dict, &tt).unwrap();
        }
        assert_eq!(bp.len(), 3);
        assert_eq!(bp.entry(2).wid, abbey);
        assert_eq!(bp.entry(0).score, -10);
    }

    #[test]
    fn find_exit_scans_backwards() {
        let (mdef, dict) = fixture();
        let tt = TriphoneTable::build(&mdef);
        let mut bp = BpTable::new(dict.n_words(), 4);
        let bay = dict.wid("BAY").unwrap();
        bp.mark_frame(0);
        let a = bp.save(0, bay, -10, NO_BP, 0, &dict, &tt).unwrap();
        bp.clear_frame_handles(0);
        // Frames 1..=3 have no exits.
        bp.mark_frame(1);
        bp.mark_frame(2);
        bp.mark_frame(3);
        let (found, score) = bp.find_exit(3).unwrap();
        assert_eq!(found, a);
        assert_eq!(score, -10);
    }

    #[test]
    fn maxwpf_keeps_the_best() {
        let (mdef, dict) = fixture();
        let tt = TriphoneTable::build(&mdef);
        let mut bp = BpTable::new(dict.n_words(), 8);
        bp.mark_frame(0);
        let words = ["BAY", "BEE", "ABBEY"].map(|w| dict.wid(w).unwrap());
        bp.save(0, words[0], -30, NO_BP, 0, &dict, &tt).unwrap();
        bp.save(0, words[1], -10, NO_BP, 0, &dict, &tt).unwrap();
        bp.save(0, words[2], -20, NO_BP, 0, &dict, &tt).unwrap();
        bp.prune_frame(0, 2);
        assert!(!bp.entry(0).valid);
        assert!(bp.entry(1).valid);
        assert!(bp.entry(2).valid);
        let (best, _) = bp.find_exit(0).unwrap();
        assert_eq!(best, 1);
    }
}
