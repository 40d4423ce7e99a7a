//! Per-frame Viterbi update of a single HMM instance.
//!
//! An [`Hmm`] carries one score and one history (backpointer index) per
//! emitting state, plus a non-emitting exit state whose score is what
//! successor HMMs consume in the same frame. All instances in a search share
//! one [`HmmContext`] binding the current senone-score vector, the
//! transition-matrix table and the senone-sequence table.
//!
//! The update runs over destination states in decreasing order so inputs are
//! never overwritten before they are read, and the exit state is computed
//! from the pre-update scores of the last two emitting states. Score
//! arithmetic saturates at [`WORST_SCORE`]; underflow is not an error.
//!
//! Specialised routines exist for the 3- and 5-state left-to-right
//! topologies (the only ones real models use) in multiplex and non-multiplex
//! forms. They must agree exactly with the generic routine; the tests below
//! drive all of them over shared vectors. Tie-breaking is uniform: the
//! self-transition wins ties, and among other predecessors the nearer state
//! wins.
use std::sync::Arc;

use crate::logmath::WORST_SCORE;
use crate::mdef::{Mdef, SenId, Ssid, NO_SSID};
use crate::tmat::TmatSet;

pub const MAX_HMM_NSTATE: usize = 5;

/// History value meaning "no predecessor".
pub const NO_HIST: i32 = -1;

#[derive(Debug)]
pub struct HmmContext {
    n_emit_state: usize,
    mdef: Arc<Mdef>,
    tmat: Arc<TmatSet>,
    senscore: Vec<i32>,
}

impl HmmContext {
    pub fn new(mdef: Arc<Mdef>, tmat: Arc<TmatSet>) -> crate::error::Result<Self> {
        let n_emit_state = mdef.n_emit_state();
        if n_emit_state == 0 || n_emit_state > MAX_HMM_NSTATE {
            return Err(crate::error::Error::Logic(format!(
                "unsupported number of emitting states: {n_emit_state}"
            )));
        }
        if tmat.n_state() != n_emit_state {
            return Err(crate::error::Error::Format {
                file: "transition_matrices".into(),
                detail: format!(
                    "tmat has {} states but model definition has {}",
                    tmat.n_state(),
                    n_emit_state
                ),
            });
        }
        let n_sen = mdef.n_sen();
        Ok(HmmContext {
            n_emit_state,
            mdef,
            tmat,
            senscore: vec![WORST_SCORE; n_sen],
        })
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    pub fn mdef(&self) -> &Mdef {
        &self.mdef
    }

    /// Install the senone scores for the current frame.
    pub fn set_senscore(&mut self, scores: &[i32]) {
        self.senscore.copy_from_slice(scores);
    }

    #[inline]
    fn senscr(&self, sen: SenId) -> i32 {
        self.senscore[sen as usize]
    }

    #[inline]
    fn tp(&self, tmatid: i32, from: usize, to: usize) -> i32 {
        self.tmat.tp(tmatid, from, to)
    }
}

/// Senone-sequence binding: one SSID for the whole HMM, or one per state for
/// multiplex HMMs whose left context can change during their lifetime.
#[derive(Debug, Clone)]
pub enum HmmSsid {
    Single(Ssid),
    Mpx(Box<[Ssid]>),
}

#[derive(Debug, Clone)]
pub struct Hmm {
    /// Emitting-state scores; slot 0 is the entry state.
    score: [i32; MAX_HMM_NSTATE],
    history: [i32; MAX_HMM_NSTATE],
    out_score: i32,
    out_history: i32,
    bestscore: i32,
    /// Frame of last activation; -1 when inactive.
    frame: i32,
    tmatid: i32,
    n_emit: u8,
    ssid: HmmSsid,
}

impl Hmm {
    pub fn new(ctx: &HmmContext, mpx: bool, ssid: Ssid, tmatid: i32) -> Self {
        let n = ctx.n_emit_state;
        let ssid = if mpx {
            let mut v = vec![NO_SSID; n].into_boxed_slice();
            v[0] = ssid;
            HmmSsid::Mpx(v)
        } else {
            HmmSsid::Single(ssid)
        };
        let mut hmm = Hmm {
            score: [WORST_SCORE; MAX_HMM_NSTATE],
            history: [NO_HIST; MAX_HMM_NSTATE],
            out_score: WORST_SCORE,
            out_history: NO_HIST,
            bestscore: WORST_SCORE,
            frame: -1,
            tmatid,
            n_emit: n as u8,
            ssid,
        };
        hmm.clear();
        hmm
    }

    pub fn is_mpx(&self) -> bool {
        matches!(self.ssid, HmmSsid::Mpx(_))
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit as usize
    }

    pub fn in_score(&self) -> i32 {
        self.score[0]
    }

    pub fn score(&self, state: usize) -> i32 {
        self.score[state]
    }

    pub fn in_history(&self) -> i32 {
        self.history[0]
    }

    pub fn history(&self, state: usize) -> i32 {
        self.history[state]
    }

    pub fn out_score(&self) -> i32 {
        self.out_score
    }

    pub fn out_history(&self) -> i32 {
        self.out_history
    }

    pub fn bestscore(&self) -> i32 {
        self.bestscore
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    pub fn set_frame(&mut self, frame: i32) {
        self.frame = frame;
    }

    pub fn tmatid(&self) -> i32 {
        self.tmatid
    }

    /// SSID bound to a state (the shared one for non-multiplex HMMs).
    pub fn ssid(&self, state: usize) -> Ssid {
        match &self.ssid {
            HmmSsid::Single(s) => *s,
            HmmSsid::Mpx(v) => v[state],
        }
    }

    /// Retarget a non-multiplex HMM (fwdflat reuses pooled channels).
    pub fn set_ssid(&mut self, ssid: Ssid) {
        debug_assert!(!self.is_mpx());
        self.ssid = HmmSsid::Single(ssid);
    }

    pub fn set_tmatid(&mut self, tmatid: i32) {
        self.tmatid = tmatid;
    }

    /// Set the entry-state SSID of a multiplex HMM; done at word entry when
    /// the left context becomes known.
    pub fn set_mpx_ssid0(&mut self, ssid: Ssid) {
        match &mut self.ssid {
            HmmSsid::Mpx(v) => v[0] = ssid,
            HmmSsid::Single(_) => debug_assert!(false, "set_mpx_ssid0 on non-mpx HMM"),
        }
    }

    pub fn senid(&self, ctx: &HmmContext, state: usize) -> SenId {
        let ssid = self.ssid(state);
        if ssid == NO_SSID {
            return -1;
        }
        ctx.mdef.sseq_sen(ssid, state)
    }

    /// Reset scores and histories; the HMM also forgets its multiplex
    /// contexts beyond state 0 and its frame stamp.
    pub fn clear(&mut self) {
        self.clear_scores();
        for h in self.history.iter_mut() {
            *h = NO_HIST;
        }
        self.out_history = NO_HIST;
        self.frame = -1;
        if let HmmSsid::Mpx(v) = &mut self.ssid {
            let keep = v[0];
            for s in v.iter_mut() {
                *s = NO_SSID;
            }
            v[0] = keep;
        }
    }

    pub fn clear_scores(&mut self) {
        for s in self.score.iter_mut() {
            *s = WORST_SCORE;
        }
        self.out_score = WORST_SCORE;
        self.bestscore = WORST_SCORE;
    }

    /// Activate the entry state for `frame`.
    pub fn enter(&mut self, score: i32, history: i32, frame: i32) {
        self.score[0] = score;
        self.history[0] = history;
        self.frame = frame;
    }

    /// Subtract `best` from every finite score, exit included. Applied when
    /// long utterances push scores toward the underflow region.
    pub fn normalize(&mut self, best: i32) {
        for s in self.score.iter_mut().take(self.n_emit as usize) {
            if *s > WORST_SCORE {
                *s -= best;
            }
        }
        if self.out_score > WORST_SCORE {
            self.out_score -= best;
        }
    }

    /// One frame of Viterbi. Returns the best score over all states.
    pub fn eval(&mut self, ctx: &HmmContext) -> i32 {
        match (self.is_mpx(), self.n_emit as usize) {
            (false, 5) => self.eval_5st_lr(ctx),
            (false, 3) => self.eval_3st_lr(ctx),
            (true, 5) => self.eval_5st_lr_mpx(ctx),
            (true, 3) => self.eval_3st_lr_mpx(ctx),
            _ => self.eval_anytopo(ctx),
        }
    }

    /// Pre-update score of state `i` with its senone's output probability
    /// folded in, clamped so nothing sinks below the sentinel.
    #[inline]
    fn s_in(&self, ctx: &HmmContext, state: usize) -> i32 {
        let ssid = self.ssid(state);
        if ssid == NO_SSID {
            return WORST_SCORE;
        }
        let s = self.score[state] + ctx.senscr(ctx.mdef.sseq_sen(ssid, state));
        s.max(WORST_SCORE)
    }

    fn eval_5st_lr(&mut self, ctx: &HmmContext) -> i32 {
        let t = self.tmatid;
        let s0 = self.s_in(ctx, 0);
        let s1 = self.s_in(ctx, 1);
        let s2 = self.s_in(ctx, 2);
        let s3 = self.s_in(ctx, 3);
        let s4 = self.s_in(ctx, 4);

        // Exit first, from the old scores of states 4 and 3.
        let mut best = s4 + ctx.tp(t, 4, 5);
        let mut hist = self.history[4];
        let skip = s3 + ctx.tp(t, 3, 5);
        if skip > best {
            best = skip;
            hist = self.history[3];
        }
        self.out_score = best.max(WORST_SCORE);
        self.out_history = hist;
        let mut best_all = self.out_score;

        // State 4 <- {4, 3, 2}.
        let mut v = s4 + ctx.tp(t, 4, 4);
        let mut from = 4usize;
        let c = s3 + ctx.tp(t, 3, 4);
        if c > v {
            v = c;
            from = 3;
        }
        let c = s2 + ctx.tp(t, 2, 4);
        if c > v {
            v = c;
            from = 2;
        }
        self.score[4] = v.max(WORST_SCORE);
        if from != 4 {
            self.history[4] = self.history[from];
        }
        best_all = best_all.max(self.score[4]);

        // State 3 <- {3, 2, 1}.
        let mut v = s3 + ctx.tp(t, 3, 3);
        let mut from = 3usize;
        let c = s2 + ctx.tp(t, 2, 3);
        if c > v {
            v = c;
            from = 2;
        }
        let c = s1 + ctx.tp(t, 1, 3);
        if c > v {
            v = c;
            from = 1;
        }
        self.score[3] = v.max(WORST_SCORE);
        if from != 3 {
            self.history[3] = self.history[from];
        }
        best_all = best_all.max(self.score[3]);

        // State 2 <- {2, 1, 0}.
        let mut v = s2 + ctx.tp(t, 2, 2);
        let mut from = 2usize;
        let c = s1 + ctx.tp(t, 1, 2);
        if c > v {
            v = c;
            from = 1;
        }
        let c = s0 + ctx.tp(t, 0, 2);
        if c > v {
            v = c;
            from = 0;
        }
        self.score[2] = v.max(WORST_SCORE);
        if from != 2 {
            self.history[2] = self.history[from];
        }
        best_all = best_all.max(self.score[2]);

        // State 1 <- {1, 0}.
        let mut v = s1 + ctx.tp(t, 1, 1);
        let mut from = 1usize;
        let c = s0 + ctx.tp(t, 0, 1);
        if c > v {
            v = c;
            from = 0;
        }
        self.score[1] = v.max(WORST_SCORE);
        if from != 1 {
            self.history[1] = self.history[from];
        }
        best_all = best_all.max(self.score[1]);

        // State 0: self-loop only.
        self.score[0] = (s0 + ctx.tp(t, 0, 0)).max(WORST_SCORE);
        best_all = best_all.max(self.score[0]);

        self.bestscore = best_all;
        best_all
    }

    fn eval_3st_lr(&mut self, ctx: &HmmContext) -> i32 {
        let t = self.tmatid;
        let s0 = self.s_in(ctx, 0);
        let s1 = self.s_in(ctx, 1);
        let s2 = self.s_in(ctx, 2);

        // Exit from states 2 and (if the skip arc exists) 1.
        let mut best = s2 + ctx.tp(t, 2, 3);
        let mut hist = self.history[2];
        if ctx.tp(t, 1, 3) > WORST_SCORE {
            let skip = s1 + ctx.tp(t, 1, 3);
            if skip > best {
                best = skip;
                hist = self.history[1];
            }
        }
        self.out_score = best.max(WORST_SCORE);
        self.out_history = hist;
        let mut best_all = self.out_score;

        // State 2 <- {2, 1, 0?}.
        let mut v = s2 + ctx.tp(t, 2, 2);
        let mut from = 2usize;
        let c = s1 + ctx.tp(t, 1, 2);
        if c > v {
            v = c;
            from = 1;
        }
        if ctx.tp(t, 0, 2) > WORST_SCORE {
            let c = s0 + ctx.tp(t, 0, 2);
            if c > v {
                v = c;
                from = 0;
            }
        }
        self.score[2] = v.max(WORST_SCORE);
        if from != 2 {
            self.history[2] = self.history[from];
        }
        best_all = best_all.max(self.score[2]);

        // State 1 <- {1, 0}.
        let mut v = s1 + ctx.tp(t, 1, 1);
        let mut from = 1usize;
        let c = s0 + ctx.tp(t, 0, 1);
        if c > v {
            v = c;
            from = 0;
        }
        self.score[1] = v.max(WORST_SCORE);
        if from != 1 {
            self.history[1] = self.history[from];
        }
        best_all = best_all.max(self.score[1]);

        self.score[0] = (s0 + ctx.tp(t, 0, 0)).max(WORST_SCORE);
        best_all = best_all.max(self.score[0]);

        self.bestscore = best_all;
        best_all
    }

    fn eval_5st_lr_mpx(&mut self, ctx: &HmmContext) -> i32 {
        self.eval_lr_mpx(ctx, 5)
    }

    fn eval_3st_lr_mpx(&mut self, ctx: &HmmContext) -> i32 {
        self.eval_lr_mpx(ctx, 3)
    }

    /// Left-to-right multiplex update. Identical score flow to the
    /// non-multiplex routines, with the winning predecessor's SSID slot
    /// carried along with its history.
    fn eval_lr_mpx(&mut self, ctx: &HmmContext, n: usize) -> i32 {
        let t = self.tmatid;
        let mut s_in = [WORST_SCORE; MAX_HMM_NSTATE];
        for (i, slot) in s_in.iter_mut().enumerate().take(n) {
            *slot = self.s_in(ctx, i);
        }

        let ssids: &mut Box<[Ssid]> = match &mut self.ssid {
            HmmSsid::Mpx(v) => v,
            HmmSsid::Single(_) => unreachable!("mpx eval on non-mpx HMM"),
        };

        // Exit from the top two states.
        let mut best = if ctx.tp(t, n - 1, n) > WORST_SCORE {
            s_in[n - 1] + ctx.tp(t, n - 1, n)
        } else {
            i32::MIN
        };
        let mut hist = self.history[n - 1];
        if ctx.tp(t, n - 2, n) > WORST_SCORE {
            let skip = s_in[n - 2] + ctx.tp(t, n - 2, n);
            if skip > best {
                best = skip;
                hist = self.history[n - 2];
            }
        }
        self.out_score = best.max(WORST_SCORE);
        self.out_history = hist;
        let mut best_all = self.out_score;

        for to in (0..n).rev() {
            let mut v = if ctx.tp(t, to, to) > WORST_SCORE {
                s_in[to] + ctx.tp(t, to, to)
            } else {
                i32::MIN
            };
            let mut from = to;
            let lo = to.saturating_sub(2);
            for f in (lo..to).rev() {
                if ctx.tp(t, f, to) > WORST_SCORE {
                    let c = s_in[f] + ctx.tp(t, f, to);
                    if c > v {
                        v = c;
                        from = f;
                    }
                }
            }
            self.score[to] = v.max(WORST_SCORE);
            if from != to {
                self.history[to] = self.history[from];
                ssids[to] = ssids[from];
            }
            best_all = best_all.max(self.score[to]);
        }

        self.bestscore = best_all;
        best_all
    }

    /// Reference implementation for any 1-skip Bakis topology up to
    /// MAX_HMM_NSTATE emitting states. The specialised routines must match
    /// this exactly.
    fn eval_anytopo(&mut self, ctx: &HmmContext) -> i32 {
        let t = self.tmatid;
        let n = self.n_emit as usize;
        let mut s_in = [WORST_SCORE; MAX_HMM_NSTATE];
        for (i, slot) in s_in.iter_mut().enumerate().take(n) {
            *slot = self.s_in(ctx, i);
        }

        // Exit state (no self-transition): nearest predecessor wins ties.
        let mut best = i32::MIN;
        let mut best_from: Option<usize> = None;
        for f in (n.saturating_sub(2)..n).rev() {
            if ctx.tp(t, f, n) > WORST_SCORE {
                let c = s_in[f] + ctx.tp(t, f, n);
                if c > best {
                    best = c;
                    best_from = Some(f);
                }
            }
        }
        self.out_score = best.max(WORST_SCORE);
        if let Some(f) = best_from {
            self.out_history = self.history[f];
        }
        let mut best_all = self.out_score;

        let is_mpx = self.is_mpx();
        for to in (0..n).rev() {
            let mut v = if ctx.tp(t, to, to) > WORST_SCORE {
                s_in[to] + ctx.tp(t, to, to)
            } else {
                i32::MIN
            };
            let mut from = to;
            for f in (to.saturating_sub(2)..to).rev() {
                if ctx.tp(t, f, to) > WORST_SCORE {
                    let c = s_in[f] + ctx.tp(t, f, to);
                    if c > v {
                        v = c;
                        from = f;
                    }
                }
            }
            self.score[to] = v.max(WORST_SCORE);
            if from != to {
                self.history[to] = self.history[from];
                if is_mpx {
                    if let HmmSsid::Mpx(v) = &mut self.ssid {
                        v[to] = v[from];
                    }
                }
            }
            best_all = best_all.max(self.score[to]);
        }

        self.bestscore = best_all;
        best_all
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logmath::LogMath;
    use crate::mdef::tests::toy_mdef;
    use crate::tmat::tests::toy_tmats;

    pub(crate) fn toy_ctx() -> HmmContext {
        let mdef = Arc::new(toy_mdef());
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let tmat = Arc::new(toy_tmats(&lmath));
        HmmContext::new(mdef, tmat).unwrap()
    }

    fn uniform_scores(ctx: &HmmContext, value: i32) -> Vec<i32> {
        vec![value; ctx.mdef().n_sen()]
    }

    #[test]
    fn inactive_hmm_stays_at_worst() {
        let mut ctx = toy_ctx();
        let mdef = ctx.mdef().clone();
        let scores = uniform_scores(&ctx, -100);
        ctx.set_senscore(&scores);
        let aa = 1; // AA in the toy model
        let mut hmm = Hmm::new(&ctx, false, mdef.ci_ssid(aa), mdef.ci_tmat(aa));
        let best = hmm.eval(&ctx);
        assert_eq!(best, WORST_SCORE);
        for i in 0..hmm.n_emit_state() {
            assert_eq!(hmm.score(i), WORST_SCORE);
        }
    }

    #[test]
    fn scores_flow_left_to_right() {
        let mut ctx = toy_ctx();
        let mdef = ctx.mdef().clone();
        let scores = uniform_scores(&ctx, -10);
        ctx.set_senscore(&scores);
        let aa = 1;
        let mut hmm = Hmm::new(&ctx, false, mdef.ci_ssid(aa), mdef.ci_tmat(aa));
        hmm.enter(0, 42, 0);
        let b1 = hmm.eval(&ctx);
        assert!(b1 > WORST_SCORE && b1 <= 0);
        assert_eq!(hmm.bestscore(), b1);
        // After one frame only states 0 and 1 can be active.
        assert!(hmm.score(1) > WORST_SCORE);
        assert_eq!(hmm.history(1), 42);
        assert_eq!(hmm.out_score(), WORST_SCORE);
        let _ = hmm.eval(&ctx);
        let _ = hmm.eval(&ctx);
        // By the third frame the exit state is reachable and carries the
        // entry history.
        assert!(hmm.out_score() > WORST_SCORE);
        assert_eq!(hmm.out_history(), 42);
        // Everything the invariant promises.
        let emit_best = (0..hmm.n_emit_state())
            .map(|i| hmm.score(i))
            .max()
            .unwrap();
        assert_eq!(hmm.bestscore(), emit_best.max(hmm.out_score()));
        assert!(hmm.bestscore() <= 0);
    }

    #[test]
    fn specialised_3st_matches_generic() {
        let mut ctx = toy_ctx();
        let mdef = ctx.mdef().clone();
        let aa = 1;
        // Vary senone scores so states see different likelihoods.
        let mut scores = uniform_scores(&ctx, -40);
        for (i, s) in scores.iter_mut().enumerate() {
            *s = -10 - (i as i32 * 7) % 60;
        }
        ctx.set_senscore(&scores);

        let mut fast = Hmm::new(&ctx, false, mdef.ci_ssid(aa), mdef.ci_tmat(aa));
        let mut slow = fast.clone();
        fast.enter(0, 7, 0);
        slow.enter(0, 7, 0);

        for _ in 0..6 {
            let a = fast.eval_3st_lr(&ctx);
            let b = slow.eval_anytopo(&ctx);
            assert_eq!(a, b);
            for i in 0..3 {
                assert_eq!(fast.score(i), slow.score(i));
                assert_eq!(fast.history(i), slow.history(i));
            }
            assert_eq!(fast.out_score(), slow.out_score());
            assert_eq!(fast.out_history(), slow.out_history());
        }
    }

    #[test]
    fn multiplex_specialised_matches_generic() {
        let mut ctx = toy_ctx();
        let mdef = ctx.mdef().clone();
        let b = 2;
        let mut scores = uniform_scores(&ctx, -40);
        for (i, s) in scores.iter_mut().enumerate() {
            *s = -5 - (i as i32 * 13) % 80;
        }
        ctx.set_senscore(&scores);

        let mut fast = Hmm::new(&ctx, true, mdef.ci_ssid(b), mdef.ci_tmat(b));
        let mut slow = fast.clone();
        fast.enter(0, 3, 0);
        slow.enter(0, 3, 0);

        for _ in 0..6 {
            let a = fast.eval_3st_lr_mpx(&ctx);
            let bscore = slow.eval_anytopo(&ctx);
            assert_eq!(a, bscore);
            for i in 0..3 {
                assert_eq!(fast.score(i), slow.score(i));
                assert_eq!(fast.ssid(i), slow.ssid(i));
            }
        }
    }

    #[test]
    fn multiplex_propagates_entry_ssid() {
        let mut ctx = toy_ctx();
        let mdef = ctx.mdef().clone();
        let b = 2;
        let scores = uniform_scores(&ctx, -10);
        ctx.set_senscore(&scores);

        let other_ssid = mdef.ci_ssid(3);
        let mut hmm = Hmm::new(&ctx, true, mdef.ci_ssid(b), mdef.ci_tmat(b));
        hmm.set_mpx_ssid0(other_ssid);
        hmm.enter(0, 1, 0);
        assert_eq!(hmm.ssid(1), NO_SSID);
        let _ = hmm.eval(&ctx);
        // State 1 inherited the entry SSID when 0 -> 1 won.
        assert_eq!(hmm.ssid(1), other_ssid);
        // clear() keeps slot 0, resets the rest.
        let _ = hmm.eval(&ctx);
        hmm.clear();
        assert_eq!(hmm.ssid(0), other_ssid);
        assert_eq!(hmm.ssid(1), NO_SSID);
        assert_eq!(hmm.frame(), -1);
    }

    #[test]
    fn normalize_shifts_finite_scores_only() {
        let mut ctx = toy_ctx();
        let mdef = ctx.mdef().clone();
        let scores = uniform_scores(&ctx, -10);
        ctx.set_senscore(&scores);
        let aa = 1;
        let mut hmm = Hmm::new(&ctx, false, mdef.ci_ssid(aa), mdef.ci_tmat(aa));
        hmm.enter(-50, NO_HIST, 0);
        let _ = hmm.eval(&ctx);
        let s1 = hmm.score(1);
        hmm.normalize(-30);
        assert_eq!(hmm.score(1), s1 + 30);
        assert_eq!(hmm.out_score(), WORST_SCORE);
    }

    #[test]
    fn enter_overrides_and_stamps_frame() {
        let ctx = toy_ctx();
        let mdef = ctx.mdef().clone();
        let mut hmm = Hmm::new(&ctx, false, mdef.ci_ssid(1), mdef.ci_tmat(1));
        hmm.enter(-123, 9, 17);
        assert_eq!(hmm.in_score(), -123);
        assert_eq!(hmm.in_history(), 9);
        assert_eq!(hmm.frame(), 17);
    }
}
