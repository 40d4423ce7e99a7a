//! Finite-state grammar search driver.
//!
//! Per frame: activate and score the senones of the live lexicon-tree
//! nodes, Viterbi-update their HMMs, prune at the HMM / phone / word beams,
//! propagate interior exits to children, turn leaf exits into history
//! entries, push those entries through the precomputed null closure, and
//! finally cross into the root nodes of the trees attached to each entry's
//! destination state, checking left/right context compatibility on the way.
//!
//! The hypothesis is a backtrace over history records from the best entry
//! that lands in a final state (or the best entry anywhere when partial
//! results are acceptable).
use std::sync::Arc;

use tracing::{info, warn};

use crate::acmod::Acmod;
use crate::config::DecoderConfig;
use crate::dict::{Dict, NO_WID};
use crate::error::{Error, Result};
use crate::hmm::HmmContext;
use crate::logmath::{LogMath, WORST_SCORE};
use crate::mdef::{Mdef, TriphoneTable};
use crate::search::{Search, Segment};
use crate::tmat::TmatSet;

pub mod history;
pub mod lextree;
pub mod model;

use history::{FsgHistory, NO_HIST};
use lextree::{CiMask, FsgLextree, NO_PNODE};
use model::WordFsg;

pub struct FsgSearch {
    dict: Arc<Dict>,
    mdef: Arc<Mdef>,
    tt: Arc<TriphoneTable>,
    hmmctx: HmmContext,
    fsg: WordFsg,
    lextree: FsgLextree,
    history: FsgHistory,

    beam_orig: i32,
    pbeam_orig: i32,
    wbeam_orig: i32,
    beam: i32,
    pbeam: i32,
    wbeam: i32,
    beam_factor: f32,
    maxhmmpf: usize,

    backtrace_from_final: bool,

    frame: i32,
    bestscore: i32,
    bpidx_start: i32,
    active: Vec<i32>,
    active_next: Vec<i32>,
}

impl FsgSearch {
    pub fn new(
        config: &DecoderConfig,
        dict: Arc<Dict>,
        mdef: Arc<Mdef>,
        tt: Arc<TriphoneTable>,
        lmath: Arc<LogMath>,
        tmat: Arc<TmatSet>,
        fsg: WordFsg,
    ) -> Result<Self> {
        let hmmctx = HmmContext::new(mdef.clone(), tmat)?;
        let wip = (lmath.log(config.wip) as f64 * config.lw as f64) as i32;
        let pip = (lmath.log(config.pip) as f64 * config.lw as f64) as i32;
        let lextree = FsgLextree::build(&fsg, &dict, &mdef, &tt, &hmmctx, wip, pip);
        let history = FsgHistory::new(fsg.n_state);
        let beam = lmath.log(config.beam);
        let pbeam = lmath.log(config.pbeam);
        let wbeam = lmath.log(config.wbeam);
        info!(
            "fsg search: {} pnodes, beam {} pbeam {} wbeam {} wip {} pip {}",
            lextree.n_pnode(),
            beam,
            pbeam,
            wbeam,
            wip,
            pip
        );
        Ok(FsgSearch {
            dict,
            mdef,
            tt,
            hmmctx,
            fsg,
            lextree,
            history,
            beam_orig: beam,
            pbeam_orig: pbeam,
            wbeam_orig: wbeam,
            beam,
            pbeam,
            wbeam,
            beam_factor: 1.0,
            maxhmmpf: if config.maxhmmpf == 0 {
                usize::MAX
            } else {
                config.maxhmmpf
            },
            backtrace_from_final: config.fsg_backtrace_from_final,
            frame: -1,
            bestscore: 0,
            bpidx_start: 0,
            active: Vec::new(),
            active_next: Vec::new(),
        })
    }

    fn sen_active(&self, acmod: &mut Acmod) {
        acmod.clear_active();
        for &p in &self.active {
            acmod.activate_hmm(&self.lextree.pnodes[p as usize].hmm);
        }
    }

    fn hmm_eval(&mut self) {
        let mut best = WORST_SCORE;
        if self.active.is_empty() {
            warn!("frame {}: no active HMM", self.frame);
        }
        let n = self.active.len();
        for &p in &self.active {
            let node = &mut self.lextree.pnodes[p as usize];
            debug_assert_eq!(node.hmm.frame(), self.frame);
            best = best.max(node.hmm.eval(&self.hmmctx));
        }
        self.bestscore = best;

        // Admission control: narrow the beams while too many HMMs are
        // active, restore them once the count falls back.
        if n > self.maxhmmpf {
            if self.beam_factor > 0.1 {
                self.beam_factor *= 0.9;
                self.beam = (self.beam_orig as f64 * self.beam_factor as f64) as i32;
                self.pbeam = (self.pbeam_orig as f64 * self.beam_factor as f64) as i32;
                self.wbeam = (self.wbeam_orig as f64 * self.beam_factor as f64) as i32;
            }
        } else {
            self.beam_factor = 1.0;
            self.beam = self.beam_orig;
            self.pbeam = self.pbeam_orig;
            self.wbeam = self.wbeam_orig;
        }
    }

    /// Transition a surviving interior node's exit into its children.
    fn pnode_trans(&mut self, p: i32) {
        let nf = self.frame + 1;
        let thresh = self.bestscore + self.beam;
        let (out, hist, mut child) = {
            let node = &self.lextree.pnodes[p as usize];
            (node.hmm.out_score(), node.hmm.out_history(), node.child)
        };
        while child != NO_PNODE {
            let (sibling, logprob, was_frame, in_score) = {
                let c = &self.lextree.pnodes[child as usize];
                (c.sibling, c.logprob, c.hmm.frame(), c.hmm.in_score())
            };
            let newscore = out + logprob;
            if newscore >= thresh && newscore > in_score {
                if was_frame < nf {
                    self.active_next.push(child);
                }
                self.lextree.pnodes[child as usize]
                    .hmm
                    .enter(newscore, hist, nf);
            }
            child = sibling;
        }
    }

    /// A leaf cleared the word beam: record the exit.
    fn pnode_exit(&mut self, p: i32) {
        let node = &self.lextree.pnodes[p as usize];
        let t = node.trans;
        debug_assert!(t != NO_PNODE);
        let trans = self.fsg.trans[t as usize];
        let wid = trans.wid;

        // Fillers, single-phone words and `</s>` model no right context;
        // their exit score applies to everything.
        let rc = if self.dict.is_filler(wid)
            || wid == self.dict.finish_wid()
            || self.dict.pron_len(wid) == 1
        {
            CiMask::all(self.mdef.n_ciphone())
        } else {
            node.ctxt.clone()
        };
        self.history.add(
            self.frame,
            trans.to,
            wid,
            node.hmm.out_score(),
            node.hmm.out_history(),
            node.ciphone,
            rc,
        );
    }

    fn prune_prop(&mut self) {
        let thresh = self.bestscore + self.beam;
        let pthresh = self.bestscore + self.pbeam;
        let wthresh = self.bestscore + self.wbeam;
        let nf = self.frame + 1;

        let active = std::mem::take(&mut self.active);
        for &p in &active {
            let (bestscore, was_frame, out, is_leaf) = {
                let node = &self.lextree.pnodes[p as usize];
                (
                    node.hmm.bestscore(),
                    node.hmm.frame(),
                    node.hmm.out_score(),
                    self.lextree.is_leaf(p),
                )
            };
            if bestscore < thresh {
                continue;
            }
            if was_frame == self.frame {
                self.lextree.pnodes[p as usize].hmm.set_frame(nf);
                self.active_next.push(p);
            }
            if !is_leaf {
                if out >= pthresh {
                    self.pnode_trans(p);
                }
            } else if out >= wthresh {
                self.pnode_exit(p);
            }
        }
        self.active = active;
    }

    /// Push this frame's new history entries through the null closure.
    fn null_prop(&mut self) {
        let thresh = self.bestscore + self.wbeam;
        let n = self.history.len() as i32;
        for idx in self.bpidx_start..n {
            let (state, score, frame, lc, rc) = {
                let e = self.history.entry(idx);
                (e.to_state, e.score, e.frame, e.lc, e.rc.clone())
            };
            for i in 0..self.fsg.null_closure[state as usize].len() {
                let (dest, prob) = self.fsg.null_closure[state as usize][i];
                let newscore = score + prob;
                if newscore >= thresh {
                    self.history
                        .add(frame, dest, NO_WID, newscore, idx, lc, rc.clone());
                }
            }
        }
    }

    /// Cross-word transitions into the root nodes of each entry's
    /// destination state.
    fn word_trans(&mut self) {
        let thresh = self.bestscore + self.beam;
        let nf = self.frame + 1;
        let n = self.history.len() as i32;

        for idx in self.bpidx_start..n {
            let (state, score, lc, rc) = {
                let e = self.history.entry(idx);
                (e.to_state, e.score, e.lc, e.rc.clone())
            };
            let mut root = self.lextree.roots[state as usize];
            while root != NO_PNODE {
                let (sibling, ciphone, second, logprob, lc_ok, was_frame, in_score) = {
                    let r = &self.lextree.pnodes[root as usize];
                    (
                        r.sibling,
                        r.ciphone,
                        r.second,
                        r.logprob,
                        r.ctxt.test(lc),
                        r.hmm.frame(),
                        r.hmm.in_score(),
                    )
                };
                // The entry must support the root's first phone as its
                // right context, and the root must admit the entry's final
                // phone as left context.
                if lc_ok && rc.test(ciphone) {
                    let newscore = score + logprob;
                    if newscore >= thresh && newscore > in_score {
                        if was_frame < nf {
                            self.active_next.push(root);
                        }
                        let r = &mut self.lextree.pnodes[root as usize];
                        if r.hmm.is_mpx() && second != crate::mdef::NO_PHONE {
                            let ssid = self.tt.ldiph_ssid(ciphone, second, lc);
                            r.hmm.set_mpx_ssid0(ssid);
                        }
                        r.hmm.enter(newscore, idx, nf);
                    }
                }
                root = sibling;
            }
        }
    }

    /// Deactivate HMMs that did not make it into the next frame and swap
    /// the active lists.
    fn flip_active(&mut self) {
        let nf = self.frame + 1;
        let active = std::mem::take(&mut self.active);
        for &p in &active {
            let node = &mut self.lextree.pnodes[p as usize];
            if node.hmm.frame() == self.frame {
                node.hmm.clear();
            } else {
                debug_assert_eq!(node.hmm.frame(), nf);
            }
        }
        self.active = std::mem::take(&mut self.active_next);
        self.frame = nf;
    }

    fn best_entry(&self) -> Option<i32> {
        let finals = |s: i32| self.fsg.is_final(s);
        match self.history.best_exit(finals, true) {
            Some(e) => Some(e),
            None => {
                if self.backtrace_from_final {
                    None
                } else {
                    self.history.best_exit(finals, false)
                }
            }
        }
    }
}

impl Search for FsgSearch {
    fn start(&mut self, _acmod: &mut Acmod) -> Result<()> {
        self.beam_factor = 1.0;
        self.beam = self.beam_orig;
        self.pbeam = self.pbeam_orig;
        self.wbeam = self.wbeam_orig;
        self.lextree.clear_all();
        self.active.clear();
        self.active_next.clear();
        self.history.reset();

        // Dummy entry leading into the start state, then its null closure,
        // then the first word entries.
        self.frame = -1;
        self.bestscore = 0;
        self.bpidx_start = 0;
        self.history.add(
            -1,
            self.fsg.start_state,
            NO_WID,
            0,
            NO_HIST,
            self.mdef.sil(),
            CiMask::all(self.mdef.n_ciphone()),
        );
        self.null_prop();
        self.word_trans();
        self.active = std::mem::take(&mut self.active_next);
        self.frame = 0;
        Ok(())
    }

    fn step(&mut self, acmod: &mut Acmod) -> Result<usize> {
        if !acmod.frame_available() {
            return Ok(0);
        }
        if !acmod.compallsen {
            self.sen_active(acmod);
        }
        let (frame, _best, _bestsen) = acmod
            .score_frame()
            .ok_or_else(|| Error::Logic("step called with no frame ready".into()))?;
        debug_assert_eq!(frame, self.frame);
        self.hmmctx.set_senscore(acmod.senone_scores());

        self.bpidx_start = self.history.len() as i32;
        self.hmm_eval();
        self.prune_prop();
        self.null_prop();
        self.word_trans();
        self.flip_active();
        Ok(1)
    }

    fn finish(&mut self, _acmod: &mut Acmod) -> Result<()> {
        let active = std::mem::take(&mut self.active);
        for &p in &active {
            self.lextree.pnodes[p as usize].hmm.clear();
        }
        let next = std::mem::take(&mut self.active_next);
        for &p in &next {
            self.lextree.pnodes[p as usize].hmm.clear();
        }
        info!(
            "fsg: {} frames, {} history entries",
            self.frame,
            self.history.len()
        );
        Ok(())
    }

    fn hyp(&mut self) -> Option<(String, i32)> {
        let best = self.best_entry()?;
        let score = self.history.entry(best).score;
        let words: Vec<&str> = self
            .history
            .backtrace(best)
            .into_iter()
            .filter_map(|i| {
                let e = self.history.entry(i);
                if e.wid == NO_WID || self.dict.is_filler(e.wid) || self.dict.is_hidden(e.wid) {
                    None
                } else {
                    Some(self.dict.base_str(e.wid))
                }
            })
            .collect();
        Some((words.join(" "), score))
    }

    fn seg(&mut self) -> Vec<Segment> {
        let Some(best) = self.best_entry() else {
            return Vec::new();
        };
        let chain = self.history.backtrace(best);
        let mut segs = Vec::new();
        let mut prev_frame = -1i32;
        for &i in &chain {
            let e = self.history.entry(i);
            if e.wid != NO_WID {
                segs.push(Segment {
                    word: self.dict.word_str(e.wid).to_string(),
                    sf: prev_frame + 1,
                    ef: e.frame,
                    ascr: e.score,
                    lscr: 0,
                    prob: 0.0,
                });
            }
            if e.frame >= 0 {
                prev_frame = e.frame;
            }
        }
        segs
    }
}
