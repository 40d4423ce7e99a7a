//! Shared state of the N-gram searches. The lexicon-tree first pass and the
//! flat-lexicon second pass live in sibling modules and operate on this
//! struct; they share the channel pool, the backpointer table, the language
//! model and the beam set.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::acmod::Acmod;
use crate::config::DecoderConfig;
use crate::dict::{Dict, NO_WID};
use crate::error::Result;
use crate::hmm::{Hmm, HmmContext};
use crate::lattice::Lattice;
use crate::lm::{LangModel, WidMap, NO_LMWID};
use crate::logmath::{LogMath, WORST_SCORE};
use crate::mdef::{Mdef, PhoneId, TriphoneTable, NO_PHONE};
use crate::search::bptbl::{BpTable, NO_BP};
use crate::search::{Search, Segment};

pub(crate) const NO_CHAN: i32 = -1;

/// What a pooled channel is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChanInfo {
    /// Tree-internal node: head of the homophone-linked list of words whose
    /// penultimate phone ends here (NO_WID when none).
    Penult(i32),
    /// Word-final channel: index into the word's right-context set.
    RcId(i32),
    /// Flat-search word-initial channel; carries the second phone so entry
    /// can pick the left-context senone sequence.
    FlatRoot { second: PhoneId },
}

#[derive(Debug)]
pub(crate) struct Chan {
    pub hmm: Hmm,
    /// First child (tree) / next chain element (flat), NO_CHAN if none.
    pub next: i32,
    /// Next sibling sharing the same parent, NO_CHAN if none.
    pub alt: i32,
    pub ciphone: PhoneId,
    pub info: ChanInfo,
}

/// Free-list pool; channels are referenced by dense indices everywhere.
#[derive(Debug, Default)]
pub(crate) struct ChanPool {
    chans: Vec<Option<Chan>>,
    free: Vec<i32>,
}

impl ChanPool {
    pub fn alloc(&mut self, chan: Chan) -> i32 {
        match self.free.pop() {
            Some(id) => {
                self.chans[id as usize] = Some(chan);
                id
            }
            None => {
                self.chans.push(Some(chan));
                (self.chans.len() - 1) as i32
            }
        }
    }

    pub fn release(&mut self, id: i32) {
        debug_assert!(self.chans[id as usize].is_some());
        self.chans[id as usize] = None;
        self.free.push(id);
    }

    #[inline]
    pub fn get(&self, id: i32) -> &Chan {
        self.chans[id as usize].as_ref().expect("stale channel id")
    }

    #[inline]
    pub fn get_mut(&mut self, id: i32) -> &mut Chan {
        self.chans[id as usize].as_mut().expect("stale channel id")
    }

    pub fn clear(&mut self) {
        self.chans.clear();
        self.free.clear();
    }
}

/// Root of a lexicon tree (or a permanently allocated single-phone word).
#[derive(Debug)]
pub(crate) struct RootChan {
    pub hmm: Hmm,
    /// First phone.
    pub ciphone: PhoneId,
    /// Second phone of the words rooted here (NO_PHONE for single-phone
    /// words).
    pub second: PhoneId,
    /// Words of length two rooted here (head of homophone chain).
    pub penult_phn_wid: i32,
    /// First child channel.
    pub next: i32,
}

/// Candidate for the transition into a word's final phone.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cand {
    pub wid: i32,
    pub score: i32,
    pub bp: i32,
}

/// Best word exit this frame reaching a given first CI phone.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BestBp {
    pub score: i32,
    pub bp: i32,
    /// Final CI phone of that exit (left context for the entered word).
    pub lc: PhoneId,
}

impl BestBp {
    pub const NONE: BestBp = BestBp {
        score: WORST_SCORE,
        bp: NO_BP,
        lc: NO_PHONE,
    };
}

/// Per-frame word interval collected for the flat pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlatNode {
    pub wid: i32,
    pub fef: i32,
    pub lef: i32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Beams {
    pub beam: i32,
    pub pbeam: i32,
    pub wbeam: i32,
    pub lpbeam: i32,
    pub lponlybeam: i32,
    pub fwdflatbeam: i32,
    pub fwdflatwbeam: i32,
}

impl Beams {
    fn scaled(&self, f: f32) -> Beams {
        let s = |b: i32| (b as f64 * f as f64) as i32;
        Beams {
            beam: s(self.beam),
            pbeam: s(self.pbeam),
            wbeam: s(self.wbeam),
            lpbeam: s(self.lpbeam),
            lponlybeam: s(self.lponlybeam),
            fwdflatbeam: s(self.fwdflatbeam),
            fwdflatwbeam: s(self.fwdflatwbeam),
        }
    }
}

pub struct NgramSearch {
    pub(crate) dict: Arc<Dict>,
    pub(crate) mdef: Arc<Mdef>,
    pub(crate) tt: Arc<TriphoneTable>,
    pub(crate) lmath: Arc<LogMath>,
    pub(crate) lm: Arc<dyn LangModel>,
    pub(crate) widmap: WidMap,
    pub(crate) hmmctx: HmmContext,

    pub(crate) beams_orig: Beams,
    pub(crate) beams: Beams,
    pub(crate) beam_factor: f32,
    pub(crate) maxhmmpf: usize,
    pub(crate) maxwpf: usize,
    pub(crate) wip: i32,
    pub(crate) pip: i32,
    pub(crate) silpen: i32,
    pub(crate) fillpen: i32,
    pub(crate) lw: f32,
    pub(crate) fwdflatlw: f32,
    pub(crate) bestpathlw: f32,
    pub(crate) min_ef_width: i32,
    pub(crate) max_sf_win: i32,
    pub(crate) do_fwdtree: bool,
    pub(crate) do_fwdflat: bool,
    pub(crate) do_bestpath: bool,

    pub(crate) bptbl: BpTable,
    pub(crate) pool: ChanPool,

    // Lexicon tree.
    pub(crate) root_chan: Vec<RootChan>,
    pub(crate) rchan_map: HashMap<(PhoneId, PhoneId), usize>,
    pub(crate) homophone_set: Vec<i32>,
    /// Single-phone word ids: LM words first, then `</s>` and fillers.
    pub(crate) single_phone_wid: Vec<i32>,
    pub(crate) n_1ph_lm_words: usize,
    /// wid -> index into `all_rhmm` for single-phone words, else -1.
    pub(crate) word_rhmm: Vec<i32>,
    pub(crate) all_rhmm: Vec<RootChan>,
    /// wid -> head of last-phone (or flat-chain) channels.
    pub(crate) word_chan: Vec<i32>,

    pub(crate) active_chan: [Vec<i32>; 2],
    pub(crate) active_word: [Vec<i32>; 2],
    pub(crate) word_active: Vec<bool>,

    pub(crate) best_score: i32,
    pub(crate) renormalized: bool,
    /// Frames processed by the pass that filled the backpointer table.
    pub(crate) n_frame: i32,

    /// Cached word LM score for the current start frame: (sf, lscr).
    pub(crate) last_ltrans: Vec<(i32, i32)>,
    pub(crate) lastphn_cand: Vec<Cand>,
    pub(crate) bestbp_rc: Vec<BestBp>,

    // Flat pass state.
    pub(crate) frm_wordlist: Vec<Vec<FlatNode>>,
    pub(crate) fwdflat_wordlist: Vec<i32>,
    pub(crate) expand_word_flag: Vec<bool>,
    pub(crate) expand_word_list: Vec<i32>,
    pub(crate) in_fwdflat: bool,

    pub(crate) dag: Option<Lattice>,
}

impl NgramSearch {
    pub fn new(
        config: &DecoderConfig,
        dict: Arc<Dict>,
        mdef: Arc<Mdef>,
        tt: Arc<TriphoneTable>,
        lmath: Arc<LogMath>,
        tmat: Arc<crate::tmat::TmatSet>,
        lm: Arc<dyn LangModel>,
    ) -> Result<Self> {
        let hmmctx = HmmContext::new(mdef.clone(), tmat)?;
        let widmap = WidMap::build(&dict, lm.as_ref());
        let n_words = dict.n_words();

        let beams = Beams {
            beam: lmath.log(config.beam),
            pbeam: lmath.log(config.pbeam),
            wbeam: lmath.log(config.wbeam),
            lpbeam: lmath.log(config.lpbeam),
            lponlybeam: lmath.log(config.lponlybeam),
            fwdflatbeam: lmath.log(config.fwdflatbeam),
            fwdflatwbeam: lmath.log(config.fwdflatwbeam),
        };
        let pip = lmath.log(config.pip);
        let wip = lmath.log(config.wip);
        let silpen = pip + lmath.log(config.silprob);
        let fillpen = pip + lmath.log(config.fillprob);
        info!(
            "ngram search: beam {} pbeam {} wbeam {} wip {} pip {}",
            beams.beam, beams.pbeam, beams.wbeam, wip, pip
        );

        let mut ngs = NgramSearch {
            dict,
            mdef,
            tt,
            lmath,
            lm,
            widmap,
            hmmctx,
            beams_orig: beams,
            beams,
            beam_factor: 1.0,
            maxhmmpf: if config.maxhmmpf == 0 { usize::MAX } else { config.maxhmmpf },
            maxwpf: if config.maxwpf == 0 { usize::MAX } else { config.maxwpf },
            wip,
            pip,
            silpen,
            fillpen,
            lw: config.lw,
            fwdflatlw: config.fwdflatlw,
            bestpathlw: config.bestpathlw,
            min_ef_width: config.fwdflatefwid,
            max_sf_win: config.fwdflatsfwin,
            do_fwdtree: config.fwdtree,
            do_fwdflat: config.fwdflat,
            do_bestpath: config.bestpath,
            bptbl: BpTable::new(n_words, config.latsize),
            pool: ChanPool::default(),
            root_chan: Vec::new(),
            rchan_map: HashMap::new(),
            homophone_set: vec![NO_WID; n_words],
            single_phone_wid: Vec::new(),
            n_1ph_lm_words: 0,
            word_rhmm: vec![-1; n_words],
            all_rhmm: Vec::new(),
            word_chan: vec![NO_CHAN; n_words],
            active_chan: [Vec::new(), Vec::new()],
            active_word: [Vec::new(), Vec::new()],
            word_active: vec![false; n_words],
            best_score: 0,
            renormalized: false,
            n_frame: 0,
            last_ltrans: vec![(-1, 0); n_words],
            lastphn_cand: Vec::new(),
            bestbp_rc: Vec::new(),
            frm_wordlist: Vec::new(),
            fwdflat_wordlist: Vec::new(),
            expand_word_flag: vec![false; n_words],
            expand_word_list: Vec::new(),
            in_fwdflat: false,
            dag: None,
        };

        ngs.init_single_phone_words()?;
        if ngs.do_fwdtree {
            ngs.create_search_tree()?;
        }
        if !ngs.do_fwdtree && ngs.do_fwdflat {
            ngs.build_full_expansion_list();
        }
        Ok(ngs)
    }

    /// Permanently allocate root HMMs for every single-phone word; both
    /// passes reuse them.
    fn init_single_phone_words(&mut self) -> Result<()> {
        for wid in 0..self.dict.n_words() as i32 {
            if self.dict.pron_len(wid) != 1 {
                continue;
            }
            let ci = self.dict.first_phone(wid);
            let hmm = Hmm::new(
                &self.hmmctx,
                true,
                self.mdef.ci_ssid(ci),
                self.mdef.ci_tmat(ci),
            );
            self.word_rhmm[wid as usize] = self.all_rhmm.len() as i32;
            self.all_rhmm.push(RootChan {
                hmm,
                ciphone: ci,
                second: NO_PHONE,
                penult_phn_wid: NO_WID,
                next: NO_CHAN,
            });
        }
        Ok(())
    }

    /// Weighted trigram score with the word-insertion penalty folded in.
    pub(crate) fn lm_trans_score(&self, wid: i32, real: i32, prev_real: i32, lw: f32) -> i32 {
        let w3 = self.widmap.get(wid);
        if w3 == NO_LMWID {
            return WORST_SCORE;
        }
        let raw = self
            .lm
            .tg_score(w3, self.widmap.get(real), self.widmap.get(prev_real));
        ((raw as f64 * lw as f64) as i32).max(WORST_SCORE) + self.wip
    }

    /// Same, cached per (word, start frame): repeated transitions to the
    /// same word within a frame cost one lookup.
    pub(crate) fn cached_lm_score(&mut self, wid: i32, bp: i32, lw: f32) -> i32 {
        let (real, prev_real, sf) = if bp == NO_BP {
            (NO_WID, NO_WID, 0)
        } else {
            let e = self.bptbl.entry(bp);
            (e.real_wid, e.prev_real_wid, e.frame + 1)
        };
        let cached = self.last_ltrans[wid as usize];
        if cached.0 == sf {
            return cached.1;
        }
        let lscr = self.lm_trans_score(wid, real, prev_real, lw);
        self.last_ltrans[wid as usize] = (sf, lscr);
        lscr
    }

    /// Apply the admission-control beam scaling for the coming frames.
    pub(crate) fn update_beam_factor(&mut self, n_active_hmm: usize) {
        if n_active_hmm > self.maxhmmpf {
            if self.beam_factor > 0.1 {
                self.beam_factor *= 0.9;
                self.beams = self.beams_orig.scaled(self.beam_factor);
            }
        } else if self.beam_factor != 1.0 {
            self.beam_factor = 1.0;
            self.beams = self.beams_orig;
        }
    }

    /// Allocate the right-context fanout channels for a word's final phone,
    /// one channel per distinct senone sequence.
    pub(crate) fn alloc_all_rc(&mut self, wid: i32) {
        debug_assert!(self.word_chan[wid as usize] == NO_CHAN);
        let w = self.dict.word(wid);
        let n = w.phones.len();
        debug_assert!(n > 1);
        let b = w.phones[n - 1];
        let l = w.phones[n - 2];
        let ciphone = b;
        let tmat = self.mdef.ci_tmat(b);
        let ssids = self.tt.rc_set(b, l).ssid.clone();
        let mut head = NO_CHAN;
        for (rc_id, &ssid) in ssids.iter().enumerate().rev() {
            let hmm = Hmm::new(&self.hmmctx, false, ssid, tmat);
            let id = self.pool.alloc(Chan {
                hmm,
                next: head,
                alt: NO_CHAN,
                ciphone,
                info: ChanInfo::RcId(rc_id as i32),
            });
            head = id;
        }
        self.word_chan[wid as usize] = head;
    }

    /// Free a word's channel chain back into the pool.
    pub(crate) fn free_word_chan(&mut self, wid: i32) {
        let mut id = self.word_chan[wid as usize];
        while id != NO_CHAN {
            let next = self.pool.get(id).next;
            self.pool.release(id);
            id = next;
        }
        self.word_chan[wid as usize] = NO_CHAN;
    }

    /// Decompose every backpointer entry's path score into acoustic and
    /// language parts. `lwf` is the weight the decomposition should assume.
    pub(crate) fn compute_seg_scores(&mut self, lwf: f32) {
        for bp in 0..self.bptbl.len() as i32 {
            let (pred, wid, score) = {
                let e = self.bptbl.entry(bp);
                (e.bp, e.wid, e.score)
            };
            if pred == NO_BP {
                let e = self.bptbl.entry_mut(bp);
                e.ascr = score;
                e.lscr = 0;
                continue;
            }
            let first_ci = self.dict.first_phone(wid);
            let start_score = self.bptbl.rc_score(pred, first_ci, &self.tt);
            let lscr = if wid == self.dict.silence_wid() {
                self.silpen
            } else if self.dict.is_filler(wid) {
                self.fillpen
            } else {
                let (real, prev_real) = {
                    let p = self.bptbl.entry(pred);
                    (p.real_wid, p.prev_real_wid)
                };
                self.lm_trans_score(wid, real, prev_real, lwf)
            };
            let e = self.bptbl.entry_mut(bp);
            e.lscr = lscr;
            e.ascr = score - start_score - lscr;
        }
    }

    /// Hypothesis from the backpointer table: the words on the backtrace of
    /// the best exit, fillers and sentence markers dropped.
    fn bp_hyp(&self) -> Option<(String, i32)> {
        let (bp, score) = self.bptbl.find_exit(self.n_frame - 1)?;
        let words: Vec<&str> = self
            .bptbl
            .backtrace(bp)
            .into_iter()
            .filter(|&b| {
                let wid = self.bptbl.entry(b).wid;
                !self.dict.is_filler(wid) && !self.dict.is_hidden(wid)
            })
            .map(|b| self.dict.base_str(self.bptbl.entry(b).wid))
            .collect();
        Some((words.join(" "), score))
    }

    fn bp_seg(&self) -> Vec<Segment> {
        let Some((bp, _)) = self.bptbl.find_exit(self.n_frame - 1) else {
            return Vec::new();
        };
        self.bptbl
            .backtrace(bp)
            .into_iter()
            .map(|b| {
                let e = self.bptbl.entry(b);
                Segment {
                    word: self.dict.word_str(e.wid).to_string(),
                    sf: self.bptbl.start_frame(b),
                    ef: e.frame,
                    ascr: e.ascr,
                    lscr: e.lscr,
                    prob: 0.0,
                }
            })
            .collect()
    }

    pub fn lattice(&self) -> Option<&Lattice> {
        self.dag.as_ref()
    }

    pub fn take_lattice(&mut self) -> Option<Lattice> {
        self.dag.take()
    }

    /// Words-known check used by the tree builder and the flat word list.
    pub(crate) fn lm_known(&self, wid: i32) -> bool {
        self.widmap.known(wid)
    }
}

impl Search for NgramSearch {
    fn start(&mut self, _acmod: &mut Acmod) -> Result<()> {
        self.dag = None;
        self.beam_factor = 1.0;
        self.beams = self.beams_orig;
        if self.do_fwdtree {
            self.fwdtree_start()
        } else {
            self.fwdflat_start()
        }
    }

    fn step(&mut self, acmod: &mut Acmod) -> Result<usize> {
        if !acmod.frame_available() {
            return Ok(0);
        }
        if self.in_fwdflat {
            self.fwdflat_step(acmod)?;
        } else {
            self.fwdtree_step(acmod)?;
        }
        Ok(1)
    }

    fn finish(&mut self, acmod: &mut Acmod) -> Result<()> {
        if self.in_fwdflat {
            self.fwdflat_finish()?;
        } else {
            self.fwdtree_finish()?;

            if self.do_fwdflat {
                // Second pass over the same utterance.
                acmod.rewind();
                self.fwdflat_start()?;
                while self.step(acmod)? > 0 {}
                self.fwdflat_finish()?;
            }
        }

        if self.do_bestpath {
            // The lattice wants the decomposition under the bestpath weight.
            self.compute_seg_scores(self.bestpathlw);
            match Lattice::build(self) {
                Ok(dag) => self.dag = Some(dag),
                Err(e) => {
                    warn!("lattice construction failed: {e}");
                    self.dag = None;
                }
            }
        }
        let lwf = if self.do_fwdflat { self.fwdflatlw } else { self.lw };
        self.compute_seg_scores(lwf);
        Ok(())
    }

    fn hyp(&mut self) -> Option<(String, i32)> {
        if let Some(dag) = &mut self.dag {
            if let Some(r) = dag.bestpath_hyp() {
                return Some(r);
            }
        }
        self.bp_hyp()
    }

    fn seg(&mut self) -> Vec<Segment> {
        if let Some(dag) = &mut self.dag {
            let segs = dag.bestpath_seg();
            if !segs.is_empty() {
                return segs;
            }
        }
        self.bp_seg()
    }
}
