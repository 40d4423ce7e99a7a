//! Flat-lexicon second pass.
//!
//! After the tree pass fills the backpointer table, this pass re-runs
//! Viterbi over a flat network restricted to the words that actually
//! appeared, with its own (wider) beams and language weight. Each word gets
//! a linear chain: a multiplex root for the first phone, one channel per
//! interior phone, then the right-context fanout of the final phone.
//! Single-phone words reuse the permanent root HMMs. Word exits feed the
//! same backpointer table, which is reset when the pass starts.
//!
//! Candidate successors for a word exiting at frame f are the words whose
//! first-pass start frames fall within `f +- max_sf_win`. Without a first
//! pass (fwdtree disabled) the expansion set is the whole LM vocabulary.
use tracing::info;

use crate::acmod::Acmod;
use crate::error::{Error, Result};
use crate::hmm::Hmm;
use crate::logmath::WORST_SCORE;
use crate::search::bptbl::NO_BP;

use super::ngram::{Chan, ChanInfo, FlatNode, NgramSearch, NO_CHAN};

impl NgramSearch {
    /// Expansion list covering every LM word; used when there is no tree
    /// pass to restrict the vocabulary.
    pub(crate) fn build_full_expansion_list(&mut self) {
        self.fwdflat_wordlist.clear();
        for wid in 0..self.dict.n_main_words() as i32 {
            if self.lm_known(wid) {
                self.fwdflat_wordlist.push(wid);
            }
        }
        let finish = self.dict.finish_wid();
        if self.lm_known(finish) {
            self.fwdflat_wordlist.push(finish);
        }
        self.expand_word_list = self.fwdflat_wordlist.clone();
    }

    /// Bucket the first-pass word exits by start frame and collect the
    /// vocabulary for the second pass.
    fn build_fwdflat_wordlist(&mut self) {
        if !self.do_fwdtree {
            return;
        }
        let n_frame = self.n_frame;
        self.frm_wordlist.clear();
        self.frm_wordlist.resize(n_frame.max(0) as usize + 1, Vec::new());

        for bp in 0..self.bptbl.len() as i32 {
            let (wid, ef, valid) = {
                let e = self.bptbl.entry(bp);
                (e.wid, e.frame, e.valid)
            };
            if !valid {
                continue;
            }
            let sf = self.bptbl.start_frame(bp);
            // Anything the LM cannot transition to stays out of the list.
            if self.dict.is_filler(wid) || wid == self.dict.start_wid() {
                continue;
            }
            let bucket = &mut self.frm_wordlist[sf as usize];
            match bucket.iter_mut().find(|n| n.wid == wid) {
                Some(node) => node.lef = node.lef.max(ef),
                None => bucket.push(FlatNode { wid, fef: ef, lef: ef }),
            }
        }

        // Drop words with too narrow an end-frame spread, and </s> entries
        // that do not actually reach the final frame.
        let min_ef = self.min_ef_width;
        let finish = self.dict.finish_wid();
        for bucket in &mut self.frm_wordlist {
            bucket.retain(|n| {
                n.lef - n.fef >= min_ef && (n.wid != finish || n.lef >= n_frame - 1)
            });
        }

        self.fwdflat_wordlist.clear();
        self.word_active.fill(false);
        for f in 0..self.frm_wordlist.len() {
            for i in 0..self.frm_wordlist[f].len() {
                let wid = self.frm_wordlist[f][i].wid;
                if !self.word_active[wid as usize] {
                    self.word_active[wid as usize] = true;
                    self.fwdflat_wordlist.push(wid);
                }
            }
        }
        self.word_active.fill(false);
        info!(
            "fwdflat: {} words from first pass",
            self.fwdflat_wordlist.len()
        );
    }

    /// Build the linear HMM chain for every multi-phone word in the list.
    fn build_fwdflat_chan(&mut self) {
        for i in 0..self.fwdflat_wordlist.len() {
            let wid = self.fwdflat_wordlist[i];
            let phones = self.dict.word(wid).phones.clone();
            if phones.len() == 1 {
                continue;
            }
            debug_assert_eq!(self.word_chan[wid as usize], NO_CHAN);

            // Right-context fanout first; it forms the chain tail.
            self.alloc_all_rc(wid);
            let mut head = self.word_chan[wid as usize];

            // Interior phones, last to second.
            for p in (1..phones.len() - 1).rev() {
                let ssid = self.mdef.phone_ssid(
                    phones[p],
                    phones[p - 1],
                    phones[p + 1],
                    crate::mdef::WordPos::Internal,
                );
                let hmm = Hmm::new(&self.hmmctx, false, ssid, self.mdef.ci_tmat(phones[p]));
                head = self.pool.alloc(Chan {
                    hmm,
                    next: head,
                    alt: NO_CHAN,
                    ciphone: phones[p],
                    info: ChanInfo::RcId(p as i32 + 1 - phones.len() as i32),
                });
            }

            // Multiplex root for the first phone.
            let (b, r) = (phones[0], phones[1]);
            let hmm = Hmm::new(
                &self.hmmctx,
                true,
                self.tt.ldiph_ssid(b, r, self.mdef.sil()),
                self.mdef.ci_tmat(b),
            );
            let root = self.pool.alloc(Chan {
                hmm,
                next: head,
                alt: NO_CHAN,
                ciphone: b,
                info: ChanInfo::FlatRoot { second: r },
            });
            self.word_chan[wid as usize] = root;
        }
    }

    pub(crate) fn fwdflat_start(&mut self) -> Result<()> {
        self.build_fwdflat_wordlist();
        self.build_fwdflat_chan();
        self.in_fwdflat = true;

        // The flat pass owns the backpointer table from here on.
        self.bptbl.reset();
        self.best_score = 0;
        self.renormalized = false;
        self.last_ltrans.fill((-1, 0));
        self.active_chan[0].clear();
        self.active_chan[1].clear();
        self.active_word[0].clear();
        self.active_word[1].clear();
        self.word_active.fill(false);

        for rh in &mut self.all_rhmm {
            rh.hmm.clear();
        }

        let start = self.dict.start_wid();
        let idx = self.word_rhmm[start as usize];
        if idx < 0 {
            return Err(Error::Logic("<s> has no single-phone HMM".into()));
        }
        self.all_rhmm[idx as usize].hmm.enter(0, NO_BP, 0);
        self.active_word[0].push(start);
        if !self.do_fwdtree {
            self.n_frame = 0;
        }
        Ok(())
    }

    pub(crate) fn fwdflat_step(&mut self, acmod: &mut Acmod) -> Result<()> {
        if !acmod.compallsen {
            self.fwdflat_sen_active(acmod);
        }
        let (frame, _best, _bestsen) = acmod
            .score_frame()
            .ok_or_else(|| Error::Logic("step called with no frame ready".into()))?;
        self.hmmctx.set_senscore(acmod.senone_scores());
        self.bptbl.mark_frame(frame);

        if self.best_score + 2 * self.beams_orig.beam < WORST_SCORE {
            info!(
                "renormalizing scores at frame {} (best {})",
                frame, self.best_score
            );
            self.fwdflat_renormalize(frame);
        }

        self.fwdflat_eval(frame);
        self.fwdflat_prune(frame)?;
        self.fwdflat_word_transition(frame)?;
        self.bptbl.clear_frame_handles(frame);

        let cf = (frame & 1) as usize;
        self.active_word[cf].clear();
        if !self.do_fwdtree {
            self.n_frame = frame + 1;
        } else {
            self.n_frame = self.n_frame.max(frame + 1);
        }
        Ok(())
    }

    pub(crate) fn fwdflat_finish(&mut self) -> Result<()> {
        // Tear the per-utterance network down.
        for i in 0..self.fwdflat_wordlist.len() {
            let wid = self.fwdflat_wordlist[i];
            if self.dict.pron_len(wid) > 1 && self.word_chan[wid as usize] != NO_CHAN {
                self.free_word_chan(wid);
            }
        }
        self.frm_wordlist.clear();
        self.word_active.fill(false);
        self.active_word[0].clear();
        self.active_word[1].clear();

        let cf = self.n_frame;
        self.bptbl.mark_frame(cf);
        info!("fwdflat: {} frames, {} word exits", cf, self.bptbl.len());
        Ok(())
    }

    /// Chain walker shared by activation and evaluation.
    fn fwdflat_sen_active(&mut self, acmod: &mut Acmod) {
        let frame = acmod.frame_idx();
        acmod.clear_active();
        let cf = (frame & 1) as usize;
        for i in 0..self.active_word[cf].len() {
            let wid = self.active_word[cf][i];
            if self.dict.pron_len(wid) == 1 {
                let rh = &self.all_rhmm[self.word_rhmm[wid as usize] as usize];
                if rh.hmm.frame() == frame {
                    acmod.activate_hmm(&rh.hmm);
                }
                continue;
            }
            let mut id = self.word_chan[wid as usize];
            while id != NO_CHAN {
                let c = self.pool.get(id);
                if c.hmm.frame() == frame {
                    acmod.activate_hmm(&c.hmm);
                }
                id = c.next;
            }
        }
    }

    fn fwdflat_eval(&mut self, frame: i32) {
        let mut best = WORST_SCORE;
        let cf = (frame & 1) as usize;
        let finish = self.dict.finish_wid();
        let words = std::mem::take(&mut self.active_word[cf]);
        for &wid in &words {
            if self.dict.pron_len(wid) == 1 {
                let rh = &mut self.all_rhmm[self.word_rhmm[wid as usize] as usize];
                if rh.hmm.frame() == frame {
                    let s = rh.hmm.eval(&self.hmmctx);
                    if wid != finish {
                        best = best.max(s);
                    }
                }
                continue;
            }
            let mut id = self.word_chan[wid as usize];
            let mut first = true;
            while id != NO_CHAN {
                let c = self.pool.get_mut(id);
                if c.hmm.frame() == frame {
                    let s = c.hmm.eval(&self.hmmctx);
                    if !(first && wid == finish) {
                        best = best.max(s);
                    }
                }
                first = false;
                id = c.next;
            }
        }
        self.active_word[cf] = words;
        self.best_score = best;
    }

    fn fwdflat_prune(&mut self, frame: i32) -> Result<()> {
        let thresh = self.best_score + self.beams.fwdflatbeam;
        let wordthresh = self.best_score + self.beams.fwdflatwbeam;
        let nf = frame + 1;
        let nf_buf = (nf & 1) as usize;
        let cf_buf = (frame & 1) as usize;
        self.word_active.fill(false);

        let words = std::mem::take(&mut self.active_word[cf_buf]);
        for &wid in &words {
            let mut alive = false;

            if self.dict.pron_len(wid) == 1 {
                let rh_idx = self.word_rhmm[wid as usize] as usize;
                let (active, bestscore, out, hist) = {
                    let rh = &self.all_rhmm[rh_idx];
                    (
                        rh.hmm.frame() == frame,
                        rh.hmm.bestscore(),
                        rh.hmm.out_score(),
                        rh.hmm.out_history(),
                    )
                };
                let entered = self.all_rhmm[rh_idx].hmm.frame() == nf;
                if active || entered {
                    if bestscore > thresh {
                        self.all_rhmm[rh_idx].hmm.set_frame(nf);
                        alive = true;
                        if out > wordthresh {
                            self.bptbl
                                .save(frame, wid, out, hist, 0, &self.dict, &self.tt)?;
                        }
                    } else if !entered {
                        self.all_rhmm[rh_idx].hmm.clear_scores();
                    } else {
                        alive = true;
                    }
                }
                if alive && !self.word_active[wid as usize] {
                    self.word_active[wid as usize] = true;
                    self.active_word[nf_buf].push(wid);
                }
                continue;
            }

            let mut id = self.word_chan[wid as usize];
            while id != NO_CHAN {
                let (next, was_frame, bestscore, out, hist, info) = {
                    let c = self.pool.get(id);
                    (
                        c.next,
                        c.hmm.frame(),
                        c.hmm.bestscore(),
                        c.hmm.out_score(),
                        c.hmm.out_history(),
                        c.info,
                    )
                };
                if was_frame == frame || was_frame == nf {
                    if bestscore > thresh {
                        self.pool.get_mut(id).hmm.set_frame(nf);
                        alive = true;

                        let is_rc = matches!(info, ChanInfo::RcId(r) if r >= 0);
                        if is_rc {
                            // Final-phone channel: word exit.
                            if out > wordthresh {
                                let rc = match info {
                                    ChanInfo::RcId(r) => r as usize,
                                    _ => 0,
                                };
                                self.bptbl
                                    .save(frame, wid, out, hist, rc, &self.dict, &self.tt)?;
                            }
                        } else {
                            // Root or interior: push into the next chain
                            // element(s).
                            let newscore = out + self.pip;
                            if newscore > thresh && next != NO_CHAN {
                                self.enter_chain(next, newscore, hist, frame);
                            }
                        }
                    } else if was_frame != nf {
                        self.pool.get_mut(id).hmm.clear_scores();
                    } else {
                        // Entered for the next frame but not yet scored.
                        alive = true;
                    }
                }
                id = next;
            }
            if alive && !self.word_active[wid as usize] {
                self.word_active[wid as usize] = true;
                self.active_word[nf_buf].push(wid);
            }
        }
        self.active_word[cf_buf] = words;
        Ok(())
    }

    /// Enter the next chain element; when it is the start of the
    /// right-context fanout, enter every channel in it.
    fn enter_chain(&mut self, first: i32, newscore: i32, hist: i32, frame: i32) {
        let nf = frame + 1;
        let fanout = matches!(self.pool.get(first).info, ChanInfo::RcId(r) if r >= 0);
        let mut id = first;
        loop {
            let (next, was_frame, in_score) = {
                let c = self.pool.get(id);
                (c.next, c.hmm.frame(), c.hmm.in_score())
            };
            if was_frame < frame || in_score < newscore {
                self.pool.get_mut(id).hmm.enter(newscore, hist, nf);
            }
            if !fanout {
                break;
            }
            if next == NO_CHAN {
                break;
            }
            id = next;
        }
    }

    /// Successor words whose first-pass start frames fall inside the
    /// window around `frame`.
    fn get_expand_wordlist(&mut self, frame: i32) {
        if !self.do_fwdtree {
            // Full vocabulary, precomputed.
            return;
        }
        let sf = (frame - self.max_sf_win).max(0) as usize;
        let ef = ((frame + self.max_sf_win) as usize).min(self.frm_wordlist.len());
        self.expand_word_flag.fill(false);
        self.expand_word_list.clear();
        for f in sf..ef {
            for i in 0..self.frm_wordlist[f].len() {
                let wid = self.frm_wordlist[f][i].wid;
                if !self.expand_word_flag[wid as usize] {
                    self.expand_word_flag[wid as usize] = true;
                    self.expand_word_list.push(wid);
                }
            }
        }
    }

    fn fwdflat_word_transition(&mut self, frame: i32) -> Result<()> {
        let cf = frame;
        let nf = frame + 1;
        let thresh = self.best_score + self.beams.fwdflatbeam;
        let lwf = self.fwdflatlw;
        let sil_ci = self.mdef.sil();
        let mut best_silrc_score = WORST_SCORE;
        let mut best_silrc_bp = NO_BP;

        self.get_expand_wordlist(frame);

        for bp in self.bptbl.frame_entries(frame) {
            let (wid, valid) = {
                let e = self.bptbl.entry(bp);
                (e.wid, e.valid)
            };
            if !valid || wid == self.dict.finish_wid() {
                continue;
            }
            let lc = self.dict.last_phone(wid);

            for i in 0..self.expand_word_list.len() {
                let w = self.expand_word_list[i];
                let b = self.dict.first_phone(w);
                let start = self.bptbl.rc_score(bp, b, &self.tt);
                if start <= WORST_SCORE {
                    continue;
                }
                let lscr = self.cached_lm_score(w, bp, lwf);
                if lscr <= WORST_SCORE / 2 {
                    continue;
                }
                let newscore = start + lscr + self.pip;
                if newscore <= thresh {
                    continue;
                }
                self.enter_flat_word(w, newscore, bp, lc, cf, nf);
            }

            // Track the best exit whose right context is silence.
            let sil_score = self.bptbl.rc_score(bp, sil_ci, &self.tt);
            if sil_score > best_silrc_score {
                best_silrc_score = sil_score;
                best_silrc_bp = bp;
            }
        }

        // Silence and filler transitions.
        if best_silrc_bp != NO_BP {
            let lc = {
                let e = self.bptbl.entry(best_silrc_bp);
                self.dict.last_phone(e.wid)
            };
            let sil = self.dict.silence_wid();
            for wid in sil..self.dict.n_words() as i32 {
                if self.dict.pron_len(wid) != 1 {
                    continue;
                }
                let pen = if wid == sil { self.silpen } else { self.fillpen };
                let newscore = best_silrc_score + pen;
                if newscore > thresh && newscore > WORST_SCORE {
                    self.enter_flat_word(wid, newscore, best_silrc_bp, lc, cf, nf);
                }
            }
        }

        // Words that did not survive into the next frame lose their entry
        // state.
        let cf_buf = (frame & 1) as usize;
        let words = std::mem::take(&mut self.active_word[cf_buf]);
        for &wid in &words {
            if self.dict.pron_len(wid) == 1 {
                let rh = &mut self.all_rhmm[self.word_rhmm[wid as usize] as usize];
                if rh.hmm.frame() == cf {
                    rh.hmm.clear_scores();
                }
            } else if self.word_chan[wid as usize] != NO_CHAN {
                let id = self.word_chan[wid as usize];
                let c = self.pool.get_mut(id);
                if c.hmm.frame() == cf {
                    c.hmm.clear_scores();
                }
            }
        }
        self.active_word[cf_buf] = words;
        Ok(())
    }

    /// Enter a word's first HMM, fixing the multiplex left context.
    fn enter_flat_word(
        &mut self,
        wid: i32,
        newscore: i32,
        bp: i32,
        lc: crate::mdef::PhoneId,
        cf: i32,
        nf: i32,
    ) {
        let nf_buf = (nf & 1) as usize;
        if self.dict.pron_len(wid) == 1 {
            let rh = &mut self.all_rhmm[self.word_rhmm[wid as usize] as usize];
            if rh.hmm.frame() < cf || rh.hmm.in_score() < newscore {
                rh.hmm.enter(newscore, bp, nf);
                if !self.word_active[wid as usize] {
                    self.word_active[wid as usize] = true;
                    self.active_word[nf_buf].push(wid);
                }
            }
            return;
        }
        let root = self.word_chan[wid as usize];
        if root == NO_CHAN {
            return;
        }
        let (second, was_frame, in_score) = {
            let c = self.pool.get(root);
            let second = match c.info {
                ChanInfo::FlatRoot { second } => second,
                _ => return,
            };
            (second, c.hmm.frame(), c.hmm.in_score())
        };
        if was_frame < cf || in_score < newscore {
            let b = self.dict.first_phone(wid);
            let ssid = self.tt.ldiph_ssid(b, second, lc);
            let c = self.pool.get_mut(root);
            c.hmm.set_mpx_ssid0(ssid);
            c.hmm.enter(newscore, bp, nf);
            if !self.word_active[wid as usize] {
                self.word_active[wid as usize] = true;
                self.active_word[nf_buf].push(wid);
            }
        }
    }

    fn fwdflat_renormalize(&mut self, frame: i32) {
        let norm = self.best_score;
        let cf = (frame & 1) as usize;
        let words = std::mem::take(&mut self.active_word[cf]);
        for &wid in &words {
            if self.dict.pron_len(wid) == 1 {
                let rh = &mut self.all_rhmm[self.word_rhmm[wid as usize] as usize];
                if rh.hmm.frame() == frame {
                    rh.hmm.normalize(norm);
                }
                continue;
            }
            let mut id = self.word_chan[wid as usize];
            while id != NO_CHAN {
                let c = self.pool.get_mut(id);
                if c.hmm.frame() == frame {
                    c.hmm.normalize(norm);
                }
                id = c.next;
            }
        }
        self.active_word[cf] = words;
        self.best_score = 0;
        self.renormalized = true;
    }
}
