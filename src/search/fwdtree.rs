//! Lexicon-tree Viterbi pass.
//!
//! Pronunciations of all LM words are arranged in a phonetic prefix tree.
//! Root channels are keyed by the first-phone diphone (first and second
//! phone) and hold multiplex HMMs so the left context of an incoming word
//! transition can change while the HMM is alive. Interior channels factor
//! shared prefixes; the final phone of every word is excluded from the tree
//! and materialised per word as a fanout of channels, one per distinct
//! right-context senone sequence. Single-phone words and fillers live in
//! permanently allocated root HMMs.
//!
//! Because tree channels are shared between words, the language model score
//! is applied where the word identity becomes known: at the transition into
//! the final phone (governed by the last-phone beams). Root entry uses the
//! best right-context exit score for the root's first phone plus the phone
//! insertion penalty.
use tracing::info;

use crate::acmod::Acmod;
use crate::dict::NO_WID;
use crate::error::{Error, Result};
use crate::hmm::Hmm;
use crate::logmath::WORST_SCORE;
use crate::search::bptbl::NO_BP;

use super::ngram::{BestBp, Cand, Chan, ChanInfo, NgramSearch, RootChan, NO_CHAN};

impl NgramSearch {
    /// Arrange all LM words into the prefix tree. Deterministic: the same
    /// dictionary and LM vocabulary produce the same tree.
    pub(crate) fn create_search_tree(&mut self) -> Result<()> {
        self.homophone_set.fill(NO_WID);
        self.single_phone_wid.clear();

        let n_main = self.dict.n_main_words() as i32;
        for wid in 0..n_main {
            if !self.lm_known(wid) {
                continue;
            }
            let phones = self.dict.word(wid).phones.clone();
            if phones.len() == 1 {
                self.single_phone_wid.push(wid);
                continue;
            }

            let (b, r) = (phones[0], phones[1]);
            let root_idx = match self.rchan_map.get(&(b, r)) {
                Some(&i) => i,
                None => {
                    let ssid = self.tt.ldiph_ssid(b, r, self.mdef.sil());
                    let hmm = Hmm::new(&self.hmmctx, true, ssid, self.mdef.ci_tmat(b));
                    self.root_chan.push(RootChan {
                        hmm,
                        ciphone: b,
                        second: r,
                        penult_phn_wid: NO_WID,
                        next: NO_CHAN,
                    });
                    let i = self.root_chan.len() - 1;
                    self.rchan_map.insert((b, r), i);
                    i
                }
            };

            if phones.len() == 2 {
                // Second phone is the last; the word hangs off the root.
                let head = self.root_chan[root_idx].penult_phn_wid;
                self.root_chan[root_idx].penult_phn_wid =
                    self.homophone_chain_insert(head, wid);
                continue;
            }

            // Add interior phones (all but first and last) to the tree.
            let mut parent_first = self.root_chan[root_idx].next;
            let mut parent_is_root = true;
            let mut parent_chan = NO_CHAN;
            for p in 1..phones.len() - 1 {
                let ssid = self.mdef.phone_ssid(
                    phones[p],
                    phones[p - 1],
                    phones[p + 1],
                    crate::mdef::WordPos::Internal,
                );
                let found = self.find_sibling(parent_first, ssid);
                let chan = match found {
                    Some(c) => c,
                    None => {
                        let hmm = Hmm::new(
                            &self.hmmctx,
                            false,
                            ssid,
                            self.mdef.ci_tmat(phones[p]),
                        );
                        let id = self.pool.alloc(Chan {
                            hmm,
                            next: NO_CHAN,
                            alt: parent_first,
                            ciphone: phones[p],
                            info: ChanInfo::Penult(NO_WID),
                        });
                        if parent_is_root {
                            self.root_chan[root_idx].next = id;
                        } else {
                            self.pool.get_mut(parent_chan).next = id;
                        }
                        id
                    }
                };
                parent_first = self.pool.get(chan).next;
                parent_is_root = false;
                parent_chan = chan;
            }

            // The word's final phone follows `parent_chan`.
            let head = match self.pool.get(parent_chan).info {
                ChanInfo::Penult(h) => h,
                _ => unreachable!("tree-internal channel without a penult list"),
            };
            let new_head = self.homophone_chain_insert(head, wid);
            self.pool.get_mut(parent_chan).info = ChanInfo::Penult(new_head);
        }

        self.n_1ph_lm_words = self.single_phone_wid.len();
        // `</s>` is an LM word even though it lives in the tail region.
        let finish = self.dict.finish_wid();
        if self.dict.pron_len(finish) == 1 && self.lm_known(finish) {
            self.single_phone_wid.push(finish);
            self.n_1ph_lm_words += 1;
        }
        // Sentence start, silence and the other fillers.
        for wid in self.dict.finish_wid()..self.dict.n_words() as i32 {
            if wid == finish || self.dict.pron_len(wid) != 1 {
                continue;
            }
            self.single_phone_wid.push(wid);
        }

        info!(
            "lexicon tree: {} roots, {} single-phone words",
            self.root_chan.len(),
            self.single_phone_wid.len()
        );
        Ok(())
    }

    /// Append `wid` to a homophone chain, returning the (unchanged or new)
    /// head.
    fn homophone_chain_insert(&mut self, head: i32, wid: i32) -> i32 {
        if head == NO_WID {
            return wid;
        }
        let mut w = head;
        while self.homophone_set[w as usize] != NO_WID {
            w = self.homophone_set[w as usize];
        }
        self.homophone_set[w as usize] = wid;
        head
    }

    fn find_sibling(&self, mut chan: i32, ssid: crate::mdef::Ssid) -> Option<i32> {
        while chan != NO_CHAN {
            let c = self.pool.get(chan);
            if c.hmm.ssid(0) == ssid {
                return Some(chan);
            }
            chan = c.alt;
        }
        None
    }

    pub(crate) fn fwdtree_start(&mut self) -> Result<()> {
        self.in_fwdflat = false;
        self.bptbl.reset();
        self.n_frame = 0;
        self.best_score = 0;
        self.renormalized = false;
        self.active_chan[0].clear();
        self.active_chan[1].clear();
        self.active_word[0].clear();
        self.active_word[1].clear();
        self.word_active.fill(false);
        self.last_ltrans.fill((-1, 0));
        for i in 0..self.word_chan.len() {
            if self.word_chan[i] != NO_CHAN {
                self.free_word_chan(i as i32);
            }
        }
        for root in &mut self.root_chan {
            root.hmm.clear();
        }
        // Single-phone roots may hold junk from a previous flat pass.
        for rh in &mut self.all_rhmm {
            rh.hmm.clear();
        }

        // The search begins inside <s>.
        let start = self.dict.start_wid();
        let idx = self.word_rhmm[start as usize];
        if idx < 0 {
            return Err(Error::Logic("<s> has no single-phone HMM".into()));
        }
        self.all_rhmm[idx as usize].hmm.enter(0, NO_BP, 0);
        Ok(())
    }

    pub(crate) fn fwdtree_step(&mut self, acmod: &mut Acmod) -> Result<()> {
        if !acmod.compallsen {
            self.fwdtree_sen_active(acmod);
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
            self.fwdtree_renormalize(frame);
        }

        let n_active = self.fwdtree_eval(frame);
        self.update_beam_factor(n_active);
        self.fwdtree_prune(frame)?;
        self.bptbl.prune_frame(frame, self.maxwpf);
        self.fwdtree_word_transition(frame);
        self.bptbl.clear_frame_handles(frame);

        let cf = (frame & 1) as usize;
        self.active_chan[cf].clear();
        self.active_word[cf].clear();
        self.n_frame = frame + 1;
        Ok(())
    }

    pub(crate) fn fwdtree_finish(&mut self) -> Result<()> {
        self.bptbl.mark_frame(self.n_frame);

        for root in &mut self.root_chan {
            root.hmm.clear();
        }
        for buf in 0..2 {
            let list = std::mem::take(&mut self.active_chan[buf]);
            for &cid in &list {
                self.pool.get_mut(cid).hmm.clear();
            }
            let words = std::mem::take(&mut self.active_word[buf]);
            for &wid in &words {
                if self.word_chan[wid as usize] != NO_CHAN {
                    self.free_word_chan(wid);
                }
            }
        }
        self.word_active.fill(false);
        for rh in &mut self.all_rhmm {
            rh.hmm.clear();
        }
        info!(
            "fwdtree: {} frames, {} word exits",
            self.n_frame,
            self.bptbl.len()
        );
        Ok(())
    }

    /// OR the senones every active channel needs into the acmod bit-vector.
    fn fwdtree_sen_active(&mut self, acmod: &mut Acmod) {
        let frame = acmod.frame_idx();
        acmod.clear_active();
        for root in &self.root_chan {
            if root.hmm.frame() == frame {
                acmod.activate_hmm(&root.hmm);
            }
        }
        let cf = (frame & 1) as usize;
        for &cid in &self.active_chan[cf] {
            let c = self.pool.get(cid);
            if c.hmm.frame() == frame {
                acmod.activate_hmm(&c.hmm);
            }
        }
        for &wid in &self.active_word[cf] {
            let mut id = self.word_chan[wid as usize];
            while id != NO_CHAN {
                let c = self.pool.get(id);
                if c.hmm.frame() == frame {
                    acmod.activate_hmm(&c.hmm);
                }
                id = c.next;
            }
        }
        for &wid in &self.single_phone_wid {
            let rh = &self.all_rhmm[self.word_rhmm[wid as usize] as usize];
            if rh.hmm.frame() == frame {
                acmod.activate_hmm(&rh.hmm);
            }
        }
    }

    /// Evaluate every active HMM; sets `best_score` and returns the number
    /// evaluated (the admission-control signal).
    fn fwdtree_eval(&mut self, frame: i32) -> usize {
        let mut best = WORST_SCORE;
        let mut n = 0usize;
        for root in &mut self.root_chan {
            if root.hmm.frame() == frame {
                best = best.max(root.hmm.eval(&self.hmmctx));
                n += 1;
            }
        }
        let cf = (frame & 1) as usize;
        let list = std::mem::take(&mut self.active_chan[cf]);
        for &cid in &list {
            let c = self.pool.get_mut(cid);
            if c.hmm.frame() == frame {
                best = best.max(c.hmm.eval(&self.hmmctx));
                n += 1;
            }
        }
        self.active_chan[cf] = list;

        let words = std::mem::take(&mut self.active_word[cf]);
        for &wid in &words {
            let mut id = self.word_chan[wid as usize];
            while id != NO_CHAN {
                let c = self.pool.get_mut(id);
                if c.hmm.frame() == frame {
                    best = best.max(c.hmm.eval(&self.hmmctx));
                    n += 1;
                }
                id = c.next;
            }
        }
        self.active_word[cf] = words;

        let finish = self.dict.finish_wid();
        for &wid in &self.single_phone_wid {
            let rh = &mut self.all_rhmm[self.word_rhmm[wid as usize] as usize];
            if rh.hmm.frame() == frame {
                let s = rh.hmm.eval(&self.hmmctx);
                n += 1;
                if wid != finish {
                    best = best.max(s);
                }
            }
        }

        self.best_score = best;
        n
    }

    fn fwdtree_prune(&mut self, frame: i32) -> Result<()> {
        self.lastphn_cand.clear();
        self.word_active.fill(false);
        self.prune_root_chan(frame);
        self.prune_nonroot_chan(frame);
        self.prune_word_chan(frame)?;
        self.last_phone_transition(frame);
        Ok(())
    }

    /// Enter every child of a surviving channel whose exit cleared the
    /// phone beam.
    fn enter_children(&mut self, first: i32, newscore: i32, hist: i32, frame: i32) {
        let nf = frame + 1;
        let nf_buf = (nf & 1) as usize;
        let thresh = self.best_score + self.beams.beam;
        if newscore < thresh {
            return;
        }
        let mut child = first;
        while child != NO_CHAN {
            let (alt, was_frame, in_score) = {
                let c = self.pool.get(child);
                (c.alt, c.hmm.frame(), c.hmm.in_score())
            };
            if was_frame < frame || newscore > in_score {
                self.pool.get_mut(child).hmm.enter(newscore, hist, nf);
                if was_frame != nf {
                    self.active_chan[nf_buf].push(child);
                }
            }
            child = alt;
        }
    }

    /// Queue the words whose final phone follows this channel.
    fn queue_lastphn_cands(&mut self, head: i32, score: i32, bp: i32) {
        let mut w = head;
        while w != NO_WID {
            self.lastphn_cand.push(Cand { wid: w, score, bp });
            w = self.homophone_set[w as usize];
        }
    }

    fn prune_root_chan(&mut self, frame: i32) {
        let thresh = self.best_score + self.beams.beam;
        let pthresh = self.best_score + self.beams.pbeam;
        let lpthresh = self.best_score + self.beams.lpbeam;
        let nf = frame + 1;

        for i in 0..self.root_chan.len() {
            let (active, bestscore) = {
                let r = &self.root_chan[i];
                (r.hmm.frame() == frame, r.hmm.bestscore())
            };
            if !active || bestscore <= thresh {
                continue;
            }
            let (out, hist, first_child, penult) = {
                let r = &mut self.root_chan[i];
                r.hmm.set_frame(nf);
                (
                    r.hmm.out_score(),
                    r.hmm.out_history(),
                    r.next,
                    r.penult_phn_wid,
                )
            };
            if out > pthresh {
                self.enter_children(first_child, out + self.pip, hist, frame);
            }
            if penult != NO_WID && out > lpthresh {
                self.queue_lastphn_cands(penult, out, hist);
            }
        }
    }

    fn prune_nonroot_chan(&mut self, frame: i32) {
        let thresh = self.best_score + self.beams.beam;
        let pthresh = self.best_score + self.beams.pbeam;
        let lpthresh = self.best_score + self.beams.lpbeam;
        let nf = frame + 1;
        let cf_buf = (frame & 1) as usize;
        let nf_buf = (nf & 1) as usize;

        let list = std::mem::take(&mut self.active_chan[cf_buf]);
        for &cid in &list {
            let (bestscore, was_frame, out, hist, first_child, info) = {
                let c = self.pool.get(cid);
                (
                    c.hmm.bestscore(),
                    c.hmm.frame(),
                    c.hmm.out_score(),
                    c.hmm.out_history(),
                    c.next,
                    c.info,
                )
            };
            if bestscore > thresh {
                if was_frame != nf {
                    self.pool.get_mut(cid).hmm.set_frame(nf);
                    self.active_chan[nf_buf].push(cid);
                }
                if out > pthresh {
                    self.enter_children(first_child, out + self.pip, hist, frame);
                }
                if let ChanInfo::Penult(head) = info {
                    if head != NO_WID && out > lpthresh {
                        self.queue_lastphn_cands(head, out, hist);
                    }
                }
            } else if was_frame != nf {
                self.pool.get_mut(cid).hmm.clear_scores();
            }
        }
        self.active_chan[cf_buf] = list;
    }

    /// Commit words: apply the language model score and enter the word's
    /// final-phone channels.
    fn last_phone_transition(&mut self, frame: i32) {
        let nf = frame + 1;
        let nf_buf = (nf & 1) as usize;
        let lpthresh = self.best_score + self.beams.lpbeam;
        let lw = self.lw;

        for i in 0..self.lastphn_cand.len() {
            let cand = self.lastphn_cand[i];
            let lscr = self.cached_lm_score(cand.wid, cand.bp, lw);
            if lscr <= WORST_SCORE / 2 {
                continue;
            }
            let newscore = cand.score + self.pip + lscr;
            if newscore < lpthresh {
                continue;
            }
            if self.word_chan[cand.wid as usize] == NO_CHAN {
                self.alloc_all_rc(cand.wid);
            }
            let mut id = self.word_chan[cand.wid as usize];
            let mut entered = false;
            while id != NO_CHAN {
                let (next, was_frame, in_score) = {
                    let c = self.pool.get(id);
                    (c.next, c.hmm.frame(), c.hmm.in_score())
                };
                if was_frame < nf || newscore > in_score {
                    self.pool.get_mut(id).hmm.enter(newscore, cand.bp, nf);
                    entered = true;
                }
                id = next;
            }
            if entered && !self.word_active[cand.wid as usize] {
                self.word_active[cand.wid as usize] = true;
                self.active_word[nf_buf].push(cand.wid);
            }
        }
        self.lastphn_cand.clear();
    }

    /// Word exits from final-phone channels and single-phone roots.
    fn prune_word_chan(&mut self, frame: i32) -> Result<()> {
        let thresh = self.best_score + self.beams.beam;
        let wthresh = self.best_score + self.beams.wbeam;
        let lponlythresh = self.best_score + self.beams.lponlybeam;
        let nf = frame + 1;
        let cf_buf = (frame & 1) as usize;
        let nf_buf = (nf & 1) as usize;

        let words = std::mem::take(&mut self.active_word[cf_buf]);
        for &wid in &words {
            let mut alive = false;
            let mut id = self.word_chan[wid as usize];
            while id != NO_CHAN {
                let (next, was_frame, bestscore, out, hist, rc_id) = {
                    let c = self.pool.get(id);
                    let rc = match c.info {
                        ChanInfo::RcId(r) => r,
                        _ => 0,
                    };
                    (
                        c.next,
                        c.hmm.frame(),
                        c.hmm.bestscore(),
                        c.hmm.out_score(),
                        c.hmm.out_history(),
                        rc,
                    )
                };
                if was_frame == frame || was_frame == nf {
                    if bestscore > thresh {
                        self.pool.get_mut(id).hmm.set_frame(nf);
                        alive = true;
                        if out > wthresh {
                            self.bptbl.save(
                                frame,
                                wid,
                                out,
                                hist,
                                rc_id as usize,
                                &self.dict,
                                &self.tt,
                            )?;
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
            if alive {
                if !self.word_active[wid as usize] {
                    self.word_active[wid as usize] = true;
                    self.active_word[nf_buf].push(wid);
                }
            } else {
                self.free_word_chan(wid);
            }
        }
        self.active_word[cf_buf] = words;

        // Single-phone words: LM words exit under the last-phone-only beam,
        // fillers and markers under the word beam.
        for i in 0..self.single_phone_wid.len() {
            let wid = self.single_phone_wid[i];
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
            if !active {
                continue;
            }
            let exit_thresh = if i < self.n_1ph_lm_words {
                lponlythresh
            } else {
                wthresh
            };
            if bestscore > thresh {
                self.all_rhmm[rh_idx].hmm.set_frame(nf);
            } else {
                self.all_rhmm[rh_idx].hmm.clear_scores();
            }
            if out > exit_thresh {
                self.bptbl
                    .save(frame, wid, out, hist, 0, &self.dict, &self.tt)?;
            }
        }
        Ok(())
    }

    /// Cross-word transitions from this frame's word exits.
    fn fwdtree_word_transition(&mut self, frame: i32) {
        let nf = frame + 1;
        let thresh = self.best_score + self.beams.beam;
        let n_ci = self.tt.n_ci();

        // Best exit score per possible first phone of a successor word.
        self.bestbp_rc.clear();
        self.bestbp_rc.resize(n_ci, BestBp::NONE);
        for bp in self.bptbl.frame_entries(frame) {
            let (valid, wid) = {
                let e = self.bptbl.entry(bp);
                (e.valid, e.wid)
            };
            if !valid {
                continue;
            }
            let lc = self.dict.last_phone(wid);
            for ci in 0..n_ci {
                let score = self.bptbl.rc_score(bp, ci as i32, &self.tt);
                if score > self.bestbp_rc[ci].score {
                    self.bestbp_rc[ci] = BestBp { score, bp, lc };
                }
            }
        }

        // Root channels: no LM score yet, just the phone insertion penalty.
        for i in 0..self.root_chan.len() {
            let (b, second) = {
                let r = &self.root_chan[i];
                (r.ciphone, r.second)
            };
            let e = self.bestbp_rc[b as usize];
            if e.score <= WORST_SCORE {
                continue;
            }
            let newscore = e.score + self.pip;
            let r = &mut self.root_chan[i];
            if newscore > thresh && (r.hmm.frame() < nf || newscore > r.hmm.in_score()) {
                let ssid = self.tt.ldiph_ssid(b, second, e.lc);
                r.hmm.set_mpx_ssid0(ssid);
                r.hmm.enter(newscore, e.bp, nf);
            }
        }

        // Single-phone LM words carry their LM score at entry.
        for i in 0..self.n_1ph_lm_words {
            let wid = self.single_phone_wid[i];
            let b = self.dict.first_phone(wid);
            let e = self.bestbp_rc[b as usize];
            if e.score <= WORST_SCORE {
                continue;
            }
            let lscr = self.cached_lm_score(wid, e.bp, self.lw);
            if lscr <= WORST_SCORE / 2 {
                continue;
            }
            let newscore = e.score + self.pip + lscr;
            let rh = &mut self.all_rhmm[self.word_rhmm[wid as usize] as usize];
            if newscore > thresh && (rh.hmm.frame() < nf || newscore > rh.hmm.in_score()) {
                rh.hmm.enter(newscore, e.bp, nf);
            }
        }

        // Silence and the other fillers enter from the best exit whose
        // right context is silence.
        let e = self.bestbp_rc[self.mdef.sil() as usize];
        if e.score > WORST_SCORE {
            let sil = self.dict.silence_wid();
            for wid in sil..self.dict.n_words() as i32 {
                if self.dict.pron_len(wid) != 1 {
                    continue;
                }
                let pen = if wid == sil { self.silpen } else { self.fillpen };
                let newscore = e.score + pen;
                let rh = &mut self.all_rhmm[self.word_rhmm[wid as usize] as usize];
                if newscore > thresh
                    && newscore > WORST_SCORE
                    && (rh.hmm.frame() < nf || newscore > rh.hmm.in_score())
                {
                    rh.hmm.enter(newscore, e.bp, nf);
                }
            }
        }
    }

    fn fwdtree_renormalize(&mut self, frame: i32) {
        let norm = self.best_score;
        for root in &mut self.root_chan {
            if root.hmm.frame() == frame {
                root.hmm.normalize(norm);
            }
        }
        let cf = (frame & 1) as usize;
        let list = std::mem::take(&mut self.active_chan[cf]);
        for &cid in &list {
            self.pool.get_mut(cid).hmm.normalize(norm);
        }
        self.active_chan[cf] = list;
        let words = std::mem::take(&mut self.active_word[cf]);
        for &wid in &words {
            let mut id = self.word_chan[wid as usize];
            while id != NO_CHAN {
                let c = self.pool.get_mut(id);
                c.hmm.normalize(norm);
                id = c.next;
            }
        }
        self.active_word[cf] = words;
        for rh in &mut self.all_rhmm {
            if rh.hmm.frame() == frame {
                rh.hmm.normalize(norm);
            }
        }
        self.best_score = 0;
        self.renormalized = true;
    }
}
