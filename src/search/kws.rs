//! Keyword-phrase spotting.
//!
//! One single-path HMM chain models the target phrase; a context
//! independent phone loop models everything else. Each frame the phrase-end
//! exit score is compared against the best phone-loop exit: when the margin
//! exceeds the detection threshold, a detection is recorded, the phrase
//! chain resets, and spotting continues. The phone loop re-enters itself
//! (and the phrase entry) from the better of the two exits, minus a
//! phone-loop penalty.
use std::sync::Arc;

use tracing::info;

use crate::acmod::Acmod;
use crate::config::DecoderConfig;
use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::hmm::{Hmm, HmmContext, NO_HIST};
use crate::logmath::{LogMath, WORST_SCORE};
use crate::mdef::Mdef;
use crate::search::{Search, Segment};
use crate::tmat::TmatSet;

struct KwsNode {
    hmm: Hmm,
    active: bool,
}

pub struct KwsSearch {
    keyphrase: String,
    hmmctx: HmmContext,
    /// Phrase chain, one HMM per phone.
    nodes: Vec<KwsNode>,
    /// Background phone loop, one HMM per CI phone.
    pl_hmms: Vec<Hmm>,
    beam: i32,
    /// Phone-loop penalty.
    plp: i32,
    threshold: i32,
    frame: i32,
    bestscore: i32,
    detections: Vec<i32>,
}

impl KwsSearch {
    pub fn new(
        config: &DecoderConfig,
        dict: Arc<Dict>,
        mdef: Arc<Mdef>,
        lmath: Arc<LogMath>,
        tmat: Arc<TmatSet>,
        keyphrase: &str,
    ) -> Result<Self> {
        // Every word of the phrase must be in the dictionary before any
        // network is allocated.
        let mut phones = Vec::new();
        for word in keyphrase.split_whitespace() {
            let wid = dict.wid(word).ok_or_else(|| {
                Error::Config(format!("keyphrase word {word} missing from the dictionary"))
            })?;
            phones.extend_from_slice(&dict.word(wid).phones);
        }
        if phones.is_empty() {
            return Err(Error::Config("empty keyphrase".into()));
        }

        let hmmctx = HmmContext::new(mdef.clone(), tmat)?;

        let mut nodes = Vec::with_capacity(phones.len());
        for (i, &p) in phones.iter().enumerate() {
            let l = if i > 0 { phones[i - 1] } else { mdef.sil() };
            let r = if i + 1 < phones.len() {
                phones[i + 1]
            } else {
                mdef.sil()
            };
            let ssid = mdef.phone_ssid(p, l, r, crate::mdef::WordPos::Internal);
            nodes.push(KwsNode {
                hmm: Hmm::new(&hmmctx, false, ssid, mdef.ci_tmat(p)),
                active: false,
            });
        }

        let pl_hmms: Vec<Hmm> = (0..mdef.n_ciphone() as i32)
            .map(|ci| Hmm::new(&hmmctx, false, mdef.ci_ssid(ci), mdef.ci_tmat(ci)))
            .collect();

        let beam = lmath.log(config.beam);
        let plp = lmath.log(config.kws_plp);
        let threshold = lmath.log(config.kws_threshold);
        info!(
            "kws '{}': {} phrase phones, beam {} plp {} threshold {}",
            keyphrase,
            nodes.len(),
            beam,
            plp,
            threshold
        );

        Ok(KwsSearch {
            keyphrase: keyphrase.to_string(),
            hmmctx,
            nodes,
            pl_hmms,
            beam,
            plp,
            threshold,
            frame: 0,
            bestscore: WORST_SCORE,
            detections: Vec::new(),
        })
    }

    pub fn n_detections(&self) -> usize {
        self.detections.len()
    }

    pub fn detection_frames(&self) -> &[i32] {
        &self.detections
    }

    fn hmm_eval(&mut self) {
        let mut best = WORST_SCORE;
        for hmm in self.pl_hmms.iter_mut() {
            best = best.max(hmm.eval(&self.hmmctx));
        }
        for node in self.nodes.iter_mut() {
            if node.active {
                best = best.max(node.hmm.eval(&self.hmmctx));
            }
        }
        self.bestscore = best;
    }

    fn hmm_prune(&mut self) {
        let thresh = self.bestscore + self.beam;
        for node in self.nodes.iter_mut() {
            if node.active && node.hmm.bestscore() < thresh {
                node.active = false;
                node.hmm.clear();
            }
        }
    }

    fn trans(&mut self) {
        // Best phone-loop exit is the background reference.
        let mut best_out = WORST_SCORE;
        for hmm in &self.pl_hmms {
            best_out = best_out.max(hmm.out_score());
        }
        if best_out <= WORST_SCORE {
            return;
        }

        // Detection test against the phrase-end exit.
        let last = self.nodes.len() - 1;
        if self.nodes[last].active {
            let margin = self.nodes[last].hmm.out_score().saturating_sub(best_out);
            if self.nodes[last].hmm.out_score() > WORST_SCORE && margin >= self.threshold {
                self.detections.push(self.frame);
                info!("keyphrase detected in frame {}", self.frame);
                for node in self.nodes.iter_mut() {
                    node.active = false;
                    node.hmm.clear_scores();
                }
            }
        }

        let nf = self.frame + 1;
        // Phone loop re-enters itself.
        for hmm in self.pl_hmms.iter_mut() {
            let newscore = best_out + self.plp;
            if newscore > hmm.in_score() {
                hmm.enter(newscore, NO_HIST, nf);
            }
        }

        // Advance the phrase chain.
        for i in (1..self.nodes.len()).rev() {
            if self.nodes[i - 1].active {
                let (pred_out, pred_hist) = {
                    let p = &self.nodes[i - 1].hmm;
                    (p.out_score(), p.out_history())
                };
                let node = &mut self.nodes[i];
                if !node.active || pred_out > node.hmm.in_score() {
                    node.hmm.enter(pred_out, pred_hist, nf);
                    node.active = true;
                }
            }
        }

        // Enter the phrase from the background.
        if best_out > self.nodes[0].hmm.in_score() {
            self.nodes[0].active = true;
            self.nodes[0].hmm.enter(best_out, NO_HIST, nf);
        }
    }
}

impl Search for KwsSearch {
    fn start(&mut self, _acmod: &mut Acmod) -> Result<()> {
        self.frame = 0;
        self.detections.clear();
        for node in self.nodes.iter_mut() {
            node.active = false;
            node.hmm.clear();
        }
        for hmm in self.pl_hmms.iter_mut() {
            hmm.clear();
            hmm.enter(0, NO_HIST, 0);
        }
        Ok(())
    }

    fn step(&mut self, acmod: &mut Acmod) -> Result<usize> {
        if !acmod.frame_available() {
            return Ok(0);
        }
        if !acmod.compallsen {
            acmod.clear_active();
            for hmm in &self.pl_hmms {
                acmod.activate_hmm(hmm);
            }
            for node in &self.nodes {
                if node.active {
                    acmod.activate_hmm(&node.hmm);
                }
            }
        }
        let (frame, _best, _bestsen) = acmod
            .score_frame()
            .ok_or_else(|| Error::Logic("step called with no frame ready".into()))?;
        self.hmmctx.set_senscore(acmod.senone_scores());
        self.frame = frame;

        self.hmm_eval();
        self.hmm_prune();
        self.trans();
        self.frame = frame + 1;
        Ok(1)
    }

    fn finish(&mut self, _acmod: &mut Acmod) -> Result<()> {
        info!(
            "kws: {} frames, {} detections",
            self.frame,
            self.detections.len()
        );
        Ok(())
    }

    fn hyp(&mut self) -> Option<(String, i32)> {
        if self.detections.is_empty() {
            None
        } else {
            Some((self.keyphrase.clone(), 0))
        }
    }

    fn seg(&mut self) -> Vec<Segment> {
        self.detections
            .iter()
            .map(|&f| Segment {
                word: self.keyphrase.clone(),
                sf: f,
                ef: f,
                ascr: 0,
                lscr: 0,
                prob: 0.0,
            })
            .collect()
    }
}
