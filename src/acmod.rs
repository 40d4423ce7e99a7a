//! Acoustic model plumbing: the cepstral buffer, dynamic feature
//! computation, cepstral mean normalisation, the senone-activation
//! bit-vector, and per-frame scoring.
//!
//! The decoder consumes cepstral frames; raw audio goes through a host
//! supplied [`FrontEnd`] (MFCC extraction itself is outside this crate).
//! Cepstra are retained for the whole utterance because the second search
//! pass rewinds and re-reads the identical senone scores frame by frame.
//!
//! Dynamic features are derived on the fly from a window around each frame
//! (replicating the edge frames at utterance boundaries):
//!
//! - `S2x4`: the four-stream layout of semi-continuous models: cepstra
//!   (minus c0), a +-2 frame delta, a {c0, delta-c0, double-delta-c0} power
//!   stream, and a double delta.
//! - `Cep1s`: the single-stream cepstra + delta + double-delta layout of
//!   continuous models.
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::gauden::SenoneScorer;
use crate::hmm::Hmm;
use crate::logmath::WORST_SCORE;
use crate::mdef::{Mdef, NO_SSID};

/// Frames of context needed on each side of a frame for dynamic features.
pub const FEAT_WINDOW: usize = 3;

/// Host-supplied conversion from audio samples to cepstral frames.
pub trait FrontEnd: Send {
    fn cep_len(&self) -> usize;
    fn start_utt(&mut self);
    /// Consume samples, returning any complete cepstral frames.
    fn process(&mut self, samples: &[i16]) -> Vec<Vec<f32>>;
    /// Flush buffered state at utterance end.
    fn end_utt(&mut self) -> Vec<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatKind {
    /// Four streams: cep, delta-cep, power, double-delta-cep.
    S2x4,
    /// One stream: cep + delta + double delta concatenated.
    Cep1s,
}

impl FeatKind {
    pub fn parse(name: &str) -> Option<FeatKind> {
        match name {
            "s2_4x" => Some(FeatKind::S2x4),
            "1s_c_d_dd" => Some(FeatKind::Cep1s),
            _ => None,
        }
    }

    pub fn n_streams(&self) -> usize {
        match self {
            FeatKind::S2x4 => 4,
            FeatKind::Cep1s => 1,
        }
    }

    pub fn veclen(&self, cep_len: usize) -> Vec<usize> {
        match self {
            FeatKind::S2x4 => vec![cep_len - 1, cep_len - 1, 3, cep_len - 1],
            FeatKind::Cep1s => vec![cep_len * 3],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmnKind {
    None,
    /// Subtract the running mean of the current utterance.
    Current,
    /// Subtract the mean carried over from previous utterances.
    Prior,
}

impl CmnKind {
    pub fn parse(name: &str) -> Option<CmnKind> {
        match name {
            "none" => Some(CmnKind::None),
            "current" => Some(CmnKind::Current),
            "prior" => Some(CmnKind::Prior),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Cmn {
    kind: CmnKind,
    mean: Vec<f32>,
    sum: Vec<f64>,
    n: usize,
}

/// Weight of the carried-over mean when blending in a finished utterance.
const CMN_PRIOR_N: usize = 200;

impl Cmn {
    fn new(kind: CmnKind, cep_len: usize, init: &[f32]) -> Cmn {
        let mut mean = vec![0.0f32; cep_len];
        for (m, &v) in mean.iter_mut().zip(init.iter()) {
            *m = v;
        }
        Cmn {
            kind,
            mean,
            sum: vec![0.0; cep_len],
            n: 0,
        }
    }

    fn apply(&mut self, frame: &mut [f32]) {
        if self.kind == CmnKind::None {
            return;
        }
        for (s, &v) in self.sum.iter_mut().zip(frame.iter()) {
            *s += v as f64;
        }
        self.n += 1;
        if self.kind == CmnKind::Current {
            for (m, &s) in self.mean.iter_mut().zip(self.sum.iter()) {
                *m = (s / self.n as f64) as f32;
            }
        }
        for (v, &m) in frame.iter_mut().zip(self.mean.iter()) {
            *v -= m;
        }
    }

    fn end_utt(&mut self) {
        if self.kind == CmnKind::None || self.n == 0 {
            return;
        }
        // Note for Current the sums accumulated pre-subtraction, so this is
        // the same update Prior uses: fold the utterance into the mean and
        // decay the evidence so later utterances can still move it.
        for (m, s) in self.mean.iter_mut().zip(self.sum.iter_mut()) {
            *m = (*s / self.n as f64) as f32;
            *s = *m as f64 * CMN_PRIOR_N as f64;
        }
        self.n = CMN_PRIOR_N;
        if self.kind == CmnKind::Current {
            // Current-mode means restart from scratch each utterance.
            for s in self.sum.iter_mut() {
                *s = 0.0;
            }
            self.n = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UttState {
    Idle,
    Started,
    Processing,
    Ended,
}

pub struct Acmod {
    mdef: Arc<Mdef>,
    scorer: Box<dyn SenoneScorer + Send>,
    frontend: Option<Box<dyn FrontEnd>>,
    feat: FeatKind,
    cep_len: usize,
    cmn: Cmn,
    /// Post-CMN cepstra for the current utterance.
    mfc: Vec<Vec<f32>>,
    state: UttState,
    output_frame: i32,
    senone_scores: Vec<i32>,
    active_vec: Vec<u64>,
    active_list: Vec<i32>,
    n_senone_active: usize,
    pub compallsen: bool,
}

impl Acmod {
    pub fn new(
        mdef: Arc<Mdef>,
        scorer: Box<dyn SenoneScorer + Send>,
        feat: FeatKind,
        cep_len: usize,
        cmn_kind: CmnKind,
        cmn_init: &[f32],
        compallsen: bool,
        frontend: Option<Box<dyn FrontEnd>>,
    ) -> Result<Self> {
        if scorer.n_sen() != mdef.n_sen() {
            return Err(Error::Format {
                file: "acoustic model".into(),
                detail: format!(
                    "scorer has {} senones, model definition has {}",
                    scorer.n_sen(),
                    mdef.n_sen()
                ),
            });
        }
        if scorer.n_streams() != feat.n_streams()
            || scorer.veclen() != feat.veclen(cep_len).as_slice()
        {
            return Err(Error::Format {
                file: "acoustic model".into(),
                detail: format!(
                    "scorer feature layout {:?} does not match {:?}",
                    scorer.veclen(),
                    feat.veclen(cep_len)
                ),
            });
        }
        if let Some(fe) = &frontend {
            if fe.cep_len() != cep_len {
                return Err(Error::Config(format!(
                    "front end produces {}-dimensional cepstra, model wants {}",
                    fe.cep_len(),
                    cep_len
                )));
            }
        }
        let n_sen = mdef.n_sen();
        Ok(Acmod {
            mdef,
            scorer,
            frontend,
            feat,
            cep_len,
            cmn: Cmn::new(cmn_kind, cep_len, cmn_init),
            mfc: Vec::new(),
            state: UttState::Idle,
            output_frame: 0,
            senone_scores: vec![WORST_SCORE; n_sen],
            active_vec: vec![0u64; (n_sen + 63) / 64],
            active_list: vec![0; n_sen],
            n_senone_active: 0,
            compallsen,
        })
    }

    pub fn mdef(&self) -> &Arc<Mdef> {
        &self.mdef
    }

    /// Install (or replace) the raw-audio front end.
    pub fn set_frontend(&mut self, fe: Box<dyn FrontEnd>) -> Result<()> {
        if fe.cep_len() != self.cep_len {
            return Err(Error::Config(format!(
                "front end produces {}-dimensional cepstra, model wants {}",
                fe.cep_len(),
                self.cep_len
            )));
        }
        self.frontend = Some(fe);
        Ok(())
    }

    pub fn start_utt(&mut self) -> Result<()> {
        if self.state == UttState::Started || self.state == UttState::Processing {
            return Err(Error::Logic("utterance already started".into()));
        }
        if let Some(fe) = &mut self.frontend {
            fe.start_utt();
        }
        self.mfc.clear();
        self.output_frame = 0;
        self.state = UttState::Started;
        Ok(())
    }

    pub fn end_utt(&mut self) -> Result<()> {
        if self.state != UttState::Started && self.state != UttState::Processing {
            return Err(Error::Logic("no utterance in progress".into()));
        }
        if let Some(fe) = &mut self.frontend {
            for frame in fe.end_utt() {
                self.push_cep(frame)?;
            }
        }
        self.cmn.end_utt();
        self.state = UttState::Ended;
        info!("utterance: {} cepstral frames", self.mfc.len());
        Ok(())
    }

    fn push_cep(&mut self, mut frame: Vec<f32>) -> Result<()> {
        if frame.len() != self.cep_len {
            return Err(Error::Domain(format!(
                "cepstral frame has {} values, model wants {}",
                frame.len(),
                self.cep_len
            )));
        }
        self.cmn.apply(&mut frame);
        self.mfc.push(frame);
        Ok(())
    }

    /// Feed raw audio. Requires a front end; returns the number of cepstral
    /// frames produced.
    pub fn process_raw(&mut self, samples: &[i16], full_utt: bool) -> Result<usize> {
        if self.state != UttState::Started && self.state != UttState::Processing {
            return Err(Error::Logic("no utterance in progress".into()));
        }
        let fe = self
            .frontend
            .as_mut()
            .ok_or_else(|| Error::Config("no front end installed; feed cepstra instead".into()))?;
        let mut frames = fe.process(samples);
        if full_utt {
            frames.extend(fe.end_utt());
        }
        let n = frames.len();
        for f in frames {
            self.push_cep(f)?;
        }
        self.state = UttState::Processing;
        Ok(n)
    }

    /// Feed cepstral frames directly. Returns the number accepted (all of
    /// them; the internal buffer grows for the benefit of multi-pass
    /// search).
    pub fn process_cep(&mut self, frames: &[Vec<f32>]) -> Result<usize> {
        if self.state != UttState::Started && self.state != UttState::Processing {
            return Err(Error::Logic("no utterance in progress".into()));
        }
        for f in frames {
            self.push_cep(f.clone())?;
        }
        self.state = UttState::Processing;
        Ok(frames.len())
    }

    /// Frames that can be scored right now. Until the utterance ends, the
    /// last few frames wait for their dynamic-feature context.
    pub fn n_frames_ready(&self) -> usize {
        if self.state == UttState::Ended {
            self.mfc.len()
        } else {
            self.mfc.len().saturating_sub(FEAT_WINDOW)
        }
    }

    pub fn frame_available(&self) -> bool {
        (self.output_frame as usize) < self.n_frames_ready()
    }

    /// Index of the next frame to score.
    pub fn frame_idx(&self) -> i32 {
        self.output_frame
    }

    /// Rewind to frame zero for a second pass over the same utterance.
    pub fn rewind(&mut self) {
        self.output_frame = 0;
    }

    #[inline]
    fn cep(&self, t: i64, dim: usize) -> f32 {
        let t = t.clamp(0, self.mfc.len() as i64 - 1) as usize;
        self.mfc[t][dim]
    }

    /// Assemble the dynamic-feature streams for one frame.
    fn features(&self, t: i64) -> Vec<Vec<f32>> {
        let nc = self.cep_len;
        match self.feat {
            FeatKind::S2x4 => {
                let cep: Vec<f32> = (1..nc).map(|d| self.cep(t, d)).collect();
                let dcep: Vec<f32> = (1..nc).map(|d| self.cep(t + 2, d) - self.cep(t - 2, d)).collect();
                let pow = vec![
                    self.cep(t, 0),
                    self.cep(t + 2, 0) - self.cep(t - 2, 0),
                    (self.cep(t + 3, 0) - self.cep(t - 1, 0))
                        - (self.cep(t + 1, 0) - self.cep(t - 3, 0)),
                ];
                let ddcep: Vec<f32> = (1..nc)
                    .map(|d| {
                        (self.cep(t + 3, d) - self.cep(t - 1, d))
                            - (self.cep(t + 1, d) - self.cep(t - 3, d))
                    })
                    .collect();
                vec![cep, dcep, pow, ddcep]
            }
            FeatKind::Cep1s => {
                let mut v = Vec::with_capacity(nc * 3);
                for d in 0..nc {
                    v.push(self.cep(t, d));
                }
                for d in 0..nc {
                    v.push(self.cep(t + 2, d) - self.cep(t - 2, d));
                }
                for d in 0..nc {
                    v.push(
                        (self.cep(t + 3, d) - self.cep(t - 1, d))
                            - (self.cep(t + 1, d) - self.cep(t - 3, d)),
                    );
                }
                vec![v]
            }
        }
    }

    pub fn clear_active(&mut self) {
        self.active_vec.fill(0);
        self.n_senone_active = 0;
    }

    /// OR in the senones an active HMM needs this frame.
    pub fn activate_hmm(&mut self, hmm: &Hmm) {
        for state in 0..hmm.n_emit_state() {
            let ssid = hmm.ssid(state);
            if ssid == NO_SSID {
                continue;
            }
            let sen = self.mdef.sseq_sen(ssid, state) as usize;
            self.active_vec[sen / 64] |= 1u64 << (sen % 64);
        }
    }

    /// Expand the activation bit-vector into a sorted id list.
    fn flags_to_list(&mut self) {
        let mut j = 0;
        for (w, &word) in self.active_vec.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let b = bits.trailing_zeros();
                self.active_list[j] = (w * 64) as i32 + b as i32;
                j += 1;
                bits &= bits - 1;
            }
        }
        self.n_senone_active = j;
    }

    pub fn n_senone_active(&self) -> usize {
        self.n_senone_active
    }

    /// Score the next frame. Returns `(frame_idx, best_score, best_senid)`,
    /// or None when no frame is ready.
    pub fn score_frame(&mut self) -> Option<(i32, i32, i32)> {
        if !self.frame_available() {
            return None;
        }
        let t = self.output_frame;
        let feats = self.features(t as i64);
        if !self.compallsen {
            self.flags_to_list();
        }
        let (best, best_sen) = self.scorer.frame_eval(
            &feats,
            &self.active_list[..self.n_senone_active],
            self.compallsen,
            t,
            &mut self.senone_scores,
        );
        if best_sen < 0 && !self.compallsen && self.n_senone_active == 0 {
            warn!("frame {}: no active senones", t);
        }
        self.output_frame += 1;
        Some((t, best, best_sen))
    }

    pub fn senone_scores(&self) -> &[i32] {
        &self.senone_scores
    }

    pub fn apply_mllr(&mut self, mllr: &crate::gauden::Mllr) -> Result<()> {
        if self.state == UttState::Started || self.state == UttState::Processing {
            return Err(Error::Logic(
                "speaker transforms apply only between utterances".into(),
            ));
        }
        self.scorer.apply_mllr(mllr)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gauden::semi::tests::toy_semi;
    use crate::gauden::SemiScorer;
    use crate::mdef::tests::toy_mdef;
    use ndarray::arr2;

    /// A scorer whose stream layout matches FeatKind::Cep1s with a 1-dim
    /// "cepstrum" (veclen 3) and as many senones as the toy mdef.
    fn toy_acmod(compallsen: bool) -> Acmod {
        let mdef = Arc::new(toy_mdef());
        let n_sen = mdef.n_sen();
        // One codeword at the origin, one off to the side, 3-dim stream.
        let means = vec![arr2(&[[0.0f32, 0.0, 0.0], [4.0, 0.0, 0.0]])];
        let vars = vec![arr2(&[[1.0f32, 1.0, 1.0], [1.0, 1.0, 1.0]])];
        let mixw: Vec<Vec<Vec<f32>>> = (0..n_sen)
            .map(|s| vec![vec![0.2 + 0.6 * ((s % 2) as f32), 0.8 - 0.6 * ((s % 2) as f32)]])
            .collect();
        let scorer = SemiScorer::from_parts(1.0001, means, vars, &mixw, 1e-7, 1e-4, 2, 1).unwrap();
        Acmod::new(
            mdef,
            Box::new(scorer),
            FeatKind::Cep1s,
            1,
            CmnKind::None,
            &[],
            compallsen,
            None,
        )
        .unwrap()
    }

    fn cep_frames(n: usize, value: f32) -> Vec<Vec<f32>> {
        (0..n).map(|_| vec![value]).collect()
    }

    #[test]
    fn frames_wait_for_their_window() {
        let mut ac = toy_acmod(true);
        ac.start_utt().unwrap();
        ac.process_cep(&cep_frames(2, 0.0)).unwrap();
        assert_eq!(ac.n_frames_ready(), 0);
        ac.process_cep(&cep_frames(4, 0.0)).unwrap();
        assert_eq!(ac.n_frames_ready(), 3);
        ac.end_utt().unwrap();
        assert_eq!(ac.n_frames_ready(), 6);
    }

    #[test]
    fn chunked_and_oneshot_scores_agree() {
        let frames: Vec<Vec<f32>> = (0..20).map(|i| vec![(i % 5) as f32 * 0.7]).collect();

        let mut a = toy_acmod(true);
        a.start_utt().unwrap();
        a.process_cep(&frames).unwrap();
        a.end_utt().unwrap();
        let mut best_a = Vec::new();
        while let Some((_, _, sen)) = a.score_frame() {
            best_a.push(sen);
        }

        // Feed in small chunks, scoring whatever becomes ready as we go.
        let mut b = toy_acmod(true);
        b.start_utt().unwrap();
        let mut best_b = Vec::new();
        for chunk in frames.chunks(3) {
            b.process_cep(chunk).unwrap();
            while let Some((_, _, sen)) = b.score_frame() {
                best_b.push(sen);
            }
        }
        b.end_utt().unwrap();
        while let Some((_, _, sen)) = b.score_frame() {
            best_b.push(sen);
        }
        assert_eq!(best_a.len(), 20);
        assert_eq!(best_a, best_b);
    }

    #[test]
    fn rewind_reproduces_best_senones() {
        let mut ac = toy_acmod(true);
        ac.start_utt().unwrap();
        let frames: Vec<Vec<f32>> = (0..12).map(|i| vec![i as f32 * 0.4]).collect();
        ac.process_cep(&frames).unwrap();
        ac.end_utt().unwrap();
        let mut first = Vec::new();
        while let Some((_, _, sen)) = ac.score_frame() {
            first.push(sen);
        }
        ac.rewind();
        let mut second = Vec::new();
        while let Some((_, _, sen)) = ac.score_frame() {
            second.push(sen);
        }
        assert_eq!(first, second);
    }

    #[test]
    fn activation_bits_become_a_sorted_list() {
        let mut ac = toy_acmod(false);
        ac.clear_active();
        // Poke bits directly through an HMM.
        let mdef = ac.mdef().clone();
        let ctx = crate::hmm::tests::toy_ctx();
        let hmm = Hmm::new(&ctx, false, mdef.ci_ssid(1), mdef.ci_tmat(1));
        ac.activate_hmm(&hmm);
        ac.flags_to_list();
        assert_eq!(ac.n_senone_active(), 3);
        let l = &ac.active_list[..3];
        assert_eq!(l, &[3, 4, 5]);
    }

    #[test]
    fn no_active_senones_and_no_compallsen_scores_nothing() {
        let mut ac = toy_acmod(false);
        ac.start_utt().unwrap();
        ac.process_cep(&cep_frames(8, 0.0)).unwrap();
        ac.end_utt().unwrap();
        ac.clear_active();
        let (_, best, sen) = ac.score_frame().unwrap();
        assert_eq!(sen, -1);
        assert_eq!(best, WORST_SCORE);
    }

    #[test]
    fn cmn_current_subtracts_running_mean() {
        let mdef = Arc::new(toy_mdef());
        let _ = mdef;
        let mut cmn = Cmn::new(CmnKind::Current, 2, &[]);
        let mut f1 = vec![2.0f32, 4.0];
        cmn.apply(&mut f1);
        // First frame: mean equals the frame, so it zeroes out.
        assert_eq!(f1, vec![0.0, 0.0]);
        let mut f2 = vec![4.0f32, 0.0];
        cmn.apply(&mut f2);
        // Mean is now (3, 2).
        assert_eq!(f2, vec![1.0, -2.0]);
    }

    #[test]
    fn semi_scorer_layout_must_match() {
        let mdef = Arc::new(toy_mdef());
        let scorer = toy_semi(); // 2 streams of veclen 1, 3 senones
        let r = Acmod::new(
            mdef,
            Box::new(scorer),
            FeatKind::Cep1s,
            1,
            CmnKind::None,
            &[],
            true,
            None,
        );
        assert!(r.is_err());
    }
}
