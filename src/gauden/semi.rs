//! Semi-continuous senone scorer.
//!
//! One shared codebook of diagonal Gaussians per feature stream. Scoring a
//! frame is two phases: evaluate every codeword of every stream against the
//! frame (a Mahalanobis distance against precomputed {mean, 1/2σ²,
//! log-determinant}), keep the top-N per stream, then mix those top-N
//! scores into each active senone through its quantised mixture weights.
//!
//! Mixture weights are 8-bit negated quantised logs in shifted score units,
//! and the mixing loop adds probabilities with the narrow 8-bit log-add
//! table, so the whole inner loop stays in small integers. Codeword scores
//! are shifted the same way; final senone scores are shifted back up.
//!
//! Frames may be downsampled: when `frame % ds_ratio != 0` the previous
//! frame's top-N lists are reused and only the mixing runs.
use std::path::Path;

use ndarray::Array2;
use tracing::info;

use super::{floor_and_norm, read_mgau_file, read_mixw_file, FeatFrame, Mllr, SenoneScorer};
use crate::bio::BinReader;
use crate::error::{Error, Result};
use crate::logmath::{LogMath, LOGPROB_ZERO, WORST_SCORE};

/// Shift applied to codeword and mixture scores so the add table fits in
/// eight bits.
pub const SENSCR_SHIFT: u32 = 10;

pub const MAX_TOPN: usize = 16;

#[derive(Debug, Clone, Copy)]
struct TopCw {
    cw: u32,
    /// Shifted score.
    score: i32,
}

#[derive(Debug)]
pub struct SemiScorer {
    n_sen: usize,
    n_density: usize,
    topn: usize,
    ds_ratio: i32,
    veclen: Vec<usize>,
    /// Per stream: density x veclen.
    means: Vec<Array2<f32>>,
    /// Raw variances, kept so MLLR can re-derive the precomputed tables.
    raw_vars: Vec<Array2<f32>>,
    /// Precomputed 1/(2σ²) in log-base units per squared difference.
    inv_vars: Vec<Array2<f32>>,
    /// Precomputed log determinants, full log-base units.
    dets: Vec<Vec<f64>>,
    /// Per stream: n_sen x n_density quantised negated log weights.
    mixw: Vec<Array2<u8>>,
    lmath_8b: LogMath,
    var_floor: f64,
    /// Top-N codewords per stream, retained across downsampled frames.
    top: Vec<Vec<TopCw>>,
}

impl SemiScorer {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        base: f64,
        mean_path: &Path,
        var_path: &Path,
        mixw_path: Option<&Path>,
        sendump_path: Option<&Path>,
        mixw_floor: f64,
        var_floor: f64,
        topn: usize,
        ds_ratio: i32,
    ) -> Result<Self> {
        let mf = read_mgau_file(mean_path)?;
        let vf = read_mgau_file(var_path)?;
        if mf.n_mgau != 1 {
            return Err(Error::format(
                mean_path.display().to_string(),
                format!("semi-continuous model expects 1 codebook, found {}", mf.n_mgau),
            ));
        }
        if vf.n_mgau != mf.n_mgau || vf.n_feat != mf.n_feat || vf.n_density != mf.n_density
            || vf.veclen != mf.veclen
        {
            return Err(Error::format(
                var_path.display().to_string(),
                "variance file dimensions disagree with means",
            ));
        }

        let n_density = mf.n_density;
        let n_feat = mf.n_feat;
        let veclen = mf.veclen.clone();
        let means = split_streams(&mf.data, n_density, &veclen);
        let raw_vars = split_streams(&vf.data, n_density, &veclen);

        let lmath_8b = LogMath::new(base, SENSCR_SHIFT)?;

        let mixw = match (sendump_path, mixw_path) {
            (Some(p), _) => read_sendump(p, n_feat, n_density)?,
            (None, Some(p)) => {
                let mw = read_mixw_file(p)?;
                if mw.n_feat != n_feat || mw.n_comp != n_density {
                    return Err(Error::format(
                        p.display().to_string(),
                        format!(
                            "mixture weights are {} x {}, model is {} x {}",
                            mw.n_feat, mw.n_comp, n_feat, n_density
                        ),
                    ));
                }
                quantise_mixw(&lmath_8b, &mw.data, mw.n_sen, n_feat, n_density, mixw_floor)
            }
            (None, None) => {
                return Err(Error::Config(
                    "semi-continuous model needs mixture_weights or sendump".into(),
                ))
            }
        };
        let n_sen = mixw[0].nrows();

        let mut s = SemiScorer {
            n_sen,
            n_density,
            topn: topn.clamp(1, MAX_TOPN.min(n_density)),
            ds_ratio: ds_ratio.max(1),
            veclen,
            means,
            raw_vars,
            inv_vars: Vec::new(),
            dets: Vec::new(),
            mixw,
            lmath_8b,
            var_floor,
            top: Vec::new(),
        };
        s.precompute();
        s.reset_topn();
        Ok(s)
    }

    /// Build a scorer from in-memory parameters; the linear `mixw` rows are
    /// floored and quantised exactly as the file path does it.
    pub fn from_parts(
        base: f64,
        means: Vec<Array2<f32>>,
        vars: Vec<Array2<f32>>,
        mixw: &[Vec<Vec<f32>>],
        mixw_floor: f64,
        var_floor: f64,
        topn: usize,
        ds_ratio: i32,
    ) -> Result<Self> {
        let n_density = means[0].nrows();
        let n_feat = means.len();
        let veclen: Vec<usize> = means.iter().map(|m| m.ncols()).collect();
        let n_sen = mixw.len();
        let lmath_8b = LogMath::new(base, SENSCR_SHIFT)?;
        let mut flat = Vec::with_capacity(n_sen * n_feat * n_density);
        for sen in mixw {
            for stream in sen {
                flat.extend_from_slice(stream);
            }
        }
        let mixw = quantise_mixw(&lmath_8b, &flat, n_sen, n_feat, n_density, mixw_floor);
        let mut s = SemiScorer {
            n_sen,
            n_density,
            topn: topn.clamp(1, MAX_TOPN.min(n_density)),
            ds_ratio: ds_ratio.max(1),
            veclen,
            means,
            raw_vars: vars,
            inv_vars: Vec::new(),
            dets: Vec::new(),
            mixw,
            lmath_8b,
            var_floor,
            top: Vec::new(),
        };
        s.precompute();
        s.reset_topn();
        Ok(s)
    }

    /// Derive 1/2σ² and log determinants from the raw variances, flooring
    /// as we go.
    fn precompute(&mut self) {
        let ln_b = self.lmath_8b.base().ln();
        let two_pi = std::f64::consts::TAU;
        let mut n_floored = 0usize;
        self.inv_vars.clear();
        self.dets.clear();
        for (raw, &len) in self.raw_vars.iter().zip(self.veclen.iter()) {
            let mut inv = Array2::zeros((self.n_density, len));
            let mut dets = Vec::with_capacity(self.n_density);
            for cw in 0..self.n_density {
                let mut det = 0.0f64;
                for j in 0..len {
                    let mut var = raw[(cw, j)] as f64;
                    if var < self.var_floor {
                        var = self.var_floor;
                        n_floored += 1;
                    }
                    det += (1.0 / (var * two_pi).sqrt()).ln() / ln_b;
                    inv[(cw, j)] = (1.0 / (2.0 * var * ln_b)) as f32;
                }
                dets.push(det);
            }
            self.inv_vars.push(inv);
            self.dets.push(dets);
        }
        if n_floored > 0 {
            info!("floored {} variance values", n_floored);
        }
    }

    fn reset_topn(&mut self) {
        self.top = self
            .veclen
            .iter()
            .map(|_| vec![TopCw { cw: 0, score: WORST_SCORE }; self.topn])
            .collect();
    }

    /// Score every codeword of one stream and keep the best N.
    fn eval_cb(&mut self, stream: usize, z: &[f32]) {
        let means = &self.means[stream];
        let inv = &self.inv_vars[stream];
        let dets = &self.dets[stream];
        let len = self.veclen[stream];
        let top = &mut self.top[stream];
        for t in top.iter_mut() {
            *t = TopCw { cw: 0, score: WORST_SCORE };
        }

        for cw in 0..self.n_density {
            let mut d = dets[cw];
            for j in 0..len {
                let diff = (z[j] - means[(cw, j)]) as f64;
                d -= diff * diff * inv[(cw, j)] as f64;
            }
            let score = (d.max(WORST_SCORE as f64) as i32) >> SENSCR_SHIFT;

            // Bounded insertion, best first.
            if score <= top[self.topn - 1].score {
                continue;
            }
            let mut pos = self.topn - 1;
            while pos > 0 && score > top[pos - 1].score {
                top[pos] = top[pos - 1];
                pos -= 1;
            }
            top[pos] = TopCw { cw: cw as u32, score };
        }
    }

    /// Mix one senone's score out of the current top-N lists. Shifted units.
    #[inline]
    fn senone_score(&self, sen: usize) -> i32 {
        let mut total = 0i32;
        for (stream, top) in self.top.iter().enumerate() {
            let mixw = &self.mixw[stream];
            let mut acc = top[0].score - mixw[(sen, top[0].cw as usize)] as i32;
            for t in &top[1..] {
                if t.score <= WORST_SCORE {
                    break;
                }
                let c = t.score - mixw[(sen, t.cw as usize)] as i32;
                acc = self.lmath_8b.add(acc, c);
            }
            total = total.saturating_add(acc);
        }
        total
    }

    /// Senone score back in full (unshifted) units.
    #[inline]
    fn senone_full(&self, sen: usize) -> i32 {
        let sh = self.senone_score(sen);
        ((sh as i64) << SENSCR_SHIFT).max(WORST_SCORE as i64) as i32
    }

    pub fn n_density(&self) -> usize {
        self.n_density
    }

    pub fn topn(&self) -> usize {
        self.topn
    }
}

impl SenoneScorer for SemiScorer {
    fn n_sen(&self) -> usize {
        self.n_sen
    }

    fn n_streams(&self) -> usize {
        self.veclen.len()
    }

    fn veclen(&self) -> &[usize] {
        &self.veclen
    }

    fn frame_eval(
        &mut self,
        feat: &FeatFrame,
        active: &[i32],
        compallsen: bool,
        frame: i32,
        scores: &mut [i32],
    ) -> (i32, i32) {
        // Downsampling reuses the previous frame's top-N lists.
        if frame % self.ds_ratio == 0 {
            for stream in 0..self.veclen.len() {
                debug_assert_eq!(feat[stream].len(), self.veclen[stream]);
                self.eval_cb(stream, &feat[stream]);
            }
        }

        scores.fill(LOGPROB_ZERO);
        let mut best = i32::MIN;
        let mut best_sen = -1i32;
        if compallsen {
            for sen in 0..self.n_sen {
                let v = self.senone_full(sen);
                scores[sen] = v;
                if v > best {
                    best = v;
                    best_sen = sen as i32;
                }
            }
        } else {
            for &sen in active {
                let v = self.senone_full(sen as usize);
                scores[sen as usize] = v;
                if v > best {
                    best = v;
                    best_sen = sen;
                }
            }
        }

        if best_sen < 0 {
            return (WORST_SCORE, -1);
        }
        // Renormalise so the best senone sits at zero.
        for s in scores.iter_mut() {
            if *s != LOGPROB_ZERO {
                *s -= best;
            }
        }
        (best, best_sen)
    }

    fn apply_mllr(&mut self, mllr: &Mllr) -> Result<()> {
        if mllr.a.len() != self.veclen.len() {
            return Err(Error::Domain(format!(
                "transform has {} streams, model has {}",
                mllr.a.len(),
                self.veclen.len()
            )));
        }
        for (stream, &len) in self.veclen.iter().enumerate() {
            if mllr.a[stream].nrows() != len {
                return Err(Error::Domain(format!(
                    "transform stream {stream} is {}-dimensional, model wants {len}",
                    mllr.a[stream].nrows()
                )));
            }
        }
        let mut scratch = Vec::new();
        for (stream, &len) in self.veclen.iter().enumerate() {
            let means = &mut self.means[stream];
            for cw in 0..self.n_density {
                scratch.clear();
                scratch.extend((0..len).map(|j| means[(cw, j)]));
                let mut out = vec![0.0f32; len];
                mllr.transform_mean(stream, &scratch, &mut out);
                for (j, &v) in out.iter().enumerate() {
                    means[(cw, j)] = v;
                }
                let raw = &mut self.raw_vars[stream];
                for j in 0..len {
                    let h = mllr.h[stream][j];
                    if h > 0.0 {
                        raw[(cw, j)] /= h;
                    }
                }
            }
        }
        self.precompute();
        Ok(())
    }
}

fn split_streams(data: &[f32], n_density: usize, veclen: &[usize]) -> Vec<Array2<f32>> {
    let blk: usize = veclen.iter().sum();
    veclen
        .iter()
        .scan(0usize, |off, &len| {
            let start = *off;
            *off += len;
            Some((start, len))
        })
        .map(|(start, len)| {
            let mut m = Array2::zeros((n_density, len));
            for cw in 0..n_density {
                for j in 0..len {
                    m[(cw, j)] = data[cw * blk + start + j];
                }
            }
            m
        })
        .collect()
}

/// Floor, renormalise, convert to the shifted log base and quantise to a
/// byte, clipping at 255.
fn quantise_mixw(
    lmath_8b: &LogMath,
    data: &[f32],
    n_sen: usize,
    n_feat: usize,
    n_comp: usize,
    floor: f64,
) -> Vec<Array2<u8>> {
    let mut out: Vec<Array2<u8>> = (0..n_feat).map(|_| Array2::zeros((n_sen, n_comp))).collect();
    let mut n_err = 0usize;
    let mut row = vec![0.0f32; n_comp];
    for sen in 0..n_sen {
        for feat in 0..n_feat {
            let off = (sen * n_feat + feat) * n_comp;
            row.copy_from_slice(&data[off..off + n_comp]);
            if !floor_and_norm(&mut row, floor as f32) {
                n_err += 1;
            }
            for (cw, &p) in row.iter().enumerate() {
                let q = -lmath_8b.log(p as f64);
                out[feat][(sen, cw)] = q.clamp(0, 255) as u8;
            }
        }
    }
    if n_err > 0 {
        tracing::error!("weight normalisation failed for {} senones", n_err);
    }
    out
}

/// Pre-quantised mixture weights, keyed on the dimensions of the rest of
/// the model.
fn read_sendump(path: &Path, n_feat: usize, n_density: usize) -> Result<Vec<Array2<u8>>> {
    let mut r = BinReader::open(path)?;
    let n_sen = r.read_i32()? as usize;
    let file_feat = r.read_i32()? as usize;
    let file_density = r.read_i32()? as usize;
    if file_feat != n_feat || file_density != n_density {
        return Err(Error::format(
            r.file(),
            format!(
                "sendump is {file_feat} x {file_density}, model is {n_feat} x {n_density}"
            ),
        ));
    }
    let mut out = Vec::with_capacity(n_feat);
    for _ in 0..n_feat {
        let data = r.read_u8_vec(n_sen * n_density)?;
        out.push(
            Array2::from_shape_vec((n_sen, n_density), data)
                .map_err(|e| Error::format(r.file(), e.to_string()))?,
        );
    }
    r.verify_chksum()?;
    r.expect_eof()?;
    info!("{}: {} x {} x {} sendump weights", r.file(), n_sen, n_feat, n_density);
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::arr2;

    /// Two streams of one dimension each, two codewords per stream, three
    /// senones with sharply different weights. Senone 0 likes codeword 0,
    /// senone 1 likes codeword 1, senone 2 is split.
    pub(crate) fn toy_semi() -> SemiScorer {
        let means = vec![arr2(&[[0.0f32], [4.0]]), arr2(&[[0.0f32], [4.0]])];
        let vars = vec![arr2(&[[1.0f32], [1.0]]), arr2(&[[1.0f32], [1.0]])];
        let mixw = vec![
            vec![vec![0.9, 0.1], vec![0.9, 0.1]],
            vec![vec![0.1, 0.9], vec![0.1, 0.9]],
            vec![vec![0.5, 0.5], vec![0.5, 0.5]],
        ];
        SemiScorer::from_parts(1.0001, means, vars, &mixw, 1e-7, 1e-4, 2, 1).unwrap()
    }

    #[test]
    fn frame_near_codeword_zero_prefers_senone_zero() {
        let mut s = toy_semi();
        let feat = vec![vec![0.1f32], vec![0.1f32]];
        let mut scores = vec![0; s.n_sen()];
        let (best, best_sen) = s.frame_eval(&feat, &[], true, 0, &mut scores);
        assert!(best > WORST_SCORE);
        assert_eq!(best_sen, 0);
        assert_eq!(scores[0], 0);
        assert!(scores[1] < 0);
        assert!(scores[2] < 0 && scores[2] > scores[1]);
    }

    #[test]
    fn scoring_is_deterministic() {
        let mut s = toy_semi();
        let feat = vec![vec![2.3f32], vec![1.7f32]];
        let mut a = vec![0; s.n_sen()];
        let mut b = vec![0; s.n_sen()];
        let ra = s.frame_eval(&feat, &[], true, 0, &mut a);
        let rb = s.frame_eval(&feat, &[], true, 0, &mut b);
        assert_eq!(ra, rb);
        assert_eq!(a, b);
    }

    #[test]
    fn active_subset_leaves_others_at_zero_prob() {
        let mut s = toy_semi();
        let feat = vec![vec![3.9f32], vec![3.9f32]];
        let mut scores = vec![0; s.n_sen()];
        let (_, best_sen) = s.frame_eval(&feat, &[1, 2], false, 0, &mut scores);
        assert_eq!(best_sen, 1);
        assert_eq!(scores[0], LOGPROB_ZERO);
        assert_eq!(scores[1], 0);
    }

    #[test]
    fn downsampling_reuses_codeword_scores() {
        let means = vec![arr2(&[[0.0f32], [4.0]])];
        let vars = vec![arr2(&[[1.0f32], [1.0]])];
        let mixw = vec![
            vec![vec![0.9, 0.1]],
            vec![vec![0.1, 0.9]],
        ];
        let mut s = SemiScorer::from_parts(1.0001, means, vars, &mixw, 1e-7, 1e-4, 2, 2).unwrap();
        let near0 = vec![vec![0.0f32]];
        let near1 = vec![vec![4.0f32]];
        let mut scores = vec![0; 2];
        // Frame 0 computes codewords from near0.
        let (_, s0) = s.frame_eval(&near0, &[], true, 0, &mut scores);
        assert_eq!(s0, 0);
        // Frame 1 is downsampled: the near1 features are ignored and the
        // senone preference stays with senone 0.
        let (_, s1) = s.frame_eval(&near1, &[], true, 1, &mut scores);
        assert_eq!(s1, 0);
        // Frame 2 recomputes and flips.
        let (_, s2) = s.frame_eval(&near1, &[], true, 2, &mut scores);
        assert_eq!(s2, 1);
    }

    #[test]
    fn mllr_shift_moves_the_decision_boundary() {
        let mut s = toy_semi();
        let feat = vec![vec![0.0f32], vec![0.0f32]];
        let mut scores = vec![0; s.n_sen()];
        let (_, before) = s.frame_eval(&feat, &[], true, 0, &mut scores);
        assert_eq!(before, 0);
        // Shift every mean down by 4: codeword 1 now sits at 0.
        let mllr = Mllr {
            a: vec![arr2(&[[1.0f32]]), arr2(&[[1.0f32]])],
            b: vec![vec![-4.0], vec![-4.0]],
            h: vec![vec![1.0], vec![1.0]],
        };
        s.apply_mllr(&mllr).unwrap();
        let (_, after) = s.frame_eval(&feat, &[], true, 0, &mut scores);
        assert_eq!(after, 1);
    }
}
