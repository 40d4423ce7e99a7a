//! Continuous senone scorer: every senone owns a small diagonal-covariance
//! Gaussian mixture over a single feature stream. No codebook sharing, no
//! top-N, no weight quantisation; every component of every active senone is
//! evaluated with the full-width log-add table.
use std::path::Path;

use ndarray::{Array2, Array3};
use tracing::info;

use super::{floor_and_norm, read_mgau_file, read_mixw_file, FeatFrame, Mllr, SenoneScorer};
use crate::error::{Error, Result};
use crate::logmath::{LogMath, LOGPROB_ZERO, WORST_SCORE};

#[derive(Debug)]
pub struct ContScorer {
    n_sen: usize,
    n_density: usize,
    veclen: Vec<usize>,
    /// (senone, component, dim).
    means: Array3<f32>,
    raw_vars: Array3<f32>,
    /// Precomputed 1/(2σ²) in log-base units.
    inv_vars: Array3<f32>,
    /// (senone, component) log determinants, full log-base units.
    dets: Array2<f64>,
    /// (senone, component) log mixture weights.
    mixw: Array2<i32>,
    /// Senones whose weight row failed to normalise score LOGPROB_ZERO.
    valid: Vec<bool>,
    lmath: LogMath,
    var_floor: f64,
}

impl ContScorer {
    pub fn load(
        base: f64,
        mean_path: &Path,
        var_path: &Path,
        mixw_path: &Path,
        mixw_floor: f64,
        var_floor: f64,
    ) -> Result<Self> {
        let mf = read_mgau_file(mean_path)?;
        let vf = read_mgau_file(var_path)?;
        if mf.n_feat != 1 {
            return Err(Error::format(
                mean_path.display().to_string(),
                format!("continuous model expects 1 feature stream, found {}", mf.n_feat),
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
        let mw = read_mixw_file(mixw_path)?;
        if mw.n_sen != mf.n_mgau || mw.n_comp != mf.n_density {
            return Err(Error::format(
                mixw_path.display().to_string(),
                format!(
                    "mixture weights are {} x {}, model is {} x {}",
                    mw.n_sen, mw.n_comp, mf.n_mgau, mf.n_density
                ),
            ));
        }

        let n_sen = mf.n_mgau;
        let n_density = mf.n_density;
        let len = mf.veclen[0];
        let means = Array3::from_shape_vec((n_sen, n_density, len), mf.data)
            .map_err(|e| Error::format(mean_path.display().to_string(), e.to_string()))?;
        let raw_vars = Array3::from_shape_vec((n_sen, n_density, len), vf.data)
            .map_err(|e| Error::format(var_path.display().to_string(), e.to_string()))?;
        Self::from_parts_inner(base, means, raw_vars, &mw.data, mixw_floor, var_floor)
    }

    pub fn from_parts(
        base: f64,
        means: Array3<f32>,
        vars: Array3<f32>,
        mixw: &[Vec<f32>],
        mixw_floor: f64,
        var_floor: f64,
    ) -> Result<Self> {
        let flat: Vec<f32> = mixw.iter().flatten().copied().collect();
        Self::from_parts_inner(base, means, vars, &flat, mixw_floor, var_floor)
    }

    fn from_parts_inner(
        base: f64,
        means: Array3<f32>,
        raw_vars: Array3<f32>,
        mixw_flat: &[f32],
        mixw_floor: f64,
        var_floor: f64,
    ) -> Result<Self> {
        let (n_sen, n_density, len) = means.dim();
        let lmath = LogMath::new(base, 0)?;

        let mut mixw = Array2::zeros((n_sen, n_density));
        let mut valid = vec![true; n_sen];
        let mut n_err = 0usize;
        let mut row = vec![0.0f32; n_density];
        for sen in 0..n_sen {
            row.copy_from_slice(&mixw_flat[sen * n_density..(sen + 1) * n_density]);
            if !floor_and_norm(&mut row, mixw_floor as f32) {
                valid[sen] = false;
                n_err += 1;
            }
            for (c, &p) in row.iter().enumerate() {
                mixw[(sen, c)] = lmath.log(p as f64);
            }
        }
        if n_err > 0 {
            tracing::error!("weight normalisation failed for {} senones", n_err);
        }

        let mut s = ContScorer {
            n_sen,
            n_density,
            veclen: vec![len],
            means,
            raw_vars,
            inv_vars: Array3::zeros((n_sen, n_density, len)),
            dets: Array2::zeros((n_sen, n_density)),
            mixw,
            valid,
            lmath,
            var_floor,
        };
        s.precompute();
        Ok(s)
    }

    fn precompute(&mut self) {
        let ln_b = self.lmath.base().ln();
        let two_pi = std::f64::consts::TAU;
        let len = self.veclen[0];
        let mut n_floored = 0usize;
        for sen in 0..self.n_sen {
            for c in 0..self.n_density {
                let mut det = 0.0f64;
                for j in 0..len {
                    let mut var = self.raw_vars[(sen, c, j)] as f64;
                    if var < self.var_floor {
                        var = self.var_floor;
                        n_floored += 1;
                    }
                    det += (1.0 / (var * two_pi).sqrt()).ln() / ln_b;
                    self.inv_vars[(sen, c, j)] = (1.0 / (2.0 * var * ln_b)) as f32;
                }
                self.dets[(sen, c)] = det;
            }
        }
        if n_floored > 0 {
            info!("floored {} variance values", n_floored);
        }
    }

    fn senone_score(&self, sen: usize, z: &[f32]) -> i32 {
        if !self.valid[sen] {
            return LOGPROB_ZERO;
        }
        let len = self.veclen[0];
        let mut acc = WORST_SCORE;
        for c in 0..self.n_density {
            let mut d = self.dets[(sen, c)];
            for j in 0..len {
                let diff = (z[j] - self.means[(sen, c, j)]) as f64;
                d -= diff * diff * self.inv_vars[(sen, c, j)] as f64;
            }
            let comp = (d.max(WORST_SCORE as f64) as i32)
                .saturating_add(self.mixw[(sen, c)])
                .max(WORST_SCORE);
            acc = if c == 0 { comp } else { self.lmath.add(acc, comp) };
        }
        acc
    }
}

impl SenoneScorer for ContScorer {
    fn n_sen(&self) -> usize {
        self.n_sen
    }

    fn n_streams(&self) -> usize {
        1
    }

    fn veclen(&self) -> &[usize] {
        &self.veclen
    }

    fn frame_eval(
        &mut self,
        feat: &FeatFrame,
        active: &[i32],
        compallsen: bool,
        _frame: i32,
        scores: &mut [i32],
    ) -> (i32, i32) {
        let z = &feat[0];
        scores.fill(LOGPROB_ZERO);
        let mut best = i32::MIN;
        let mut best_sen = -1i32;
        if compallsen {
            for sen in 0..self.n_sen {
                let v = self.senone_score(sen, z);
                scores[sen] = v;
                if v > best {
                    best = v;
                    best_sen = sen as i32;
                }
            }
        } else {
            for &sen in active {
                let v = self.senone_score(sen as usize, z);
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
        for s in scores.iter_mut() {
            if *s != LOGPROB_ZERO {
                *s -= best;
            }
        }
        (best, best_sen)
    }

    fn apply_mllr(&mut self, mllr: &Mllr) -> Result<()> {
        if mllr.a.len() != 1 || mllr.a[0].nrows() != self.veclen[0] {
            return Err(Error::Domain(
                "transform dimensions disagree with the continuous model".into(),
            ));
        }
        let len = self.veclen[0];
        let mut scratch = vec![0.0f32; len];
        let mut out = vec![0.0f32; len];
        for sen in 0..self.n_sen {
            for c in 0..self.n_density {
                for j in 0..len {
                    scratch[j] = self.means[(sen, c, j)];
                }
                mllr.transform_mean(0, &scratch, &mut out);
                for j in 0..len {
                    self.means[(sen, c, j)] = out[j];
                    let h = mllr.h[0][j];
                    if h > 0.0 {
                        self.raw_vars[(sen, c, j)] /= h;
                    }
                }
            }
        }
        self.precompute();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::Array3;

    /// Three senones over a 2-dimensional stream, one component each,
    /// centred at distinct points; senone 2 has a dead weight row.
    pub(crate) fn toy_cont() -> ContScorer {
        let mut means = Array3::zeros((3, 1, 2));
        means[(1, 0, 0)] = 4.0;
        means[(1, 0, 1)] = 4.0;
        means[(2, 0, 0)] = -4.0;
        let vars = Array3::from_elem((3, 1, 2), 1.0f32);
        let mixw = vec![vec![1.0], vec![1.0], vec![0.0]];
        ContScorer::from_parts(1.0001, means, vars, &mixw, 1e-7, 1e-4).unwrap()
    }

    #[test]
    fn nearest_senone_wins() {
        let mut s = toy_cont();
        let mut scores = vec![0; 3];
        let (_, sen) = s.frame_eval(&[vec![0.2, -0.1]], &[], true, 0, &mut scores);
        assert_eq!(sen, 0);
        let (_, sen) = s.frame_eval(&[vec![3.8, 4.1]], &[], true, 1, &mut scores);
        assert_eq!(sen, 1);
    }

    #[test]
    fn dead_weight_row_scores_log_zero() {
        let mut s = toy_cont();
        let mut scores = vec![0; 3];
        // Right on senone 2's mean, but its weights were all zero.
        let (_, sen) = s.frame_eval(&[vec![-4.0, 0.0]], &[], true, 0, &mut scores);
        assert_ne!(sen, 2);
        assert_eq!(scores[2], LOGPROB_ZERO);
    }

    #[test]
    fn mllr_recentres_means() {
        let mut s = toy_cont();
        let mut scores = vec![0; 3];
        let mllr = Mllr {
            a: vec![ndarray::arr2(&[[1.0f32, 0.0], [0.0, 1.0]])],
            b: vec![vec![-4.0, -4.0]],
            h: vec![vec![1.0, 1.0]],
        };
        s.apply_mllr(&mllr).unwrap();
        // Senone 1's mean moved to the origin.
        let (_, sen) = s.frame_eval(&[vec![0.0, 0.0]], &[], true, 0, &mut scores);
        assert_eq!(sen, 1);
    }
}
