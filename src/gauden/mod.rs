//! Acoustic model evaluation: turning a feature frame into a vector of
//! per-senone log-likelihood scores.
//!
//! Two back-ends implement [`SenoneScorer`]: the semi-continuous scorer
//! (shared Gaussian codebook per feature stream, quantised mixture weights,
//! top-N approximation) and the continuous scorer (a private mixture per
//! senone). Which one a model wants is decided by the codebook count in its
//! parameter files, exactly the way the model directory layout implies it.
//!
//! Scores follow the crate convention: `i32`, log domain, higher is better,
//! renormalised per frame so the best senone scores 0 and everything else is
//! negative. A senone that cannot be evaluated gets [`LOGPROB_ZERO`].
use std::path::Path;

use ndarray::Array2;
use tracing::info;

use crate::bio::BinReader;
use crate::error::{Error, Result};

pub mod cont;
pub mod semi;

pub use cont::ContScorer;
pub use semi::SemiScorer;

pub const MGAU_PARAM_VERSION: &str = "1.0";
pub const MGAU_MIXW_VERSION: &str = "1.0";

/// A frame of features: one vector per stream.
pub type FeatFrame = [Vec<f32>];

pub trait SenoneScorer {
    fn n_sen(&self) -> usize;
    fn n_streams(&self) -> usize;
    fn veclen(&self) -> &[usize];

    /// Score one frame. `active` lists the senones the search needs unless
    /// `compallsen` asks for all of them. Writes into `scores` (inactive
    /// senones get `LOGPROB_ZERO`), renormalises so the best active senone
    /// is 0, and returns the pre-normalisation best score with its senone.
    fn frame_eval(
        &mut self,
        feat: &FeatFrame,
        active: &[i32],
        compallsen: bool,
        frame: i32,
        scores: &mut [i32],
    ) -> (i32, i32);

    /// Apply a speaker transform. Strictly between utterances.
    fn apply_mllr(&mut self, mllr: &Mllr) -> Result<()>;
}

/// A regression-class-free MLLR transform: per stream, means are replaced by
/// `A·m + b` and inverse variances are scaled by `h`. Stored as a plain text
/// file: the stream count, then for each stream its dimension followed by
/// the rows of `A`, the vector `b`, and the vector `h`.
#[derive(Debug, Clone)]
pub struct Mllr {
    pub a: Vec<Array2<f32>>,
    pub b: Vec<Vec<f32>>,
    pub h: Vec<Vec<f32>>,
}

impl Mllr {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::format(path.display().to_string(), e.to_string()))?;
        let mut toks = text.split_whitespace().map(|t| t.parse::<f32>());
        let mut next = move || -> Result<f32> {
            toks.next()
                .and_then(|t| t.ok())
                .ok_or_else(|| Error::format(path.display().to_string(), "truncated transform"))
        };

        let n_stream = next()? as usize;
        if n_stream == 0 || n_stream > 8 {
            return Err(Error::format(
                path.display().to_string(),
                format!("implausible stream count {n_stream}"),
            ));
        }
        let mut a = Vec::with_capacity(n_stream);
        let mut b = Vec::with_capacity(n_stream);
        let mut h = Vec::with_capacity(n_stream);
        for _ in 0..n_stream {
            let len = next()? as usize;
            let mut mat = Array2::zeros((len, len));
            for i in 0..len {
                for j in 0..len {
                    mat[(i, j)] = next()?;
                }
            }
            a.push(mat);
            let mut vb = Vec::with_capacity(len);
            for _ in 0..len {
                vb.push(next()?);
            }
            b.push(vb);
            let mut vh = Vec::with_capacity(len);
            for _ in 0..len {
                vh.push(next()?);
            }
            h.push(vh);
        }
        Ok(Mllr { a, b, h })
    }

    /// `A·m + b` for one stream.
    pub fn transform_mean(&self, stream: usize, mean: &[f32], out: &mut [f32]) {
        let a = &self.a[stream];
        let b = &self.b[stream];
        for (i, o) in out.iter_mut().enumerate() {
            let mut acc = b[i];
            for (j, &m) in mean.iter().enumerate() {
                acc += a[(i, j)] * m;
            }
            *o = acc;
        }
    }
}

/// Parsed contents of a Sphinx-3 `means` or `variances` file.
#[derive(Debug)]
pub struct MgauFile {
    pub n_mgau: usize,
    pub n_feat: usize,
    pub n_density: usize,
    pub veclen: Vec<usize>,
    /// Row-major by (mgau, density, feature, dim).
    pub data: Vec<f32>,
}

pub fn read_mgau_file(path: impl AsRef<Path>) -> Result<MgauFile> {
    let mut r = BinReader::open(path.as_ref())?;
    if let Some(v) = r.version() {
        if v != MGAU_PARAM_VERSION {
            tracing::warn!("{}: version {} (expected {})", r.file(), v, MGAU_PARAM_VERSION);
        }
    }
    let n_mgau = r.read_i32()? as usize;
    let n_feat = r.read_i32()? as usize;
    let n_density = r.read_i32()? as usize;
    if n_feat == 0 || n_feat > 8 {
        return Err(Error::format(r.file(), format!("implausible n_feat {n_feat}")));
    }
    let veclen: Vec<usize> = r.read_i32_vec(n_feat)?.into_iter().map(|v| v as usize).collect();
    let blk: usize = veclen.iter().sum();
    let n_floats = r.read_i32()? as usize;
    if n_floats != n_mgau * n_density * blk {
        return Err(Error::format(
            r.file(),
            format!("{n_floats} floats does not match {n_mgau} x {n_density} x {blk}"),
        ));
    }
    let data = r.read_f32_vec(n_floats)?;
    r.verify_chksum()?;
    r.expect_eof()?;
    info!(
        "{}: {} codebooks, {} densities, {} streams, veclen {:?}",
        r.file(),
        n_mgau,
        n_density,
        n_feat,
        veclen
    );
    Ok(MgauFile {
        n_mgau,
        n_feat,
        n_density,
        veclen,
        data,
    })
}

/// Parsed contents of a `mixture_weights` file, still linear.
#[derive(Debug)]
pub struct MixwFile {
    pub n_sen: usize,
    pub n_feat: usize,
    pub n_comp: usize,
    /// Row-major by (senone, feature, component).
    pub data: Vec<f32>,
}

pub fn read_mixw_file(path: impl AsRef<Path>) -> Result<MixwFile> {
    let mut r = BinReader::open(path.as_ref())?;
    if let Some(v) = r.version() {
        if v != MGAU_MIXW_VERSION {
            tracing::warn!("{}: version {} (expected {})", r.file(), v, MGAU_MIXW_VERSION);
        }
    }
    let n_sen = r.read_i32()? as usize;
    let n_feat = r.read_i32()? as usize;
    let n_comp = r.read_i32()? as usize;
    let n_floats = r.read_i32()? as usize;
    if n_floats != n_sen * n_feat * n_comp {
        return Err(Error::format(
            r.file(),
            format!("{n_floats} floats does not match {n_sen} x {n_feat} x {n_comp}"),
        ));
    }
    let data = r.read_f32_vec(n_floats)?;
    r.verify_chksum()?;
    r.expect_eof()?;
    info!("{}: {} x {} x {} mixture weights", r.file(), n_sen, n_feat, n_comp);
    Ok(MixwFile {
        n_sen,
        n_feat,
        n_comp,
        data,
    })
}

/// Floor and renormalise a weight distribution in place. Returns false when
/// the row summed to zero (the caller counts and reports these).
pub(crate) fn floor_and_norm(row: &mut [f32], floor: f32) -> bool {
    let sum: f32 = row.iter().sum();
    let ok = sum > 0.0;
    if ok {
        for p in row.iter_mut() {
            *p /= sum;
        }
    }
    for p in row.iter_mut() {
        if *p < floor {
            *p = floor;
        }
    }
    let sum: f32 = row.iter().sum();
    if sum > 0.0 {
        for p in row.iter_mut() {
            *p /= sum;
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mllr_reads_and_transforms() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        // One stream of dimension 2: A = [[2,0],[0,1]], b = [1, 0], h = [1, 0.5]
        write!(tmp, "1\n2\n2 0\n0 1\n1 0\n1 0.5\n").unwrap();
        let mllr = Mllr::read(tmp.path()).unwrap();
        let mut out = [0.0f32; 2];
        mllr.transform_mean(0, &[3.0, 4.0], &mut out);
        assert_eq!(out, [7.0, 4.0]);
        assert_eq!(mllr.h[0][1], 0.5);
    }

    #[test]
    fn mllr_rejects_truncation() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "1\n3\n1 0 0\n").unwrap();
        assert!(Mllr::read(tmp.path()).is_err());
    }

    #[test]
    fn weight_flooring_renormalises() {
        let mut row = [0.9f32, 0.1, 0.0];
        assert!(floor_and_norm(&mut row, 0.01));
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(row[2] > 0.0);
        let mut zeros = [0.0f32; 4];
        assert!(!floor_and_norm(&mut zeros, 0.25));
        assert!((zeros.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
