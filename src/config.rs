//! Decoder configuration. One flat struct, one field per command-line flag,
//! defaults matching the historical values. The CLI builds one of these from
//! flags; programmatic users fill it in directly or deserialise it from
//! JSON.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Acoustic model directory (mdef, means, variances, etc).
    pub hmm: Option<PathBuf>,
    pub dict: Option<PathBuf>,
    /// Filler (noise) dictionary.
    pub fdict: Option<PathBuf>,
    /// N-gram language model (ARPA).
    pub lm: Option<PathBuf>,
    /// Finite-state grammar.
    pub fsg: Option<PathBuf>,
    /// Keyword-spotting phrase.
    pub kws: Option<String>,

    /// Individual model files; filled from `hmm` when absent.
    pub mdef: Option<PathBuf>,
    pub mean: Option<PathBuf>,
    pub var: Option<PathBuf>,
    pub tmat: Option<PathBuf>,
    pub mixw: Option<PathBuf>,
    pub sendump: Option<PathBuf>,

    pub logbase: f64,
    /// Feature layout: "s2_4x" or "1s_c_d_dd".
    pub feat: String,
    pub ceplen: usize,
    /// Cepstral mean normalisation: "none", "current" or "prior".
    pub cmn: String,
    pub cmninit: Vec<f32>,

    // Main beams.
    pub beam: f64,
    pub wbeam: f64,
    pub pbeam: f64,
    pub lpbeam: f64,
    pub lponlybeam: f64,
    pub fwdflatbeam: f64,
    pub fwdflatwbeam: f64,

    /// Absolute pruning: max HMMs / words per frame (0 = unlimited).
    pub maxhmmpf: usize,
    pub maxwpf: usize,
    /// Initial backpointer table size.
    pub latsize: usize,

    /// Gaussian selection.
    pub topn: usize,
    /// Frame downsampling ratio for codebook evaluation.
    pub ds: i32,
    pub compallsen: bool,

    // Language weights and penalties (linear probabilities).
    pub lw: f32,
    pub fwdflatlw: f32,
    pub bestpathlw: f32,
    pub wip: f64,
    pub pip: f64,
    pub silprob: f64,
    pub fillprob: f64,

    // Pass selection.
    pub fwdtree: bool,
    pub fwdflat: bool,
    pub bestpath: bool,

    // Fwdflat word-list construction.
    pub fwdflatefwid: i32,
    pub fwdflatsfwin: i32,

    // Model flooring.
    pub varfloor: f64,
    pub mixwfloor: f64,
    pub tmatfloor: f64,

    // Keyword spotting.
    pub kws_plp: f64,
    pub kws_threshold: f64,

    // FSG behaviour.
    pub fsg_backtrace_from_final: bool,
    pub fsgusefiller: bool,

    /// Accepted for compatibility; the sendump block is always buffered.
    pub mmap: bool,
    /// Log output file (stderr when unset).
    pub logfn: Option<PathBuf>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            hmm: None,
            dict: None,
            fdict: None,
            lm: None,
            fsg: None,
            kws: None,
            mdef: None,
            mean: None,
            var: None,
            tmat: None,
            mixw: None,
            sendump: None,
            logbase: 1.0001,
            feat: "s2_4x".into(),
            ceplen: 13,
            cmn: "current".into(),
            cmninit: vec![8.0],
            beam: 1e-48,
            wbeam: 7e-29,
            pbeam: 1e-48,
            lpbeam: 1e-40,
            lponlybeam: 7e-29,
            fwdflatbeam: 1e-64,
            fwdflatwbeam: 7e-29,
            maxhmmpf: 0,
            maxwpf: 0,
            latsize: 5000,
            topn: 4,
            ds: 1,
            compallsen: false,
            lw: 6.5,
            fwdflatlw: 8.5,
            bestpathlw: 9.5,
            wip: 0.65,
            pip: 1.0,
            silprob: 0.005,
            fillprob: 1e-8,
            fwdtree: true,
            fwdflat: true,
            bestpath: true,
            fwdflatefwid: 4,
            fwdflatsfwin: 25,
            varfloor: 1e-4,
            mixwfloor: 1e-7,
            tmatfloor: 1e-4,
            kws_plp: 1e-1,
            kws_threshold: 1.0,
            fsg_backtrace_from_final: true,
            fsgusefiller: true,
            mmap: true,
            logfn: None,
        }
    }
}

impl DecoderConfig {
    /// Resolve individual model file paths from the model directory for any
    /// that were not given explicitly, taking only files that exist.
    pub fn fill_from_hmm_dir(&mut self) {
        let Some(dir) = self.hmm.clone() else { return };
        let mut fill = |slot: &mut Option<PathBuf>, name: &str| {
            if slot.is_none() {
                let p = dir.join(name);
                if p.exists() {
                    *slot = Some(p);
                }
            }
        };
        fill(&mut self.mdef, "mdef");
        fill(&mut self.mean, "means");
        fill(&mut self.var, "variances");
        fill(&mut self.tmat, "transition_matrices");
        fill(&mut self.mixw, "mixture_weights");
        fill(&mut self.sendump, "sendump");
        fill(&mut self.fdict, "noisedict");
    }

    /// Basic consistency checks, reported before any model loading starts.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;
        let n_modes = [self.lm.is_some(), self.fsg.is_some(), self.kws.is_some()]
            .iter()
            .filter(|&&b| b)
            .count();
        if n_modes > 1 {
            return Err(Error::Config(
                "choose one of -lm, -fsg and -kws".into(),
            ));
        }
        if self.mdef.is_none() {
            return Err(Error::Config("no model definition (-hmm or -mdef)".into()));
        }
        if self.mean.is_none() || self.var.is_none() || self.tmat.is_none() {
            return Err(Error::Config("no mean/var/tmat files specified".into()));
        }
        if self.dict.is_none() {
            return Err(Error::Config("no dictionary (-dict)".into()));
        }
        if !self.fwdtree && !self.fwdflat && self.lm.is_some() {
            return Err(Error::Config(
                "at least one of fwdtree and fwdflat must be enabled".into(),
            ));
        }
        if crate::acmod::FeatKind::parse(&self.feat).is_none() {
            return Err(Error::Config(format!("unknown feature layout {}", self.feat)));
        }
        if crate::acmod::CmnKind::parse(&self.cmn).is_none() {
            return Err(Error::Config(format!("unknown cmn mode {}", self.cmn)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_once_models_are_set() {
        let mut c = DecoderConfig::default();
        assert!(c.validate().is_err());
        c.mdef = Some("mdef".into());
        c.mean = Some("means".into());
        c.var = Some("variances".into());
        c.tmat = Some("transition_matrices".into());
        c.dict = Some("dict".into());
        c.validate().unwrap();
    }

    #[test]
    fn conflicting_modes_are_rejected() {
        let mut c = DecoderConfig::default();
        c.mdef = Some("mdef".into());
        c.mean = Some("means".into());
        c.var = Some("variances".into());
        c.tmat = Some("transition_matrices".into());
        c.dict = Some("dict".into());
        c.lm = Some("lm.arpa".into());
        c.fsg = Some("grammar.fsg".into());
        assert!(c.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let c = DecoderConfig::default();
        let j = serde_json::to_string(&c).unwrap();
        let back: DecoderConfig = serde_json::from_str(&j).unwrap();
        assert_eq!(back.beam, c.beam);
        assert_eq!(back.feat, c.feat);
    }
}
