#![doc = include_str!("../README.md")]
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod acmod;
pub mod bio;
pub mod config;
pub mod dict;
pub mod error;
pub mod gauden;
pub mod hmm;
pub mod lattice;
pub mod lm;
pub mod logmath;
pub mod mdef;
pub mod search;
pub mod tmat;

pub use acmod::{Acmod, CmnKind, FeatKind, FrontEnd};
pub use config::DecoderConfig;
pub use error::{Error, Result};
pub use lattice::{Lattice, Nbest};
pub use logmath::{LogMath, WORST_SCORE};
pub use search::{Search, Segment};

use dict::Dict;
use gauden::{ContScorer, SemiScorer, SenoneScorer};
use lm::{LangModel, NgramModel};
use mdef::{Mdef, TriphoneTable};
use search::fsg::model::WordFsg;
use search::fsg::FsgSearch;
use search::kws::KwsSearch;
use search::NgramSearch;
use tmat::TmatSet;

/// The active search, one of the three back-ends.
enum AnySearch {
    Ngram(NgramSearch),
    Fsg(FsgSearch),
    Kws(KwsSearch),
}

impl AnySearch {
    fn as_search(&mut self) -> &mut dyn Search {
        match self {
            AnySearch::Ngram(s) => s,
            AnySearch::Fsg(s) => s,
            AnySearch::Kws(s) => s,
        }
    }
}

/// A speech decoder: loaded models plus per-utterance state. Feed frames in
/// with [`Decoder::process_raw`] or [`Decoder::process_cep`] between
/// [`Decoder::start_utt`] and [`Decoder::end_utt`], then read the result
/// with [`Decoder::get_hyp`].
pub struct Decoder {
    config: DecoderConfig,
    lmath: Arc<LogMath>,
    mdef: Arc<Mdef>,
    tmat: Arc<TmatSet>,
    tt: Arc<TriphoneTable>,
    dict: Arc<Dict>,
    lm: Option<Arc<dyn LangModel>>,
    acmod: Acmod,
    search: AnySearch,
    utt_running: bool,
    utt_counter: u64,
    uttid: String,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder").finish_non_exhaustive()
    }
}

impl Decoder {
    pub fn new(mut config: DecoderConfig) -> Result<Self> {
        config.fill_from_hmm_dir();
        config.validate()?;

        let lmath = Arc::new(LogMath::new(config.logbase, 0)?);
        let mdef = Arc::new(Mdef::read(config.mdef.as_ref().unwrap())?);
        let tmat = Arc::new(TmatSet::read(
            config.tmat.as_ref().unwrap(),
            &lmath,
            config.tmatfloor,
        )?);
        if tmat.n_tmat() < mdef.n_tmat() {
            return Err(Error::Format {
                file: "transition_matrices".into(),
                detail: format!(
                    "model definition references {} matrices, file has {}",
                    mdef.n_tmat(),
                    tmat.n_tmat()
                ),
            });
        }

        let scorer = build_scorer(&config, &mdef)?;
        let feat = FeatKind::parse(&config.feat).unwrap();
        let cmn = CmnKind::parse(&config.cmn).unwrap();
        let acmod = Acmod::new(
            mdef.clone(),
            scorer,
            feat,
            config.ceplen,
            cmn,
            &config.cmninit,
            config.compallsen,
            None,
        )?;

        let dict = Arc::new(Dict::load(
            &mdef,
            config.dict.as_ref().unwrap(),
            config.fdict.as_deref(),
        )?);
        let tt = Arc::new(TriphoneTable::build(&mdef));

        let mut lm = None;
        let search = build_search(&config, &dict, &mdef, &tt, &lmath, &tmat, &mut lm)?;
        Ok(Decoder {
            config,
            lmath,
            mdef,
            tmat,
            tt,
            dict,
            lm,
            acmod,
            search,
            utt_running: false,
            utt_counter: 0,
            uttid: String::new(),
        })
    }

    /// Reconfigure in place. Model files are reloaded; any utterance in
    /// progress is discarded.
    pub fn reinit(&mut self, config: DecoderConfig) -> Result<()> {
        *self = Decoder::new(config)?;
        Ok(())
    }

    fn rebuild_search(&mut self) -> Result<()> {
        self.search = build_search(
            &self.config,
            &self.dict,
            &self.mdef,
            &self.tt,
            &self.lmath,
            &self.tmat,
            &mut self.lm,
        )?;
        Ok(())
    }

    /// Install a front end so [`Decoder::process_raw`] can accept audio.
    pub fn set_frontend(&mut self, fe: Box<dyn FrontEnd>) -> Result<()> {
        self.acmod.set_frontend(fe)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn logmath(&self) -> &LogMath {
        &self.lmath
    }

    pub fn uttid(&self) -> &str {
        &self.uttid
    }

    pub fn start_utt(&mut self) -> Result<()> {
        self.acmod.start_utt()?;
        self.utt_counter += 1;
        self.uttid = format!("{:09}", self.utt_counter);
        self.search.as_search().start(&mut self.acmod)?;
        self.utt_running = true;
        Ok(())
    }

    /// Feed raw audio samples; needs an installed front end. Returns the
    /// number of feature frames produced. Pass `full_utt` when this is the
    /// complete utterance.
    pub fn process_raw(&mut self, samples: &[i16], full_utt: bool) -> Result<usize> {
        if !self.utt_running {
            return Err(Error::Logic("no utterance in progress".into()));
        }
        let n = self.acmod.process_raw(samples, full_utt)?;
        self.pump()?;
        Ok(n)
    }

    /// Feed cepstral frames directly. Returns the number of frames
    /// consumed.
    pub fn process_cep(&mut self, frames: &[Vec<f32>]) -> Result<usize> {
        if !self.utt_running {
            return Err(Error::Logic("no utterance in progress".into()));
        }
        let n = self.acmod.process_cep(frames)?;
        self.pump()?;
        Ok(n)
    }

    /// Run the search over every frame that is ready.
    fn pump(&mut self) -> Result<()> {
        while self.search.as_search().step(&mut self.acmod)? > 0 {}
        Ok(())
    }

    pub fn end_utt(&mut self) -> Result<()> {
        if !self.utt_running {
            return Err(Error::Logic("no utterance in progress".into()));
        }
        self.acmod.end_utt()?;
        self.pump()?;
        self.search.as_search().finish(&mut self.acmod)?;
        self.utt_running = false;
        Ok(())
    }

    /// Best hypothesis: `(text, path score, utterance id)`. An utterance
    /// with no scorable word exits yields an empty string at WORST_SCORE.
    pub fn get_hyp(&mut self) -> (String, i32, String) {
        match self.search.as_search().hyp() {
            Some((text, score)) => (text, score, self.uttid.clone()),
            None => {
                warn!("lattice empty: no hypothesis for utterance {}", self.uttid);
                (String::new(), WORST_SCORE, self.uttid.clone())
            }
        }
    }

    /// Word-level segmentation of the best hypothesis.
    pub fn seg_iter(&mut self) -> impl Iterator<Item = Segment> {
        self.search.as_search().seg().into_iter()
    }

    /// A* N-best over the utterance lattice (N-gram mode with bestpath
    /// enabled only). `w1`/`w2` give LM context before `sf`.
    pub fn nbest(&mut self, sf: i32, ef: i32, w1: i32, w2: i32) -> Result<Nbest<'_>> {
        match &mut self.search {
            AnySearch::Ngram(ngs) => {
                let dag = ngs
                    .lattice()
                    .ok_or_else(|| Error::Domain("no lattice for this utterance".into()))?;
                Nbest::new(dag, sf, ef, w1, w2)
            }
            _ => Err(Error::Domain("N-best needs the N-gram search".into())),
        }
    }

    /// The utterance word lattice, when the bestpath pass built one.
    pub fn lattice(&mut self) -> Option<&Lattice> {
        match &mut self.search {
            AnySearch::Ngram(ngs) => ngs.lattice(),
            _ => None,
        }
    }

    /// Add a word to the dictionary at runtime. With `update_now` the
    /// search networks are rebuilt immediately; otherwise the word becomes
    /// usable after the next reinit.
    pub fn add_word(&mut self, word: &str, phones: &str, update_now: bool) -> Result<i32> {
        if self.utt_running {
            return Err(Error::Logic("cannot add words mid-utterance".into()));
        }
        let mut pron = Vec::new();
        for name in phones.split_whitespace() {
            let id = self
                .mdef
                .ciphone_id(name)
                .ok_or_else(|| Error::Domain(format!("unknown phone {name}")))?;
            pron.push(id);
        }
        if pron.is_empty() {
            return Err(Error::Domain("empty pronunciation".into()));
        }
        let mut dict = (*self.dict).clone();
        let wid = dict.add_word(word, pron)?;
        self.dict = Arc::new(dict);
        if update_now {
            self.rebuild_search()?;
        }
        info!("added word {} as id {}", word, wid);
        Ok(wid)
    }

    /// Replace the dictionary (and optional filler dictionary) and rebuild
    /// the search.
    pub fn load_dict(
        &mut self,
        dict_path: &std::path::Path,
        fdict_path: Option<&std::path::Path>,
        _format: Option<&str>,
    ) -> Result<()> {
        if self.utt_running {
            return Err(Error::Logic("cannot swap dictionaries mid-utterance".into()));
        }
        let dict = Dict::load(&self.mdef, dict_path, fdict_path)?;
        self.dict = Arc::new(dict);
        self.rebuild_search()?;
        self.config.dict = Some(dict_path.to_path_buf());
        if let Some(f) = fdict_path {
            self.config.fdict = Some(f.to_path_buf());
        }
        Ok(())
    }

    /// Apply a speaker transform. Strictly between utterances.
    pub fn update_mllr(&mut self, mllr: &gauden::Mllr) -> Result<()> {
        if self.utt_running {
            return Err(Error::Logic(
                "speaker transforms apply only between utterances".into(),
            ));
        }
        self.acmod.apply_mllr(mllr)
    }
}

fn build_search(
    config: &DecoderConfig,
    dict: &Arc<Dict>,
    mdef: &Arc<Mdef>,
    tt: &Arc<TriphoneTable>,
    lmath: &Arc<LogMath>,
    tmat: &Arc<TmatSet>,
    lm_cache: &mut Option<Arc<dyn LangModel>>,
) -> Result<AnySearch> {
    if let Some(kws) = &config.kws {
        return Ok(AnySearch::Kws(KwsSearch::new(
            config,
            dict.clone(),
            mdef.clone(),
            lmath.clone(),
            tmat.clone(),
            kws,
        )?));
    }
    if let Some(path) = &config.fsg {
        let lw = config.lw;
        let pip = (lmath.log(config.pip) as f64 * lw as f64) as i32;
        let silpen = pip + (lmath.log(config.silprob) as f64 * lw as f64) as i32;
        let fillpen = pip + (lmath.log(config.fillprob) as f64 * lw as f64) as i32;
        let fsg = WordFsg::read(
            path,
            dict,
            lmath,
            lw,
            config.fsgusefiller,
            silpen,
            fillpen,
        )?;
        return Ok(AnySearch::Fsg(FsgSearch::new(
            config,
            dict.clone(),
            mdef.clone(),
            tt.clone(),
            lmath.clone(),
            tmat.clone(),
            fsg,
        )?));
    }
    if let Some(path) = &config.lm {
        let lm: Arc<dyn LangModel> = match lm_cache {
            Some(lm) => lm.clone(),
            None => {
                let lm: Arc<dyn LangModel> = Arc::new(NgramModel::read(path, lmath)?);
                *lm_cache = Some(lm.clone());
                lm
            }
        };
        return Ok(AnySearch::Ngram(NgramSearch::new(
            config,
            dict.clone(),
            mdef.clone(),
            tt.clone(),
            lmath.clone(),
            tmat.clone(),
            lm,
        )?));
    }
    Err(Error::Config(
        "no search configured: give one of -lm, -fsg, -kws".into(),
    ))
}

/// Pick the scorer back-end by the codebook count in the parameter files:
/// one shared codebook means semi-continuous, one per senone means
/// continuous.
fn build_scorer(config: &DecoderConfig, mdef: &Mdef) -> Result<Box<dyn SenoneScorer + Send>> {
    let mean = config.mean.as_ref().unwrap();
    let var = config.var.as_ref().unwrap();
    let probe = gauden::read_mgau_file(mean)?;
    if probe.n_mgau == 1 {
        info!("using semi-continuous senone scorer");
        let s = SemiScorer::load(
            config.logbase,
            mean,
            var,
            config.mixw.as_deref(),
            config.sendump.as_deref(),
            config.mixwfloor,
            config.varfloor,
            config.topn,
            config.ds,
        )?;
        if s.n_sen() != mdef.n_sen() {
            return Err(Error::Format {
                file: "mixture_weights".into(),
                detail: format!(
                    "{} senones in weights, {} in model definition",
                    s.n_sen(),
                    mdef.n_sen()
                ),
            });
        }
        Ok(Box::new(s))
    } else {
        info!("using continuous senone scorer");
        let mixw = config
            .mixw
            .as_ref()
            .ok_or_else(|| Error::Config("continuous model needs mixture_weights".into()))?;
        let s = ContScorer::load(
            config.logbase,
            mean,
            var,
            mixw,
            config.mixwfloor,
            config.varfloor,
        )?;
        Ok(Box::new(s))
    }
}

/// Convenience logging setup for the binaries: everything in this crate at
/// `info` unless `RUST_LOG` says otherwise.
pub fn setup_logging() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("hark=info,app=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default().with_writer(std::io::stderr);

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::BinWriter;
    use std::fs;
    use std::path::Path;

    /// Four CI phones, three emitting states, no triphones: every context
    /// falls back to the base phone, which keeps the decoding arithmetic
    /// easy to reason about. Senones 3k..3k+2 belong to phone k.
    const TEST_MDEF: &str = "\
0.3
4 n_base
0 n_tri
16 n_state_map
12 n_tied_state
12 n_tied_ci_state
4 n_tied_tmat
SIL - - - filler 0  0  1  2 N
AA  - - - n/a    1  3  4  5 N
B   - - - n/a    2  6  7  8 N
IY  - - - n/a    3  9 10 11 N
";

    const TEST_ARPA: &str = "\
\\data\\
ngram 1=4
ngram 2=4
ngram 3=1

\\1-grams:
-1.0 <s> -0.3
-1.0 </s>
-0.5 BAY -0.3
-0.5 BEE -0.3

\\2-grams:
-0.3 <s> BAY -0.2
-0.3 BAY BEE -0.2
-0.9 BEE </s>
-1.5 <s> BEE -0.2

\\3-grams:
-0.2 BAY BEE </s>

\\end\\
";

    fn write_tmat_file(path: &Path) {
        let mat = [
            [0.5f32, 0.4, 0.1, 0.0],
            [0.0, 0.5, 0.4, 0.1],
            [0.0, 0.0, 0.6, 0.4],
        ];
        let file = fs::File::create(path).unwrap();
        let mut w = BinWriter::new(file, &[("version", "1.0")], true).unwrap();
        w.write_i32(4).unwrap();
        w.write_i32(3).unwrap();
        w.write_i32(4).unwrap();
        w.write_i32(4 * 3 * 4).unwrap();
        for _ in 0..4 {
            for row in &mat {
                for &p in row {
                    w.write_f32(p).unwrap();
                }
            }
        }
        w.finish().unwrap();
    }

    fn write_gauss_file(path: &Path, values: impl Fn(usize) -> [f32; 3]) {
        let file = fs::File::create(path).unwrap();
        let mut w = BinWriter::new(file, &[("version", "1.0")], true).unwrap();
        w.write_i32(12).unwrap(); // one codebook per senone: continuous
        w.write_i32(1).unwrap();
        w.write_i32(1).unwrap();
        w.write_i32(3).unwrap(); // veclen
        w.write_i32(12 * 3).unwrap();
        for sen in 0..12 {
            for v in values(sen) {
                w.write_f32(v).unwrap();
            }
        }
        w.finish().unwrap();
    }

    fn write_mixw_file(path: &Path) {
        let file = fs::File::create(path).unwrap();
        let mut w = BinWriter::new(file, &[("version", "1.0")], true).unwrap();
        w.write_i32(12).unwrap();
        w.write_i32(1).unwrap();
        w.write_i32(1).unwrap();
        w.write_i32(12).unwrap();
        for _ in 0..12 {
            w.write_f32(1.0).unwrap();
        }
        w.finish().unwrap();
    }

    fn write_model(dir: &Path) -> DecoderConfig {
        fs::write(dir.join("mdef"), TEST_MDEF).unwrap();
        write_tmat_file(&dir.join("transition_matrices"));
        // Senone means sit at their phone id on the cepstral axis; the
        // delta dimensions are effectively unmodelled (huge variance).
        write_gauss_file(&dir.join("means"), |sen| [(sen / 3) as f32, 0.0, 0.0]);
        write_gauss_file(&dir.join("variances"), |_| [0.2, 1000.0, 1000.0]);
        write_mixw_file(&dir.join("mixture_weights"));
        fs::write(dir.join("dict.txt"), "BAY B AA IY\nBEE B IY\n").unwrap();
        fs::write(dir.join("lm.arpa"), TEST_ARPA).unwrap();

        let mut config = DecoderConfig::default();
        config.mdef = Some(dir.join("mdef"));
        config.tmat = Some(dir.join("transition_matrices"));
        config.mean = Some(dir.join("means"));
        config.var = Some(dir.join("variances"));
        config.mixw = Some(dir.join("mixture_weights"));
        config.dict = Some(dir.join("dict.txt"));
        config.feat = "1s_c_d_dd".into();
        config.ceplen = 1;
        config.cmn = "none".into();
        // Toy utterances are short; keep every first-pass word.
        config.fwdflatefwid = 0;
        config
    }

    /// SIL B AA IY B IY SIL, eight frames per phone: "BAY BEE".
    fn bay_bee_frames() -> Vec<Vec<f32>> {
        let phones = [0.0f32, 2.0, 1.0, 3.0, 2.0, 3.0, 0.0];
        let mut frames = Vec::new();
        for &mu in &phones {
            for _ in 0..8 {
                frames.push(vec![mu]);
            }
        }
        frames
    }

    fn decode(dec: &mut Decoder, frames: &[Vec<f32>]) -> (String, i32) {
        dec.start_utt().unwrap();
        dec.process_cep(frames).unwrap();
        dec.end_utt().unwrap();
        let (text, score, _) = dec.get_hyp();
        (text, score)
    }

    #[test]
    fn ngram_decode_finds_the_words() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();
        let (text, score) = decode(&mut dec, &bay_bee_frames());
        assert_eq!(text, "BAY BEE");
        assert!(score > WORST_SCORE);
        // Segmentation covers the utterance in order.
        let segs: Vec<Segment> = dec.seg_iter().collect();
        let words: Vec<&str> = segs.iter().map(|s| s.word.as_str()).collect();
        assert!(words.contains(&"BAY"));
        assert!(words.contains(&"BEE"));
        for pair in segs.windows(2) {
            assert!(pair[0].ef < pair[1].sf || pair[0].sf <= pair[1].sf);
        }
    }

    #[test]
    fn ngram_decode_without_rescoring_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        config.fwdflat = false;
        config.bestpath = false;
        let mut dec = Decoder::new(config).unwrap();
        let (text, _) = decode(&mut dec, &bay_bee_frames());
        assert_eq!(text, "BAY BEE");
    }

    #[test]
    fn empty_utterance_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();

        dec.start_utt().unwrap();
        dec.end_utt().unwrap();
        let (text, score, _) = dec.get_hyp();
        assert_eq!(text, "");
        assert_eq!(score, WORST_SCORE);
        assert_eq!(dec.seg_iter().count(), 0);

        // The decoder stays usable.
        let (text, _) = decode(&mut dec, &bay_bee_frames());
        assert_eq!(text, "BAY BEE");
    }

    #[test]
    fn chunked_and_oneshot_agree() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();

        let frames = bay_bee_frames();
        let (oneshot, _) = decode(&mut dec, &frames);

        dec.start_utt().unwrap();
        for chunk in frames.chunks(5) {
            dec.process_cep(chunk).unwrap();
        }
        dec.end_utt().unwrap();
        let (chunked, _, _) = dec.get_hyp();
        assert_eq!(oneshot, chunked);
    }

    #[test]
    fn lattice_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();
        let _ = decode(&mut dec, &bay_bee_frames());

        let logbase = dec.config().logbase;
        let path = dir.path().join("utt.lat");
        let (n_nodes, n_links, start, end) = {
            let lat = dec.lattice().expect("bestpath should build a lattice");
            lat.write(&path, logbase).unwrap();
            (lat.nodes.len(), lat.links.len(), lat.start, lat.end)
        };

        let mdef = mdef::Mdef::read(dir.path().join("mdef")).unwrap();
        let dict = dict::Dict::load(&mdef, dir.path().join("dict.txt"), None).unwrap();
        let back = Lattice::read(&path, &dict).unwrap();
        assert_eq!(back.nodes.len(), n_nodes);
        assert_eq!(back.links.len(), n_links);
        assert_eq!(back.start, start);
        assert_eq!(back.end, end);
    }

    #[test]
    fn lattice_has_no_interior_fillers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();
        let _ = decode(&mut dec, &bay_bee_frames());

        let mdef = mdef::Mdef::read(dir.path().join("mdef")).unwrap();
        let dict = dict::Dict::load(&mdef, dir.path().join("dict.txt"), None).unwrap();
        let lat = dec.lattice().unwrap();
        assert!(!lat.has_filler_nodes(&dict));
    }

    #[test]
    fn nbest_leads_with_the_best_hypothesis() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();
        let (best, _) = decode(&mut dec, &bay_bee_frames());

        let n_frames = dec.lattice().unwrap().n_frames;
        let hyps: Vec<(String, i32)> = dec.nbest(0, n_frames, -1, -1).unwrap().collect();
        assert!(!hyps.is_empty());
        assert_eq!(hyps[0].0, best);
        for pair in hyps.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn fsg_decode_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        let fsg_path = dir.path().join("grammar.fsg");
        fs::write(&fsg_path, "N 3\nS 0\nF 2\nT 0 1 1.0 BAY\nT 1 2 1.0 BEE\n").unwrap();
        config.fsg = Some(fsg_path);
        config.bestpath = false;
        let mut dec = Decoder::new(config).unwrap();
        let (text, score) = decode(&mut dec, &bay_bee_frames());
        assert_eq!(text, "BAY BEE");
        assert!(score > WORST_SCORE);
    }

    #[test]
    fn fsg_empty_input_yields_empty_hyp_and_stays_usable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        let fsg_path = dir.path().join("grammar.fsg");
        fs::write(&fsg_path, "N 3\nS 0\nF 2\nT 0 1 1.0 BAY\nT 1 2 1.0 BEE\n").unwrap();
        config.fsg = Some(fsg_path);
        let mut dec = Decoder::new(config).unwrap();

        dec.start_utt().unwrap();
        dec.end_utt().unwrap();
        let (text, score, _) = dec.get_hyp();
        assert_eq!(text, "");
        assert_eq!(score, WORST_SCORE);
        assert_eq!(dec.seg_iter().count(), 0);

        let (text, _) = decode(&mut dec, &bay_bee_frames());
        assert_eq!(text, "BAY BEE");
    }

    #[test]
    fn kws_spots_the_phrase() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.kws = Some("BAY".into());
        let mut dec = Decoder::new(config).unwrap();
        let (text, _) = decode(&mut dec, &bay_bee_frames());
        assert_eq!(text, "BAY");
        assert!(dec.seg_iter().count() >= 1);
    }

    #[test]
    fn kws_oov_keyphrase_fails_at_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.kws = Some("ZEBRA".into());
        let err = Decoder::new(config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn add_word_extends_the_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();
        let wid = dec.add_word("BYE", "B AA", true).unwrap();
        assert!(wid >= 0);
        // Unknown phones are a domain error and leave the decoder usable.
        assert!(matches!(
            dec.add_word("QUACK", "Q K", true),
            Err(Error::Domain(_))
        ));
        let (text, _) = decode(&mut dec, &bay_bee_frames());
        assert_eq!(text, "BAY BEE");
    }

    #[test]
    fn mllr_applies_only_between_utterances() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();

        let mllr = gauden::Mllr {
            a: vec![ndarray::Array2::eye(3)],
            b: vec![vec![0.0; 3]],
            h: vec![vec![1.0; 3]],
        };
        dec.update_mllr(&mllr).unwrap();

        dec.start_utt().unwrap();
        assert!(dec.update_mllr(&mllr).is_err());
        dec.process_cep(&bay_bee_frames()).unwrap();
        dec.end_utt().unwrap();
        // Identity transform: nothing changed.
        let (text, _, _) = dec.get_hyp();
        assert_eq!(text, "BAY BEE");
    }

    #[test]
    fn process_raw_without_frontend_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_model(dir.path());
        config.lm = Some(dir.path().join("lm.arpa"));
        let mut dec = Decoder::new(config).unwrap();
        dec.start_utt().unwrap();
        assert!(matches!(
            dec.process_raw(&[0i16; 160], false),
            Err(Error::Config(_))
        ));
        dec.end_utt().unwrap();
    }
}
