use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use clap::Parser;
use tracing::info;

use hark::{Decoder, DecoderConfig, Segment};

/// Batch decoder: reads cepstral feature files and prints the best
/// hypothesis for each.
#[derive(Parser, Debug)]
pub struct Args {
    /// Acoustic model directory (mdef, means, variances, ...)
    #[clap(long)]
    hmm: Option<PathBuf>,
    /// Pronunciation dictionary
    #[clap(long)]
    dict: Option<PathBuf>,
    /// Filler dictionary
    #[clap(long)]
    fdict: Option<PathBuf>,
    /// ARPA language model
    #[clap(long)]
    lm: Option<PathBuf>,
    /// Finite-state grammar
    #[clap(long)]
    fsg: Option<PathBuf>,
    /// Keyword phrase to spot
    #[clap(long)]
    kws: Option<String>,
    /// JSON config file; flags override its values
    #[clap(long)]
    config: Option<PathBuf>,
    /// Cepstral feature files to decode
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
    /// Write utterance lattices into this directory
    #[clap(long)]
    outlatdir: Option<PathBuf>,
    /// Print word segmentations
    #[clap(long)]
    backtrace: bool,

    #[clap(long)]
    beam: Option<f64>,
    #[clap(long)]
    wbeam: Option<f64>,
    #[clap(long)]
    pbeam: Option<f64>,
    #[clap(long)]
    lw: Option<f32>,
    #[clap(long)]
    wip: Option<f64>,
    #[clap(long)]
    maxhmmpf: Option<usize>,
    #[clap(long)]
    maxwpf: Option<usize>,
    #[clap(long)]
    topn: Option<usize>,
    #[clap(long)]
    ds: Option<i32>,
    #[clap(long)]
    feat: Option<String>,
    #[clap(long)]
    ceplen: Option<usize>,
    #[clap(long)]
    cmn: Option<String>,
    /// Disable the tree pass
    #[clap(long)]
    no_fwdtree: bool,
    /// Disable the flat rescoring pass
    #[clap(long)]
    no_fwdflat: bool,
    /// Disable best-path lattice rescoring
    #[clap(long)]
    no_bestpath: bool,
    /// Score every senone every frame
    #[clap(long)]
    compallsen: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(DecoderConfig, Vec<PathBuf>, Option<PathBuf>, bool)> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_reader(File::open(path)?)?,
            None => DecoderConfig::default(),
        };
        if self.hmm.is_some() {
            config.hmm = self.hmm;
        }
        if self.dict.is_some() {
            config.dict = self.dict;
        }
        if self.fdict.is_some() {
            config.fdict = self.fdict;
        }
        if self.lm.is_some() {
            config.lm = self.lm;
        }
        if self.fsg.is_some() {
            config.fsg = self.fsg;
        }
        if self.kws.is_some() {
            config.kws = self.kws;
        }
        if let Some(v) = self.beam {
            config.beam = v;
        }
        if let Some(v) = self.wbeam {
            config.wbeam = v;
        }
        if let Some(v) = self.pbeam {
            config.pbeam = v;
        }
        if let Some(v) = self.lw {
            config.lw = v;
        }
        if let Some(v) = self.wip {
            config.wip = v;
        }
        if let Some(v) = self.maxhmmpf {
            config.maxhmmpf = v;
        }
        if let Some(v) = self.maxwpf {
            config.maxwpf = v;
        }
        if let Some(v) = self.topn {
            config.topn = v;
        }
        if let Some(v) = self.ds {
            config.ds = v;
        }
        if let Some(v) = self.feat {
            config.feat = v;
        }
        if let Some(v) = self.ceplen {
            config.ceplen = v;
        }
        if let Some(v) = self.cmn {
            config.cmn = v;
        }
        if self.no_fwdtree {
            config.fwdtree = false;
        }
        if self.no_fwdflat {
            config.fwdflat = false;
        }
        if self.no_bestpath {
            config.bestpath = false;
        }
        if self.compallsen {
            config.compallsen = true;
        }
        Ok((config, self.inputs, self.outlatdir, self.backtrace))
    }
}

/// Read a Sphinx cepstral feature file: a 32-bit float count followed by
/// the float data. Byte order is detected from whether the count matches
/// the file size.
fn read_cep_file(path: &Path, ceplen: usize) -> anyhow::Result<Vec<Vec<f32>>> {
    let mut file = File::open(path)?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    if raw.len() < 4 {
        anyhow::bail!("{}: too short for a feature file", path.display());
    }
    let n_floats = (raw.len() - 4) / 4;
    let le = (&raw[..4]).read_i32::<LittleEndian>()?;
    let be = (&raw[..4]).read_i32::<BigEndian>()?;
    let swap = if le as usize == n_floats {
        false
    } else if be as usize == n_floats {
        true
    } else {
        anyhow::bail!(
            "{}: header count matches neither byte order ({} floats in file)",
            path.display(),
            n_floats
        );
    };

    let mut cursor = &raw[4..];
    let mut floats = Vec::with_capacity(n_floats);
    for _ in 0..n_floats {
        let v = if swap {
            cursor.read_f32::<BigEndian>()?
        } else {
            cursor.read_f32::<LittleEndian>()?
        };
        floats.push(v);
    }
    if n_floats % ceplen != 0 {
        anyhow::bail!(
            "{}: {} floats is not a whole number of {}-dimensional frames",
            path.display(),
            n_floats,
            ceplen
        );
    }
    Ok(floats.chunks(ceplen).map(|c| c.to_vec()).collect())
}

fn print_backtrace(segs: &[Segment]) {
    println!("{:<20} {:>5} {:>5} {:>12} {:>10}", "word", "sf", "ef", "ascr", "lscr");
    for s in segs {
        println!(
            "{:<20} {:>5} {:>5} {:>12} {:>10}",
            s.word, s.sf, s.ef, s.ascr, s.lscr
        );
    }
}

fn main() -> anyhow::Result<()> {
    hark::setup_logging();
    let args = Args::parse();
    let (config, inputs, outlatdir, backtrace) = args.into_config()?;
    let logbase = config.logbase;
    let ceplen = config.ceplen;

    info!("loading models");
    let mut dec = Decoder::new(config)?;

    for input in inputs {
        let frames = read_cep_file(&input, ceplen)?;
        info!("{}: {} frames", input.display(), frames.len());

        dec.start_utt()?;
        dec.process_cep(&frames)?;
        dec.end_utt()?;

        let (text, score, uttid) = dec.get_hyp();
        println!("{}: {} ({})", uttid, text, score);
        if backtrace {
            let segs: Vec<Segment> = dec.seg_iter().collect();
            print_backtrace(&segs);
        }
        if let Some(dir) = &outlatdir {
            if let Some(lat) = dec.lattice() {
                let stem = input.file_stem().unwrap_or_default().to_string_lossy();
                let out = dir.join(format!("{stem}.lat"));
                lat.write(&out, logbase)?;
                info!("wrote lattice {}", out.display());
            }
        }
    }
    Ok(())
}
