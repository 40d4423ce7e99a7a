//! Model definition: the phone set, the tied-state (senone) inventory, and
//! the mapping from context-dependent phones to senone sequences.
//!
//! The Sphinx-3 text mdef format is parsed here. It carries the base (CI)
//! phones followed by triphones, one per line:
//!
//! ```text
//! 0.3
//! 3 n_base
//! 100 n_tri
//! ...
//! # base lft rt p attrib tmat ... state id's ... N
//! SIL    -  -  - filler    0    0    1    2    N
//! AA     -  -  - n/a       1    3    4    5    N
//! AA     B  IY  i n/a      1   42   43   44    N
//! ```
//!
//! Senone sequences are interned: every distinct vector of per-state senone
//! ids gets one SSID, and HMM instances refer to sequences only by SSID.
//! Triphones missing from the model fall back to their base phone's
//! sequence, which is what lets a small model decode any dictionary.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};

pub type PhoneId = i32;
pub type Ssid = i32;
pub type SenId = i32;

pub const NO_PHONE: PhoneId = -1;
pub const NO_SSID: Ssid = -1;

/// Position of a phone within a word, as tagged in the mdef.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordPos {
    Begin,
    End,
    Internal,
    Single,
}

impl WordPos {
    fn parse(s: &str) -> Option<WordPos> {
        match s {
            "b" => Some(WordPos::Begin),
            "e" => Some(WordPos::End),
            "i" => Some(WordPos::Internal),
            "s" => Some(WordPos::Single),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mdef {
    n_emit_state: usize,
    n_sen: usize,
    n_tmat: usize,
    ci_names: Vec<String>,
    ci_by_name: HashMap<String, PhoneId>,
    ci_filler: Vec<bool>,
    ci_ssid: Vec<Ssid>,
    ci_tmat: Vec<i32>,
    /// Interned senone sequences; index is the SSID.
    sseq: Vec<Vec<SenId>>,
    tri: HashMap<(PhoneId, PhoneId, PhoneId, WordPos), TriEntry>,
    sil: PhoneId,
}

#[derive(Debug, Clone, Copy)]
struct TriEntry {
    ssid: Ssid,
    tmat: i32,
}

impl Mdef {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::format(path.display().to_string(), e.to_string()))?;
        Self::from_reader(BufReader::new(file), &path.display().to_string())
    }

    pub fn from_reader(reader: impl BufRead, name: &str) -> Result<Self> {
        let mut lines = reader
            .lines()
            .filter_map(|l| l.ok())
            .map(|l| match l.find('#') {
                Some(pos) => l[..pos].to_string(),
                None => l,
            })
            .filter(|l| !l.trim().is_empty());

        let version = lines
            .next()
            .ok_or_else(|| Error::format(name, "empty mdef"))?;
        if version.trim() != "0.3" {
            return Err(Error::format(
                name,
                format!("unsupported mdef version {}", version.trim()),
            ));
        }

        // Count lines: "<n> n_base" etc. Order is fixed in the format.
        let mut counts = HashMap::new();
        for _ in 0..6 {
            let line = lines
                .next()
                .ok_or_else(|| Error::format(name, "truncated mdef counts"))?;
            let mut it = line.split_whitespace();
            let n: usize = it
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| Error::format(name, "bad count line"))?;
            let key = it
                .next()
                .ok_or_else(|| Error::format(name, "bad count line"))?
                .to_string();
            counts.insert(key, n);
        }
        let n_base = *counts
            .get("n_base")
            .ok_or_else(|| Error::format(name, "missing n_base"))?;
        let n_tri = counts.get("n_tri").copied().unwrap_or(0);
        let n_sen = *counts
            .get("n_tied_state")
            .ok_or_else(|| Error::format(name, "missing n_tied_state"))?;
        let n_tmat = *counts
            .get("n_tied_tmat")
            .ok_or_else(|| Error::format(name, "missing n_tied_tmat"))?;

        let mut mdef = Mdef {
            n_emit_state: 0,
            n_sen,
            n_tmat,
            ci_names: Vec::with_capacity(n_base),
            ci_by_name: HashMap::new(),
            ci_filler: Vec::with_capacity(n_base),
            ci_ssid: Vec::with_capacity(n_base),
            ci_tmat: Vec::with_capacity(n_base),
            sseq: Vec::new(),
            tri: HashMap::new(),
            sil: NO_PHONE,
        };
        let mut sseq_intern: HashMap<Vec<SenId>, Ssid> = HashMap::new();

        for line in lines {
            let toks: Vec<&str> = line.split_whitespace().collect();
            // base lft rt p attrib tmat states... N
            if toks.len() < 7 || *toks.last().unwrap() != "N" {
                return Err(Error::format(name, format!("bad phone line: {line}")));
            }
            let base = toks[0];
            let attrib = toks[4];
            let tmat: i32 = toks[5]
                .parse()
                .map_err(|_| Error::format(name, format!("bad tmat id in: {line}")))?;
            if tmat < 0 || tmat as usize >= n_tmat {
                return Err(Error::format(name, format!("tmat id out of range: {line}")));
            }
            let states: Vec<SenId> = toks[6..toks.len() - 1]
                .iter()
                .map(|t| t.parse::<SenId>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| Error::format(name, format!("bad state id in: {line}")))?;
            if mdef.n_emit_state == 0 {
                mdef.n_emit_state = states.len();
            } else if states.len() != mdef.n_emit_state {
                return Err(Error::format(
                    name,
                    format!("inconsistent state count in: {line}"),
                ));
            }
            for &s in &states {
                if s < 0 || s as usize >= n_sen {
                    return Err(Error::format(
                        name,
                        format!("senone id out of range in: {line}"),
                    ));
                }
            }

            let ssid = *sseq_intern.entry(states.clone()).or_insert_with(|| {
                mdef.sseq.push(states.clone());
                (mdef.sseq.len() - 1) as Ssid
            });

            if toks[1] == "-" {
                // Context-independent phone.
                let id = mdef.ci_names.len() as PhoneId;
                if mdef.ci_by_name.insert(base.to_string(), id).is_some() {
                    return Err(Error::format(name, format!("duplicate CI phone {base}")));
                }
                mdef.ci_names.push(base.to_string());
                mdef.ci_filler.push(attrib == "filler");
                mdef.ci_ssid.push(ssid);
                mdef.ci_tmat.push(tmat);
                if base == "SIL" {
                    mdef.sil = id;
                }
            } else {
                let b = mdef.ciphone_id(base).ok_or_else(|| {
                    Error::format(name, format!("triphone base {base} unknown"))
                })?;
                let l = mdef.ciphone_id(toks[1]).ok_or_else(|| {
                    Error::format(name, format!("left context {} unknown", toks[1]))
                })?;
                let r = mdef.ciphone_id(toks[2]).ok_or_else(|| {
                    Error::format(name, format!("right context {} unknown", toks[2]))
                })?;
                let pos = WordPos::parse(toks[3]).ok_or_else(|| {
                    Error::format(name, format!("bad word position {}", toks[3]))
                })?;
                mdef.tri.insert((b, l, r, pos), TriEntry { ssid, tmat });
            }
        }

        if mdef.ci_names.len() != n_base {
            return Err(Error::format(
                name,
                format!(
                    "n_base {} disagrees with {} CI phones found",
                    n_base,
                    mdef.ci_names.len()
                ),
            ));
        }
        if n_tri != 0 && mdef.tri.len() != n_tri {
            return Err(Error::format(
                name,
                format!("n_tri {} disagrees with {} triphones found", n_tri, mdef.tri.len()),
            ));
        }
        if mdef.sil == NO_PHONE {
            return Err(Error::format(name, "model has no SIL phone"));
        }
        if mdef.n_emit_state > crate::hmm::MAX_HMM_NSTATE {
            return Err(Error::format(
                name,
                format!("{} emitting states exceeds supported maximum", mdef.n_emit_state),
            ));
        }
        Ok(mdef)
    }

    pub fn n_ciphone(&self) -> usize {
        self.ci_names.len()
    }

    pub fn n_sen(&self) -> usize {
        self.n_sen
    }

    pub fn n_tmat(&self) -> usize {
        self.n_tmat
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    pub fn n_sseq(&self) -> usize {
        self.sseq.len()
    }

    pub fn sil(&self) -> PhoneId {
        self.sil
    }

    pub fn ciphone_id(&self, name: &str) -> Option<PhoneId> {
        self.ci_by_name.get(name).copied()
    }

    pub fn ciphone_name(&self, id: PhoneId) -> &str {
        &self.ci_names[id as usize]
    }

    pub fn is_filler_phone(&self, id: PhoneId) -> bool {
        self.ci_filler[id as usize]
    }

    pub fn ci_ssid(&self, id: PhoneId) -> Ssid {
        self.ci_ssid[id as usize]
    }

    pub fn ci_tmat(&self, id: PhoneId) -> i32 {
        self.ci_tmat[id as usize]
    }

    /// Senone for one emitting state of a sequence.
    #[inline]
    pub fn sseq_sen(&self, ssid: Ssid, state: usize) -> SenId {
        self.sseq[ssid as usize][state]
    }

    pub fn sseq(&self, ssid: Ssid) -> &[SenId] {
        &self.sseq[ssid as usize]
    }

    /// SSID for a triphone, falling back to the base phone when the model
    /// has no entry for this context.
    pub fn phone_ssid(&self, b: PhoneId, l: PhoneId, r: PhoneId, pos: WordPos) -> Ssid {
        if l == NO_PHONE || r == NO_PHONE {
            return self.ci_ssid(b);
        }
        match self.tri.get(&(b, l, r, pos)) {
            Some(e) => e.ssid,
            None => self.ci_ssid(b),
        }
    }

    pub fn phone_tmat(&self, b: PhoneId, l: PhoneId, r: PhoneId, pos: WordPos) -> i32 {
        if l == NO_PHONE || r == NO_PHONE {
            return self.ci_tmat(b);
        }
        match self.tri.get(&(b, l, r, pos)) {
            Some(e) => e.tmat,
            None => self.ci_tmat(b),
        }
    }
}

/// Cross-word context tables derived from the mdef: word-initial senone
/// sequences per left context, and compressed right-context fanout sets for
/// word-final phones. These are the tables the tree search and the
/// backpointer right-context score stacks are built on.
#[derive(Debug)]
pub struct TriphoneTable {
    n_ci: usize,
    /// `ldiph[b][r][l]`: SSID of word-initial triphone `b(l, r)`.
    ldiph: Vec<Vec<Vec<Ssid>>>,
    /// `rset[b][l]`: distinct word-final SSIDs of `b(l, *)` plus the map
    /// from right-context CI phone to position in that set.
    rset: Vec<Vec<RcSet>>,
}

#[derive(Debug, Clone, Default)]
pub struct RcSet {
    pub ssid: Vec<Ssid>,
    /// Right-context CI phone -> index into `ssid`.
    pub cimap: Vec<u16>,
}

impl TriphoneTable {
    pub fn build(mdef: &Mdef) -> Self {
        let n_ci = mdef.n_ciphone();
        let mut ldiph = vec![vec![vec![NO_SSID; n_ci]; n_ci]; n_ci];
        let mut rset = vec![vec![RcSet::default(); n_ci]; n_ci];

        for b in 0..n_ci as PhoneId {
            for l in 0..n_ci as PhoneId {
                for r in 0..n_ci as PhoneId {
                    ldiph[b as usize][r as usize][l as usize] =
                        mdef.phone_ssid(b, l, r, WordPos::Begin);
                }
                // Compress the right-context fanout for final phone b with
                // left context l: one slot per distinct SSID.
                let mut set = RcSet {
                    ssid: Vec::new(),
                    cimap: vec![0; n_ci],
                };
                for r in 0..n_ci as PhoneId {
                    let ssid = mdef.phone_ssid(b, l, r, WordPos::End);
                    let idx = match set.ssid.iter().position(|&s| s == ssid) {
                        Some(i) => i,
                        None => {
                            set.ssid.push(ssid);
                            set.ssid.len() - 1
                        }
                    };
                    set.cimap[r as usize] = idx as u16;
                }
                rset[b as usize][l as usize] = set;
            }
        }

        TriphoneTable { n_ci, ldiph, rset }
    }

    /// Word-initial SSID for first phone `b`, second phone `r`, left context
    /// `l`.
    #[inline]
    pub fn ldiph_ssid(&self, b: PhoneId, r: PhoneId, l: PhoneId) -> Ssid {
        self.ldiph[b as usize][r as usize][l as usize]
    }

    /// Right-context set for final phone `b` with left context `l`.
    #[inline]
    pub fn rc_set(&self, b: PhoneId, l: PhoneId) -> &RcSet {
        &self.rset[b as usize][l as usize]
    }

    pub fn n_ci(&self) -> usize {
        self.n_ci
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// A small but complete model: three real phones plus SIL, three
    /// emitting states, a handful of triphones. Shared with other modules'
    /// tests.
    pub(crate) const TOY_MDEF: &str = "\
0.3
4 n_base
4 n_tri
24 n_state_map
18 n_tied_state
12 n_tied_ci_state
4 n_tied_tmat
# base lft rt p attrib tmat    ... state id's ...
SIL  - - - filler 0  0  1  2 N
AA   - - - n/a    1  3  4  5 N
B    - - - n/a    2  6  7  8 N
IY   - - - n/a    3  9 10 11 N
AA  B IY i n/a    1 12 13 14 N
B  SIL AA b n/a   2 15 16 17 N
B   AA IY e n/a   2 15 16  8 N
IY   B SIL e n/a  3  9 13 11 N
";

    pub(crate) fn toy_mdef() -> Mdef {
        Mdef::from_reader(Cursor::new(TOY_MDEF), "toy").unwrap()
    }

    #[test]
    fn parses_toy_model() {
        let mdef = toy_mdef();
        assert_eq!(mdef.n_ciphone(), 4);
        assert_eq!(mdef.n_sen(), 18);
        assert_eq!(mdef.n_emit_state(), 3);
        assert_eq!(mdef.ciphone_name(mdef.sil()), "SIL");
        assert!(mdef.is_filler_phone(mdef.sil()));
        let aa = mdef.ciphone_id("AA").unwrap();
        assert!(!mdef.is_filler_phone(aa));
        assert_eq!(mdef.sseq(mdef.ci_ssid(aa)), &[3, 4, 5]);
    }

    #[test]
    fn triphone_lookup_falls_back_to_base() {
        let mdef = toy_mdef();
        let aa = mdef.ciphone_id("AA").unwrap();
        let b = mdef.ciphone_id("B").unwrap();
        let iy = mdef.ciphone_id("IY").unwrap();
        // Present in the model.
        let ssid = mdef.phone_ssid(aa, b, iy, WordPos::Internal);
        assert_eq!(mdef.sseq(ssid), &[12, 13, 14]);
        // Absent context falls back to the CI sequence.
        let ssid = mdef.phone_ssid(aa, iy, b, WordPos::Internal);
        assert_eq!(ssid, mdef.ci_ssid(aa));
    }

    #[test]
    fn sequences_are_interned() {
        let mdef = toy_mdef();
        let b = mdef.ciphone_id("B").unwrap();
        let aa = mdef.ciphone_id("AA").unwrap();
        let sil = mdef.sil();
        // B(SIL, AA)b and any unknown-context B share nothing, but two
        // lookups of the same triphone return the same SSID.
        let s1 = mdef.phone_ssid(b, sil, aa, WordPos::Begin);
        let s2 = mdef.phone_ssid(b, sil, aa, WordPos::Begin);
        assert_eq!(s1, s2);
        assert!(mdef.n_sseq() >= 4);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Mdef::from_reader(Cursor::new("0.2\n"), "bad").is_err());
        let missing_sil = "\
0.3
1 n_base
0 n_tri
3 n_state_map
3 n_tied_state
3 n_tied_ci_state
1 n_tied_tmat
AA - - - n/a 0 0 1 2 N
";
        assert!(Mdef::from_reader(Cursor::new(missing_sil), "bad").is_err());
    }

    #[test]
    fn triphone_table_compresses_right_contexts() {
        let mdef = toy_mdef();
        let tt = TriphoneTable::build(&mdef);
        let b = mdef.ciphone_id("B").unwrap();
        let aa = mdef.ciphone_id("AA").unwrap();
        let iy = mdef.ciphone_id("IY").unwrap();
        // Final B with left context AA: B(AA,IY)e exists, everything else
        // falls back to CI B, so there are exactly two distinct SSIDs.
        let set = tt.rc_set(b, aa);
        assert_eq!(set.ssid.len(), 2);
        assert_ne!(
            set.ssid[set.cimap[iy as usize] as usize],
            mdef.ci_ssid(b)
        );
        // Word-initial lookup hits B(SIL,AA)b.
        let ssid = tt.ldiph_ssid(b, aa, mdef.sil());
        assert_eq!(mdef.sseq(ssid), &[15, 16, 17]);
    }
}
