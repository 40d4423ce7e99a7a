//! N-gram language model.
//!
//! The searches treat the LM as an oracle answering bigram and trigram
//! queries in raw (unweighted) log-base scores; every search applies its own
//! language weight and word-insertion penalty, which is also what lets the
//! second and third passes rescore with different weights without undoing a
//! baked-in one.
//!
//! The provided implementation reads the textual ARPA format. Lookup is by
//! LM-internal word ids; [`WidMap`] bridges dictionary ids to LM ids the way
//! the searches need it (base words only, fillers never map).
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::logmath::LogMath;

pub const NO_LMWID: i32 = -1;

pub trait LangModel: Send {
    fn n_words(&self) -> usize;
    fn wid(&self, word: &str) -> Option<i32>;
    fn word(&self, lmwid: i32) -> &str;
    /// Unigram score (with backoff semantics this is exact).
    fn ug_score(&self, w: i32) -> i32;
    /// `P(w | ctx)` with backoff.
    fn bg_score(&self, w: i32, ctx: i32) -> i32;
    /// `P(w3 | w1, w2)` with backoff.
    fn tg_score(&self, w3: i32, w2: i32, w1: i32) -> i32;
}

#[derive(Debug, Clone, Copy)]
struct Unigram {
    prob: i32,
    backoff: i32,
}

#[derive(Debug, Clone, Copy)]
struct Bigram {
    prob: i32,
    backoff: i32,
}

/// ARPA-format back-off model, up to trigrams.
pub struct NgramModel {
    words: Vec<String>,
    by_name: HashMap<String, i32>,
    unigrams: Vec<Unigram>,
    bigrams: HashMap<(i32, i32), Bigram>,
    trigrams: HashMap<(i32, i32, i32), i32>,
}

impl NgramModel {
    pub fn read(path: impl AsRef<Path>, lmath: &LogMath) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::format(path.display().to_string(), e.to_string()))?;
        Self::from_reader(BufReader::new(file), lmath, &path.display().to_string())
    }

    pub fn from_reader(reader: impl BufRead, lmath: &LogMath, name: &str) -> Result<Self> {
        let mut lm = NgramModel {
            words: Vec::new(),
            by_name: HashMap::new(),
            unigrams: Vec::new(),
            bigrams: HashMap::new(),
            trigrams: HashMap::new(),
        };

        #[derive(PartialEq)]
        enum Section {
            Preamble,
            Grams(u32),
        }
        let mut section = Section::Preamble;
        let mut counts: [usize; 3] = [0; 3];

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "\\data\\" {
                continue;
            }
            if line == "\\end\\" {
                break;
            }
            if let Some(rest) = line.strip_prefix("ngram ") {
                if let Some((n, count)) = rest.split_once('=') {
                    let n: usize = n.trim().parse().unwrap_or(0);
                    if (1..=3).contains(&n) {
                        counts[n - 1] = count.trim().parse().unwrap_or(0);
                    } else if n > 3 {
                        return Err(Error::format(
                            name,
                            format!("{n}-grams are not supported"),
                        ));
                    }
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix('\\') {
                if let Some(n) = rest.strip_suffix("-grams:") {
                    let n: u32 = n
                        .parse()
                        .map_err(|_| Error::format(name, format!("bad section {line}")))?;
                    section = Section::Grams(n);
                    continue;
                }
                return Err(Error::format(name, format!("unrecognised section {line}")));
            }

            let toks: Vec<&str> = line.split_whitespace().collect();
            match section {
                Section::Preamble => continue,
                Section::Grams(1) => {
                    if toks.len() < 2 {
                        return Err(Error::format(name, format!("bad 1-gram line: {line}")));
                    }
                    let prob = parse_log10(toks[0], lmath, name)?;
                    let backoff = if toks.len() > 2 {
                        parse_log10(toks[2], lmath, name)?
                    } else {
                        0
                    };
                    let wid = lm.words.len() as i32;
                    lm.by_name.insert(toks[1].to_string(), wid);
                    lm.words.push(toks[1].to_string());
                    lm.unigrams.push(Unigram { prob, backoff });
                }
                Section::Grams(2) => {
                    if toks.len() < 3 {
                        return Err(Error::format(name, format!("bad 2-gram line: {line}")));
                    }
                    let prob = parse_log10(toks[0], lmath, name)?;
                    let backoff = if toks.len() > 3 {
                        parse_log10(toks[3], lmath, name)?
                    } else {
                        0
                    };
                    let w1 = lm.require_wid(toks[1], name)?;
                    let w2 = lm.require_wid(toks[2], name)?;
                    lm.bigrams.insert((w1, w2), Bigram { prob, backoff });
                }
                Section::Grams(3) => {
                    if toks.len() < 4 {
                        return Err(Error::format(name, format!("bad 3-gram line: {line}")));
                    }
                    let prob = parse_log10(toks[0], lmath, name)?;
                    let w1 = lm.require_wid(toks[1], name)?;
                    let w2 = lm.require_wid(toks[2], name)?;
                    let w3 = lm.require_wid(toks[3], name)?;
                    lm.trigrams.insert((w1, w2, w3), prob);
                }
                Section::Grams(n) => {
                    return Err(Error::format(name, format!("{n}-grams are not supported")))
                }
            }
        }

        if lm.unigrams.is_empty() {
            return Err(Error::format(name, "no unigrams"));
        }
        if counts[0] != 0 && counts[0] != lm.unigrams.len() {
            return Err(Error::format(
                name,
                format!(
                    "header declares {} unigrams, found {}",
                    counts[0],
                    lm.unigrams.len()
                ),
            ));
        }
        info!(
            "{}: {} unigrams, {} bigrams, {} trigrams",
            name,
            lm.unigrams.len(),
            lm.bigrams.len(),
            lm.trigrams.len()
        );
        Ok(lm)
    }

    fn require_wid(&self, word: &str, name: &str) -> Result<i32> {
        self.by_name.get(word).copied().ok_or_else(|| {
            Error::format(name, format!("word {word} used before its unigram"))
        })
    }
}

fn parse_log10(tok: &str, lmath: &LogMath, name: &str) -> Result<i32> {
    let v: f64 = tok
        .parse()
        .map_err(|_| Error::format(name, format!("bad log probability {tok}")))?;
    // -99 is the ARPA convention for "effectively impossible".
    if v <= -98.0 {
        return Ok(crate::logmath::LOGPROB_ZERO / 2);
    }
    Ok(lmath.log10_to_log(v))
}

impl LangModel for NgramModel {
    fn n_words(&self) -> usize {
        self.words.len()
    }

    fn wid(&self, word: &str) -> Option<i32> {
        self.by_name.get(word).copied()
    }

    fn word(&self, lmwid: i32) -> &str {
        &self.words[lmwid as usize]
    }

    fn ug_score(&self, w: i32) -> i32 {
        self.unigrams[w as usize].prob
    }

    fn bg_score(&self, w: i32, ctx: i32) -> i32 {
        if ctx < 0 {
            return self.ug_score(w);
        }
        match self.bigrams.get(&(ctx, w)) {
            Some(bg) => bg.prob,
            None => self.unigrams[ctx as usize].backoff + self.ug_score(w),
        }
    }

    fn tg_score(&self, w3: i32, w2: i32, w1: i32) -> i32 {
        if w1 < 0 {
            return self.bg_score(w3, w2);
        }
        if w2 < 0 {
            return self.ug_score(w3);
        }
        match self.trigrams.get(&(w1, w2, w3)) {
            Some(&p) => p,
            None => {
                let backoff = self
                    .bigrams
                    .get(&(w1, w2))
                    .map(|bg| bg.backoff)
                    .unwrap_or(0);
                backoff + self.bg_score(w3, w2)
            }
        }
    }
}

/// Dictionary word id -> LM word id, via base spellings. Fillers and words
/// absent from the LM map to [`NO_LMWID`].
#[derive(Debug, Clone)]
pub struct WidMap {
    map: Vec<i32>,
}

impl WidMap {
    pub fn build(dict: &Dict, lm: &dyn LangModel) -> WidMap {
        let mut map = vec![NO_LMWID; dict.n_words()];
        for wid in 0..dict.n_words() as i32 {
            if dict.is_filler(wid) && wid != dict.finish_wid() && wid != dict.start_wid() {
                continue;
            }
            map[wid as usize] = lm.wid(dict.base_str(wid)).unwrap_or(NO_LMWID);
        }
        WidMap { map }
    }

    #[inline]
    pub fn get(&self, wid: i32) -> i32 {
        if wid < 0 {
            NO_LMWID
        } else {
            self.map[wid as usize]
        }
    }

    #[inline]
    pub fn known(&self, wid: i32) -> bool {
        self.get(wid) != NO_LMWID
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) const TOY_ARPA: &str = "\
\\data\\
ngram 1=5
ngram 2=6
ngram 3=2

\\1-grams:
-1.0 <s> -0.5
-1.0 </s>
-0.7 BAY -0.3
-0.7 BEE -0.3
-1.3 ABBEY -0.4

\\2-grams:
-0.3 <s> BAY -0.2
-0.5 <s> BEE -0.2
-0.4 BAY BEE -0.1
-0.6 BEE ABBEY -0.1
-0.4 ABBEY </s>
-0.9 BEE </s>

\\3-grams:
-0.2 <s> BAY BEE
-0.3 BAY BEE </s>

\\end\\
";

    pub(crate) fn toy_lm(lmath: &LogMath) -> NgramModel {
        NgramModel::from_reader(Cursor::new(TOY_ARPA), lmath, "toy").unwrap()
    }

    #[test]
    fn explicit_ngrams_score_directly() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let lm = toy_lm(&lmath);
        let bay = lm.wid("BAY").unwrap();
        let bee = lm.wid("BEE").unwrap();
        let s = lm.wid("<s>").unwrap();
        assert_eq!(lm.bg_score(bay, s), lmath.log10_to_log(-0.3));
        assert_eq!(lm.tg_score(bee, bay, s), lmath.log10_to_log(-0.2));
    }

    #[test]
    fn backoff_combines_weights() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let lm = toy_lm(&lmath);
        let bay = lm.wid("BAY").unwrap();
        let abbey = lm.wid("ABBEY").unwrap();
        // ABBEY after BAY is unseen: backoff(BAY) + ug(ABBEY).
        let expected = lmath.log10_to_log(-0.3) + lmath.log10_to_log(-1.3);
        assert_eq!(lm.bg_score(abbey, bay), expected);
        // Unseen trigram backs off onto the bigram.
        let bee = lm.wid("BEE").unwrap();
        let expected = lmath.log10_to_log(-0.1) + lm.bg_score(abbey, bee);
        assert_eq!(lm.tg_score(abbey, bee, bay), expected);
    }

    #[test]
    fn missing_context_degrades_gracefully() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let lm = toy_lm(&lmath);
        let bay = lm.wid("BAY").unwrap();
        assert_eq!(lm.bg_score(bay, NO_LMWID), lm.ug_score(bay));
        assert_eq!(lm.tg_score(bay, NO_LMWID, NO_LMWID), lm.ug_score(bay));
    }

    #[test]
    fn widmap_skips_fillers() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let lm = toy_lm(&lmath);
        let mdef = crate::mdef::tests::toy_mdef();
        let dict = crate::dict::tests::toy_dict(&mdef);
        let map = WidMap::build(&dict, &lm);
        assert!(map.known(dict.wid("BAY").unwrap()));
        assert!(map.known(dict.finish_wid()));
        assert!(!map.known(dict.silence_wid()));
        // The alternate maps through its base spelling.
        assert!(map.known(dict.wid("BEE(2)").unwrap()));
        assert!(!map.known(dict.wid("<noise>").unwrap()));
    }

    #[test]
    fn header_count_mismatch_is_rejected() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let bad = "\\data\\\nngram 1=3\n\n\\1-grams:\n-1.0 A\n\\end\\\n";
        assert!(NgramModel::from_reader(Cursor::new(bad), &lmath, "bad").is_err());
    }
}
