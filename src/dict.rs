//! Pronunciation dictionary. A fairly simple map from word to a sequence of
//! CI phone ids, parsed from the usual two-column text format. What makes it
//! more than a map is the word-id layout the searches depend on: main
//! vocabulary words first (file order), then `</s>`, `<s>`, `<sil>`, then
//! the remaining filler words. Everything at or past the silence word id is
//! a filler, which lets the hot paths test "is this a filler" with a single
//! compare and lets the backpointer real-word caching walk filler chains
//! without string lookups.
//!
//! Alternate pronunciations use the `WORD(2)` convention; alternates link
//! back to their base word id so language-model lookups always see the base
//! spelling.
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::mdef::{Mdef, PhoneId};

pub const NO_WID: i32 = -1;

pub const START_WORD: &str = "<s>";
pub const FINISH_WORD: &str = "</s>";
pub const SILENCE_WORD: &str = "<sil>";

#[derive(Debug, Clone)]
pub struct DictWord {
    pub word: String,
    /// CI phone ids of the pronunciation.
    pub phones: Vec<PhoneId>,
    /// Base word id for alternate pronunciations (self for the base).
    pub base_wid: i32,
    /// Next alternate pronunciation of the same base, or NO_WID.
    pub alt_wid: i32,
    pub filler: bool,
}

#[derive(Debug, Clone)]
pub struct Dict {
    words: Vec<DictWord>,
    by_name: HashMap<String, i32>,
    n_main: usize,
    start_wid: i32,
    finish_wid: i32,
    silence_wid: i32,
}

impl Dict {
    /// Load the main and (optional) filler dictionaries. `<s>`, `</s>` and
    /// `<sil>` are created with a SIL pronunciation when the files don't
    /// provide them.
    pub fn load(
        mdef: &Mdef,
        dict_path: impl AsRef<Path>,
        fdict_path: Option<&Path>,
    ) -> Result<Self> {
        let file = File::open(dict_path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "cannot open dictionary {}: {e}",
                dict_path.as_ref().display()
            ))
        })?;
        let main = parse_dict(mdef, BufReader::new(file))?;
        let fillers = match fdict_path {
            Some(p) => {
                let file = File::open(p).map_err(|e| {
                    Error::Config(format!("cannot open filler dictionary {}: {e}", p.display()))
                })?;
                parse_dict(mdef, BufReader::new(file))?
            }
            None => Vec::new(),
        };
        Self::build(mdef, main, fillers)
    }

    /// Assemble a dictionary from already-parsed entries. Used by the loader
    /// above and directly by tests.
    pub fn build(
        mdef: &Mdef,
        main: Vec<(String, Vec<PhoneId>)>,
        fillers: Vec<(String, Vec<PhoneId>)>,
    ) -> Result<Self> {
        let mut dict = Dict {
            words: Vec::new(),
            by_name: HashMap::new(),
            n_main: 0,
            start_wid: NO_WID,
            finish_wid: NO_WID,
            silence_wid: NO_WID,
        };

        let special = [START_WORD, FINISH_WORD, SILENCE_WORD];
        let mut held_special: HashMap<String, Vec<PhoneId>> = HashMap::new();
        let mut held_fillers: Vec<(String, Vec<PhoneId>)> = Vec::new();

        for (word, phones) in main {
            let base = base_name(&word);
            if special.contains(&base) {
                held_special.insert(base.to_string(), phones);
            } else {
                dict.push(word, phones, false);
            }
        }
        dict.n_main = dict.words.len();

        for (word, phones) in fillers {
            let base = base_name(&word);
            if special.contains(&base) {
                held_special.insert(base.to_string(), phones);
            } else {
                held_fillers.push((word, phones));
            }
        }

        let sil_pron = vec![mdef.sil()];
        for name in [FINISH_WORD, START_WORD, SILENCE_WORD] {
            let pron = held_special
                .remove(name)
                .unwrap_or_else(|| sil_pron.clone());
            let wid = dict.push(name.to_string(), pron, true);
            match name {
                FINISH_WORD => dict.finish_wid = wid,
                START_WORD => dict.start_wid = wid,
                _ => dict.silence_wid = wid,
            }
        }
        for (word, phones) in held_fillers {
            dict.push(word, phones, true);
        }

        info!(
            "dictionary: {} main words, {} fillers",
            dict.n_main,
            dict.words.len() - dict.n_main
        );
        Ok(dict)
    }

    fn push(&mut self, word: String, phones: Vec<PhoneId>, filler: bool) -> i32 {
        let wid = self.words.len() as i32;
        let base = base_name(&word).to_string();
        let base_wid = match self.by_name.get(&base) {
            Some(&b) => {
                // Chain this alternate onto the base word.
                let mut w = b;
                while self.words[w as usize].alt_wid != NO_WID {
                    w = self.words[w as usize].alt_wid;
                }
                self.words[w as usize].alt_wid = wid;
                b
            }
            None => {
                self.by_name.insert(base, wid);
                wid
            }
        };
        self.by_name.entry(word.clone()).or_insert(wid);
        self.words.push(DictWord {
            word,
            phones,
            base_wid,
            alt_wid: NO_WID,
            filler,
        });
        wid
    }

    /// Add a word to the main vocabulary at runtime. The specials and
    /// fillers shift up by one id; callers that cached word ids (the
    /// searches) must be rebuilt, which `Decoder::add_word` takes care of.
    pub fn add_word(&mut self, word: &str, phones: Vec<PhoneId>) -> Result<i32> {
        if self.by_name.contains_key(word) {
            return Err(Error::Domain(format!("word {word} already present")));
        }
        let wid = self.n_main as i32;
        self.words.insert(
            self.n_main,
            DictWord {
                word: word.to_string(),
                phones,
                base_wid: wid,
                alt_wid: NO_WID,
                filler: false,
            },
        );
        self.n_main += 1;
        // Every id at or past the insertion point moved up by one; rebuild
        // the name map and alternate links outright rather than patching.
        let mut words = std::mem::take(&mut self.words);
        self.by_name.clear();
        for w in &mut words {
            w.base_wid = NO_WID;
            w.alt_wid = NO_WID;
        }
        for w in words {
            let pushed = self.push(w.word.clone(), w.phones, w.filler);
            match w.word.as_str() {
                FINISH_WORD => self.finish_wid = pushed,
                START_WORD => self.start_wid = pushed,
                SILENCE_WORD => self.silence_wid = pushed,
                _ => {}
            }
        }
        Ok(wid)
    }

    pub fn n_words(&self) -> usize {
        self.words.len()
    }

    /// Words before the `</s>`/`<s>`/`<sil>`/filler block.
    pub fn n_main_words(&self) -> usize {
        self.n_main
    }

    pub fn word(&self, wid: i32) -> &DictWord {
        &self.words[wid as usize]
    }

    pub fn wid(&self, word: &str) -> Option<i32> {
        self.by_name.get(word).copied()
    }

    pub fn word_str(&self, wid: i32) -> &str {
        &self.words[wid as usize].word
    }

    pub fn base_str(&self, wid: i32) -> &str {
        let base = self.words[wid as usize].base_wid;
        &self.words[base as usize].word
    }

    pub fn base_wid(&self, wid: i32) -> i32 {
        self.words[wid as usize].base_wid
    }

    pub fn pron_len(&self, wid: i32) -> usize {
        self.words[wid as usize].phones.len()
    }

    #[inline]
    pub fn is_filler(&self, wid: i32) -> bool {
        wid >= self.silence_wid
    }

    /// True for anything that should not appear in a hypothesis string.
    #[inline]
    pub fn is_hidden(&self, wid: i32) -> bool {
        wid >= self.finish_wid
    }

    pub fn start_wid(&self) -> i32 {
        self.start_wid
    }

    pub fn finish_wid(&self) -> i32 {
        self.finish_wid
    }

    pub fn silence_wid(&self) -> i32 {
        self.silence_wid
    }

    pub fn first_phone(&self, wid: i32) -> PhoneId {
        self.words[wid as usize].phones[0]
    }

    pub fn last_phone(&self, wid: i32) -> PhoneId {
        *self.words[wid as usize].phones.last().unwrap()
    }
}

fn base_name(word: &str) -> &str {
    match word.find('(') {
        Some(pos) if word.ends_with(')') => &word[..pos],
        _ => word,
    }
}

/// Parse a two-column dictionary: word, then space-separated phone names.
/// Lines starting with `;;` are comments. Lines with unknown phones are
/// skipped with a logged error so one bad entry doesn't take down the whole
/// vocabulary.
fn parse_dict(mdef: &Mdef, reader: impl BufRead) -> Result<Vec<(String, Vec<PhoneId>)>> {
    let mut out = Vec::new();
    'outer: for line in reader
        .lines()
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|l| !l.starts_with(";;") && !l.trim().is_empty())
    {
        let mut toks = line.split_whitespace();
        let word = match toks.next() {
            Some(w) => w.to_string(),
            None => continue,
        };
        let mut phones = Vec::new();
        for (i, name) in toks.enumerate() {
            match mdef.ciphone_id(name) {
                Some(id) => phones.push(id),
                None => {
                    warn!("unknown phone {} (#{}) for word {}; skipping entry", name, i, word);
                    continue 'outer;
                }
            }
        }
        if phones.is_empty() {
            warn!("word {} has no pronunciation; skipping entry", word);
            continue;
        }
        out.push((word, phones));
    }
    Ok(out)
}

/// Shared handle used across the decoder.
pub type DictRef = Arc<Dict>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mdef::tests::toy_mdef;
    use std::io::Cursor;

    pub(crate) fn toy_dict(mdef: &Mdef) -> Dict {
        let text = "\
;; toy vocabulary
BAY B AA IY
BEE B IY
ABBEY AA B IY
BEE(2) B IY IY
";
        let main = parse_dict(mdef, Cursor::new(text)).unwrap();
        let fillers = parse_dict(mdef, Cursor::new("<noise> SIL\n")).unwrap();
        Dict::build(mdef, main, fillers).unwrap()
    }

    #[test]
    fn layout_puts_fillers_after_silence() {
        let mdef = toy_mdef();
        let dict = toy_dict(&mdef);
        assert_eq!(dict.n_main_words(), 4);
        assert_eq!(dict.n_words(), 8);
        assert!(dict.finish_wid() < dict.start_wid());
        assert!(dict.start_wid() < dict.silence_wid());
        assert!(!dict.is_filler(dict.wid("BAY").unwrap()));
        assert!(!dict.is_filler(dict.finish_wid()));
        assert!(dict.is_filler(dict.silence_wid()));
        assert!(dict.is_filler(dict.wid("<noise>").unwrap()));
        assert!(dict.is_hidden(dict.start_wid()));
        assert!(dict.is_hidden(dict.finish_wid()));
    }

    #[test]
    fn alternates_share_a_base() {
        let mdef = toy_mdef();
        let dict = toy_dict(&mdef);
        let bee = dict.wid("BEE").unwrap();
        let bee2 = dict.wid("BEE(2)").unwrap();
        assert_ne!(bee, bee2);
        assert_eq!(dict.base_wid(bee2), bee);
        assert_eq!(dict.base_str(bee2), "BEE");
        assert_eq!(dict.word(bee).alt_wid, bee2);
    }

    #[test]
    fn bad_phones_skip_the_entry() {
        let mdef = toy_mdef();
        let main = parse_dict(&mdef, Cursor::new("GOOD B IY\nBAD B QX\n")).unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].0, "GOOD");
    }

    #[test]
    fn add_word_keeps_the_layout() {
        let mdef = toy_mdef();
        let mut dict = toy_dict(&mdef);
        let b = mdef.ciphone_id("B").unwrap();
        let aa = mdef.ciphone_id("AA").unwrap();
        let wid = dict.add_word("BAA", vec![b, aa]).unwrap();
        assert_eq!(wid as usize, dict.n_main_words() - 1);
        assert!(dict.finish_wid() > wid);
        assert!(dict.is_filler(dict.silence_wid()));
        assert_eq!(dict.wid("BAA"), Some(wid));
        // Old words still resolve.
        assert_eq!(dict.word_str(dict.wid("BAY").unwrap()), "BAY");
        // Duplicates are a domain error and leave the dict usable.
        assert!(dict.add_word("BAA", vec![b]).is_err());
        assert_eq!(dict.n_words(), 9);
    }
}
