//! Finite-state grammar model.
//!
//! The textual format is line-oriented:
//!
//! ```text
//! N 4
//! S 0
//! F 3
//! T 0 1 0.5 go
//! T 1 2 1.0 forward
//! T 2 3 1.0
//! ```
//!
//! A `T` line without a word is an epsilon (null) transition. Null paths
//! are collapsed up front into a transitive closure with the best
//! probability per (from, to) pair, so the search only ever propagates one
//! null step. Every word must be in the dictionary; referencing an unknown
//! word is a domain error and the grammar is rejected.
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::dict::{Dict, NO_WID};
use crate::error::{Error, Result};
use crate::logmath::LogMath;

#[derive(Debug, Clone, Copy)]
pub struct FsgTrans {
    pub from: i32,
    pub to: i32,
    pub wid: i32,
    /// Weighted log probability of taking this edge.
    pub logprob: i32,
}

#[derive(Debug)]
pub struct WordFsg {
    pub n_state: usize,
    pub start_state: i32,
    pub final_states: Vec<bool>,
    /// Word-bearing transitions.
    pub trans: Vec<FsgTrans>,
    /// Per state: transition ids leaving it.
    pub state_trans: Vec<Vec<i32>>,
    /// Per state: (destination, best log probability) over null paths of
    /// any length.
    pub null_closure: Vec<Vec<(i32, i32)>>,
}

impl WordFsg {
    pub fn read(
        path: impl AsRef<Path>,
        dict: &Arc<Dict>,
        lmath: &LogMath,
        lw: f32,
        use_filler: bool,
        silpen: i32,
        fillpen: i32,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::format(path.display().to_string(), e.to_string()))?;
        Self::parse(
            &text,
            &path.display().to_string(),
            dict,
            lmath,
            lw,
            use_filler,
            silpen,
            fillpen,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn parse(
        text: &str,
        name: &str,
        dict: &Arc<Dict>,
        lmath: &LogMath,
        lw: f32,
        use_filler: bool,
        silpen: i32,
        fillpen: i32,
    ) -> Result<Self> {
        let mut n_state: Option<usize> = None;
        let mut start_state: Option<i32> = None;
        let mut finals: Vec<i32> = Vec::new();
        let mut word_trans: Vec<FsgTrans> = Vec::new();
        let mut null_trans: Vec<(i32, i32, i32)> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let toks: Vec<&str> = line.split_whitespace().collect();
            match toks[0] {
                "N" => {
                    n_state = Some(
                        toks.get(1)
                            .and_then(|t| t.parse().ok())
                            .ok_or_else(|| Error::format(name, "bad N line"))?,
                    )
                }
                "S" => {
                    start_state = Some(
                        toks.get(1)
                            .and_then(|t| t.parse().ok())
                            .ok_or_else(|| Error::format(name, "bad S line"))?,
                    )
                }
                "F" => finals.push(
                    toks.get(1)
                        .and_then(|t| t.parse().ok())
                        .ok_or_else(|| Error::format(name, "bad F line"))?,
                ),
                "T" => {
                    if toks.len() < 4 {
                        return Err(Error::format(name, format!("bad T line: {line}")));
                    }
                    let from: i32 = toks[1]
                        .parse()
                        .map_err(|_| Error::format(name, "bad T source"))?;
                    let to: i32 = toks[2]
                        .parse()
                        .map_err(|_| Error::format(name, "bad T target"))?;
                    let prob: f64 = toks[3]
                        .parse()
                        .map_err(|_| Error::format(name, "bad T probability"))?;
                    let logprob = (lmath.log(prob) as f64 * lw as f64) as i32;
                    if toks.len() > 4 {
                        let word = toks[4];
                        let wid = dict.wid(word).ok_or_else(|| {
                            Error::Domain(format!("FSG word {word} not in dictionary"))
                        })?;
                        word_trans.push(FsgTrans {
                            from,
                            to,
                            wid,
                            logprob,
                        });
                    } else {
                        null_trans.push((from, to, logprob));
                    }
                }
                _ => return Err(Error::format(name, format!("unrecognised line: {line}"))),
            }
        }

        let n_state = n_state.ok_or_else(|| Error::format(name, "no N line"))?;
        let start_state = start_state.ok_or_else(|| Error::format(name, "no S line"))?;
        if finals.is_empty() {
            return Err(Error::format(name, "no F line"));
        }
        let check = |s: i32| -> Result<()> {
            if s < 0 || s as usize >= n_state {
                Err(Error::format(name, format!("state {s} out of range")))
            } else {
                Ok(())
            }
        };
        check(start_state)?;
        for &f in &finals {
            check(f)?;
        }
        for t in &word_trans {
            check(t.from)?;
            check(t.to)?;
        }
        for &(f, t, _) in &null_trans {
            check(f)?;
            check(t)?;
        }

        let mut final_states = vec![false; n_state];
        for f in finals {
            final_states[f as usize] = true;
        }

        // Filler self-loops let silence and noise absorb frames at any
        // state without changing it.
        if use_filler {
            for s in 0..n_state as i32 {
                for wid in dict.silence_wid()..dict.n_words() as i32 {
                    let pen = if wid == dict.silence_wid() {
                        silpen
                    } else {
                        fillpen
                    };
                    word_trans.push(FsgTrans {
                        from: s,
                        to: s,
                        wid,
                        logprob: pen,
                    });
                }
            }
        }

        let mut state_trans = vec![Vec::new(); n_state];
        for (i, t) in word_trans.iter().enumerate() {
            state_trans[t.from as usize].push(i as i32);
        }

        let null_closure = compute_null_closure(n_state, &null_trans);

        info!(
            "{}: {} states, start {}, {} word transitions, {} null transitions",
            name,
            n_state,
            start_state,
            word_trans.len(),
            null_trans.len()
        );
        Ok(WordFsg {
            n_state,
            start_state,
            final_states,
            trans: word_trans,
            state_trans,
            null_closure,
        })
    }

    pub fn is_final(&self, state: i32) -> bool {
        self.final_states[state as usize]
    }
}

/// Best-probability transitive closure of the null transitions. Each null
/// path then contributes at most one hop during search.
fn compute_null_closure(n_state: usize, null_trans: &[(i32, i32, i32)]) -> Vec<Vec<(i32, i32)>> {
    const NONE: i32 = i32::MIN;
    let mut best = vec![vec![NONE; n_state]; n_state];
    for &(f, t, p) in null_trans {
        if f != t && p > best[f as usize][t as usize] {
            best[f as usize][t as usize] = p;
        }
    }
    // Relax until nothing improves; grammars are small.
    let mut changed = true;
    while changed {
        changed = false;
        for a in 0..n_state {
            for b in 0..n_state {
                if best[a][b] == NONE {
                    continue;
                }
                for c in 0..n_state {
                    if b == c || best[b][c] == NONE || a == c {
                        continue;
                    }
                    let via = best[a][b].saturating_add(best[b][c]);
                    if via > best[a][c] {
                        best[a][c] = via;
                        changed = true;
                    }
                }
            }
        }
    }
    (0..n_state)
        .map(|a| {
            (0..n_state)
                .filter(|&b| best[a][b] != NONE)
                .map(|b| (b as i32, best[a][b]))
                .collect()
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mdef::tests::toy_mdef;

    pub(crate) fn toy_fsg(dict: &Arc<Dict>, lmath: &LogMath) -> WordFsg {
        let text = "\
N 4
S 0
F 3
T 0 1 1.0 BAY
T 0 1 0.5 ABBEY
T 1 2 1.0 BEE
T 2 3 1.0
T 1 3 0.1
";
        WordFsg::parse(text, "toy.fsg", dict, lmath, 1.0, false, 0, 0).unwrap()
    }

    #[test]
    fn parses_and_closes_nulls() {
        let mdef = toy_mdef();
        let dict = Arc::new(crate::dict::tests::toy_dict(&mdef));
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let fsg = toy_fsg(&dict, &lmath);
        assert_eq!(fsg.n_state, 4);
        assert_eq!(fsg.start_state, 0);
        assert!(fsg.is_final(3));
        assert_eq!(fsg.trans.len(), 3);
        // 2 -> 3 and 1 -> 3 by nulls; no path 0 -> 3.
        assert!(fsg.null_closure[2].iter().any(|&(t, _)| t == 3));
        assert!(fsg.null_closure[1].iter().any(|&(t, _)| t == 3));
        assert!(fsg.null_closure[0].is_empty());
        // 1 -> 3 direct beats nothing; score is log(0.1).
        let (_, p) = fsg.null_closure[1][0];
        assert_eq!(p, lmath.log(0.1));
    }

    #[test]
    fn chained_nulls_compose() {
        let mdef = toy_mdef();
        let dict = Arc::new(crate::dict::tests::toy_dict(&mdef));
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let text = "\
N 4
S 0
F 3
T 0 1 1.0 BAY
T 1 2 0.5
T 2 3 0.5
T 1 3 0.1
";
        let fsg = WordFsg::parse(text, "t", &dict, &lmath, 1.0, false, 0, 0).unwrap();
        let path = fsg.null_closure[1]
            .iter()
            .find(|&&(t, _)| t == 3)
            .unwrap()
            .1;
        // Two hops of 0.5 beat one hop of 0.1.
        assert_eq!(path, lmath.log(0.5) * 2);
    }

    #[test]
    fn unknown_word_is_a_domain_error() {
        let mdef = toy_mdef();
        let dict = Arc::new(crate::dict::tests::toy_dict(&mdef));
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let text = "N 2\nS 0\nF 1\nT 0 1 1.0 ZEBRA\n";
        let err = WordFsg::parse(text, "t", &dict, &lmath, 1.0, false, 0, 0).unwrap_err();
        assert!(matches!(err, Error::Domain(_)));
    }

    #[test]
    fn filler_loops_are_added_when_asked() {
        let mdef = toy_mdef();
        let dict = Arc::new(crate::dict::tests::toy_dict(&mdef));
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let text = "N 2\nS 0\nF 1\nT 0 1 1.0 BAY\n";
        let fsg =
            WordFsg::parse(text, "t", &dict, &lmath, 1.0, true, -100, -200).unwrap();
        // One word transition plus a self-loop per filler per state.
        let n_fillers = dict.n_words() - dict.silence_wid() as usize;
        assert_eq!(fsg.trans.len(), 1 + 2 * n_fillers);
        let sil_loop = fsg
            .trans
            .iter()
            .find(|t| t.wid == dict.silence_wid() && t.from == 0)
            .unwrap();
        assert_eq!(sil_loop.to, 0);
        assert_eq!(sil_loop.logprob, -100);
    }
}
