//! Word lattice: the backpointer table promoted into a DAG, best-path
//! rescoring over it, and A* N-best enumeration.
//!
//! Nodes are `(word, start frame)` pairs; a node's `fef..lef` range covers
//! every frame in which that instance exited. A link A -> B exists when some
//! backpointer of A ends exactly at `B.sf - 1`; its score is the
//! right-context-specific acoustic score of that exit. Filler nodes are
//! bypassed (their penalty folded into spliced links) before any language
//! scoring happens, so the rescoring passes only ever see real words.
//!
//! Best path is single-source longest path: links are relaxed in an order
//! where a link enters the queue only when every link into its source node
//! has been relaxed, tracked with fan-in counts. The A* pass runs best-first
//! over partial paths with a bigram best-remaining heuristic per node and a
//! bounded candidate list.
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::lm::{LangModel, WidMap};
use crate::logmath::WORST_SCORE;
use crate::search::ngram::NgramSearch;
use crate::search::Segment;

pub const NO_LINK: i32 = -1;

#[derive(Debug, Clone)]
pub struct LatNode {
    pub word: String,
    pub wid: i32,
    pub sf: i32,
    pub fef: i32,
    pub lef: i32,
    /// Outgoing link ids.
    pub links: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct LatLink {
    pub from: i32,
    pub to: i32,
    /// Acoustic score of the "from" word over `from.sf ..= ef`.
    pub ascr: i32,
    /// End frame of the "from" word on this link.
    pub ef: i32,
    /// Filled by the best-path pass.
    pub path_scr: i32,
    pub best_prev: i32,
}

/// Language-model context needed for rescoring; absent on lattices parsed
/// back from disk.
pub(crate) struct LatticeScorer {
    pub dict: Arc<Dict>,
    pub lm: Arc<dyn LangModel>,
    pub widmap: WidMap,
    pub lw: f32,
    pub wip: i32,
}

impl LatticeScorer {
    fn trans_score(&self, wid: i32, real: i32, prev_real: i32) -> i32 {
        let w3 = self.widmap.get(wid);
        if w3 == crate::lm::NO_LMWID {
            return WORST_SCORE;
        }
        let raw = self
            .lm
            .tg_score(w3, self.widmap.get(real), self.widmap.get(prev_real));
        ((raw as f64 * self.lw as f64) as i32).max(WORST_SCORE) + self.wip
    }

    fn bg_trans_score(&self, wid: i32, ctx: i32) -> i32 {
        let w = self.widmap.get(wid);
        if w == crate::lm::NO_LMWID {
            return WORST_SCORE;
        }
        let raw = self.lm.bg_score(w, self.widmap.get(ctx));
        ((raw as f64 * self.lw as f64) as i32).max(WORST_SCORE) + self.wip
    }
}

pub struct Lattice {
    pub nodes: Vec<LatNode>,
    pub links: Vec<LatLink>,
    pub start: i32,
    pub end: i32,
    pub n_frames: i32,
    pub(crate) scorer: Option<LatticeScorer>,
    /// Best link into the end node after the best-path pass.
    best_exit: Option<i32>,
}

impl Lattice {
    /// Promote the backpointer table of a finished utterance into a DAG.
    /// Expects the acoustic/language decomposition to have been computed
    /// under the rescoring weight.
    pub fn build(ngs: &NgramSearch) -> Result<Lattice> {
        let dict = &ngs.dict;
        let bptbl = &ngs.bptbl;
        let n_frames = ngs.n_frame;
        if bptbl.is_empty() {
            return Err(Error::Domain("lattice empty: no word exits".into()));
        }

        // One node per (word, start frame); fef/lef hold backpointer ids
        // until the links are built.
        let mut nodes: Vec<LatNode> = Vec::new();
        let mut reachable: Vec<bool> = Vec::new();
        for bp in 0..bptbl.len() as i32 {
            let e = bptbl.entry(bp);
            if !e.valid {
                continue;
            }
            let sf = bptbl.start_frame(bp);
            // Non-final </s> exits do not belong in the lattice.
            if e.wid == dict.finish_wid() && e.frame < n_frames - 1 {
                continue;
            }
            if !dict.is_filler(e.wid) && !ngs.lm_known(e.wid) {
                continue;
            }
            match nodes.iter_mut().find(|n| n.wid == e.wid && n.sf == sf) {
                Some(n) => n.lef = bp,
                None => {
                    nodes.push(LatNode {
                        word: dict.word_str(e.wid).to_string(),
                        wid: e.wid,
                        sf,
                        fef: bp,
                        lef: bp,
                        links: Vec::new(),
                    });
                    reachable.push(false);
                }
            }
        }

        // Start node: <s> at frame 0.
        let start = nodes
            .iter()
            .position(|n| n.wid == dict.start_wid() && n.sf == 0)
            .ok_or_else(|| Error::Domain("no <s> node in first frame".into()))?
            as i32;

        // End node: </s> in the final frame, or the best exit overall.
        let end = match nodes
            .iter()
            .position(|n| n.wid == dict.finish_wid() && bptbl.entry(n.lef).frame == n_frames - 1)
        {
            Some(i) => i as i32,
            None => {
                let (bp, _) = bptbl
                    .find_exit(n_frames - 1)
                    .ok_or_else(|| Error::Domain("lattice empty: no word exits".into()))?;
                let sf = bptbl.start_frame(bp);
                let i = nodes
                    .iter()
                    .position(|n| n.wid == bptbl.entry(bp).wid && n.sf == sf)
                    .ok_or_else(|| Error::Logic("best exit has no lattice node".into()))?;
                warn!(
                    "</s> not found in last frame, using {}.{} instead",
                    nodes[i].word,
                    bptbl.entry(bp).frame
                );
                i as i32
            }
        };

        let mut links: Vec<LatLink> = Vec::new();
        reachable[end as usize] = true;

        // Create links, newest nodes first, so each node's reachability is
        // settled before anything tries to link into it.
        for to in (0..nodes.len()).rev() {
            if !reachable[to] {
                continue;
            }
            let to_sf = nodes[to].sf;
            let to_first = dict.first_phone(nodes[to].wid);
            for from in 0..nodes.len() {
                if from == to {
                    continue;
                }
                let fef = bptbl.entry(nodes[from].fef).frame;
                let lef = bptbl.entry(nodes[from].lef).frame;
                if to_sf <= fef || to_sf > lef + 1 {
                    continue;
                }
                // Exact exit of "from" at to.sf - 1.
                let mut found = None;
                for bp in nodes[from].fef..=nodes[from].lef {
                    let e = bptbl.entry(bp);
                    if e.wid != nodes[from].wid {
                        continue;
                    }
                    if e.frame >= to_sf - 1 {
                        if e.frame == to_sf - 1 {
                            found = Some(bp);
                        }
                        break;
                    }
                }
                let Some(bp) = found else { continue };
                let e = bptbl.entry(bp);
                let score = (bptbl.rc_score(bp, to_first, &ngs.tt) - e.score) + e.ascr;
                if score > WORST_SCORE {
                    Self::link_nodes(&mut nodes, &mut links, from as i32, to as i32, score, e.frame);
                    reachable[from] = true;
                }
            }
        }

        if !reachable[start as usize] {
            return Err(Error::Domain("<s> isolated; unreachable".into()));
        }

        // fef/lef become frames now that linking is done.
        for n in nodes.iter_mut() {
            n.fef = bptbl.entry(n.fef).frame;
            n.lef = bptbl.entry(n.lef).frame;
        }

        let mut dag = Lattice {
            nodes,
            links,
            start,
            end,
            n_frames,
            scorer: Some(LatticeScorer {
                dict: ngs.dict.clone(),
                lm: ngs.lm.clone(),
                widmap: ngs.widmap.clone(),
                lw: ngs.bestpathlw,
                wip: ngs.wip,
            }),
            best_exit: None,
        };
        dag.bypass_fillers(&ngs.dict, ngs.silpen, ngs.fillpen);
        dag.delete_unreachable();
        info!(
            "lattice: {} nodes, {} links",
            dag.nodes.len(),
            dag.links.len()
        );
        Ok(dag)
    }

    fn link_nodes(
        nodes: &mut [LatNode],
        links: &mut Vec<LatLink>,
        from: i32,
        to: i32,
        score: i32,
        ef: i32,
    ) {
        // Keep the best-scoring link between any two nodes.
        for &l in &nodes[from as usize].links {
            let link = &mut links[l as usize];
            if link.to == to {
                if link.ascr < score {
                    link.ascr = score;
                    link.ef = ef;
                }
                return;
            }
        }
        let id = links.len() as i32;
        links.push(LatLink {
            from,
            to,
            ascr: score,
            ef,
            path_scr: WORST_SCORE,
            best_prev: NO_LINK,
        });
        nodes[from as usize].links.push(id);
    }

    /// Splice filler nodes out: each link into a filler is joined with each
    /// of the filler's outgoing links, adding the filler penalty.
    fn bypass_fillers(&mut self, dict: &Dict, silpen: i32, fillpen: i32) {
        let is_filler = |n: &LatNode| dict.is_filler(n.wid);
        let mut dead_links: Vec<bool> = vec![false; self.links.len()];

        // Newest first: a filler's successors are bypassed before it is.
        for f in (0..self.nodes.len()).rev() {
            if f as i32 == self.start || f as i32 == self.end || !is_filler(&self.nodes[f]) {
                continue;
            }
            let pen = if self.nodes[f].wid == dict.silence_wid() {
                silpen
            } else {
                fillpen
            };
            let incoming: Vec<i32> = (0..self.links.len() as i32)
                .filter(|&l| self.links[l as usize].to == f as i32 && !dead_links[l as usize])
                .collect();
            let outgoing: Vec<i32> = self.nodes[f].links.clone();
            for &inl in &incoming {
                let (from, in_ascr, in_ef) = {
                    let l = &self.links[inl as usize];
                    (l.from, l.ascr, l.ef)
                };
                for &outl in &outgoing {
                    if dead_links[outl as usize] {
                        continue;
                    }
                    let (to, out_ascr) = {
                        let l = &self.links[outl as usize];
                        (l.to, l.ascr)
                    };
                    // Filler successors were already bypassed; skip them.
                    if is_filler(&self.nodes[to as usize]) {
                        continue;
                    }
                    let score = in_ascr + pen + out_ascr;
                    let mut links = std::mem::take(&mut self.links);
                    Self::link_nodes(&mut self.nodes, &mut links, from, to, score, in_ef);
                    if links.len() > dead_links.len() {
                        dead_links.resize(links.len(), false);
                    }
                    self.links = links;
                }
                dead_links[inl as usize] = true;
            }
            for &outl in &outgoing {
                dead_links[outl as usize] = true;
            }
            self.nodes[f].links.clear();
        }

        // Drop filler nodes and dead links, remapping ids.
        let keep_node: Vec<bool> = (0..self.nodes.len())
            .map(|i| {
                i as i32 == self.start || i as i32 == self.end || !is_filler(&self.nodes[i])
            })
            .collect();
        self.compact(&keep_node, &dead_links);
    }

    /// Drop nodes that cannot reach the end node.
    fn delete_unreachable(&mut self) {
        let mut reach = vec![false; self.nodes.len()];
        // Links always point forward in node order except through the
        // compaction, so just iterate to a fixed point.
        reach[self.end as usize] = true;
        let mut changed = true;
        while changed {
            changed = false;
            for l in &self.links {
                if reach[l.to as usize] && !reach[l.from as usize] {
                    reach[l.from as usize] = true;
                    changed = true;
                }
            }
        }
        let dead_links: Vec<bool> = self
            .links
            .iter()
            .map(|l| !reach[l.from as usize] || !reach[l.to as usize])
            .collect();
        self.compact(&reach, &dead_links);
    }

    /// Rebuild node and link vectors under keep-masks, remapping every id.
    fn compact(&mut self, keep_node: &[bool], dead_link: &[bool]) {
        let mut node_map = vec![-1i32; self.nodes.len()];
        let mut new_nodes = Vec::new();
        for (i, n) in self.nodes.drain(..).enumerate() {
            if keep_node[i] {
                node_map[i] = new_nodes.len() as i32;
                new_nodes.push(n);
            }
        }
        let mut link_map = vec![-1i32; self.links.len()];
        let mut new_links = Vec::new();
        for (i, mut l) in self.links.drain(..).enumerate() {
            if dead_link.get(i) == Some(&false)
                && node_map[l.from as usize] >= 0
                && node_map[l.to as usize] >= 0
            {
                l.from = node_map[l.from as usize];
                l.to = node_map[l.to as usize];
                link_map[i] = new_links.len() as i32;
                new_links.push(l);
            }
        }
        for n in new_nodes.iter_mut() {
            n.links = n
                .links
                .iter()
                .filter_map(|&l| {
                    let m = link_map[l as usize];
                    if m >= 0 {
                        Some(m)
                    } else {
                        None
                    }
                })
                .collect();
        }
        self.start = node_map[self.start as usize];
        self.end = node_map[self.end as usize];
        debug_assert!(self.start >= 0 && self.end >= 0);
        self.nodes = new_nodes;
        self.links = new_links;
        self.best_exit = None;
    }

    /// Single-source longest path with trigram rescoring. Returns the best
    /// link into the end node.
    pub fn bestpath(&mut self) -> Option<i32> {
        if let Some(best) = self.best_exit {
            return Some(best);
        }
        let scorer = self.scorer.as_ref()?;

        let mut fanin = vec![0usize; self.nodes.len()];
        for l in &self.links {
            fanin[l.to as usize] += 1;
        }
        for l in self.links.iter_mut() {
            l.path_scr = WORST_SCORE;
            l.best_prev = NO_LINK;
        }

        // Seed with the links out of the start node. The path score carries
        // the LM score of the link's destination word, not its acoustics.
        let mut queue: Vec<i32> = Vec::new();
        let start_wid = self.nodes[self.start as usize].wid;
        for &l in &self.nodes[self.start as usize].links {
            let to_wid = self.nodes[self.links[l as usize].to as usize].wid;
            let lscr = scorer.bg_trans_score(to_wid, start_wid);
            let link = &mut self.links[l as usize];
            link.path_scr = link.ascr.saturating_add(lscr).max(WORST_SCORE);
            queue.push(l);
        }

        let mut head = 0usize;
        while head < queue.len() {
            let q = queue[head];
            head += 1;
            let (q_to, q_from, q_path) = {
                let l = &self.links[q as usize];
                (l.to, l.from, l.path_scr)
            };
            let node_wid = self.nodes[q_to as usize].wid;
            let prev_wid = self.nodes[q_from as usize].wid;

            for i in 0..self.nodes[q_to as usize].links.len() {
                let l = self.nodes[q_to as usize].links[i];
                let to_wid = self.nodes[self.links[l as usize].to as usize].wid;
                let lscr = scorer.trans_score(to_wid, node_wid, prev_wid);
                let score = q_path
                    .saturating_add(self.links[l as usize].ascr)
                    .saturating_add(lscr)
                    .max(WORST_SCORE);
                let link = &mut self.links[l as usize];
                if score > link.path_scr {
                    link.path_scr = score;
                    link.best_prev = q;
                }
            }

            fanin[q_to as usize] -= 1;
            if fanin[q_to as usize] == 0 {
                // All incoming links relaxed; this node's outgoing links now
                // hold optimal partial scores.
                for &l in &self.nodes[q_to as usize].links {
                    queue.push(l);
                }
            }
        }

        let mut best = NO_LINK;
        let mut best_score = WORST_SCORE;
        for (i, l) in self.links.iter().enumerate() {
            if l.to == self.end && l.path_scr > best_score {
                best_score = l.path_scr;
                best = i as i32;
            }
        }
        if best == NO_LINK {
            None
        } else {
            self.best_exit = Some(best);
            Some(best)
        }
    }

    /// Words along the best path, oldest first, as link ids.
    fn best_link_chain(&mut self) -> Vec<i32> {
        let Some(mut l) = self.bestpath() else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        while l != NO_LINK {
            chain.push(l);
            l = self.links[l as usize].best_prev;
        }
        chain.reverse();
        chain
    }

    pub fn bestpath_hyp(&mut self) -> Option<(String, i32)> {
        let chain = self.best_link_chain();
        if chain.is_empty() {
            return None;
        }
        let score = self.links[*chain.last().unwrap() as usize].path_scr;
        let hidden = |wid: i32| match &self.scorer {
            Some(s) => s.dict.is_hidden(wid) || s.dict.is_filler(wid),
            None => false,
        };
        let mut words = Vec::new();
        for &l in &chain {
            let n = &self.nodes[self.links[l as usize].from as usize];
            if !hidden(n.wid) {
                words.push(n.word.as_str());
            }
        }
        let last = &self.nodes[self.links[*chain.last().unwrap() as usize].to as usize];
        if !hidden(last.wid) {
            words.push(last.word.as_str());
        }
        Some((words.join(" "), score))
    }

    pub fn bestpath_seg(&mut self) -> Vec<Segment> {
        let chain = self.best_link_chain();
        let mut segs = Vec::new();
        for &l in &chain {
            let link = self.links[l as usize].clone();
            let n = &self.nodes[link.from as usize];
            segs.push(Segment {
                word: n.word.clone(),
                sf: n.sf,
                ef: link.ef,
                ascr: link.ascr,
                lscr: 0,
                prob: 0.0,
            });
        }
        if let Some(&l) = chain.last() {
            let link = &self.links[l as usize];
            let n = &self.nodes[link.to as usize];
            segs.push(Segment {
                word: n.word.clone(),
                sf: n.sf,
                ef: n.lef,
                ascr: 0,
                lscr: 0,
                prob: 0.0,
            });
        }
        segs
    }

    /// Write the documented textual format.
    pub fn write(&self, path: impl AsRef<Path>, logbase: f64) -> Result<()> {
        let mut out = String::new();
        let _ = writeln!(out, "# Generated by hark");
        let _ = writeln!(out, "# -logbase {logbase:e}");
        let _ = writeln!(out, "#");
        let _ = writeln!(out, "Frames {}", self.n_frames);
        let _ = writeln!(out, "#");
        let _ = writeln!(
            out,
            "Nodes {} (NODEID WORD STARTFRAME FIRST-ENDFRAME LAST-ENDFRAME)",
            self.nodes.len()
        );
        for (i, n) in self.nodes.iter().enumerate() {
            let _ = writeln!(out, "{} {} {} {} {}", i, n.word, n.sf, n.fef, n.lef);
        }
        let _ = writeln!(out, "#");
        let _ = writeln!(out, "Initial {}\nFinal {}", self.start, self.end);
        let _ = writeln!(out, "#");
        let _ = writeln!(out, "BestSegAscr 0 (NODEID ENDFRAME ASCORE)");
        let _ = writeln!(out, "#");
        let _ = writeln!(out, "Edges (FROM-NODEID TO-NODEID ASCORE)");
        for l in &self.links {
            let _ = writeln!(out, "{} {} {}", l.from, l.to, l.ascr);
        }
        let _ = writeln!(out, "End");
        fs::write(path.as_ref(), out)?;
        Ok(())
    }

    /// Parse a lattice written by [`Self::write`]. The result carries no
    /// language-model context, so it supports inspection but not rescoring.
    pub fn read(path: impl AsRef<Path>, dict: &Dict) -> Result<Lattice> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::format(path.display().to_string(), e.to_string()))?;
        let name = path.display().to_string();
        let mut lines = text
            .lines()
            .filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty());

        let mut expect = |prefix: &str| -> Result<String> {
            let line = lines
                .next()
                .ok_or_else(|| Error::format(&name, format!("missing {prefix}")))?;
            line.strip_prefix(prefix)
                .map(|r| r.trim().to_string())
                .ok_or_else(|| Error::format(&name, format!("expected {prefix}, got {line}")))
        };

        let n_frames: i32 = expect("Frames ")?
            .parse()
            .map_err(|_| Error::format(&name, "bad frame count"))?;
        let nodes_hdr = expect("Nodes ")?;
        let n_nodes: usize = nodes_hdr
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| Error::format(&name, "bad node count"))?;

        let mut lines = lines; // reborrow for the loop below
        let mut nodes = Vec::with_capacity(n_nodes);
        for _ in 0..n_nodes {
            let line = lines
                .next()
                .ok_or_else(|| Error::format(&name, "truncated node list"))?;
            let t: Vec<&str> = line.split_whitespace().collect();
            if t.len() != 5 {
                return Err(Error::format(&name, format!("bad node line: {line}")));
            }
            let wid = dict
                .wid(t[1])
                .ok_or_else(|| Error::Domain(format!("lattice word {} not in dictionary", t[1])))?;
            nodes.push(LatNode {
                word: t[1].to_string(),
                wid,
                sf: t[2].parse().map_err(|_| Error::format(&name, "bad sf"))?,
                fef: t[3].parse().map_err(|_| Error::format(&name, "bad fef"))?,
                lef: t[4].parse().map_err(|_| Error::format(&name, "bad lef"))?,
                links: Vec::new(),
            });
        }

        let mut expect2 = |prefix: &str| -> Result<String> {
            let line = lines
                .next()
                .ok_or_else(|| Error::format(&name, format!("missing {prefix}")))?;
            line.strip_prefix(prefix)
                .map(|r| r.trim().to_string())
                .ok_or_else(|| Error::format(&name, format!("expected {prefix}, got {line}")))
        };
        let start: i32 = expect2("Initial ")?
            .parse()
            .map_err(|_| Error::format(&name, "bad initial node"))?;
        let end: i32 = expect2("Final ")?
            .parse()
            .map_err(|_| Error::format(&name, "bad final node"))?;
        let _ = expect2("BestSegAscr ")?;
        let _ = expect2("Edges ")?;

        let mut links = Vec::new();
        for line in lines {
            if line.trim() == "End" {
                break;
            }
            let t: Vec<&str> = line.split_whitespace().collect();
            if t.len() != 3 {
                return Err(Error::format(&name, format!("bad edge line: {line}")));
            }
            let from: i32 = t[0].parse().map_err(|_| Error::format(&name, "bad edge"))?;
            let to: i32 = t[1].parse().map_err(|_| Error::format(&name, "bad edge"))?;
            let ascr: i32 = t[2].parse().map_err(|_| Error::format(&name, "bad edge"))?;
            if from as usize >= nodes.len() || to as usize >= nodes.len() {
                return Err(Error::format(&name, "edge references unknown node"));
            }
            let id = links.len() as i32;
            links.push(LatLink {
                from,
                to,
                ascr,
                ef: nodes[to as usize].sf - 1,
                path_scr: WORST_SCORE,
                best_prev: NO_LINK,
            });
            nodes[from as usize].links.push(id);
        }

        Ok(Lattice {
            nodes,
            links,
            start,
            end,
            n_frames,
            scorer: None,
            best_exit: None,
        })
    }

    pub fn has_filler_nodes(&self, dict: &Dict) -> bool {
        self.nodes.iter().enumerate().any(|(i, n)| {
            i as i32 != self.start && i as i32 != self.end && dict.is_filler(n.wid)
        })
    }
}

/// A partial path in the N-best search.
#[derive(Debug, Clone, Copy)]
struct LatPath {
    node: i32,
    parent: i32,
    /// Exact score up to and including `node`'s LM score (acoustics up to
    /// the link into `node`).
    score: i32,
}

/// Best-first N-best enumeration over a rescored lattice.
pub struct Nbest<'a> {
    dag: &'a Lattice,
    paths: Vec<LatPath>,
    /// Path-pool ids ordered best (head) to worst, bounded.
    queue: Vec<i32>,
    /// Bigram best-remaining score per node.
    rem: Vec<i32>,
    ef: i32,
    n_tried: usize,
}

/// Max partial paths kept at any time.
const MAX_PATHS: usize = 500;
const MAX_HYP_TRIES: usize = 10000;

impl<'a> Nbest<'a> {
    /// `sf`/`ef` bound the region to enumerate; `w1`, `w2` are the LM
    /// context preceding `sf` (dictionary ids, NO_WID if absent).
    pub fn new(dag: &'a Lattice, sf: i32, ef: i32, w1: i32, w2: i32) -> Result<Nbest<'a>> {
        let scorer = dag
            .scorer
            .as_ref()
            .ok_or_else(|| Error::Domain("lattice has no language model attached".into()))?;
        let ef = if ef < 0 { dag.n_frames - ef } else { ef };

        // Heuristic: best remaining score to the end, bigrams only. Links
        // point forward in node order, so one reverse sweep settles it.
        let mut rem = vec![WORST_SCORE; dag.nodes.len()];
        rem[dag.end as usize] = 0;
        for i in (0..dag.nodes.len()).rev() {
            for &l in &dag.nodes[i].links {
                let link = &dag.links[l as usize];
                let to = link.to as usize;
                if rem[to] <= WORST_SCORE {
                    continue;
                }
                let lscr = scorer.bg_trans_score(dag.nodes[to].wid, dag.nodes[i].wid);
                let score = rem[to]
                    .saturating_add(link.ascr)
                    .saturating_add(lscr)
                    .max(WORST_SCORE);
                if score > rem[i] {
                    rem[i] = score;
                }
            }
        }

        let mut nb = Nbest {
            dag,
            paths: Vec::new(),
            queue: Vec::new(),
            rem,
            ef,
            n_tried: 0,
        };

        for i in 0..dag.nodes.len() {
            if dag.nodes[i].sf != sf {
                continue;
            }
            let wid = dag.nodes[i].wid;
            let lscr = if w1 < 0 {
                scorer.bg_trans_score(wid, w2)
            } else {
                scorer.trans_score(wid, w2, w1)
            };
            nb.insert(LatPath {
                node: i as i32,
                parent: -1,
                score: lscr.max(WORST_SCORE),
            });
        }
        Ok(nb)
    }

    fn total(&self, p: &LatPath) -> i32 {
        p.score.saturating_add(self.rem[p.node as usize])
    }

    fn insert(&mut self, path: LatPath) {
        let total = self.total(&path);
        if self.queue.len() >= MAX_PATHS {
            let tail = self.paths[*self.queue.last().unwrap() as usize];
            if total <= self.total(&tail) {
                return;
            }
        }
        let id = self.paths.len() as i32;
        self.paths.push(path);
        let pos = self
            .queue
            .partition_point(|&q| self.total(&self.paths[q as usize]) >= total);
        self.queue.insert(pos, id);
        self.queue.truncate(MAX_PATHS);
    }

    fn extend(&mut self, pid: i32) {
        let path = self.paths[pid as usize];
        let scorer = self.dag.scorer.as_ref().unwrap();
        let parent_wid = if path.parent >= 0 {
            self.paths[path.parent as usize].node
        } else {
            -1
        };
        for i in 0..self.dag.nodes[path.node as usize].links.len() {
            let l = self.dag.nodes[path.node as usize].links[i];
            let link = &self.dag.links[l as usize];
            // Dead-end nodes cannot complete.
            if self.rem[link.to as usize] <= WORST_SCORE {
                continue;
            }
            let to_wid = self.dag.nodes[link.to as usize].wid;
            let lscr = if parent_wid >= 0 {
                scorer.trans_score(
                    to_wid,
                    self.dag.nodes[path.node as usize].wid,
                    self.dag.nodes[parent_wid as usize].wid,
                )
            } else {
                scorer.bg_trans_score(to_wid, self.dag.nodes[path.node as usize].wid)
            };
            let score = path
                .score
                .saturating_add(link.ascr)
                .saturating_add(lscr)
                .max(WORST_SCORE);
            self.n_tried += 1;
            self.insert(LatPath {
                node: link.to,
                parent: pid,
                score,
            });
        }
    }

    fn hyp_of(&self, mut pid: i32) -> (String, i32) {
        let scorer = self.dag.scorer.as_ref().unwrap();
        let score = self.paths[pid as usize].score;
        let mut words = Vec::new();
        while pid >= 0 {
            let p = &self.paths[pid as usize];
            let n = &self.dag.nodes[p.node as usize];
            if !scorer.dict.is_hidden(n.wid) && !scorer.dict.is_filler(n.wid) {
                words.push(n.word.clone());
            }
            pid = p.parent;
        }
        words.reverse();
        (words.join(" "), score)
    }
}

impl Iterator for Nbest<'_> {
    type Item = (String, i32);

    fn next(&mut self) -> Option<(String, i32)> {
        while !self.queue.is_empty() && self.n_tried < MAX_HYP_TRIES {
            let pid = self.queue.remove(0);
            let node = self.paths[pid as usize].node;
            let n = &self.dag.nodes[node as usize];
            if n.sf >= self.ef
                || (node == self.dag.end && self.ef > self.dag.nodes[self.dag.end as usize].sf)
            {
                return Some(self.hyp_of(pid));
            }
            if n.fef < self.ef {
                self.extend(pid);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::tests::toy_lm;
    use crate::logmath::LogMath;
    use crate::mdef::tests::toy_mdef;

    /// Hand-build a small rescorable DAG:
    /// <s> -> BAY -> BEE -> </s> and <s> -> ABBEY -> </s>.
    fn hand_dag() -> Lattice {
        let mdef = toy_mdef();
        let dict = Arc::new(crate::dict::tests::toy_dict(&mdef));
        let lmath = Arc::new(LogMath::new(1.0001, 0).unwrap());
        let lm: Arc<dyn LangModel> = Arc::new(toy_lm(&lmath));
        let widmap = WidMap::build(&dict, lm.as_ref());

        let mk = |word: &str, sf: i32, fef: i32, lef: i32| LatNode {
            word: word.to_string(),
            wid: dict.wid(word).unwrap(),
            sf,
            fef,
            lef,
            links: Vec::new(),
        };
        let mut nodes = vec![
            mk("<s>", 0, 4, 5),
            mk("BAY", 5, 20, 22),
            mk("ABBEY", 5, 30, 32),
            mk("BEE", 22, 38, 39),
            mk("</s>", 39, 39, 39),
        ];
        let mut links = Vec::new();
        let mut add = |nodes: &mut Vec<LatNode>, links: &mut Vec<LatLink>, f: usize, t: usize, a: i32, ef: i32| {
            let id = links.len() as i32;
            links.push(LatLink {
                from: f as i32,
                to: t as i32,
                ascr: a,
                ef,
                path_scr: WORST_SCORE,
                best_prev: NO_LINK,
            });
            nodes[f].links.push(id);
        };
        add(&mut nodes, &mut links, 0, 1, -1000, 4);
        add(&mut nodes, &mut links, 0, 2, -1400, 4);
        add(&mut nodes, &mut links, 1, 3, -2000, 21);
        add(&mut nodes, &mut links, 2, 4, -2500, 38);
        add(&mut nodes, &mut links, 3, 4, -900, 38);

        Lattice {
            nodes,
            links,
            start: 0,
            end: 4,
            n_frames: 40,
            scorer: Some(LatticeScorer {
                dict,
                lm,
                widmap,
                lw: 1.0,
                wip: 0,
            }),
            best_exit: None,
        }
    }

    #[test]
    fn bestpath_matches_exhaustive_enumeration() {
        let mut dag = hand_dag();
        let scorer_scores = {
            let s = dag.scorer.as_ref().unwrap();
            // Path A: <s> BAY BEE </s>
            let a = -1000
                + s.bg_trans_score(dag.nodes[1].wid, dag.nodes[0].wid)
                + -2000
                + s.trans_score(dag.nodes[3].wid, dag.nodes[1].wid, dag.nodes[0].wid)
                + -900
                + s.trans_score(dag.nodes[4].wid, dag.nodes[3].wid, dag.nodes[1].wid);
            // Path B: <s> ABBEY </s>
            let b = -1400
                + s.bg_trans_score(dag.nodes[2].wid, dag.nodes[0].wid)
                + -2500
                + s.trans_score(dag.nodes[4].wid, dag.nodes[2].wid, dag.nodes[0].wid);
            (a, b)
        };
        let best = dag.bestpath().unwrap();
        let got = dag.links[best as usize].path_scr;
        assert_eq!(got, scorer_scores.0.max(scorer_scores.1));
        let (hyp, _) = dag.bestpath_hyp().unwrap();
        if scorer_scores.0 > scorer_scores.1 {
            assert_eq!(hyp, "BAY BEE");
        } else {
            assert_eq!(hyp, "ABBEY");
        }
    }

    #[test]
    fn nbest_enumerates_both_paths_in_order() {
        let dag = hand_dag();
        let hyps: Vec<(String, i32)> =
            Nbest::new(&dag, 0, dag.n_frames, -1, -1).unwrap().collect();
        assert_eq!(hyps.len(), 2);
        assert!(hyps[0].1 >= hyps[1].1);
        let texts: Vec<&str> = hyps.iter().map(|(h, _)| h.as_str()).collect();
        assert!(texts.contains(&"BAY BEE"));
        assert!(texts.contains(&"ABBEY"));
    }

    #[test]
    fn write_read_round_trip() {
        let mut dag = hand_dag();
        let _ = dag.bestpath();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utt.lat");
        dag.write(&path, 1.0001).unwrap();

        let mdef = toy_mdef();
        let dict = crate::dict::tests::toy_dict(&mdef);
        let back = Lattice::read(&path, &dict).unwrap();
        assert_eq!(back.nodes.len(), dag.nodes.len());
        assert_eq!(back.links.len(), dag.links.len());
        assert_eq!(back.start, dag.start);
        assert_eq!(back.end, dag.end);
        assert_eq!(back.n_frames, dag.n_frames);
        for (a, b) in back.nodes.iter().zip(dag.nodes.iter()) {
            assert_eq!(a.word, b.word);
            assert_eq!(a.sf, b.sf);
        }
        for (a, b) in back.links.iter().zip(dag.links.iter()) {
            assert_eq!((a.from, a.to, a.ascr), (b.from, b.to, b.ascr));
        }
    }
}
