//! Per-state lexicon trees for the FSG search.
//!
//! Each FSG state gets its own little network built from the words on its
//! outgoing transitions; states share nothing. A word-bearing transition
//! becomes a chain: a multiplex root for the first phone (carrying the
//! transition's log probability and the word insertion penalty), interior
//! phones, then one leaf per distinct right-context senone sequence of the
//! final phone, each tagged with the bit-set of right-context phones it
//! models and the transition it completes. Single-phone words collapse to a
//! root that is also a leaf, with a wildcard right context.
use crate::dict::Dict;
use crate::hmm::{Hmm, HmmContext};
use crate::mdef::{Mdef, PhoneId, TriphoneTable, NO_PHONE};

use super::model::WordFsg;

pub const NO_PNODE: i32 = -1;

/// Bit-set over CI phones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiMask(Box<[u64]>);

impl CiMask {
    pub fn none(n_ci: usize) -> CiMask {
        CiMask(vec![0u64; (n_ci + 63) / 64].into_boxed_slice())
    }

    pub fn all(n_ci: usize) -> CiMask {
        let mut m = Self::none(n_ci);
        for ci in 0..n_ci {
            m.set(ci as PhoneId);
        }
        m
    }

    pub fn set(&mut self, ci: PhoneId) {
        self.0[ci as usize / 64] |= 1 << (ci as usize % 64);
    }

    pub fn test(&self, ci: PhoneId) -> bool {
        self.0[ci as usize / 64] & (1 << (ci as usize % 64)) != 0
    }
}

#[derive(Debug)]
pub struct PNode {
    pub hmm: Hmm,
    /// Next alternative at the same level (roots of a state, or the leaf
    /// fanout of one chain).
    pub sibling: i32,
    /// First element of the next level; NO_PNODE at the leaves.
    pub child: i32,
    pub ciphone: PhoneId,
    /// Second phone, for fixing a multiplex root's left context on entry.
    pub second: PhoneId,
    /// Score added when this node is entered: transition probability plus
    /// word insertion penalty at roots, phone insertion penalty elsewhere.
    pub logprob: i32,
    /// Transition this leaf completes; NO for interior nodes.
    pub trans: i32,
    /// Right contexts this leaf's senone sequence models (leaves), or the
    /// left contexts a root admits (always all, the multiplex HMM adapts).
    pub ctxt: CiMask,
}

#[derive(Debug)]
pub struct FsgLextree {
    pub pnodes: Vec<PNode>,
    /// Per FSG state: head of the sibling-linked root list.
    pub roots: Vec<i32>,
}

impl FsgLextree {
    pub fn build(
        fsg: &WordFsg,
        dict: &Dict,
        mdef: &Mdef,
        tt: &TriphoneTable,
        ctx: &HmmContext,
        wip: i32,
        pip: i32,
    ) -> FsgLextree {
        let n_ci = mdef.n_ciphone();
        let mut tree = FsgLextree {
            pnodes: Vec::new(),
            roots: vec![NO_PNODE; fsg.n_state],
        };

        for state in 0..fsg.n_state {
            for &t in &fsg.state_trans[state] {
                let trans = &fsg.trans[t as usize];
                let phones = dict.word(trans.wid).phones.clone();
                let entry_prob = trans.logprob + wip;

                if phones.len() == 1 {
                    // Root and leaf in one: wildcard right context.
                    let b = phones[0];
                    let hmm = Hmm::new(ctx, true, mdef.ci_ssid(b), mdef.ci_tmat(b));
                    let id = tree.push(PNode {
                        hmm,
                        sibling: tree.roots[state],
                        child: NO_PNODE,
                        ciphone: b,
                        second: NO_PHONE,
                        logprob: entry_prob,
                        trans: t,
                        ctxt: CiMask::all(n_ci),
                    });
                    tree.roots[state] = id;
                    continue;
                }

                // Leaf fanout for the final phone.
                let last = phones[phones.len() - 1];
                let penult = phones[phones.len() - 2];
                let rcset = tt.rc_set(last, penult);
                let mut leaf_head = NO_PNODE;
                for (slot, &ssid) in rcset.ssid.iter().enumerate() {
                    let mut ctxt = CiMask::none(n_ci);
                    for ci in 0..n_ci {
                        if rcset.cimap[ci] as usize == slot {
                            ctxt.set(ci as PhoneId);
                        }
                    }
                    let hmm = Hmm::new(ctx, false, ssid, mdef.ci_tmat(last));
                    let id = tree.push(PNode {
                        hmm,
                        sibling: leaf_head,
                        child: NO_PNODE,
                        ciphone: last,
                        second: NO_PHONE,
                        logprob: pip,
                        trans: t,
                        ctxt,
                    });
                    leaf_head = id;
                }

                // Interior phones, last to second.
                let mut next = leaf_head;
                for p in (1..phones.len() - 1).rev() {
                    let ssid = mdef.phone_ssid(
                        phones[p],
                        phones[p - 1],
                        phones[p + 1],
                        crate::mdef::WordPos::Internal,
                    );
                    let hmm = Hmm::new(ctx, false, ssid, mdef.ci_tmat(phones[p]));
                    next = tree.push(PNode {
                        hmm,
                        sibling: NO_PNODE,
                        child: next,
                        ciphone: phones[p],
                        second: NO_PHONE,
                        logprob: pip,
                        trans: NO_PNODE,
                        ctxt: CiMask::all(n_ci),
                    });
                }

                // Multiplex root.
                let (b, r) = (phones[0], phones[1]);
                let hmm = Hmm::new(ctx, true, tt.ldiph_ssid(b, r, mdef.sil()), mdef.ci_tmat(b));
                let id = tree.push(PNode {
                    hmm,
                    sibling: tree.roots[state],
                    child: next,
                    ciphone: b,
                    second: r,
                    logprob: entry_prob,
                    trans: NO_PNODE,
                    ctxt: CiMask::all(n_ci),
                });
                tree.roots[state] = id;
            }
        }
        tree
    }

    fn push(&mut self, p: PNode) -> i32 {
        self.pnodes.push(p);
        (self.pnodes.len() - 1) as i32
    }

    pub fn n_pnode(&self) -> usize {
        self.pnodes.len()
    }

    pub fn is_leaf(&self, id: i32) -> bool {
        self.pnodes[id as usize].child == NO_PNODE
    }

    pub fn clear_all(&mut self) {
        for p in self.pnodes.iter_mut() {
            p.hmm.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::tests::toy_ctx;
    use crate::mdef::tests::toy_mdef;
    use crate::mdef::TriphoneTable;
    use crate::search::fsg::model::tests::toy_fsg;
    use std::sync::Arc;

    #[test]
    fn trees_are_separate_per_state_and_leaves_carry_links() {
        let mdef = toy_mdef();
        let dict = Arc::new(crate::dict::tests::toy_dict(&mdef));
        let lmath = crate::logmath::LogMath::new(1.0001, 0).unwrap();
        let fsg = toy_fsg(&dict, &lmath);
        let tt = TriphoneTable::build(&mdef);
        let ctx = toy_ctx();
        let tree = FsgLextree::build(&fsg, &dict, &mdef, &tt, &ctx, -5, -3);

        // State 0 has two outgoing words, state 1 has one, 2 and 3 none.
        assert_ne!(tree.roots[0], NO_PNODE);
        assert_ne!(tree.roots[1], NO_PNODE);
        assert_eq!(tree.roots[2], NO_PNODE);
        assert_eq!(tree.roots[3], NO_PNODE);

        // Count roots at state 0 via the sibling chain.
        let mut n_roots = 0;
        let mut id = tree.roots[0];
        while id != NO_PNODE {
            n_roots += 1;
            id = tree.pnodes[id as usize].sibling;
        }
        assert_eq!(n_roots, 2);

        // Walk BEE's chain at state 1: root B, leaves IY.
        let root = tree.roots[1] as usize;
        assert!(!tree.is_leaf(tree.roots[1]));
        let mut leaf = tree.pnodes[root].child;
        let mut n_leaves = 0;
        while leaf != NO_PNODE {
            assert!(tree.is_leaf(leaf));
            let p = &tree.pnodes[leaf as usize];
            assert!(p.trans != NO_PNODE);
            assert_eq!(fsg.trans[p.trans as usize].wid, dict.wid("BEE").unwrap());
            n_leaves += 1;
            leaf = p.sibling;
        }
        // IY after B has two distinct right-context sequences in the toy
        // model.
        assert_eq!(n_leaves, 2);
    }

    #[test]
    fn leaf_context_masks_partition_the_phone_set() {
        let mdef = toy_mdef();
        let dict = Arc::new(crate::dict::tests::toy_dict(&mdef));
        let lmath = crate::logmath::LogMath::new(1.0001, 0).unwrap();
        let fsg = toy_fsg(&dict, &lmath);
        let tt = TriphoneTable::build(&mdef);
        let ctx = toy_ctx();
        let tree = FsgLextree::build(&fsg, &dict, &mdef, &tt, &ctx, 0, 0);

        let root = tree.roots[1] as usize;
        let mut leaf = tree.pnodes[root].child;
        let mut covered = 0usize;
        while leaf != NO_PNODE {
            let p = &tree.pnodes[leaf as usize];
            for ci in 0..mdef.n_ciphone() {
                if p.ctxt.test(ci as i32) {
                    covered += 1;
                }
            }
            leaf = p.sibling;
        }
        // Every right context is modelled by exactly one leaf.
        assert_eq!(covered, mdef.n_ciphone());
    }
}
