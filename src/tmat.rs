//! HMM transition matrices.
//!
//! All matrices share the 1-skip Bakis topology: a state may transit only to
//! itself, the next state, or the state after next, and never backwards.
//! Rows are floored and renormalised on load, then converted to the integer
//! log domain; anything outside the topology must come out as log-zero or
//! the file is rejected.
use std::path::Path;

use tracing::info;

use crate::bio::BinReader;
use crate::error::{Error, Result};
use crate::logmath::{LogMath, WORST_SCORE};

pub const TMAT_VERSION: &str = "1.0";

#[derive(Debug)]
pub struct TmatSet {
    n_tmat: usize,
    /// Emitting states per matrix.
    n_state: usize,
    /// `n_state + 1`: the extra column is the non-emitting exit state.
    n_dst: usize,
    /// Flattened `[tmat][src][dst]` log probabilities; impossible arcs hold
    /// WORST_SCORE.
    tp: Vec<i32>,
}

impl TmatSet {
    pub fn read(path: impl AsRef<Path>, lmath: &LogMath, floor: f64) -> Result<Self> {
        let mut r = BinReader::open(path.as_ref())?;
        if let Some(v) = r.version() {
            if v != TMAT_VERSION {
                tracing::warn!("{}: version {} (expected {})", r.file(), v, TMAT_VERSION);
            }
        }

        let n_tmat = r.read_i32()? as usize;
        let n_src = r.read_i32()? as usize;
        let n_dst = r.read_i32()? as usize;
        let n_floats = r.read_i32()? as usize;
        if n_dst != n_src + 1 {
            return Err(Error::format(
                r.file(),
                format!("n_dst {n_dst} != n_src {n_src} + 1"),
            ));
        }
        if n_floats != n_tmat * n_src * n_dst {
            return Err(Error::format(
                r.file(),
                format!("{n_floats} floats does not match {n_tmat} x {n_src} x {n_dst}"),
            ));
        }

        let mut tp = vec![WORST_SCORE; n_tmat * n_dst * n_dst];
        for t in 0..n_tmat {
            for src in 0..n_src {
                let mut row = r.read_f32_vec(n_dst)?;
                floor_and_norm(&mut row, floor as f32, src);
                for (dst, &p) in row.iter().enumerate() {
                    if p > 0.0 {
                        tp[(t * n_dst + src) * n_dst + dst] = lmath.log(p as f64);
                    }
                }
            }
        }
        r.verify_chksum()?;
        r.expect_eof()?;

        let set = TmatSet {
            n_tmat,
            n_state: n_src,
            n_dst,
            tp,
        };
        set.check_topology()?;
        info!("read {} transition matrices ({} states)", n_tmat, n_src);
        Ok(set)
    }

    /// Build a set directly from probability rows. Tests and the KWS phone
    /// loop fixtures use this.
    pub fn from_rows(lmath: &LogMath, rows: &[Vec<Vec<f32>>]) -> Result<Self> {
        let n_tmat = rows.len();
        let n_state = rows[0].len();
        let n_dst = n_state + 1;
        let mut tp = vec![WORST_SCORE; n_tmat * n_dst * n_dst];
        for (t, mat) in rows.iter().enumerate() {
            for (src, row) in mat.iter().enumerate() {
                for (dst, &p) in row.iter().enumerate() {
                    if p > 0.0 {
                        tp[(t * n_dst + src) * n_dst + dst] = lmath.log(p as f64);
                    }
                }
            }
        }
        let set = TmatSet {
            n_tmat,
            n_state,
            n_dst,
            tp,
        };
        set.check_topology()?;
        Ok(set)
    }

    fn check_topology(&self) -> Result<()> {
        for t in 0..self.n_tmat {
            for src in 0..self.n_state {
                for dst in 0..self.n_dst {
                    let p = self.tp(t as i32, src, dst);
                    if p > WORST_SCORE && (dst < src || dst > src + 2) {
                        return Err(Error::format(
                            "transition_matrices",
                            format!("tmat {t} arc {src}->{dst} violates 1-skip Bakis topology"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn tp(&self, tmat: i32, from: usize, to: usize) -> i32 {
        self.tp[(tmat as usize * self.n_dst + from) * self.n_dst + to]
    }

    pub fn n_tmat(&self) -> usize {
        self.n_tmat
    }

    pub fn n_state(&self) -> usize {
        self.n_state
    }
}

/// Renormalise a row, then floor the entries that the topology permits but
/// training left at zero, and renormalise again. Out-of-topology entries are
/// left at zero so the post-load check can reject genuinely bad files.
fn floor_and_norm(row: &mut [f32], floor: f32, src: usize) {
    let sum: f32 = row.iter().sum();
    if sum > 0.0 {
        for p in row.iter_mut() {
            *p /= sum;
        }
    }
    for (dst, p) in row.iter_mut().enumerate() {
        if dst >= src && dst <= src + 2 && *p == 0.0 {
            *p = floor;
        }
    }
    let sum: f32 = row.iter().sum();
    if sum > 0.0 {
        for p in row.iter_mut() {
            *p /= sum;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bio::BinWriter;
    use std::io::Write;

    /// A left-to-right 3-state matrix set usable with the toy mdef (which
    /// references tmats 0..=3).
    pub(crate) fn toy_tmats(lmath: &LogMath) -> TmatSet {
        let mat = vec![
            vec![0.6, 0.3, 0.1, 0.0],
            vec![0.0, 0.6, 0.3, 0.1],
            vec![0.0, 0.0, 0.7, 0.3],
        ];
        TmatSet::from_rows(lmath, &[mat.clone(), mat.clone(), mat.clone(), mat]).unwrap()
    }

    fn write_tmat_file(rows: &[Vec<Vec<f32>>]) -> Vec<u8> {
        let n_tmat = rows.len();
        let n_src = rows[0].len();
        let n_dst = n_src + 1;
        let mut buf = Vec::new();
        let mut w = BinWriter::new(&mut buf, &[("version", TMAT_VERSION)], true).unwrap();
        w.write_i32(n_tmat as i32).unwrap();
        w.write_i32(n_src as i32).unwrap();
        w.write_i32(n_dst as i32).unwrap();
        w.write_i32((n_tmat * n_src * n_dst) as i32).unwrap();
        for mat in rows {
            for row in mat {
                for &p in row {
                    w.write_f32(p).unwrap();
                }
            }
        }
        w.finish().unwrap();
        buf
    }

    #[test]
    fn reads_and_quantises() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let mat = vec![
            vec![0.6, 0.3, 0.1, 0.0],
            vec![0.0, 0.6, 0.3, 0.1],
            vec![0.0, 0.0, 0.7, 0.3],
        ];
        let buf = write_tmat_file(&[mat]);
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&buf).unwrap();
        let set = TmatSet::read(tmp.path(), &lmath, 1e-4).unwrap();
        assert_eq!(set.n_tmat(), 1);
        assert_eq!(set.n_state(), 3);
        // Probabilities became negative log scores.
        assert!(set.tp(0, 0, 0) < 0);
        assert!(set.tp(0, 0, 0) > set.tp(0, 0, 2));
        // Backward arc is log-zero.
        assert_eq!(set.tp(0, 2, 0), WORST_SCORE);
        // In-topology zero got floored to something finite.
        assert!(set.tp(0, 0, 2) > WORST_SCORE);
    }

    #[test]
    fn rejects_non_bakis_files() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        // A backward arc 2 -> 0.
        let mat = vec![
            vec![0.6, 0.3, 0.1, 0.0],
            vec![0.0, 0.6, 0.3, 0.1],
            vec![0.2, 0.0, 0.5, 0.3],
        ];
        let buf = write_tmat_file(&[mat]);
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&buf).unwrap();
        assert!(TmatSet::read(tmp.path(), &lmath, 1e-4).is_err());

        // A skip of three: 0 -> 3 in a 4-state matrix.
        let mat = vec![
            vec![0.5, 0.2, 0.1, 0.2, 0.0],
            vec![0.0, 0.6, 0.3, 0.1, 0.0],
            vec![0.0, 0.0, 0.6, 0.3, 0.1],
            vec![0.0, 0.0, 0.0, 0.7, 0.3],
        ];
        let buf = write_tmat_file(&[mat]);
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&buf).unwrap();
        assert!(TmatSet::read(tmp.path(), &lmath, 1e-4).is_err());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let lmath = LogMath::new(1.0001, 0).unwrap();
        let mut buf = Vec::new();
        let mut w = BinWriter::new(&mut buf, &[("version", TMAT_VERSION)], false).unwrap();
        w.write_i32(1).unwrap();
        w.write_i32(3).unwrap();
        w.write_i32(5).unwrap(); // should be 4
        w.write_i32(15).unwrap();
        w.finish().unwrap();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&buf).unwrap();
        assert!(TmatSet::read(tmp.path(), &lmath, 1e-4).is_err());
    }
}
