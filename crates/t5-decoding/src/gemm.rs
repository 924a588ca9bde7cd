//! GEMM algorithm tuning table and the default projection op.
//!
//! The table is advisory: the decode loop looks up the logits GEMM shape and
//! passes a hit to the projection op as a hint. Entries that are not valid for
//! the active precision make construction fail.

use std::collections::HashMap;
use std::path::Path;

use anyhow::ensure;
use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::config::DataType;
use crate::error::{DecodingError, Result};
use crate::ops::{ProjectionArgs, ProjectionOp};

pub const ALGO_DEFAULT: i32 = -1;
pub const ALGO_MAX: i32 = 23;
pub const ALGO_DEFAULT_TENSOR_OP: i32 = 99;
pub const ALGO_MAX_TENSOR_OP: i32 = 115;

/// `stages` value marking a plain (non split-k) algorithm id.
pub const STAGES_NONE: i32 = -1;

/// A tuned algorithm choice for one GEMM shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmAlgo {
    pub algo_id: i32,
    pub stages: i32,
}

#[derive(Debug, Clone, Default)]
pub struct GemmAlgoTable {
    entries: HashMap<(usize, usize, usize), GemmAlgo>,
}

impl GemmAlgoTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads the table, treating a missing file as an empty table.
    pub fn load(path: &Path, precision: DataType) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "GEMM config {} not found, using default algorithms",
                    path.display()
                );
                return Ok(Self::empty());
            }
            Err(e) => return Err(e.into()),
        };
        let table = Self::parse(&text, precision)?;
        log::info!("Loaded {} GEMM algorithm entries from {}", table.len(), path.display());
        Ok(table)
    }

    /// Parses `m n k algo_id stages` lines. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str, precision: DataType) -> Result<Self> {
        let mut entries = HashMap::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(DecodingError::GemmConfig(format!(
                    "line {}: expected 5 fields `m n k algo_id stages`, found {}",
                    line_no + 1,
                    fields.len()
                )));
            }

            let dim = |i: usize| -> Result<usize> {
                fields[i].parse::<usize>().map_err(|e| {
                    DecodingError::GemmConfig(format!(
                        "line {}: bad dimension '{}': {}",
                        line_no + 1,
                        fields[i],
                        e
                    ))
                })
            };
            let int = |i: usize| -> Result<i32> {
                fields[i].parse::<i32>().map_err(|e| {
                    DecodingError::GemmConfig(format!(
                        "line {}: bad integer '{}': {}",
                        line_no + 1,
                        fields[i],
                        e
                    ))
                })
            };

            let algo = GemmAlgo {
                algo_id: int(3)?,
                stages: int(4)?,
            };
            check_algo(algo, precision).map_err(|reason| {
                DecodingError::GemmConfig(format!("line {}: {}", line_no + 1, reason))
            })?;
            entries.insert((dim(0)?, dim(1)?, dim(2)?), algo);
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, m: usize, n: usize, k: usize) -> Option<GemmAlgo> {
        self.entries.get(&(m, n, k)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn check_algo(algo: GemmAlgo, precision: DataType) -> std::result::Result<(), String> {
    if algo.stages != STAGES_NONE {
        return Ok(());
    }
    let (lo, hi) = match precision {
        DataType::F32 => (ALGO_DEFAULT, ALGO_MAX),
        DataType::F16 => (ALGO_DEFAULT_TENSOR_OP, ALGO_MAX_TENSOR_OP),
    };
    if algo.algo_id < lo || algo.algo_id > hi {
        return Err(format!(
            "algo_id {} is not valid for {:?} (expected {}..={})",
            algo.algo_id, precision, lo, hi
        ));
    }
    Ok(())
}

/// Row-major projection on the host via `ndarray`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NdarrayProjection;

impl ProjectionOp for NdarrayProjection {
    fn project(&self, args: ProjectionArgs<'_>) -> anyhow::Result<()> {
        let ProjectionArgs {
            m,
            n,
            k,
            alpha,
            a,
            b,
            c,
            algo,
            ..
        } = args;
        ensure!(a.len() >= m * k, "lhs has {} values, need {}x{}", a.len(), m, k);
        ensure!(b.len() >= k * n, "rhs has {} values, need {}x{}", b.len(), k, n);
        ensure!(c.len() >= m * n, "output has {} values, need {}x{}", c.len(), m, n);

        if let Some(algo) = algo {
            log::trace!("Projection {}x{}x{} with tuned algo {:?}", m, n, k, algo);
        }

        let a = ArrayView2::from_shape((m, k), &a[..m * k])?;
        let b = ArrayView2::from_shape((k, n), &b[..k * n])?;
        let mut c = ArrayViewMut2::from_shape((m, n), &mut c[..m * n])?;
        general_mat_mul(alpha, &a, &b, 0.0, &mut c);
        Ok(())
    }
}
