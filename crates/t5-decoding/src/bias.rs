use ndarray::ArrayView2;

use crate::error::{DecodingError, Result};

/// T5 bucketed relative-position bias for the decoder self-attention.
///
/// The decoder only looks backwards, so the bucketing is unidirectional:
/// every key at or after the query lands in bucket 0.
pub struct RelativeAttentionBias<'a> {
    pub bias_table: ArrayView2<'a, f32>, // Shape: [num_buckets, num_heads]
    pub num_buckets: usize,
    pub max_distance: usize,
}

impl<'a> RelativeAttentionBias<'a> {
    pub fn new(
        table: &'a [f32],
        num_buckets: usize,
        num_heads: usize,
        max_distance: usize,
    ) -> Result<Self> {
        let bias_table = ArrayView2::from_shape((num_buckets, num_heads), table).map_err(|e| {
            DecodingError::Input(format!(
                "relative bias table has {} values, expected {} buckets x {} heads: {}",
                table.len(),
                num_buckets,
                num_heads,
                e
            ))
        })?;
        Ok(Self {
            bias_table,
            num_buckets,
            max_distance,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.bias_table.ncols()
    }

    /// Fills `out` as `[head][query][key]` over `positions` query and key positions.
    pub fn compute_into(&self, positions: usize, out: &mut [f32]) -> Result<()> {
        let num_heads = self.num_heads();
        let plane = positions * positions;
        if out.len() != num_heads * plane {
            return Err(DecodingError::Layout(format!(
                "relative bias buffer holds {} values, expected {}",
                out.len(),
                num_heads * plane
            )));
        }

        for q in 0..positions {
            for k in 0..positions {
                // T5 relative position: k - q
                let rel_pos = k as i64 - q as i64;
                let bucket = self.relative_position_bucket(rel_pos);
                for h in 0..num_heads {
                    out[h * plane + q * positions + k] = self.bias_table[[bucket, h]];
                }
            }
        }

        log::debug!(
            "Computed relative attention bias: {} heads over {} positions",
            num_heads,
            positions
        );
        Ok(())
    }

    pub fn relative_position_bucket(&self, relative_position: i64) -> usize {
        // T5 looks "backwards" from query to key
        let n = (-relative_position).max(0);
        let num_buckets = self.num_buckets as i64;
        let max_exact = num_buckets / 2;

        if n < max_exact {
            return n as usize;
        }

        let log_ratio = (n as f32 / max_exact as f32).ln()
            / (self.max_distance as f32 / max_exact as f32).ln();
        let bucket = (max_exact as f32 + log_ratio * (num_buckets - max_exact) as f32) as i64;
        bucket.clamp(max_exact, num_buckets - 1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(num_buckets: usize, num_heads: usize) -> Vec<f32> {
        // value = bucket * 10 + head
        (0..num_buckets)
            .flat_map(|b| (0..num_heads).map(move |h| (b * 10 + h) as f32))
            .collect()
    }

    #[test]
    fn test_buckets_are_unidirectional() {
        let data = table(32, 1);
        let bias = RelativeAttentionBias::new(&data, 32, 1, 128).unwrap();
        assert_eq!(bias.relative_position_bucket(0), 0);
        assert_eq!(bias.relative_position_bucket(5), 0);
        assert_eq!(bias.relative_position_bucket(-1), 1);
        assert_eq!(bias.relative_position_bucket(-15), 15);
    }

    #[test]
    fn test_log_buckets_monotonic_and_capped() {
        let data = table(32, 1);
        let bias = RelativeAttentionBias::new(&data, 32, 1, 128).unwrap();
        assert_eq!(bias.relative_position_bucket(-16), 16);
        let mut last = 0;
        for distance in 16..400 {
            let bucket = bias.relative_position_bucket(-distance);
            assert!(bucket >= last);
            assert!(bucket <= 31);
            last = bucket;
        }
        assert_eq!(bias.relative_position_bucket(-128), 31);
        assert_eq!(bias.relative_position_bucket(-10_000), 31);
    }

    #[test]
    fn test_short_max_distance_stays_in_table() {
        // max_distance below num_buckets / 2 turns the log ratio negative.
        let data = table(32, 1);
        let bias = RelativeAttentionBias::new(&data, 32, 1, 2).unwrap();
        for distance in 16..400 {
            let bucket = bias.relative_position_bucket(-distance);
            assert!((16..=31).contains(&bucket), "distance {} -> bucket {}", distance, bucket);
        }

        let positions = 301;
        let mut out = vec![0.0; positions * positions];
        bias.compute_into(positions, &mut out).unwrap();
        assert!(out.iter().all(|&v| (0.0..=310.0).contains(&v)));
    }

    #[test]
    fn test_compute_is_head_major() {
        let data = table(4, 2);
        let bias = RelativeAttentionBias::new(&data, 4, 2, 8).unwrap();
        let positions = 3;
        let mut out = vec![0.0; 2 * positions * positions];
        bias.compute_into(positions, &mut out).unwrap();

        // query 2, key 0: distance 2 -> with max_exact 2 falls in the log range.
        let bucket = bias.relative_position_bucket(-2);
        assert_eq!(out[2 * 3], (bucket * 10) as f32);
        assert_eq!(out[9 + 2 * 3], (bucket * 10 + 1) as f32);
        // query 1, key 0
        assert_eq!(out[3], 10.0);
        assert_eq!(out[9 + 3], 11.0);
        // diagonal and future keys are bucket 0
        assert_eq!(out[4], 0.0);
        assert_eq!(out[9 + 5], 1.0);
    }

    #[test]
    fn test_shape_mismatch() {
        let data = vec![0.0; 5];
        assert!(RelativeAttentionBias::new(&data, 4, 2, 8).is_err());

        let data = table(4, 2);
        let bias = RelativeAttentionBias::new(&data, 4, 2, 8).unwrap();
        let mut out = vec![0.0; 3];
        assert!(bias.compute_into(3, &mut out).is_err());
    }
}
