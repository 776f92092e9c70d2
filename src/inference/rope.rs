/// Rotary positional embeddings.
///
/// Each adjacent pair of values within a head is rotated by an angle that
/// depends on the absolute token position and the pair index:
/// θⱼ,ₚ = p · base^(−2j/d). Queries and keys get the same rotation, so
/// their dot product depends only on relative position.
pub struct Rope {
    head_dim: usize,
    theta_base: f32,
}

impl Rope {
    pub fn new(head_dim: usize, theta_base: f32) -> Self {
        debug_assert!(head_dim % 2 == 0, "head_dim must be even for rotation pairs");
        Self {
            head_dim,
            theta_base,
        }
    }

    /// Rotation angle for pair `j` at absolute position `pos`.
    fn angle(&self, pos: usize, j: usize) -> f32 {
        let freq = self
            .theta_base
            .powf(-2.0 * (j as f32) / (self.head_dim as f32));
        (pos as f32) * freq
    }

    /// Rotate `x` in place. `x` holds `[T, n_heads * head_dim]` rows; row
    /// `t` is rotated for absolute position `p0 + t`.
    pub fn apply(&self, x: &mut [f32], n_heads: usize, p0: usize) {
        let row = n_heads * self.head_dim;
        debug_assert_eq!(x.len() % row, 0);

        for (t, row_vals) in x.chunks_exact_mut(row).enumerate() {
            let pos = p0 + t;
            for head in row_vals.chunks_exact_mut(self.head_dim) {
                for j in 0..self.head_dim / 2 {
                    let theta = self.angle(pos, j);
                    let (sin, cos) = theta.sin_cos();
                    let a = head[2 * j];
                    let b = head[2 * j + 1];
                    head[2 * j] = a * cos - b * sin;
                    head[2 * j + 1] = a * sin + b * cos;
                }
            }
        }
    }
}
