use std::fmt;

use crate::error::{Error, Result};

use super::broadcast::infer_broadcast;
use super::{Shape, ShapeInference};

/// Batched matrix multiplication `C = op(A) x op(B)` where `op` optionally
/// swaps the last two axes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatMul {
    trans_a: bool,
    trans_b: bool,
    // Cached by shape inference
    m: usize,
    n: usize,
    k: usize,
}

impl MatMul {
    pub fn new(trans_a: bool, trans_b: bool) -> Self {
        Self {
            trans_a,
            trans_b,
            ..Self::default()
        }
    }

    pub fn trans_a(&self) -> bool {
        self.trans_a
    }

    pub fn trans_b(&self) -> bool {
        self.trans_b
    }

    pub fn set_trans_a(&mut self, trans_a: bool) {
        self.trans_a = trans_a;
    }

    pub fn set_trans_b(&mut self, trans_b: bool) {
        self.trans_b = trans_b;
    }

    /// `(m, n, k)` from the last successful shape inference
    pub fn mnk(&self) -> (usize, usize, usize) {
        (self.m, self.n, self.k)
    }
}

impl ShapeInference for MatMul {
    fn infer_shape(&mut self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        let (a_shape, b_shape) = (inputs[0], inputs[1]);
        let a_rank = a_shape.len();
        let b_rank = b_shape.len();

        if a_rank < 2 || b_rank < 2 {
            return Err(Error::ShapeMismatch(format!(
                "MatMul inputs must have at least rank 2, got {} and {}",
                a_rank, b_rank
            )));
        }

        let mut a_dims = a_shape.to_vec();
        let mut b_dims = b_shape.to_vec();
        if self.trans_a {
            a_dims.swap(a_rank - 1, a_rank - 2);
        }
        if self.trans_b {
            b_dims.swap(b_rank - 1, b_rank - 2);
        }

        if a_dims[a_rank - 1] != b_dims[b_rank - 2] {
            return Err(Error::ShapeMismatch(format!(
                "incompatible matrix dimensions for MatMul: {}x{} and {}x{}",
                a_dims[a_rank - 2],
                a_dims[a_rank - 1],
                b_dims[b_rank - 2],
                b_dims[b_rank - 1]
            )));
        }

        let mut output_shape = infer_broadcast(&a_dims[..a_rank - 2], &b_dims[..b_rank - 2])?;

        self.m = a_dims[a_rank - 2];
        self.k = a_dims[a_rank - 1];
        self.n = b_dims[b_rank - 1];
        output_shape.push(self.m);
        output_shape.push(self.n);

        Ok(vec![output_shape])
    }
}

impl fmt::Display for MatMul {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MatMul([{},{}], mnk=[{},{},{}])",
            if self.trans_a { "A^T" } else { "A" },
            if self.trans_b { "B^T" } else { "B" },
            self.m,
            self.n,
            self.k
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infer(op: &mut MatMul, a: &[usize], b: &[usize]) -> Result<Shape> {
        op.infer_shape(&[a, b]).map(|mut shapes| shapes.remove(0))
    }

    #[test]
    fn test_batched_with_broadcast() {
        let mut op = MatMul::new(false, false);
        assert_eq!(infer(&mut op, &[2, 3, 4], &[4, 5]).unwrap(), vec![2, 3, 5]);
        assert_eq!(op.mnk(), (3, 5, 4));
    }

    #[test]
    fn test_batch_axes_broadcast_both_ways() {
        let mut op = MatMul::new(false, false);
        assert_eq!(
            infer(&mut op, &[1, 6, 3, 4], &[5, 1, 4, 2]).unwrap(),
            vec![5, 6, 3, 2]
        );
        assert!(infer(&mut op, &[2, 3, 4], &[3, 4, 5]).is_err());
    }

    #[test]
    fn test_inner_dimension_mismatch() {
        let mut op = MatMul::new(false, false);
        assert!(matches!(
            infer(&mut op, &[3, 4], &[5, 6]),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_rank_below_two_fails() {
        let mut op = MatMul::new(false, false);
        assert!(infer(&mut op, &[4], &[4, 5]).is_err());
        assert!(infer(&mut op, &[3, 4], &[4]).is_err());
    }

    #[test]
    fn test_transpose_flags() {
        let mut op = MatMul::new(true, false);
        assert_eq!(infer(&mut op, &[4, 3], &[4, 5]).unwrap(), vec![3, 5]);

        let mut op = MatMul::new(false, true);
        assert_eq!(infer(&mut op, &[2, 3, 4], &[2, 5, 4]).unwrap(), vec![2, 3, 5]);
        assert_eq!(op.mnk(), (3, 5, 4));

        let mut op = MatMul::new(true, true);
        assert_eq!(infer(&mut op, &[4, 3], &[5, 4]).unwrap(), vec![3, 5]);
    }

    #[test]
    fn test_display() {
        let mut op = MatMul::new(false, true);
        infer(&mut op, &[3, 4], &[5, 4]).unwrap();
        assert_eq!(op.to_string(), "MatMul([A,B^T], mnk=[3,5,4])");
    }
}
