use crate::error::{Error, Result};

use super::{Shape, ShapeInference};

/// Axis permutation: output axis `i` is input axis `perm[i]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transpose {
    perm: Vec<usize>,
}

impl Transpose {
    pub fn new(perm: Vec<usize>) -> Self {
        Self { perm }
    }

    pub fn permutation(&self) -> &[usize] {
        &self.perm
    }

    pub fn rank(&self) -> usize {
        self.perm.len()
    }

    /// Whether `perm` is a bijection on `[0, rank)`
    pub fn is_valid(&self) -> bool {
        let mut seen = vec![false; self.perm.len()];
        for &axis in &self.perm {
            if axis >= seen.len() || seen[axis] {
                return false;
            }
            seen[axis] = true;
        }
        true
    }

    pub fn is_identity(&self) -> bool {
        is_identity(&self.perm)
    }

    /// Whether this only swaps the last two axes and keeps the rest in place
    pub fn swaps_last_two(&self) -> bool {
        let rank = self.perm.len();
        rank >= 2
            && is_identity(&self.perm[..rank - 2])
            && self.perm[rank - 2] == rank - 1
            && self.perm[rank - 1] == rank - 2
    }

    /// Permutation equivalent to applying `self` and then `next`
    pub fn then(&self, next: &Transpose) -> Vec<usize> {
        next.perm.iter().map(|&axis| self.perm[axis]).collect()
    }
}

fn is_identity(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, &axis)| i == axis)
}

impl ShapeInference for Transpose {
    fn infer_shape(&mut self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        let input = inputs[0];
        if input.len() != self.perm.len() {
            return Err(Error::ShapeMismatch(format!(
                "Transpose permutation {:?} does not match input rank {}",
                self.perm,
                input.len()
            )));
        }
        if !self.is_valid() {
            return Err(Error::InvalidOperator(format!(
                "Transpose permutation {:?} is not a permutation",
                self.perm
            )));
        }

        Ok(vec![self.perm.iter().map(|&axis| input[axis]).collect()])
    }
}
