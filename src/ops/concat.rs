use crate::error::{Error, Result};

use super::{Shape, ShapeInference};

/// Concatenation of all inputs along one axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concat {
    axis: usize,
}

impl Concat {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }
}

impl ShapeInference for Concat {
    fn infer_shape(&mut self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        let first = inputs[0];
        if self.axis >= first.len() {
            return Err(Error::ShapeMismatch(format!(
                "Concat axis {} out of range for rank {}",
                self.axis,
                first.len()
            )));
        }

        let mut output = first.to_vec();
        for shape in &inputs[1..] {
            let compatible = shape.len() == first.len()
                && shape
                    .iter()
                    .zip(first.iter())
                    .enumerate()
                    .all(|(i, (a, b))| i == self.axis || a == b);
            if !compatible {
                return Err(Error::ShapeMismatch(format!(
                    "Concat input {:?} is incompatible with {:?} on axis {}",
                    shape, first, self.axis
                )));
            }
            output[self.axis] += shape[self.axis];
        }

        Ok(vec![output])
    }
}
