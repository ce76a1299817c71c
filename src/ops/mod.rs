pub mod broadcast;
pub mod concat;
pub mod element_wise;
pub mod matmul;
pub mod transpose;

use std::fmt;

use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

pub use broadcast::infer_broadcast;
pub use concat::Concat;
pub use element_wise::{BinaryOp, ElementWise, Unary, UnaryOp};
pub use matmul::MatMul;
pub use transpose::Transpose;

/// Shape of a tensor
pub type Shape = Vec<usize>;

/// Output shape rule of one operator kind.
///
/// An `Err` means the inputs are shape-incompatible; it is a recoverable
/// outcome for the caller, not a broken graph.
pub trait ShapeInference {
    /// Infer output shapes from input shapes, refreshing any cached attributes
    fn infer_shape(&mut self, inputs: &[&[usize]]) -> Result<Vec<Shape>>;
}

/// Plain tag of an operator kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum OpType {
    MatMul,
    Transpose,
    Add,
    Sub,
    Mul,
    Div,
    Relu,
    Sigmoid,
    Tanh,
    Abs,
    Concat,
}

/// Operator kind together with its kind-specific attributes
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    MatMul(MatMul),
    Transpose(Transpose),
    ElementWise(ElementWise),
    Unary(Unary),
    Concat(Concat),
}

impl OpKind {
    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::MatMul(_) => OpType::MatMul,
            OpKind::Transpose(_) => OpType::Transpose,
            OpKind::ElementWise(e) => match e.op() {
                BinaryOp::Add => OpType::Add,
                BinaryOp::Sub => OpType::Sub,
                BinaryOp::Mul => OpType::Mul,
                BinaryOp::Div => OpType::Div,
            },
            OpKind::Unary(u) => match u.op() {
                UnaryOp::Relu => OpType::Relu,
                UnaryOp::Sigmoid => OpType::Sigmoid,
                UnaryOp::Tanh => OpType::Tanh,
                UnaryOp::Abs => OpType::Abs,
            },
            OpKind::Concat(_) => OpType::Concat,
        }
    }

    /// Exact number of inputs, or `None` for variadic kinds
    pub fn num_inputs(&self) -> Option<usize> {
        match self {
            OpKind::MatMul(_) | OpKind::ElementWise(_) => Some(2),
            OpKind::Transpose(_) | OpKind::Unary(_) => Some(1),
            OpKind::Concat(_) => None,
        }
    }

    pub fn num_outputs(&self) -> usize {
        1
    }

    pub fn as_matmul(&self) -> Option<&MatMul> {
        match self {
            OpKind::MatMul(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_matmul_mut(&mut self) -> Option<&mut MatMul> {
        match self {
            OpKind::MatMul(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_transpose(&self) -> Option<&Transpose> {
        match self {
            OpKind::Transpose(t) => Some(t),
            _ => None,
        }
    }
}

impl ShapeInference for OpKind {
    fn infer_shape(&mut self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        match self.num_inputs() {
            Some(expected) if expected != inputs.len() => {
                return Err(Error::InvalidOperator(format!(
                    "{} requires {} inputs, got {}",
                    self.op_type(),
                    expected,
                    inputs.len()
                )));
            }
            None if inputs.is_empty() => {
                return Err(Error::InvalidOperator(format!(
                    "{} requires at least one input",
                    self.op_type()
                )));
            }
            _ => {}
        }

        match self {
            OpKind::MatMul(op) => op.infer_shape(inputs),
            OpKind::Transpose(op) => op.infer_shape(inputs),
            OpKind::ElementWise(op) => op.infer_shape(inputs),
            OpKind::Unary(op) => op.infer_shape(inputs),
            OpKind::Concat(op) => op.infer_shape(inputs),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::MatMul(op) => write!(f, "{}", op),
            OpKind::Transpose(op) => write!(f, "Transpose(perm={:?})", op.permutation()),
            OpKind::Concat(op) => write!(f, "Concat(axis={})", op.axis()),
            other => write!(f, "{}", other.op_type()),
        }
    }
}

impl From<MatMul> for OpKind {
    fn from(op: MatMul) -> Self {
        OpKind::MatMul(op)
    }
}

impl From<Transpose> for OpKind {
    fn from(op: Transpose) -> Self {
        OpKind::Transpose(op)
    }
}

impl From<ElementWise> for OpKind {
    fn from(op: ElementWise) -> Self {
        OpKind::ElementWise(op)
    }
}

impl From<Unary> for OpKind {
    fn from(op: Unary) -> Self {
        OpKind::Unary(op)
    }
}

impl From<Concat> for OpKind {
    fn from(op: Concat) -> Self {
        OpKind::Concat(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_is_checked() {
        let mut kind = OpKind::from(MatMul::new(false, false));
        let a = [2usize, 3];
        assert!(matches!(
            kind.infer_shape(&[&a]),
            Err(Error::InvalidOperator(_))
        ));

        let mut concat = OpKind::from(Concat::new(0));
        assert!(concat.infer_shape(&[]).is_err());
    }

    #[test]
    fn test_op_type_names() {
        assert_eq!(OpKind::from(ElementWise::new(BinaryOp::Mul)).op_type(), OpType::Mul);
        assert_eq!(OpKind::from(Unary::new(UnaryOp::Relu)).to_string(), "Relu");
        assert_eq!("Transpose".parse::<OpType>().unwrap(), OpType::Transpose);
    }
}
