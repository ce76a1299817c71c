use strum_macros::{Display, EnumString};

use crate::error::Result;

use super::broadcast::infer_broadcast;
use super::{Shape, ShapeInference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Tanh,
    Abs,
}

/// Broadcasting binary arithmetic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementWise {
    op: BinaryOp,
}

impl ElementWise {
    pub fn new(op: BinaryOp) -> Self {
        Self { op }
    }

    pub fn op(&self) -> BinaryOp {
        self.op
    }
}

impl ShapeInference for ElementWise {
    fn infer_shape(&mut self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        Ok(vec![infer_broadcast(inputs[0], inputs[1])?])
    }
}

/// Shape-preserving unary activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unary {
    op: UnaryOp,
}

impl Unary {
    pub fn new(op: UnaryOp) -> Self {
        Self { op }
    }

    pub fn op(&self) -> UnaryOp {
        self.op
    }
}

impl ShapeInference for Unary {
    fn infer_shape(&mut self, inputs: &[&[usize]]) -> Result<Vec<Shape>> {
        Ok(vec![inputs[0].to_vec()])
    }
}
