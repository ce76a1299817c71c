use crate::error::{Error, Result};

use super::Shape;

/// Two-operand broadcast of `a` and `b`, aligned at the trailing axis.
///
/// Each axis pair must be equal or contain a 1.
pub fn infer_broadcast(a: &[usize], b: &[usize]) -> Result<Shape> {
    let rank = std::cmp::max(a.len(), b.len());
    let mut padded_a = vec![1; rank];
    let mut padded_b = vec![1; rank];
    padded_a[rank - a.len()..].copy_from_slice(a);
    padded_b[rank - b.len()..].copy_from_slice(b);

    let mut result = Vec::with_capacity(rank);
    for (&dim_a, &dim_b) in padded_a.iter().zip(padded_b.iter()) {
        if dim_a == dim_b || dim_b == 1 {
            result.push(dim_a);
        } else if dim_a == 1 {
            result.push(dim_b);
        } else {
            return Err(Error::ShapeMismatch(format!(
                "cannot broadcast {:?} with {:?}: axis {} vs {}",
                a, b, dim_a, dim_b
            )));
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast() {
        assert_eq!(infer_broadcast(&[2, 1, 4], &[3, 1]).unwrap(), vec![2, 3, 4]);
        assert_eq!(infer_broadcast(&[5], &[]).unwrap(), vec![5]);
        assert_eq!(infer_broadcast(&[], &[]).unwrap(), Vec::<usize>::new());
        assert_eq!(infer_broadcast(&[1, 0], &[7, 1]).unwrap(), vec![7, 0]);
    }

    #[test]
    fn test_broadcast_mismatch() {
        assert!(matches!(
            infer_broadcast(&[2, 3], &[4, 3]),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
