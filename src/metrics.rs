/// Percentage (0..100) of samples whose predicted label differs from the
/// true one. Empty input has no error.
pub fn classification_error(predicted: &[f32], actual: &[f32]) -> f32 {
    if actual.is_empty() {
        return 0.0;
    }
    let wrong = predicted
        .iter()
        .zip(actual)
        .filter(|(p, a)| p.round() as i64 != a.round() as i64)
        .count();
    100.0 * wrong as f32 / actual.len() as f32
}

/// Mean squared residual for regression models.
pub fn mean_squared_error(predicted: &[f32], actual: &[f32]) -> f32 {
    if actual.is_empty() {
        return 0.0;
    }
    let sum: f64 = predicted
        .iter()
        .zip(actual)
        .map(|(&p, &a)| {
            let d = f64::from(p) - f64::from(a);
            d * d
        })
        .sum();
    (sum / actual.len() as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_error() {
        assert_eq!(classification_error(&[1.0, 0.0, 1.0, 1.0], &[1.0, 1.0, 1.0, 0.0]), 50.0);
        assert_eq!(classification_error(&[], &[]), 0.0);
    }

    #[test]
    fn test_mean_squared_error() {
        assert_eq!(mean_squared_error(&[1.0, 3.0], &[2.0, 1.0]), 2.5);
    }
}
