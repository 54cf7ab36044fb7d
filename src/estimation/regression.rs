// Streaming least-squares line fit.
//
// Sums are kept in 64-bit integers so that adding thousands of (PWM, mV) points
// never loses precision; the division happens once, in f64, in `compute`.

/// Result of a line fit `y = slope * x + offset`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f32,
    pub offset: f32,
    /// Root mean square of the residuals
    pub error_std: f32,
}

impl LineFit {
    pub fn predict(&self, x: f32) -> f32 {
        self.slope * x + self.offset
    }
}

#[derive(Debug, Clone, Default)]
pub struct FastRegression {
    n: i64,
    sum_x: i64,
    sum_y: i64,
    sum_x_sq: i64,
    sum_y_sq: i64,
    sum_xy: i64,
}

impl FastRegression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Accumulate one point, O(1)
    pub fn add_point(&mut self, x: u16, y: i32) {
        let (x, y) = (x as i64, y as i64);
        self.n += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_x_sq += x * x;
        self.sum_y_sq += y * y;
        self.sum_xy += x * y;
    }

    pub fn len(&self) -> usize {
        self.n as usize
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Fit the accumulated points.
    ///
    /// Returns `None` with fewer than two points or when every x is identical.
    pub fn compute(&self) -> Option<LineFit> {
        if self.n < 2 {
            return None;
        }

        let denom = self.n * self.sum_x_sq - self.sum_x * self.sum_x;
        if denom == 0 {
            return None;
        }

        let n = self.n as f64;
        let slope = (self.n * self.sum_xy - self.sum_x * self.sum_y) as f64 / denom as f64;
        let offset = (self.sum_y as f64 - slope * self.sum_x as f64) / n;

        let sse = (self.sum_y_sq as f64 - offset * self.sum_y as f64 - slope * self.sum_xy as f64)
            .max(0.0);

        Some(LineFit {
            slope: slope as f32,
            offset: offset as f32,
            error_std: (sse / n).sqrt() as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_exact_line() {
        let mut reg = FastRegression::new();
        for x in [1u16, 4, 7, 20, 33] {
            reg.add_point(x, 2 * x as i32 + 3);
        }
        let fit = reg.compute().expect("fit");
        assert_abs_diff_eq!(fit.slope, 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(fit.offset, 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.error_std, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_not_enough_points() {
        let mut reg = FastRegression::new();
        assert!(reg.compute().is_none());
        reg.add_point(10, 100);
        assert!(reg.compute().is_none());
    }

    #[test]
    fn test_identical_x_is_degenerate() {
        let mut reg = FastRegression::new();
        for y in [100, 105, 98, 110] {
            reg.add_point(307, y);
        }
        assert!(reg.compute().is_none());
    }

    #[test]
    fn test_error_std_of_noisy_points() {
        let mut reg = FastRegression::new();
        let points = [(0u16, 2), (1, -1), (2, 4), (3, 1)];
        for (x, y) in points {
            reg.add_point(x, y);
        }
        let fit = reg.compute().expect("fit");
        assert_abs_diff_eq!(fit.slope, 0.2, epsilon = 1e-5);
        assert_abs_diff_eq!(fit.offset, 1.2, epsilon = 1e-5);
        assert!(fit.error_std > 1.0 && fit.error_std < 2.0);
    }

    #[test]
    fn test_realistic_servo_sweep_does_not_overflow() {
        // 4096 PWM values against millivolt readings
        let mut reg = FastRegression::new();
        for x in 0..4096u16 {
            reg.add_point(x, 200 + (x as i32 * 7));
        }
        let fit = reg.compute().expect("fit");
        assert_abs_diff_eq!(fit.slope, 7.0, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.predict(1000.0), 7200.0, epsilon = 0.5);
    }

    #[test]
    fn test_reset_clears_points() {
        let mut reg = FastRegression::new();
        reg.add_point(1, 1);
        reg.add_point(2, 2);
        reg.reset();
        assert!(reg.is_empty());
        assert!(reg.compute().is_none());
    }
}
