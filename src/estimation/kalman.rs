// One-dimensional Kalman filter fusing a commanded displacement (process) with a
// noisy position reading (measurement).

/// Scalar Kalman filter with identity state transition
#[derive(Debug, Clone, Copy)]
pub struct KalmanFilter1D {
    x_est: f32,
    p: f32,
    q: f32,
    r: f32,
}

impl KalmanFilter1D {
    pub fn new() -> Self {
        Self {
            x_est: 0.0,
            p: 1.0,
            q: 0.1,
            r: 1.0,
        }
    }

    /// Set measurement variance `r`, process variance `q`, and reset the state to `initial`
    pub fn init(&mut self, r: f32, q: f32, initial: f32) {
        self.r = r;
        self.q = q;
        self.reset_state(initial);
    }

    /// Reset the estimate without touching the noise parameters
    pub fn reset_state(&mut self, value: f32) {
        self.x_est = value;
        self.p = 1.0;
    }

    /// Time update: apply the commanded displacement, uncertainty grows by Q
    pub fn predict(&mut self, control_movement: f32) {
        self.x_est += control_movement;
        self.p += self.q;
    }

    /// Measurement update, returns the corrected estimate
    pub fn update(&mut self, measurement: f32) -> f32 {
        let k = self.p / (self.p + self.r);
        self.x_est += k * (measurement - self.x_est);
        self.p *= 1.0 - k;
        self.x_est
    }

    pub fn estimate(&self) -> f32 {
        self.x_est
    }

    pub fn uncertainty(&self) -> f32 {
        self.p
    }
}

impl Default for KalmanFilter1D {
    fn default() -> Self {
        Self::new()
    }
}
