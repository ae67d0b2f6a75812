// Online max-hold and running-average traces
//
// Both traces treat a change in frame length as a new channel layout: the
// stored trace is replaced by the incoming frame rather than merged.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningTraces {
    max_hold: Vec<f64>,
    average: Vec<f64>,
    average_count: u64,
}

impl RunningTraces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elementwise running maximum
    pub fn update_max_hold(&mut self, values: &[f64]) {
        if self.max_hold.len() != values.len() {
            self.max_hold = values.to_vec();
            return;
        }

        for (stored, &incoming) in self.max_hold.iter_mut().zip(values) {
            if !incoming.is_finite() {
                continue;
            }
            if !stored.is_finite() || incoming > *stored {
                *stored = incoming;
            }
        }
    }

    /// Cumulative mean, updated incrementally
    pub fn update_average(&mut self, values: &[f64]) {
        if self.average.len() != values.len() {
            self.average = values.to_vec();
            self.average_count = 1;
            return;
        }

        self.average_count += 1;
        let count = self.average_count as f64;

        for (mean, &incoming) in self.average.iter_mut().zip(values) {
            if !incoming.is_finite() {
                continue;
            }
            if mean.is_finite() {
                *mean += (incoming - *mean) / count;
            } else {
                *mean = incoming;
            }
        }
    }

    pub fn reset_max_hold(&mut self) {
        self.max_hold.clear();
    }

    pub fn reset_average(&mut self) {
        self.average.clear();
        self.average_count = 0;
    }

    /// Copy of the max-hold trace
    pub fn max_hold(&self) -> Vec<f64> {
        self.max_hold.clone()
    }

    /// Copy of the running-average trace
    pub fn average(&self) -> Vec<f64> {
        self.average.clone()
    }

    pub fn average_count(&self) -> u64 {
        self.average_count
    }
}
