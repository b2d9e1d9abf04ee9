// Copyright 2024 ShaleFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Windowed-maximum estimate of lock grant latency. Grows immediately on a
/// slow observation, decays as old bins rotate out of the window.
#[derive(Debug, Clone)]
pub struct AdaptiveEstimate {
    bins: [u64; Self::BINS],
    bin_start: u64,
    current: u64,
    samples: u64,
}

impl AdaptiveEstimate {
    const BINS: usize = 4;
    /// Seconds each bin covers.
    const BIN_SECS: u64 = 150;

    pub fn new() -> Self {
        Self {
            bins: [0; Self::BINS],
            bin_start: 0,
            current: 0,
            samples: 0,
        }
    }

    /// Feed one observed grant delay, in whole seconds, stamped `now`.
    pub fn measured(&mut self, now: u64, delay_secs: u64) {
        self.rotate(now);
        self.samples += 1;
        if delay_secs > self.bins[0] {
            self.bins[0] = delay_secs;
        }
        if delay_secs > self.current {
            self.current = delay_secs;
        } else {
            self.current = self.bins.iter().copied().max().unwrap_or(0);
        }
    }

    /// Current estimate in whole seconds; zero until the first sample.
    pub fn estimate(&self) -> u64 {
        self.current
    }

    /// Observations recorded so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    fn rotate(&mut self, now: u64) {
        if self.bin_start == 0 {
            self.bin_start = now;
            return;
        }
        let elapsed_bins = (now.saturating_sub(self.bin_start) / Self::BIN_SECS) as usize;
        if elapsed_bins == 0 {
            return;
        }
        if elapsed_bins >= Self::BINS {
            self.bins = [0; Self::BINS];
        } else {
            self.bins.rotate_right(elapsed_bins);
            for slot in self.bins.iter_mut().take(elapsed_bins) {
                *slot = 0;
            }
        }
        self.bin_start = now;
        self.current = self.bins.iter().copied().max().unwrap_or(0);
    }
}

impl Default for AdaptiveEstimate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero() {
        let at = AdaptiveEstimate::new();
        assert_eq!(at.estimate(), 0);
        assert_eq!(at.samples(), 0);
    }

    #[test]
    fn test_grows_immediately() {
        let mut at = AdaptiveEstimate::new();
        at.measured(1000, 2);
        assert_eq!(at.estimate(), 2);
        at.measured(1001, 9);
        assert_eq!(at.estimate(), 9);
        // A faster sample does not shrink the window maximum.
        at.measured(1002, 1);
        assert_eq!(at.estimate(), 9);
        assert_eq!(at.samples(), 3);
    }

    #[test]
    fn test_decays_after_window() {
        let mut at = AdaptiveEstimate::new();
        at.measured(1000, 30);
        assert_eq!(at.estimate(), 30);
        // Whole window elapses with one small sample: the spike ages out.
        at.measured(1000 + AdaptiveEstimate::BIN_SECS * AdaptiveEstimate::BINS as u64, 3);
        assert_eq!(at.estimate(), 3);
    }

    #[test]
    fn test_partial_rotation_keeps_recent_max() {
        let mut at = AdaptiveEstimate::new();
        at.measured(1000, 10);
        at.measured(1000 + AdaptiveEstimate::BIN_SECS, 4);
        // One bin rotated; the 10s sample is still inside the window.
        assert_eq!(at.estimate(), 10);
    }
}
