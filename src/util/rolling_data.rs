use std::time::Duration;

/// The rolling average of the `N` most recent round trip samples. It is seeded with an initial
///  estimate, which is evicted like any other sample once `N` real samples have arrived.
pub struct RollingData<const N: usize> {
    samples: [Duration; N],
    len: usize,
    next: usize,
    sum: Duration,
}
impl<const N: usize> RollingData<N> {
    pub fn new(seed: Duration) -> Self {
        assert!(N > 0);
        let mut result = RollingData {
            samples: [Duration::ZERO; N],
            len: 0,
            next: 0,
            sum: Duration::ZERO,
        };
        result.add_sample(seed);
        result
    }

    pub fn add_sample(&mut self, sample: Duration) {
        if self.len == N {
            self.sum -= self.samples[self.next];
        }
        else {
            self.len += 1;
        }
        self.samples[self.next] = sample;
        self.sum += sample;
        self.next = (self.next + 1) % N;
    }

    pub fn mean(&self) -> Duration {
        self.sum / self.len as u32
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[rstest]
    #[case::seed_only(vec![], 10)]
    #[case::growing(vec![20], 15)]
    #[case::full(vec![20, 30, 40], 25)]
    #[case::evicting_seed(vec![20, 30, 40, 50], 35)]
    #[case::wrapped_twice(vec![1, 1, 1, 1, 1, 1, 1, 1, 1], 1)]
    fn test_mean(#[case] samples: Vec<u64>, #[case] expected_millis: u64) {
        let mut data = RollingData::<4>::new(ms(10));
        for s in samples {
            data.add_sample(ms(s));
        }
        assert_eq!(data.mean(), ms(expected_millis));
    }

    #[test]
    fn test_len_is_bounded() {
        let mut data = RollingData::<3>::new(Duration::ZERO);
        for i in 0..10 {
            data.add_sample(ms(i));
        }
        assert_eq!(3, data.len());
        assert_eq!(data.mean(), ms(8));
    }
}
