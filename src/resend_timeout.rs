use std::time::Duration;

const MAX_BACKOFF_FACTOR: u32 = 64;

/// Round trip time based resend timeout: `srtt + 4 * rttvar` with smoothing factors 1/8 and 1/4,
///  clamped to configured bounds and doubled for every timeout-triggered resend until the next
///  valid sample.
///
/// Samples must only be taken from datagrams that were not retransmitted (Karn's algorithm) - the
///  caller is responsible for that.
pub struct ResendTimeout {
    srtt: Option<Duration>,
    rttvar: Duration,
    backoff_factor: u32,

    initial: Duration,
    min: Duration,
    max: Duration,
}

impl ResendTimeout {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> ResendTimeout {
        ResendTimeout {
            srtt: None,
            rttvar: Duration::ZERO,
            backoff_factor: 1,
            initial,
            min,
            max,
        }
    }

    pub fn on_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar * 3 / 4 + delta / 4;
                self.srtt = Some(srtt * 7 / 8 + rtt / 8);
            }
        }
        self.backoff_factor = 1;
    }

    pub fn on_timeout(&mut self) {
        self.backoff_factor = (self.backoff_factor * 2).min(MAX_BACKOFF_FACTOR);
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn current(&self) -> Duration {
        let base = match self.srtt {
            None => self.initial,
            Some(srtt) => srtt + self.rttvar * 4,
        };
        base.clamp(self.min, self.max)
            .saturating_mul(self.backoff_factor)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn timeout() -> ResendTimeout {
        ResendTimeout::new(Duration::from_millis(500), Duration::from_millis(100), Duration::from_secs(5))
    }

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[rstest]
    #[case::initial(vec![], 0, millis(500))]
    #[case::initial_backoff(vec![], 2, millis(2000))]
    #[case::first_sample(vec![100], 0, millis(300))]
    #[case::second_sample(vec![100, 200], 0, Duration::from_micros(362_500))]
    #[case::clamped_min(vec![1], 0, millis(100))]
    #[case::clamped_max(vec![3000], 0, millis(5000))]
    #[case::backoff(vec![100], 1, millis(600))]
    #[case::backoff_clamped(vec![100], 6, millis(5000))]
    fn test_current(#[case] samples: Vec<u64>, #[case] num_timeouts: usize, #[case] expected: Duration) {
        let mut timeout = timeout();
        for sample in samples {
            timeout.on_sample(millis(sample));
        }
        for _ in 0..num_timeouts {
            timeout.on_timeout();
        }
        assert_eq!(timeout.current(), expected);
    }

    #[test]
    fn test_sample_resets_backoff() {
        let mut timeout = timeout();
        timeout.on_timeout();
        timeout.on_timeout();
        assert_eq!(timeout.current(), millis(2000));

        timeout.on_sample(millis(100));
        assert_eq!(timeout.current(), millis(300));
        assert_eq!(timeout.smoothed_rtt(), Some(millis(100)));
    }
}
