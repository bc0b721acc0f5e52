use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};

/// Returns whether `s1` is newer than `s2`, taking wrap-around into account: a number is
///  considered newer if it is less than half the number space ahead.
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    s1 != s2 && s1.wrapping_sub(s2) < 0x8000_0000
}

pub fn sequence_at_or_after(s1: u32, s2: u32) -> bool {
    s1 == s2 || sequence_greater_than(s1, s2)
}

/// A wrapping sequence counter that can be shared between tasks. There is one per channel,
///  reliability tier and direction.
#[derive(Default)]
pub struct SequenceNumber(AtomicU32);
impl SequenceNumber {
    pub fn new(initial: u32) -> SequenceNumber {
        SequenceNumber(AtomicU32::new(initial))
    }

    /// increments the counter, returning the new value
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u32) {
        self.0.store(value, Ordering::Release)
    }

    /// sets the counter to `new` if it still has the value `current`, returning the actual
    ///  previous value on failure
    pub fn compare_exchange(&self, current: u32, new: u32) -> Result<u32, u32> {
        self.0.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}
impl Debug for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case::simple(2, 1, true)]
    #[case::simple_less(1, 2, false)]
    #[case::equal(7, 7, false)]
    #[case::wrapped(0, u32::MAX, true)]
    #[case::wrapped_less(u32::MAX, 0, false)]
    #[case::far_ahead_is_older(0x8000_0001, 0, false)]
    #[case::just_below_half(0x7fff_ffff, 0, true)]
    fn test_sequence_greater_than(#[case] s1: u32, #[case] s2: u32, #[case] expected: bool) {
        assert_eq!(expected, sequence_greater_than(s1, s2));
    }

    #[rstest]
    #[case::equal(5, 5, true)]
    #[case::after(6, 5, true)]
    #[case::before(4, 5, false)]
    fn test_sequence_at_or_after(#[case] s1: u32, #[case] s2: u32, #[case] expected: bool) {
        assert_eq!(expected, sequence_at_or_after(s1, s2));
    }

    #[test]
    fn test_next_wraps() {
        let seq = SequenceNumber::new(u32::MAX - 1);
        assert_eq!(u32::MAX, seq.next());
        assert_eq!(0, seq.next());
        assert_eq!(1, seq.next());
        assert_eq!(1, seq.get());
    }

    #[test]
    fn test_compare_exchange() {
        let seq = SequenceNumber::new(3);
        assert_eq!(Err(3), seq.compare_exchange(2, 10));
        assert_eq!(Ok(3), seq.compare_exchange(3, 10));
        assert_eq!(10, seq.get());
    }

    #[test]
    fn test_concurrent_next_is_unique() {
        let seq = Arc::new(SequenceNumber::default());
        let handles = (0..4)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || (0..1000).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut all = handles.into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        all.sort();
        all.dedup();
        assert_eq!(4000, all.len());
        assert_eq!(4000, seq.get());
    }
}
