use rand::{Rng, RngCore};
use std::ops::Range;
use std::time::Duration;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    fn next_u32() -> u32;
    fn gen_u64_range(range: Range<u64>) -> u64;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::rng().next_u32()
    }

    fn gen_u64_range(range: Range<u64>) -> u64 {
        rand::rng().random_range(range)
    }
}

/// Uniformly distributed delay in `[0, max]`, with millisecond granularity
pub fn jittered_delay<R: Random>(max: Duration) -> Duration {
    let max_millis = max.as_millis().min(u64::MAX as u128 - 1) as u64;
    if max_millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(R::gen_u64_range(0..max_millis + 1))
}
