use rand::Rng;
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    /// NB: an empty range returns its start
    fn gen_f64_range(range: Range<f64>) -> f64;
    /// NB: an empty range returns its start
    fn gen_usize_range(range: Range<usize>) -> usize;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_f64_range(range: Range<f64>) -> f64 {
        if range.is_empty() {
            return range.start;
        }
        rand::rng().random_range(range)
    }

    fn gen_usize_range(range: Range<usize>) -> usize {
        if range.is_empty() {
            return range.start;
        }
        rand::rng().random_range(range)
    }
}

/// Fisher-Yates shuffle driven by `R`
pub fn shuffle<R: Random, T>(items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = R::gen_usize_range(0..i + 1);
        items.swap(i, j);
    }
}
