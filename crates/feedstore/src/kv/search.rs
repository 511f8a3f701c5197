//! Nearest-point search over a time-ordered sample window.

/// Returns the index of the sample nearest to `target`.
///
/// `window` must be sorted by `time_of`. Targets outside the window clamp to
/// the first or last sample. Equidistant neighbours resolve to the later
/// sample. Returns `None` only for an empty window.
///
/// # Example
///
/// ```rust
/// use feedstore::kv::nearest_index;
///
/// let times = [10i64, 20, 30];
/// assert_eq!(nearest_index(&times, 17, |t| *t), Some(1));
/// assert_eq!(nearest_index(&times, 25, |t| *t), Some(2));
/// assert_eq!(nearest_index(&times, 99, |t| *t), Some(2));
/// ```
pub fn nearest_index<T, F>(window: &[T], target: i64, time_of: F) -> Option<usize>
where
    F: Fn(&T) -> i64,
{
    let last = window.len().checked_sub(1)?;
    if target <= time_of(&window[0]) {
        return Some(0);
    }
    if target >= time_of(&window[last]) {
        return Some(last);
    }

    // first sample strictly after target; 1..=last given the clamps above
    let next = window.partition_point(|item| time_of(item) <= target);
    let prev = next - 1;
    let prev_distance = target - time_of(&window[prev]);
    let next_distance = time_of(&window[next]) - target;
    if prev_distance < next_distance {
        Some(prev)
    } else {
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(times: &[i64], target: i64) -> Option<usize> {
        nearest_index(times, target, |t| *t)
    }

    #[test]
    fn test_empty_window() {
        assert_eq!(search(&[], 5), None);
    }

    #[test]
    fn test_single_sample() {
        assert_eq!(search(&[10], 0), Some(0));
        assert_eq!(search(&[10], 10), Some(0));
        assert_eq!(search(&[10], 99), Some(0));
    }

    #[test]
    fn test_clamps_to_boundaries() {
        let times = [10, 20, 30];
        assert_eq!(search(&times, 10), Some(0));
        assert_eq!(search(&times, -5), Some(0));
        assert_eq!(search(&times, 30), Some(2));
        assert_eq!(search(&times, 31), Some(2));
    }

    #[test]
    fn test_exact_match() {
        assert_eq!(search(&[10, 20, 30, 40], 20), Some(1));
        assert_eq!(search(&[10, 20, 30, 40], 30), Some(2));
    }

    #[test]
    fn test_nearest_neighbour() {
        let times = [10, 20, 30];
        assert_eq!(search(&times, 17), Some(1));
        assert_eq!(search(&times, 13), Some(0));
        assert_eq!(search(&times, 24), Some(1));
    }

    #[test]
    fn test_tie_prefers_later() {
        assert_eq!(search(&[10, 20, 30], 25), Some(2));
        assert_eq!(search(&[10, 20, 30], 15), Some(1));
    }

    #[test]
    fn test_duplicate_times() {
        assert_eq!(search(&[10, 20, 20, 30], 21), Some(2));
    }
}
