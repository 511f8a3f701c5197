//! Property-based tests for the nearest-point search and rollup averaging.

use feedstore::fiwa::writer::rollup_average;
use feedstore::kv::nearest_index;
use proptest::prelude::*;

/// Strategy for sorted sample times, duplicates allowed.
fn sorted_times() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(-1_000_000i64..1_000_000, 1..200).prop_map(|mut times| {
        times.sort_unstable();
        times
    })
}

/// Strategy for slot values with roughly one in four missing.
fn slot_values() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(
        prop_oneof![3 => (-1000.0f32..1000.0), 1 => Just(f32::NAN)],
        0..64,
    )
}

proptest! {
    /// The result is a global nearest-time minimum; ties go to the later time.
    #[test]
    fn test_nearest_is_global_minimum(times in sorted_times(), target in -1_100_000i64..1_100_000) {
        let index = nearest_index(&times, target, |t| *t).unwrap();
        let best = (times[index] - target).abs();

        for time in &times {
            let distance = (time - target).abs();
            prop_assert!(best <= distance);
            if distance == best {
                prop_assert!(*time <= times[index]);
            }
        }
    }

    /// Exact matches are always found.
    #[test]
    fn test_nearest_exact_match(times in sorted_times(), pick in any::<prop::sample::Index>()) {
        let target = times[pick.index(times.len())];
        let index = nearest_index(&times, target, |t| *t).unwrap();
        prop_assert_eq!(times[index], target);
    }

    /// Rollup skips missing slots and is missing only when every slot is.
    #[test]
    fn test_rollup_average_ignores_nan(values in slot_values()) {
        let present: Vec<f64> = values
            .iter()
            .filter(|v| !v.is_nan())
            .map(|v| f64::from(*v))
            .collect();
        let average = rollup_average(&values);

        if present.is_empty() {
            prop_assert!(average.is_nan());
        } else {
            let expected = present.iter().sum::<f64>() / present.len() as f64;
            prop_assert!((average - expected).abs() < 1e-9);
            let min = present.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = present.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(average >= min - 1e-9 && average <= max + 1e-9);
        }
    }
}
