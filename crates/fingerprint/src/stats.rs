//! Anonymity-set statistics.

use common::artifacts::AnonSetStats;

/// Size-distribution statistics for a set of equivalence classes.
/// Mean/std follow population conventions (no Bessel correction); the
/// median of an even count is the truncated midpoint average; entropy is
/// Shannon entropy in nats over ln(N).
pub fn anon_stats(mask_len: usize, classes: &[Vec<u32>], n_users: usize) -> AnonSetStats {
    let sizes: Vec<u64> = classes.iter().map(|c| c.len() as u64).collect();
    let count = sizes.len();
    if count == 0 {
        return AnonSetStats {
            best_mask_size: mask_len,
            n_anon_sets: 0,
            max_anon_set_size: 0,
            mean_anon_set_size: 0.0,
            std_anon_set_size: 0.0,
            median_anon_set_size: 0,
            anon_set_entropy: 0.0,
        };
    }

    let total: u64 = sizes.iter().sum();
    let mean = total as f64 / count as f64;
    let variance = sizes
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count as f64;

    let mut sorted = sizes.clone();
    sorted.sort_unstable();
    let median = if count % 2 == 1 {
        sorted[count / 2]
    } else {
        ((sorted[count / 2 - 1] + sorted[count / 2]) as f64 / 2.0) as u64
    };

    AnonSetStats {
        best_mask_size: mask_len,
        n_anon_sets: count,
        max_anon_set_size: *sorted.last().unwrap_or(&0),
        mean_anon_set_size: mean,
        std_anon_set_size: variance.sqrt(),
        median_anon_set_size: median,
        anon_set_entropy: normalized_entropy(&sizes, n_users),
    }
}

/// Shannon entropy of the class-size distribution divided by ln(N).
/// 1.0 means fully separated singletons; 0.0 means one indistinct mass.
pub fn normalized_entropy(sizes: &[u64], n_users: usize) -> f64 {
    let total: u64 = sizes.iter().sum();
    if total == 0 || n_users <= 1 {
        return 0.0;
    }
    let entropy: f64 = sizes
        .iter()
        .filter(|&&s| s > 0)
        .map(|&s| {
            let p = s as f64 / total as f64;
            -p * p.ln()
        })
        .sum();
    entropy / (n_users as f64).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_have_unit_entropy() {
        let classes: Vec<Vec<u32>> = (0..8u32).map(|u| vec![u]).collect();
        let stats = anon_stats(3, &classes, 8);
        assert!((stats.anon_set_entropy - 1.0).abs() < 1e-12);
        assert_eq!(stats.max_anon_set_size, 1);
        assert_eq!(stats.n_anon_sets, 8);
    }

    #[test]
    fn test_single_mass_has_zero_entropy() {
        let stats = anon_stats(0, &[vec![0, 1, 2, 3]], 4);
        assert_eq!(stats.anon_set_entropy, 0.0);
        assert_eq!(stats.n_anon_sets, 1);
        assert_eq!(stats.median_anon_set_size, 4);
    }

    #[test]
    fn test_moments() {
        let classes = vec![vec![0], vec![1, 2], vec![3, 4, 5], vec![6, 7, 8, 9]];
        let stats = anon_stats(2, &classes, 10);
        assert_eq!(stats.mean_anon_set_size, 2.5);
        assert_eq!(stats.max_anon_set_size, 4);
        // Even count: truncated midpoint of (2, 3).
        assert_eq!(stats.median_anon_set_size, 2);
        let expected_std = (1.25f64).sqrt();
        assert!((stats.std_anon_set_size - expected_std).abs() < 1e-12);
    }

    #[test]
    fn test_empty_classes() {
        let stats = anon_stats(0, &[], 0);
        assert_eq!(stats.n_anon_sets, 0);
        assert_eq!(stats.anon_set_entropy, 0.0);
    }
}
