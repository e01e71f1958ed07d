//! Freeze-quantity splitting.
//!
//! Exchanges reject single orders above the freeze quantity, so a large
//! quantity goes out as several sub-orders: as many full `limit`-sized
//! chunks as fit, then one remainder.

/// Split `quantity` into the fewest chunks no larger than `limit`.
///
/// A zero `limit` disables splitting. A zero `quantity` yields no chunks.
pub fn split_quantity(quantity: u32, limit: u32) -> Vec<u32> {
    if quantity == 0 {
        return Vec::new();
    }
    if limit == 0 || quantity <= limit {
        return vec![quantity];
    }
    let full = (quantity / limit) as usize;
    let rest = quantity % limit;
    let mut chunks = vec![limit; full];
    if rest > 0 {
        chunks.push(rest);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_limit_is_single_order() {
        assert_eq!(split_quantity(1800, 1800), vec![1800]);
        assert_eq!(split_quantity(75, 1800), vec![75]);
        assert_eq!(split_quantity(500, 0), vec![500]);
        assert!(split_quantity(0, 1800).is_empty());
    }

    #[test]
    fn remainder_goes_last() {
        assert_eq!(split_quantity(4000, 1800), vec![1800, 1800, 400]);
        assert_eq!(split_quantity(1200, 600), vec![600, 600]);
    }

    #[test]
    fn split_properties() {
        for limit in [25u32, 75, 600, 1800] {
            for qty in (1..=10_000u32).step_by(37) {
                let chunks = split_quantity(qty, limit);
                assert_eq!(chunks.iter().sum::<u32>(), qty);
                assert!(chunks.iter().all(|&c| c > 0 && c <= limit));
                assert_eq!(chunks.len() as u32, qty.div_ceil(limit));
                assert!(chunks.iter().filter(|&&c| c < limit).count() <= 1);
                if let Some(pos) = chunks.iter().position(|&c| c < limit) {
                    assert_eq!(pos, chunks.len() - 1);
                }
            }
        }
    }
}
