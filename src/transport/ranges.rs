/// Received packet numbers, kept as disjoint inclusive ranges.
///
/// At most `MAX_RANGES` ranges are tracked. When a new gap would exceed that,
/// the oldest (lowest) range is forgotten. While the set is full, anything
/// below the lowest retained range is treated as already seen.
pub const MAX_RANGES: usize = 32;

#[derive(Debug, Default)]
pub struct PnRanges {
    /// Ascending, non-overlapping, non-adjacent `(first, last)` pairs.
    ranges: heapless::Vec<(u64, u64), MAX_RANGES>,
    /// Everything below this was dropped from tracking.
    floor: u64,
}

impl PnRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn largest(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.1)
    }

    /// Whether `pn` has been recorded, or is too old to tell.
    pub fn contains(&self, pn: u64) -> bool {
        if pn < self.floor {
            return true;
        }
        if self.ranges.is_full() && self.ranges.first().is_some_and(|&(lo, _)| pn < lo) {
            return true;
        }
        self.ranges.iter().any(|&(lo, hi)| lo <= pn && pn <= hi)
    }

    pub fn insert(&mut self, pn: u64) {
        if self.contains(pn) {
            return;
        }

        let idx = self.ranges.iter().position(|&(lo, _)| lo > pn).unwrap_or(self.ranges.len());

        let joins_prev = idx > 0 && self.ranges[idx - 1].1 + 1 == pn;
        let joins_next = idx < self.ranges.len() && pn + 1 == self.ranges[idx].0;

        match (joins_prev, joins_next) {
            (true, true) => {
                self.ranges[idx - 1].1 = self.ranges[idx].1;
                self.ranges.remove(idx);
            }
            (true, false) => self.ranges[idx - 1].1 = pn,
            (false, true) => self.ranges[idx].0 = pn,
            (false, false) => {
                if self.ranges.is_full() {
                    if idx == 0 {
                        return;
                    }
                    let (_, hi) = self.ranges.remove(0);
                    self.floor = hi + 1;
                    let _ = self.ranges.insert(idx - 1, (pn, pn));
                } else {
                    let _ = self.ranges.insert(idx, (pn, pn));
                }
            }
        }
    }

    /// Ranges from highest to lowest, as an ACK frame lists them.
    pub fn iter_desc(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().rev().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(r: &PnRanges) -> Vec<(u64, u64)> {
        r.iter_desc().collect()
    }

    #[test]
    fn merges_adjacent() {
        let mut r = PnRanges::new();
        for pn in [0, 1, 2, 5, 6, 4] {
            r.insert(pn);
        }
        assert_eq!(collect(&r), vec![(4, 6), (0, 2)]);
        r.insert(3);
        assert_eq!(collect(&r), vec![(0, 6)]);
        assert_eq!(r.largest(), Some(6));
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut r = PnRanges::new();
        r.insert(9);
        r.insert(9);
        assert!(r.contains(9));
        assert!(!r.contains(8));
        assert_eq!(collect(&r), vec![(9, 9)]);
    }

    #[test]
    fn drops_oldest_when_full() {
        let mut r = PnRanges::new();
        for i in 0..MAX_RANGES as u64 {
            r.insert(i * 2);
        }
        r.insert(1000);
        assert_eq!(collect(&r).len(), MAX_RANGES);
        // pn 0 was forgotten and is now below the floor
        assert!(r.contains(0));
        assert!(r.contains(1));
        assert!(r.contains(2));
        assert!(!r.contains(3));
        assert!(r.contains(1000));
    }

    #[test]
    fn old_packets_count_as_seen_while_full() {
        let mut r = PnRanges::new();
        for i in 0..MAX_RANGES as u64 {
            r.insert(10 + i * 2);
        }
        let before = collect(&r);

        // below every retained range, so a replay must not be accepted
        assert!(r.contains(3));
        r.insert(3);
        assert!(r.contains(3));
        assert!(r.contains(9));
        assert_eq!(collect(&r), before);

        // gaps inside the retained window are still unknown
        assert!(!r.contains(11));
    }
}
