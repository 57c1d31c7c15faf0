//! Poll ordering across labeled queues.

use parking_lot::Mutex;

/// Decides which label each receive cycle polls first.
///
/// Labels are held in descending weight order. In strict mode every cycle
/// walks them in that order. In fair mode a smooth weighted round-robin picks
/// the leader of each cycle and the rest follow in weight order, so over any
/// `sum(weights)` consecutive cycles each label leads exactly `weight` times.
pub struct PollPlanner {
    weights: Vec<i64>,
    fair: bool,
    current: Mutex<Vec<i64>>,
}

impl PollPlanner {
    /// `weights` must already be sorted in descending order.
    pub fn new(weights: Vec<u32>, fair: bool) -> Self {
        let weights: Vec<i64> = weights.into_iter().map(|w| i64::from(w.max(1))).collect();
        let current = Mutex::new(vec![0; weights.len()]);
        PollPlanner {
            weights,
            fair,
            current,
        }
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Indices to poll this cycle, in order.
    pub fn next_cycle(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.weights.len()).collect();
        if !self.fair || self.weights.len() < 2 {
            return order;
        }

        let leader = self.next_leader();
        order.remove(leader);
        order.insert(0, leader);
        order
    }

    fn next_leader(&self) -> usize {
        let total: i64 = self.weights.iter().sum();
        let mut current = self.current.lock();

        let mut best = 0;
        for (i, weight) in self.weights.iter().enumerate() {
            current[i] += weight;
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strict_order_is_fixed() {
        let planner = PollPlanner::new(vec![10, 5, 1], false);
        for _ in 0..5 {
            assert_eq!(planner.next_cycle(), vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_fair_ten_to_one() {
        let planner = PollPlanner::new(vec![10, 1], true);
        let leaders: Vec<usize> = (0..11).map(|_| planner.next_cycle()[0]).collect();

        assert_eq!(leaders.iter().filter(|&&l| l == 0).count(), 10);
        assert_eq!(leaders.iter().filter(|&&l| l == 1).count(), 1);
    }

    #[test]
    fn test_fair_cycle_polls_every_label() {
        let planner = PollPlanner::new(vec![3, 2, 1], true);
        for _ in 0..12 {
            let mut cycle = planner.next_cycle();
            cycle.sort_unstable();
            assert_eq!(cycle, vec![0, 1, 2]);
        }
    }

    proptest! {
        #[test]
        fn prop_each_label_leads_weight_times_per_window(
            mut weights in proptest::collection::vec(1u32..20, 2..6),
            windows in 1usize..4,
        ) {
            weights.sort_unstable_by(|a, b| b.cmp(a));
            let total: u32 = weights.iter().sum();
            let planner = PollPlanner::new(weights.clone(), true);

            for _ in 0..windows {
                let mut led = vec![0u32; weights.len()];
                for _ in 0..total {
                    led[planner.next_cycle()[0]] += 1;
                }
                prop_assert_eq!(&led, &weights);
            }
        }
    }
}
