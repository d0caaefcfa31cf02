//! Named priority queues and weighted polling order.

use std::collections::BTreeMap;
use std::str::FromStr;

use rand::Rng;

pub const CRITICAL_QUEUE: &str = "critical";
pub const DEFAULT_QUEUE: &str = "default";
pub const LOW_QUEUE: &str = "low";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueConfigError {
    #[error("no queues configured")]
    Empty,
    #[error("queue {0:?} must have a positive weight")]
    ZeroWeight(String),
    #[error("invalid queue weight entry {0:?} (expected name=weight)")]
    Malformed(String),
}

/// Queue names with their relative polling weights.
///
/// A queue with weight 6 is chosen first roughly six times as often as a
/// queue with weight 1, but lower-weight queues are never starved: every poll
/// visits every queue, only the order changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    weights: BTreeMap<String, u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            weights: BTreeMap::from([
                (CRITICAL_QUEUE.to_string(), 6),
                (DEFAULT_QUEUE.to_string(), 3),
                (LOW_QUEUE.to_string(), 1),
            ]),
        }
    }
}

impl QueueConfig {
    pub fn new<I, S>(weights: I) -> Result<Self, QueueConfigError>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (name, weight) in weights {
            let name = name.into();
            if weight == 0 {
                return Err(QueueConfigError::ZeroWeight(name));
            }
            map.insert(name, weight);
        }
        if map.is_empty() {
            return Err(QueueConfigError::Empty);
        }
        Ok(Self { weights: map })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    pub fn weight(&self, queue: &str) -> Option<u32> {
        self.weights.get(queue).copied()
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.weights.contains_key(queue)
    }

    /// Weighted random permutation of all queues, used as the order in which
    /// a single poll tries them.
    pub fn poll_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        // Summed as u64: each weight may be up to u32::MAX.
        let mut remaining: Vec<(&String, u64)> = self
            .weights
            .iter()
            .map(|(n, w)| (n, u64::from(*w)))
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|(_, w)| *w).sum();
            let mut pick = rng.gen_range(0..total);
            let idx = remaining
                .iter()
                .position(|(_, w)| {
                    if pick < *w {
                        true
                    } else {
                        pick -= *w;
                        false
                    }
                })
                .unwrap_or(remaining.len() - 1);
            order.push(remaining.swap_remove(idx).0.clone());
        }

        order
    }
}

/// Parses `critical=6,default=3,low=1`.
impl FromStr for QueueConfig {
    type Err = QueueConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for raw in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, weight) = raw
                .split_once('=')
                .ok_or_else(|| QueueConfigError::Malformed(raw.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(QueueConfigError::Malformed(raw.to_string()));
            }
            let weight = weight
                .trim()
                .parse::<u32>()
                .map_err(|_| QueueConfigError::Malformed(raw.to_string()))?;
            entries.push((name.to_string(), weight));
        }
        Self::new(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn default_weights() {
        let config = QueueConfig::default();
        assert_eq!(config.weight("critical"), Some(6));
        assert_eq!(config.weight("default"), Some(3));
        assert_eq!(config.weight("low"), Some(1));
    }

    #[test]
    fn parses_weight_list() {
        let config: QueueConfig = "critical=6, default=3,low=1".parse().unwrap();
        assert_eq!(config, QueueConfig::default());

        assert_eq!(
            "critical=0".parse::<QueueConfig>(),
            Err(QueueConfigError::ZeroWeight("critical".into()))
        );
        assert_eq!("".parse::<QueueConfig>(), Err(QueueConfigError::Empty));
        assert!(matches!(
            "critical".parse::<QueueConfig>(),
            Err(QueueConfigError::Malformed(_))
        ));
    }

    #[test]
    fn poll_order_visits_every_queue_once() {
        let config = QueueConfig::default();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let mut order = config.poll_order(&mut rng);
            order.sort();
            assert_eq!(order, vec!["critical", "default", "low"]);
        }
    }

    #[test]
    fn poll_order_favours_heavier_queues() {
        let config = QueueConfig::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut first = BTreeMap::<String, u32>::new();

        let rounds = 10_000;
        for _ in 0..rounds {
            let order = config.poll_order(&mut rng);
            *first.entry(order[0].clone()).or_default() += 1;
        }

        let share = |q: &str| f64::from(first[q]) / f64::from(rounds);
        assert!((0.55..0.65).contains(&share("critical")), "{first:?}");
        assert!((0.25..0.35).contains(&share("default")), "{first:?}");
        assert!((0.07..0.13).contains(&share("low")), "{first:?}");
    }

    #[test]
    fn extreme_weights_do_not_overflow() {
        let config: QueueConfig = "critical=4294967295,default=4294967295,low=1"
            .parse()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..100 {
            let mut order = config.poll_order(&mut rng);
            order.sort();
            assert_eq!(order, vec!["critical", "default", "low"]);
        }
    }
}
