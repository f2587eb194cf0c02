use std::sync::Arc;

use crate::rotation::CursorStore;
use crate::rules::Candidate;

/// Round-robin candidate selection over the shared keyed cursor.
#[derive(Clone)]
pub struct RoundRobinSelector {
    cursors: Arc<dyn CursorStore>,
}

impl RoundRobinSelector {
    pub fn new(cursors: Arc<dyn CursorStore>) -> Self {
        Self { cursors }
    }

    /// Picks `candidates[cursor % len]` for `key` and advances the cursor
    /// exactly once, returning the chosen candidate and the remaining list
    /// with the chosen one removed (relative order preserved).
    ///
    /// Failover re-selection calls this again with the remaining list; the
    /// cursor keeps advancing globally, so the next independent request
    /// continues the rotation where this one left off. Rotation uses the
    /// modulo of the current list size, so no strict fairness is promised
    /// when the set size changes between selections.
    pub fn select(&self, candidates: &[Candidate], key: &str) -> Option<(Candidate, Vec<Candidate>)> {
        if candidates.is_empty() {
            return None;
        }

        let cursor = self.cursors.next(key);
        let index = (cursor % candidates.len() as u64) as usize;
        let chosen = candidates[index].clone();
        let remaining = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, candidate)| candidate.clone())
            .collect();
        Some((chosen, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::InMemoryCursorStore;
    use crate::rules::WireProtocol;

    fn candidate(id: &str) -> Candidate {
        Candidate {
            provider_id: id.to_string(),
            provider_name: id.to_string(),
            base_url: format!("https://{id}.example.test"),
            protocol: WireProtocol::OpenAi,
            api_key: String::new(),
            target_model: format!("target-{id}"),
            priority: 0,
            weight: 1,
        }
    }

    fn selector() -> RoundRobinSelector {
        RoundRobinSelector::new(Arc::new(InMemoryCursorStore::new()))
    }

    #[test]
    fn rotates_in_order_and_wraps() {
        let selector = selector();
        let candidates = vec![candidate("a"), candidate("b"), candidate("c")];

        let picks: Vec<String> = (0..4)
            .map(|_| selector.select(&candidates, "gpt-4o").unwrap().0.provider_id)
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn consecutive_selections_distribute_evenly() {
        let selector = selector();
        let candidates = vec![candidate("a"), candidate("b"), candidate("c")];

        let mut counts = std::collections::HashMap::new();
        let n = 10;
        for _ in 0..n {
            let (chosen, _) = selector.select(&candidates, "gpt-4o").unwrap();
            *counts.entry(chosen.provider_id).or_insert(0u32) += 1;
        }
        // 10 picks over 3 candidates: each chosen floor(10/3) or ceil(10/3).
        for id in ["a", "b", "c"] {
            let count = counts.get(id).copied().unwrap_or(0);
            assert!((3..=4).contains(&count), "{id} picked {count} times");
        }
    }

    #[test]
    fn keys_rotate_independently() {
        let selector = selector();
        let candidates = vec![candidate("a"), candidate("b")];

        assert_eq!(selector.select(&candidates, "m1").unwrap().0.provider_id, "a");
        assert_eq!(selector.select(&candidates, "m2").unwrap().0.provider_id, "a");
        assert_eq!(selector.select(&candidates, "m1").unwrap().0.provider_id, "b");
    }

    #[test]
    fn remaining_excludes_chosen_and_keeps_order() {
        let selector = selector();
        let candidates = vec![candidate("a"), candidate("b"), candidate("c")];

        let (first, remaining) = selector.select(&candidates, "gpt-4o").unwrap();
        assert_eq!(first.provider_id, "a");
        let ids: Vec<&str> = remaining.iter().map(|c| c.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        // Failover re-selection advances the shared cursor again.
        let (second, rest) = selector.select(&remaining, "gpt-4o").unwrap();
        assert_eq!(second.provider_id, "c");
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn empty_candidate_list_yields_none() {
        assert!(selector().select(&[], "gpt-4o").is_none());
    }
}
