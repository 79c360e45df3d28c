//! Candidate scoring and ranking.
//!
//! [`RankingModel`] is the seam between the executor and the scoring
//! implementation; tests substitute slow or failing models through it.
//! [`EmbeddingRanker`] is the production model: it folds the turn's items
//! into the session profile, scores candidates against the profile and
//! the ranking head, and emits a deterministic descending order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::cache::{ItemId, TurnSnapshot};
use crate::config::RequestParams;
use crate::error::{Result, VlmError};
use crate::executor::Ticket;
use crate::model::ModelBinding;

/// How often the scoring loop polls the cancellation ticket.
const CANCEL_POLL_INTERVAL: usize = 64;

/// Output of a completed ranking pass.
#[derive(Debug, Clone)]
pub struct RankOutcome {
    /// Recommended items, best first, at most `max_new_items`.
    pub items: Vec<ItemId>,
    /// The session's next candidate pool: every candidate, scored ones
    /// reordered to the front, unscored ones unchanged at the tail.
    pub refreshed_pool: Vec<ItemId>,
}

/// Scores a turn against a session snapshot.
///
/// Implementations must treat the snapshot as read-only and honor the
/// cancellation ticket: once it reports cancelled, return
/// `Err(VlmError::Timeout)` promptly instead of finishing the pass.
pub trait RankingModel: Send + Sync {
    fn rank(
        &self,
        binding: &ModelBinding,
        snapshot: &TurnSnapshot,
        new_items: &[ItemId],
        params: &RequestParams,
        ticket: &Ticket,
    ) -> Result<RankOutcome>;
}

/// Map a message's content onto the item vocabulary.
pub fn message_item_id(content: &str, num_items: usize) -> ItemId {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish() % num_items.max(1) as u64
}

/// Dot-product ranker over the loaded embedding table.
#[derive(Debug, Default)]
pub struct EmbeddingRanker;

impl EmbeddingRanker {
    fn score(binding: &ModelBinding, profile: &[f32], item: ItemId, temperature: f32) -> f32 {
        let embedding = binding.embedding(item);
        let head = binding.ranking_head();
        let mut score = 0.0f32;
        for ((&e, &p), &h) in embedding.iter().zip(profile).zip(head) {
            score += e * (p + h);
        }
        score / temperature
    }
}

impl RankingModel for EmbeddingRanker {
    fn rank(
        &self,
        binding: &ModelBinding,
        snapshot: &TurnSnapshot,
        new_items: &[ItemId],
        params: &RequestParams,
        ticket: &Ticket,
    ) -> Result<RankOutcome> {
        // Continue the running mean from where the session left off,
        // without touching the shared entry.
        let mut profile = snapshot.profile.clone();
        let mut turns = snapshot.turns;
        for &item in new_items {
            turns += 1;
            let n = turns as f32;
            for (slot, &value) in profile.iter_mut().zip(binding.embedding(item)) {
                *slot += (value - *slot) / n;
            }
        }

        // A fresh session ranks the whole vocabulary; an established one
        // ranks its candidate pool.
        let candidates: Vec<ItemId> = if snapshot.candidate_pool.is_empty() {
            (0..binding.num_items() as u64).collect()
        } else {
            snapshot.candidate_pool.clone()
        };
        let bound = match params.top_k {
            0 => candidates.len(),
            k => candidates.len().min(k as usize),
        };

        let mut scored = Vec::with_capacity(bound);
        for (i, &item) in candidates.iter().take(bound).enumerate() {
            if i % CANCEL_POLL_INTERVAL == 0 && ticket.is_cancelled() {
                return Err(VlmError::Timeout);
            }
            scored.push((item, Self::score(binding, &profile, item, params.temperature)));
        }

        if ticket.is_cancelled() {
            return Err(VlmError::Timeout);
        }

        // Descending score, ascending item id on ties. Stable across runs.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut refreshed_pool: Vec<ItemId> = scored.iter().map(|&(item, _)| item).collect();
        let items: Vec<ItemId> = refreshed_pool
            .iter()
            .copied()
            .filter(|item| !new_items.contains(item))
            .take(params.max_new_items as usize)
            .collect();
        // Candidates beyond the top_k bound keep their place at the tail:
        // a narrow top_k reorders the front of the pool, it never shrinks
        // the session's candidate set.
        refreshed_pool.extend(candidates.iter().skip(bound).copied());

        Ok(RankOutcome {
            items,
            refreshed_pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitOptions;
    use crate::device::{DeviceContextPool, DeviceSpec};
    use crate::model::ModelLoader;
    use std::io::Write;
    use std::path::Path;

    fn write_fixture(dir: &Path, num_items: usize, hidden_dim: usize) {
        std::fs::write(
            dir.join("config.json"),
            format!(r#"{{"model_id":"rec-v1","num_items":{num_items},"hidden_dim":{hidden_dim}}}"#),
        )
        .unwrap();

        let mut data = Vec::new();
        // Item i embeds as [i, 1, 0, ...]: dot against a positive head
        // grows with the item id, giving a known ranking order.
        for i in 0..num_items {
            data.extend_from_slice(&(i as f32).to_le_bytes());
            data.extend_from_slice(&1.0f32.to_le_bytes());
            for _ in 2..hidden_dim {
                data.extend_from_slice(&0.0f32.to_le_bytes());
            }
        }
        let emb_end = data.len();
        for _ in 0..hidden_dim {
            data.extend_from_slice(&1.0f32.to_le_bytes());
        }
        let head_end = data.len();

        let header = format!(
            concat!(
                r#"{{"item_embedding.weight":{{"dtype":"F32","shape":[{},{}],"data_offsets":[0,{}]}},"#,
                r#""ranking_head.weight":{{"dtype":"F32","shape":[{}],"data_offsets":[{},{}]}}}}"#
            ),
            num_items, hidden_dim, emb_end, hidden_dim, emb_end, head_end
        );
        let mut file = std::fs::File::create(dir.join("model.safetensors")).unwrap();
        file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
        file.write_all(header.as_bytes()).unwrap();
        file.write_all(&data).unwrap();
    }

    fn binding(num_items: usize) -> crate::model::ModelBinding {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), num_items, 4);
        let spec = DeviceSpec::parse("cuda:0").unwrap();
        let opts = InitOptions {
            batch_size: 4,
            ..InitOptions::default()
        };
        let pool = DeviceContextPool::acquire(&spec, &opts).unwrap();
        ModelLoader::load(dir.path().to_str().unwrap(), &pool, &opts).unwrap()
    }

    fn empty_snapshot(hidden_dim: usize) -> TurnSnapshot {
        TurnSnapshot {
            behavior_sequence: Vec::new(),
            candidate_pool: Vec::new(),
            profile: vec![0.0; hidden_dim],
            turns: 0,
        }
    }

    #[test]
    fn ranks_highest_scoring_items_first() {
        let binding = binding(8);
        let params = RequestParams {
            max_new_items: 3,
            top_k: 0,
            ..RequestParams::default()
        };
        let outcome = EmbeddingRanker
            .rank(&binding, &empty_snapshot(4), &[], &params, &Ticket::new())
            .unwrap();

        // With head = ones and zero profile, score grows with item id.
        assert_eq!(outcome.items, vec![7, 6, 5]);
        assert_eq!(outcome.refreshed_pool.len(), 8);
        assert_eq!(outcome.refreshed_pool[0], 7);
    }

    #[test]
    fn ranking_is_deterministic() {
        let binding = binding(16);
        let params = RequestParams::default();
        let snapshot = empty_snapshot(4);
        let a = EmbeddingRanker
            .rank(&binding, &snapshot, &[3], &params, &Ticket::new())
            .unwrap();
        let b = EmbeddingRanker
            .rank(&binding, &snapshot, &[3], &params, &Ticket::new())
            .unwrap();
        assert_eq!(a.items, b.items);
        assert_eq!(a.refreshed_pool, b.refreshed_pool);
    }

    #[test]
    fn temperature_preserves_order() {
        let binding = binding(8);
        let snapshot = empty_snapshot(4);
        let hot = RequestParams {
            temperature: 0.5,
            ..RequestParams::default()
        };
        let cold = RequestParams {
            temperature: 2.0,
            ..RequestParams::default()
        };
        let a = EmbeddingRanker
            .rank(&binding, &snapshot, &[], &hot, &Ticket::new())
            .unwrap();
        let b = EmbeddingRanker
            .rank(&binding, &snapshot, &[], &cold, &Ticket::new())
            .unwrap();
        assert_eq!(a.items, b.items);
    }

    #[test]
    fn top_k_bounds_candidates() {
        let binding = binding(16);
        let params = RequestParams {
            top_k: 4,
            max_new_items: 10,
            ..RequestParams::default()
        };
        let outcome = EmbeddingRanker
            .rank(&binding, &empty_snapshot(4), &[], &params, &Ticket::new())
            .unwrap();
        // Only the first four candidates were scored and recommended.
        assert!(outcome.items.len() <= 4);
        assert!(outcome.items.iter().all(|&item| item < 4));
        assert_eq!(outcome.items[0], 3);
        // The unscored candidates survive at the pool's tail.
        assert_eq!(outcome.refreshed_pool.len(), 16);
        assert_eq!(outcome.refreshed_pool[4..], (4..16u64).collect::<Vec<_>>());
    }

    #[test]
    fn narrow_top_k_never_shrinks_the_pool() {
        let binding = binding(16);
        let params = RequestParams {
            top_k: 3,
            ..RequestParams::default()
        };
        let mut snapshot = empty_snapshot(4);
        snapshot.candidate_pool = (0..16).collect();

        // Rank repeatedly, feeding each refreshed pool back in.
        for _ in 0..4 {
            let outcome = EmbeddingRanker
                .rank(&binding, &snapshot, &[], &params, &Ticket::new())
                .unwrap();
            let mut pool = outcome.refreshed_pool.clone();
            pool.sort_unstable();
            assert_eq!(pool, (0..16u64).collect::<Vec<_>>());
            snapshot.candidate_pool = outcome.refreshed_pool;
        }
    }

    #[test]
    fn new_items_excluded_from_recommendations() {
        let binding = binding(8);
        let params = RequestParams {
            max_new_items: 8,
            top_k: 0,
            ..RequestParams::default()
        };
        let outcome = EmbeddingRanker
            .rank(&binding, &empty_snapshot(4), &[7, 6], &params, &Ticket::new())
            .unwrap();
        assert!(!outcome.items.contains(&7));
        assert!(!outcome.items.contains(&6));
    }

    #[test]
    fn cancelled_ticket_aborts_with_timeout() {
        let binding = binding(8);
        let ticket = Ticket::new();
        assert!(ticket.try_cancel());

        let err = EmbeddingRanker
            .rank(
                &binding,
                &empty_snapshot(4),
                &[],
                &RequestParams::default(),
                &ticket,
            )
            .unwrap_err();
        assert!(matches!(err, VlmError::Timeout));
    }

    #[test]
    fn message_item_id_in_vocabulary() {
        for content in ["jacket", "boots", ""] {
            assert!(message_item_id(content, 16) < 16);
        }
        assert_eq!(
            message_item_id("jacket", 16),
            message_item_id("jacket", 16)
        );
    }
}
