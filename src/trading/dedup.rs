//! Activity deduplication and baseline seeding.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::api::ActivityResponse;
use crate::models::TradeEvent;

/// Trade identifiers already acted upon.
///
/// Grows monotonically for the life of a session; only `clear` on restart
/// shrinks it.
#[derive(Debug, Default)]
pub struct SeenSet {
    ids: HashSet<String>,
}

impl SeenSet {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns `true` if the id was not seen before.
    pub fn insert(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

/// Outcome of feeding one poll's records through the deduplicator.
#[derive(Debug)]
pub enum PollBatch {
    /// First poll after (re)start: ids were seeded, nothing is actionable.
    Baseline { seeded: usize },

    /// Unseen trades, oldest first.
    New(Vec<TradeEvent>),
}

impl PollBatch {
    pub fn into_events(self) -> Vec<TradeEvent> {
        match self {
            PollBatch::Baseline { .. } => Vec::new(),
            PollBatch::New(events) => events,
        }
    }
}

/// Normalizes raw activity and filters out everything already seen.
#[derive(Debug)]
pub struct Deduplicator {
    seen: SeenSet,
    initialized: bool,
    require_hash: bool,
}

impl Deduplicator {
    pub fn new(require_hash: bool) -> Self {
        Self {
            seen: SeenSet::default(),
            initialized: false,
            require_hash,
        }
    }

    /// Forget everything; the next poll becomes a baseline again.
    pub fn reset(&mut self) {
        self.seen.clear();
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Process one page of activity (newest first, as the feed returns it).
    pub fn ingest(&mut self, records: &[ActivityResponse]) -> PollBatch {
        let events: Vec<TradeEvent> = records
            .iter()
            .filter_map(|r| TradeEvent::from_activity(r, self.require_hash))
            .collect();

        if !self.initialized {
            let mut seeded = 0;
            for event in &events {
                if self.seen.insert(&event.id) {
                    seeded += 1;
                }
            }
            self.initialized = true;
            info!(seeded, "Baseline seeded from recent activity");
            return PollBatch::Baseline { seeded };
        }

        // Feed is newest first. Equal timestamps keep reversed feed order.
        let mut fresh: Vec<TradeEvent> = events
            .into_iter()
            .rev()
            .filter(|e| !self.seen.contains(&e.id))
            .collect();
        fresh.sort_by_key(|e| e.timestamp);

        let mut unique = Vec::with_capacity(fresh.len());
        for event in fresh {
            if self.seen.insert(&event.id) {
                unique.push(event);
            }
        }

        if !unique.is_empty() {
            debug!(count = unique.len(), "New trades detected");
        }

        PollBatch::New(unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn activity(hash: &str, ts: i64) -> ActivityResponse {
        ActivityResponse {
            activity_type: "TRADE".to_string(),
            condition_id: "0xcond".to_string(),
            asset: "token".to_string(),
            side: "BUY".to_string(),
            price: dec!(0.5),
            size: dec!(10),
            usdc_size: dec!(5),
            timestamp: ts,
            transaction_hash: hash.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_poll_is_baseline() {
        let mut dedup = Deduplicator::new(true);
        let batch = dedup.ingest(&[activity("0x2", 200), activity("0x1", 100)]);

        assert!(matches!(batch, PollBatch::Baseline { seeded: 2 }));
        assert!(batch.into_events().is_empty());
        assert!(dedup.is_initialized());
    }

    #[test]
    fn test_seen_ids_never_reemitted() {
        let mut dedup = Deduplicator::new(true);
        dedup.ingest(&[activity("0x1", 100)]);

        let events = dedup
            .ingest(&[activity("0x2", 200), activity("0x1", 100)])
            .into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "0x2");

        let again = dedup
            .ingest(&[activity("0x2", 200), activity("0x1", 100)])
            .into_events();
        assert!(again.is_empty());
    }

    #[test]
    fn test_new_trades_oldest_first() {
        let mut dedup = Deduplicator::new(true);
        dedup.ingest(&[]);

        let events = dedup
            .ingest(&[activity("0xc", 300), activity("0xa", 100), activity("0xb", 200)])
            .into_events();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["0xa", "0xb", "0xc"]);
    }

    #[test]
    fn test_duplicate_within_page_emitted_once() {
        let mut dedup = Deduplicator::new(true);
        dedup.ingest(&[]);

        let events = dedup
            .ingest(&[activity("0x1", 100), activity("0x1", 100)])
            .into_events();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_reset_reseeds() {
        let mut dedup = Deduplicator::new(true);
        dedup.ingest(&[activity("0x1", 100)]);
        dedup.reset();

        assert_eq!(dedup.seen_count(), 0);
        let batch = dedup.ingest(&[activity("0x1", 100), activity("0x2", 200)]);
        assert!(matches!(batch, PollBatch::Baseline { seeded: 2 }));
    }
}
