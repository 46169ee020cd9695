use std::collections::{HashSet, VecDeque};

/// Word-set Jaccard similarity in `[0, 1]`.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let wa: HashSet<&str> = a.split_whitespace().collect();
    let wb: HashSet<&str> = b.split_whitespace().collect();
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let inter = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    inter / union
}

/// Flags a continuation loop that keeps producing the same text.
#[derive(Debug, Clone)]
pub struct StallDetector {
    recent: VecDeque<String>,
    threshold: f64,
    min_words: usize,
}

impl StallDetector {
    const IDENTICAL_RUN: usize = 3;

    pub fn new(threshold: f64) -> Self {
        Self {
            recent: VecDeque::with_capacity(Self::IDENTICAL_RUN),
            threshold,
            min_words: 8,
        }
    }

    /// Feed the next chunk; true when the loop has stalled.
    pub fn observe(&mut self, chunk: &str) -> bool {
        let chunk = chunk.trim().to_string();
        let similar = self
            .recent
            .back()
            .map(|prev| {
                prev.split_whitespace().count() >= self.min_words
                    && chunk.split_whitespace().count() >= self.min_words
                    && jaccard_similarity(prev, &chunk) >= self.threshold
            })
            .unwrap_or(false);

        self.recent.push_back(chunk);
        while self.recent.len() > Self::IDENTICAL_RUN {
            self.recent.pop_front();
        }
        let identical = self.recent.len() == Self::IDENTICAL_RUN
            && self.recent.iter().all(|c| c == &self.recent[0]);

        similar || identical
    }
}
