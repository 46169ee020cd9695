use serde::{Deserialize, Serialize};

/// Creation index of a block. Never reused within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Raw,
    Compressed,
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub id: BlockId,
    pub label: Option<String>,
    pub content: String,
    pub tokens: usize,
    pub pinned: bool,
    pub references: u32,
    /// Logical clock value of the last ingest or reference.
    pub last_touched: u64,
    pub status: BlockStatus,
}

impl MemoryBlock {
    pub fn is_live(&self) -> bool {
        self.status != BlockStatus::Evicted
    }

    pub fn render(&self) -> String {
        match &self.label {
            Some(label) => format!("[{label}]\n{}", self.content),
            None => self.content.clone(),
        }
    }
}
