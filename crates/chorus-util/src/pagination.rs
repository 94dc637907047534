use serde::Deserialize;

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 100;

/// Offset-addressed page over a room's append log, newest tail first.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl HistoryParams {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self { limit, offset }
    }

    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT) as usize
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0) as usize
    }
}

impl Default for HistoryParams {
    fn default() -> Self {
        Self {
            limit: Some(DEFAULT_HISTORY_LIMIT),
            offset: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        assert_eq!(HistoryParams::new(Some(0), None).limit(), 1);
        assert_eq!(HistoryParams::new(Some(500), None).limit(), 100);
        assert_eq!(HistoryParams::new(None, None).limit(), 50);
        assert_eq!(HistoryParams::default().offset(), 0);
    }
}
