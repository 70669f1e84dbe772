use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ComposeError, Result},
    time::sec_to_us,
};

/// One source clip placed on the output timeline.
///
/// `start_time` is the offset into the source, `composition_start_time` the
/// offset on the output timeline. Both in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionItem {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub composition_start_time: f64,
    #[serde(default)]
    pub muted: bool,
}

impl CompositionItem {
    pub fn new(id: &str, path: &str) -> Self {
        Self {
            id: id.to_string(),
            path: path.to_string(),
            start_time: 0.0,
            composition_start_time: 0.0,
            muted: false,
        }
    }

    pub fn with_start_time(mut self, secs: f64) -> Self {
        self.start_time = secs;
        self
    }

    pub fn with_composition_start_time(mut self, secs: f64) -> Self {
        self.composition_start_time = secs;
        self
    }

    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn start_us(&self) -> i64 {
        sec_to_us(self.start_time)
    }

    pub fn composition_start_us(&self) -> i64 {
        sec_to_us(self.composition_start_time)
    }

    /// Elapsed item time requested by composition time `composition_us`.
    pub fn requested_elapsed_us(&self, composition_us: i64) -> i64 {
        composition_us - self.composition_start_us()
    }

    /// Elapsed item time of a source-local timestamp.
    pub fn elapsed_us(&self, local_us: i64) -> i64 {
        local_us - self.start_us()
    }

    /// Source-local time shown at composition time `composition_us`.
    pub fn local_time_us(&self, composition_us: i64) -> i64 {
        self.start_us() + self.requested_elapsed_us(composition_us)
    }

    /// Whether the item has been placed on the timeline at `composition_us`.
    pub fn is_active_at(&self, composition_us: i64) -> bool {
        composition_us >= self.composition_start_us()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    /// Output duration in seconds.
    pub duration: f64,
    pub items: Vec<CompositionItem>,
}

impl Composition {
    pub fn new(duration: f64, items: Vec<CompositionItem>) -> Self {
        Self { duration, items }
    }

    pub fn duration_us(&self) -> i64 {
        sec_to_us(self.duration)
    }

    pub fn item(&self, id: &str) -> Option<&CompositionItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(ComposeError::Config(format!(
                "invalid composition duration {}",
                self.duration
            )));
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            if !seen.insert(item.id.as_str()) {
                return Err(ComposeError::Config(format!(
                    "duplicate composition item id {}",
                    item.id
                )));
            }
            if item.path.is_empty() {
                return Err(ComposeError::Config(format!(
                    "item {} has no source path",
                    item.id
                )));
            }
            if !(item.start_time >= 0.0 && item.composition_start_time >= 0.0) {
                return Err(ComposeError::Config(format!(
                    "item {} has a negative or invalid time offset",
                    item.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_mapping() {
        let item = CompositionItem::new("b", "b.mp4")
            .with_start_time(2.0)
            .with_composition_start_time(1.0);
        assert_eq!(item.requested_elapsed_us(1_500_000), 500_000);
        assert_eq!(item.local_time_us(1_500_000), 2_500_000);
        assert_eq!(item.elapsed_us(2_500_000), 500_000);
        assert!(!item.is_active_at(999_999));
        assert!(item.is_active_at(1_000_000));
    }

    #[test]
    fn test_from_json() {
        let composition: Composition = serde_json::from_str(
            r#"{
                "duration": 3.5,
                "items": [
                    {"id": "a", "path": "a.mp4"},
                    {"id": "b", "path": "b.mp4", "startTime": 2, "compositionStartTime": 0.5, "muted": true}
                ]
            }"#,
        )
        .unwrap();
        composition.validate().unwrap();
        assert_eq!(composition.duration_us(), 3_500_000);
        let b = composition.item("b").unwrap();
        assert!(b.muted);
        assert_eq!(b.start_us(), 2_000_000);
        assert_eq!(b.composition_start_us(), 500_000);
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let composition = Composition::new(
            1.0,
            vec![
                CompositionItem::new("a", "a.mp4"),
                CompositionItem::new("a", "b.mp4"),
            ],
        );
        assert!(matches!(
            composition.validate(),
            Err(ComposeError::Config(_))
        ));
    }
}
