//! Detector that replays recorded detections from a JSON-lines file.
//!
//! Each non-empty line holds a JSON array of [`Detection`]s for one cycle.
//! Once the recording is exhausted every call returns an empty list.

use std::{collections::VecDeque, fs, path::Path};

use anyhow::{Context, Result};
use video_ingest::Frame;

use crate::{Detection, Detector};

pub struct ReplayDetector {
    cycles: VecDeque<Vec<Detection>>,
}

impl ReplayDetector {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        Self::from_jsonl(&text).with_context(|| format!("invalid replay file {}", path.display()))
    }

    pub fn from_jsonl(text: &str) -> Result<Self> {
        let mut cycles = VecDeque::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let detections: Vec<Detection> = serde_json::from_str(line)
                .with_context(|| format!("line {}: expected a JSON array of detections", index + 1))?;
            cycles.push_back(detections);
        }
        Ok(Self { cycles })
    }

    pub fn remaining(&self) -> usize {
        self.cycles.len()
    }
}

impl Detector for ReplayDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self.cycles.pop_front().unwrap_or_default())
    }
}
