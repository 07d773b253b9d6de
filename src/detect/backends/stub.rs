use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Candidate;
use crate::frame::Frame;

/// Class list the stub backend reports when none is given.
pub const STUB_CLASS_NAMES: &[&str] = &["Healthy", "Early Blight", "Late Blight", "Leaf Spot"];

/// Box reported for detections scripted through a `stub://` reference.
const SCRIPTED_BOX: [f32; 4] = [16.0, 16.0, 96.0, 96.0];

/// Stub backend for testing.
///
/// Detects nothing unless scripted: `with_detection` replays a candidate on
/// the frame with the given sequence number, `failing_on` makes detection on
/// that frame return an error, and `panicking_on` makes it panic.
pub struct StubBackend {
    class_names: Vec<String>,
    script: HashMap<u64, Vec<Candidate>>,
    failing: HashSet<u64>,
    panicking: HashSet<u64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            class_names: STUB_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            script: HashMap::new(),
            failing: HashSet::new(),
            panicking: HashSet::new(),
        }
    }

    pub fn with_class_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.class_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_detection(mut self, sequence: u64, candidate: Candidate) -> Self {
        self.script.entry(sequence).or_default().push(candidate);
        self
    }

    pub fn failing_on(mut self, sequence: u64) -> Self {
        self.failing.insert(sequence);
        self
    }

    pub fn panicking_on(mut self, sequence: u64) -> Self {
        self.panicking.insert(sequence);
        self
    }

    /// Build a backend from a model reference such as
    /// `stub://model?detect=3:1:0.8,7:1:0.8&fail=5`.
    ///
    /// `detect` entries are `frame:class_id:confidence`; `fail` lists frames
    /// whose detection call errors; `panic` lists frames whose detection call
    /// panics.
    pub fn from_reference(reference: &str) -> Result<Self> {
        let url = Url::parse(reference).with_context(|| format!("parse {}", reference))?;
        let mut backend = Self::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "detect" => {
                    for entry in value.split(',').filter(|e| !e.trim().is_empty()) {
                        let (sequence, candidate) = parse_scripted(entry)?;
                        backend = backend.with_detection(sequence, candidate);
                    }
                }
                "fail" => {
                    for sequence in parse_frames("fail", &value)? {
                        backend = backend.failing_on(sequence);
                    }
                }
                "panic" => {
                    for sequence in parse_frames("panic", &value)? {
                        backend = backend.panicking_on(sequence);
                    }
                }
                other => return Err(anyhow!("unknown stub model parameter '{}'", other)),
            }
        }
        Ok(backend)
    }
}

fn parse_frames(key: &str, value: &str) -> Result<Vec<u64>> {
    value
        .split(',')
        .filter(|e| !e.trim().is_empty())
        .map(|entry| {
            entry
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} frame '{}' is not a number", key, entry))
        })
        .collect()
}

fn parse_scripted(entry: &str) -> Result<(u64, Candidate)> {
    let parts: Vec<&str> = entry.trim().split(':').collect();
    let [sequence, class_id, confidence] = parts.as_slice() else {
        return Err(anyhow!(
            "detect entry '{}' must be frame:class_id:confidence",
            entry
        ));
    };
    let sequence: u64 = sequence
        .parse()
        .map_err(|_| anyhow!("detect frame '{}' is not a number", sequence))?;
    let class_id: u32 = class_id
        .parse()
        .map_err(|_| anyhow!("detect class '{}' is not a number", class_id))?;
    let confidence: f32 = confidence
        .parse()
        .map_err(|_| anyhow!("detect confidence '{}' is not a number", confidence))?;
    let [x1, y1, x2, y2] = SCRIPTED_BOX;
    Ok((
        sequence,
        Candidate {
            class_id,
            confidence,
            x1,
            y1,
            x2,
            y2,
        },
    ))
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>> {
        if self.panicking.contains(&frame.sequence) {
            panic!("scripted panic on frame {}", frame.sequence);
        }
        if self.failing.contains(&frame.sequence) {
            return Err(anyhow!("scripted failure on frame {}", frame.sequence));
        }
        Ok(self.script.get(&frame.sequence).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> Candidate {
        Candidate {
            class_id: 1,
            confidence: 0.8,
            x1: 1.0,
            y1: 1.0,
            x2: 3.0,
            y2: 3.0,
        }
    }

    #[test]
    fn replays_script_by_sequence() -> Result<()> {
        let mut backend = StubBackend::new().with_detection(2, candidate());
        let first = Frame::new(vec![0u8; 48], 4, 4, 1)?;
        let second = Frame::new(vec![0u8; 48], 4, 4, 2)?;
        assert!(backend.detect(&first)?.is_empty());
        assert_eq!(backend.detect(&second)?, vec![candidate()]);
        Ok(())
    }

    #[test]
    fn parses_script_from_reference() -> Result<()> {
        let mut backend = StubBackend::from_reference("stub://model?detect=3:1:0.8,7:2:0.5&fail=4")?;
        let third = Frame::new(vec![0u8; 48], 4, 4, 3)?;
        let fourth = Frame::new(vec![0u8; 48], 4, 4, 4)?;
        let seventh = Frame::new(vec![0u8; 48], 4, 4, 7)?;
        assert_eq!(backend.detect(&third)?[0].class_id, 1);
        assert!(backend.detect(&fourth).is_err());
        assert_eq!(backend.detect(&seventh)?[0].confidence, 0.5);
        assert!(StubBackend::from_reference("stub://model?detect=3:1").is_err());
        assert!(StubBackend::from_reference("stub://model?panic=x").is_err());
        assert!(StubBackend::from_reference("stub://model").is_ok());
        Ok(())
    }

    #[test]
    fn scripted_failure_returns_error() -> Result<()> {
        let mut backend = StubBackend::new().failing_on(1);
        let frame = Frame::new(vec![0u8; 48], 4, 4, 1)?;
        assert!(backend.detect(&frame).is_err());
        Ok(())
    }

    #[test]
    #[should_panic(expected = "scripted panic on frame 2")]
    fn scripted_panic_unwinds() {
        let mut backend = StubBackend::from_reference("stub://model?panic=2").unwrap();
        let frame = Frame::new(vec![0u8; 48], 4, 4, 2).unwrap();
        let _ = backend.detect(&frame);
    }
}
