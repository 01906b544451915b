/// Trace notes collected while a message travels.
///
/// Only notes at or below `level` are recorded. On the wire the notes are
/// joined into one newline-separated string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trace {
    level: u32,
    notes: Vec<String>,
}

impl Trace {
    pub fn new(level: u32) -> Self {
        Self { level, notes: Vec::new() }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn set_level(&mut self, level: u32) {
        self.level = level;
    }

    pub fn should_trace(&self, level: u32) -> bool {
        level <= self.level
    }

    /// Records `note` if `level` is enabled. Returns whether it was recorded.
    pub fn trace(&mut self, level: u32, note: impl Into<String>) -> bool {
        if !self.should_trace(level) {
            return false;
        }
        self.notes.push(note.into());
        true
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Appends the notes of another trace, e.g. one returned by a remote peer.
    pub fn merge(&mut self, other: Trace) {
        self.notes.extend(other.notes);
    }

    pub fn encode(&self) -> String {
        self.notes.join("\n")
    }

    pub fn decode(level: u32, encoded: &str) -> Self {
        let notes = encoded.lines().filter(|line| !line.is_empty()).map(str::to_owned).collect();
        Self { level, notes }
    }
}
