use tracing::warn;

use crate::StreamError;

/// One reference sequence: name and length.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SequenceEntry {
    /// Sequence name (e.g. `chr1`).
    pub name: String,
    /// Sequence length in bases.
    pub length: u64,
}

/// Header-like metadata attached to every record source.
///
/// Sequence identifiers on records index into `sequences`. Read groups are
/// informational and are unioned when sources are combined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "stats-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SequenceDictionary {
    /// Ordered reference sequences.
    pub sequences: Vec<SequenceEntry>,
    /// Read-group identifiers in first-seen order.
    pub read_groups: Vec<String>,
}

impl SequenceDictionary {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sequence; its identifier is the previous sequence count.
    pub fn with_sequence(mut self, name: impl Into<String>, length: u64) -> Self {
        self.sequences.push(SequenceEntry {
            name: name.into(),
            length,
        });
        self
    }

    /// Append a read group unless already present.
    pub fn with_read_group(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.read_groups.contains(&id) {
            self.read_groups.push(id);
        }
        self
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Whether no sequences are declared.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Look up a sequence identifier by name.
    pub fn sequence_id(&self, name: &str) -> Option<i32> {
        self.sequences
            .iter()
            .position(|entry| entry.name == name)
            .map(|idx| idx as i32)
    }

    /// Look up a sequence by identifier.
    pub fn sequence(&self, sequence_id: i32) -> Option<&SequenceEntry> {
        usize::try_from(sequence_id)
            .ok()
            .and_then(|idx| self.sequences.get(idx))
    }

    /// Combine per-source headers into one.
    ///
    /// Sequence lists must be identical; otherwise reconciliation fails with
    /// [`StreamError::IncompatibleSources`], or logs a warning and keeps the
    /// first source's sequences when `ignore_incompatible` is set.
    pub fn reconcile(
        headers: &[SequenceDictionary],
        ignore_incompatible: bool,
    ) -> Result<SequenceDictionary, StreamError> {
        let Some((first, rest)) = headers.split_first() else {
            return Ok(SequenceDictionary::new());
        };

        let mut combined = first.clone();
        for (idx, header) in rest.iter().enumerate() {
            if header.sequences != first.sequences {
                let detail = describe_mismatch(first, header, idx + 1);
                if !ignore_incompatible {
                    return Err(StreamError::IncompatibleSources(detail));
                }
                warn!("ignoring incompatible source header: {}", detail);
            }
            for group in &header.read_groups {
                if !combined.read_groups.contains(group) {
                    combined.read_groups.push(group.clone());
                }
            }
        }
        Ok(combined)
    }
}

fn describe_mismatch(first: &SequenceDictionary, other: &SequenceDictionary, idx: usize) -> String {
    if first.sequences.len() != other.sequences.len() {
        return format!(
            "source {} declares {} sequences, source 0 declares {}",
            idx,
            other.sequences.len(),
            first.sequences.len()
        );
    }
    first
        .sequences
        .iter()
        .zip(&other.sequences)
        .enumerate()
        .find(|(_, (a, b))| a != b)
        .map(|(seq, (a, b))| {
            format!(
                "sequence {} differs: source 0 has {}:{}, source {} has {}:{}",
                seq, a.name, a.length, idx, b.name, b.length
            )
        })
        .unwrap_or_else(|| format!("source {} sequence dictionary differs", idx))
}
