//! Capture records
//!
//! One record per entity of the source tree, holding the encoded bridge
//! targets of all its members as parallel sequences. Records are recycled
//! through a [`RecordPool`] between operations.

/// Encoded fields of one entity's members
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureRecord {
    owner_types: Vec<String>,
    field_names: Vec<String>,
    values: Vec<serde_json::Value>,
    by_reference: Vec<bool>,
    member_slots: Vec<usize>,
}

/// Borrowed view of one captured field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureEntry<'a> {
    /// Qualified name of the type declaring the field
    pub owner_type: &'a str,
    /// Field name
    pub field_name: &'a str,
    /// Encoded value
    pub value: &'a serde_json::Value,
    /// Restore only after every node has been correlated
    pub by_reference: bool,
    /// Position of the member inside its entity
    pub member_slot: usize,
}

impl CaptureRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one field
    pub fn push(
        &mut self,
        owner_type: impl Into<String>,
        field_name: impl Into<String>,
        value: serde_json::Value,
        by_reference: bool,
        member_slot: usize,
    ) {
        self.owner_types.push(owner_type.into());
        self.field_names.push(field_name.into());
        self.values.push(value);
        self.by_reference.push(by_reference);
        self.member_slots.push(member_slot);
    }

    /// Get one entry
    pub fn get(&self, index: usize) -> Option<CaptureEntry<'_>> {
        Some(CaptureEntry {
            owner_type: self.owner_types.get(index)?,
            field_name: self.field_names.get(index)?,
            value: self.values.get(index)?,
            by_reference: *self.by_reference.get(index)?,
            member_slot: *self.member_slots.get(index)?,
        })
    }

    /// Iterate over entries in capture order
    pub fn iter(&self) -> impl Iterator<Item = CaptureEntry<'_>> {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Number of captured fields
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if nothing was captured
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop all entries, keeping the allocations
    pub fn clear(&mut self) {
        self.owner_types.clear();
        self.field_names.clear();
        self.values.clear();
        self.by_reference.clear();
        self.member_slots.clear();
    }
}

/// Free list of cleared records
#[derive(Debug)]
pub struct RecordPool {
    free: Vec<CaptureRecord>,
    max_idle: usize,
}

impl RecordPool {
    /// Create a pool keeping at most `max_idle` records
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Vec::new(),
            max_idle,
        }
    }

    /// Take a cleared record
    pub fn acquire(&mut self) -> CaptureRecord {
        self.free.pop().unwrap_or_default()
    }

    /// Return a record to the pool
    pub fn release(&mut self, mut record: CaptureRecord) {
        if self.free.len() < self.max_idle {
            record.clear();
            self.free.push(record);
        }
    }

    /// Number of idle records
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}
