//! Point lookup state carried across memtables and tables

use crate::options::MergeOperator;
use crate::types::ValueType;
use crate::{Result, TierError};

/// Where a lookup stands after the sources seen so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetState {
    NotFound,
    Found,
    Deleted,
    /// Merge operands collected, still looking for a base value
    Merge,
    Corrupt,
}

/// Accumulates the entries for one user key, newest first
pub struct GetContext<'a> {
    user_key: &'a [u8],
    merge_operator: Option<&'a dyn MergeOperator>,
    state: GetState,
    // newest first, as encountered
    operands: Vec<Vec<u8>>,
    value: Option<Vec<u8>>,
    error: Option<TierError>,
}

impl<'a> GetContext<'a> {
    pub fn new(user_key: &'a [u8], merge_operator: Option<&'a dyn MergeOperator>) -> Self {
        Self {
            user_key,
            merge_operator,
            state: GetState::NotFound,
            operands: Vec::new(),
            value: None,
            error: None,
        }
    }

    pub fn user_key(&self) -> &[u8] {
        self.user_key
    }

    pub fn state(&self) -> GetState {
        self.state
    }

    /// Feed the next (older) entry for the key.
    ///
    /// Returns `true` while older entries are still needed.
    pub fn save_value(&mut self, value_type: ValueType, value: &[u8]) -> bool {
        match value_type {
            ValueType::Value => {
                if self.operands.is_empty() {
                    self.value = Some(value.to_vec());
                    self.state = GetState::Found;
                } else {
                    self.merge(Some(value));
                }
                false
            }
            ValueType::Deletion => {
                if self.operands.is_empty() {
                    self.state = GetState::Deleted;
                } else {
                    self.merge(None);
                }
                false
            }
            ValueType::Merge => {
                if self.merge_operator.is_none() {
                    self.state = GetState::Corrupt;
                    self.error = Some(TierError::InvalidArgument(
                        "merge entry found but no merge operator is configured".into(),
                    ));
                    return false;
                }
                self.operands.push(value.to_vec());
                self.state = GetState::Merge;
                true
            }
        }
    }

    fn merge(&mut self, base: Option<&[u8]>) {
        let Some(operator) = self.merge_operator else {
            self.state = GetState::Corrupt;
            self.error = Some(TierError::InvalidArgument(
                "merge entry found but no merge operator is configured".into(),
            ));
            return;
        };
        let operands: Vec<Vec<u8>> = self.operands.drain(..).rev().collect();
        match operator.full_merge(self.user_key, base, &operands) {
            Some(merged) => {
                self.value = Some(merged);
                self.state = GetState::Found;
            }
            None => {
                self.state = GetState::Corrupt;
                self.error = Some(TierError::Corruption(format!(
                    "merge operator {} failed",
                    operator.name()
                )));
            }
        }
    }

    /// Resolve the lookup once every source has been consulted
    pub fn finish(mut self) -> Result<Option<Vec<u8>>> {
        if self.state == GetState::Merge {
            self.merge(None);
        }
        match self.state {
            GetState::Found => Ok(self.value),
            GetState::NotFound | GetState::Deleted => Ok(None),
            GetState::Merge => Ok(None),
            GetState::Corrupt => Err(self
                .error
                .unwrap_or_else(|| TierError::Corruption("lookup failed".into()))),
        }
    }
}
