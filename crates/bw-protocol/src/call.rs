//! Call identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier tying request, response and stream frames of one RPC call together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub u32);

impl CallId {
    /// Create a new call ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the ID following this one, skipping zero on wrap-around
    pub fn next(&self) -> CallId {
        match self.0.wrapping_add(1) {
            0 => CallId(1),
            n => CallId(n),
        }
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

impl From<u32> for CallId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_display() {
        assert_eq!(CallId::new(42).to_string(), "call-42");
    }

    #[test]
    fn test_call_id_next_skips_zero() {
        assert_eq!(CallId::new(7).next(), CallId::new(8));
        assert_eq!(CallId::new(u32::MAX).next(), CallId::new(1));
    }
}
