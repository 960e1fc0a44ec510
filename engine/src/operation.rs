//! Operation kinds and the queue coalescing rule.
//!
//! Local changes reach the remote backend as operations, not as direct
//! writes. At most one open queue entry exists per record: newer payloads
//! replace older ones so intermediate states never reach the remote.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of mutation carried by a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// How an incoming mutation folds into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesce {
    /// Append a new entry.
    Append,
    /// Overwrite the open entry's payload in place, keeping its sequence.
    Replace { operation: Operation },
    /// Drop the open create/update entries for the key, then append.
    CancelAndAppend,
}

/// Decide how `incoming` combines with the newest open entry for the same
/// record. Entries already borrowed by a drain are never open.
pub fn coalesce(open: Option<Operation>, incoming: Operation) -> Coalesce {
    match (open, incoming) {
        (None, _) => Coalesce::Append,
        (Some(Operation::Create | Operation::Update), Operation::Delete) => {
            Coalesce::CancelAndAppend
        }
        (Some(Operation::Delete), Operation::Delete) => Coalesce::Replace {
            operation: Operation::Delete,
        },
        // a recreate must not overtake the pending delete
        (Some(Operation::Delete), _) => Coalesce::Append,
        // the remote has not seen the record yet: still a create
        (Some(Operation::Create), _) => Coalesce::Replace {
            operation: Operation::Create,
        },
        (Some(Operation::Update), _) => Coalesce::Replace {
            operation: Operation::Update,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_open_appends() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(coalesce(None, op), Coalesce::Append);
        }
    }

    #[test]
    fn update_after_update_replaces() {
        assert_eq!(
            coalesce(Some(Operation::Update), Operation::Update),
            Coalesce::Replace {
                operation: Operation::Update
            }
        );
    }

    #[test]
    fn update_after_create_stays_create() {
        assert_eq!(
            coalesce(Some(Operation::Create), Operation::Update),
            Coalesce::Replace {
                operation: Operation::Create
            }
        );
    }

    #[test]
    fn delete_cancels_pending_writes() {
        assert_eq!(
            coalesce(Some(Operation::Create), Operation::Delete),
            Coalesce::CancelAndAppend
        );
        assert_eq!(
            coalesce(Some(Operation::Update), Operation::Delete),
            Coalesce::CancelAndAppend
        );
    }

    #[test]
    fn recreate_waits_behind_delete() {
        assert_eq!(
            coalesce(Some(Operation::Delete), Operation::Create),
            Coalesce::Append
        );
    }

    #[test]
    fn operation_string_roundtrip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn serialization_format() {
        assert_eq!(serde_json::to_string(&Operation::Delete).unwrap(), "\"delete\"");
    }
}
