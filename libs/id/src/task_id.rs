//! Task IDs assigned at launch time.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;
use crate::serial::split_serial;

/// Identifier of one launched task.
///
/// Format: `{framework}.{instance name}.{uuid}`. IDs received from the
/// resource manager are accepted as-is, so the format is not enforced on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a fresh ID for `task_name` under `framework`.
    #[must_use]
    pub fn generate(framework: &str, task_name: &str) -> Self {
        Self(format!(
            "{}.{}.{}",
            framework,
            task_name.replacen('/', "_", 1),
            Uuid::new_v4()
        ))
    }

    /// Returns the string form of the ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the instance name segment, if the ID has one.
    pub fn task_name(&self) -> Option<&str> {
        self.0.split('.').nth(1)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.contains('/') {
            return Err(IdError::InvalidFormat {
                message: format!("'{}' contains a path separator", s),
            });
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_task_ids(&self.0, &other.0)
    }
}

/// Orders task IDs by instance type name, then numeric serial, then the
/// full string.
///
/// IDs whose instance segment has no serial sort before serial-numbered IDs
/// of the same type. The full-string tiebreak keeps the order total.
pub fn compare_task_ids(a: &str, b: &str) -> Ordering {
    sort_key(a).cmp(&sort_key(b))
}

fn sort_key(id: &str) -> (&str, Option<u64>, &str) {
    let segment = id.split('.').nth(1).unwrap_or(id);
    let (base, serial) = split_serial(segment);
    (base, serial, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_compare_numeric_serials() {
        assert_eq!(compare_task_ids("fw.task-9.x", "fw.task-11.x"), Ordering::Less);
        assert_eq!(
            compare_task_ids("fw.task-381.x", "fw.task-131.x"),
            Ordering::Greater
        );
        assert_eq!(compare_task_ids("fw.task-1.x", "fw.task-1.x"), Ordering::Equal);
    }

    #[test]
    fn test_compare_type_names_first() {
        assert_eq!(compare_task_ids("fw.alpha-20.x", "fw.beta-3.x"), Ordering::Less);
        assert_eq!(compare_task_ids("fw.task.x", "fw.task-1.x"), Ordering::Less);
    }

    #[test]
    fn test_compare_same_serial_uses_full_id() {
        assert_eq!(compare_task_ids("fw.task-2.a", "fw.task-2.b"), Ordering::Less);
    }

    #[test]
    fn test_generate_format() {
        let id = TaskId::generate("berth", "team/web-3");
        let parts: Vec<&str> = id.as_str().split('.').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "berth");
        assert_eq!(parts[1], "team_web-3");
        assert!(Uuid::parse_str(parts[2]).is_ok());
        assert_eq!(id.task_name(), Some("team_web-3"));
    }

    #[test]
    fn test_generate_unique() {
        let a = TaskId::generate("berth", "web-1");
        let b = TaskId::generate("berth", "web-1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse() {
        assert_eq!("".parse::<TaskId>(), Err(IdError::Empty));
        assert!("fw/web".parse::<TaskId>().is_err());
        let id: TaskId = "fw.web-1.abc".parse().unwrap();
        assert_eq!(id.to_string(), "fw.web-1.abc");
    }

    #[test]
    fn test_serde_transparent() {
        let id: TaskId = "fw.web-1.abc".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"fw.web-1.abc\"");
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_ord_sorts_vec() {
        let mut ids: Vec<TaskId> = ["fw.t-11.a", "fw.t-9.a", "fw.t-100.a"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(TaskId::as_str).collect();
        assert_eq!(sorted, vec!["fw.t-9.a", "fw.t-11.a", "fw.t-100.a"]);
    }

    fn id_strategy() -> impl Strategy<Value = String> {
        ("[a-c]{1,2}", proptest::option::of(0u64..200), "[x-z]")
            .prop_map(|(base, serial, suffix)| match serial {
                Some(n) => format!("fw.{}-{}.{}", base, n, suffix),
                None => format!("fw.{}.{}", base, suffix),
            })
    }

    proptest! {
        #[test]
        fn prop_sort_independent_of_input_order(mut ids in proptest::collection::vec(id_strategy(), 0..20)) {
            let mut forward = ids.clone();
            forward.sort_by(|a, b| compare_task_ids(a, b));
            ids.reverse();
            ids.sort_by(|a, b| compare_task_ids(a, b));
            prop_assert_eq!(forward, ids);
        }

        #[test]
        fn prop_antisymmetric(a in id_strategy(), b in id_strategy()) {
            prop_assert_eq!(compare_task_ids(&a, &b), compare_task_ids(&b, &a).reverse());
        }
    }
}
