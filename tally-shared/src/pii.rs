use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// A recipient address (e-mail or phone number) that only shows a hint of itself
/// when formatted, so it can be passed to `tracing` macros without leaking.
///
/// Serialization writes the real value: queue payloads and API responses need it.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Masked<T>(pub T);

impl<T: AsRef<str>> Masked<T> {
    fn hint(&self) -> String {
        let raw = self.0.as_ref();
        if let Some((local, domain)) = raw.split_once('@') {
            let first: String = local.chars().take(1).collect();
            return format!("{}***@{}", first, domain);
        }

        let visible: String = raw
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if raw.chars().count() <= 4 {
            return "****".to_string();
        }
        format!("****{}", visible)
    }
}

impl<T: AsRef<str>> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hint())
    }
}

impl<T: AsRef<str>> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hint())
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}
