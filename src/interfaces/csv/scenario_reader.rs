use crate::error::{BillingError, Result};
use serde::Deserialize;
use std::fmt;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioAction {
    Product,
    Owned,
    Backend,
    Unavailable,
    Connect,
    Purchase,
    Retry,
    Recover,
    Dismiss,
    Refresh,
    Invalidate,
    Disconnect,
    Reconcile,
}

impl ScenarioAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Owned => "owned",
            Self::Backend => "backend",
            Self::Unavailable => "unavailable",
            Self::Connect => "connect",
            Self::Purchase => "purchase",
            Self::Retry => "retry",
            Self::Recover => "recover",
            Self::Dismiss => "dismiss",
            Self::Refresh => "refresh",
            Self::Invalidate => "invalidate",
            Self::Disconnect => "disconnect",
            Self::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for ScenarioAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a scenario file: `action,subject,value`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScenarioStep {
    pub action: ScenarioAction,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl ScenarioStep {
    pub fn subject(&self) -> Result<&str> {
        self.subject
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BillingError::InvalidStep(format!("{} needs a subject", self.action)))
    }
}

/// Reads scenario steps from a CSV source, one lazily deserialized step per row.
pub struct ScenarioReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ScenarioReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .comment(Some(b'#'))
            .from_reader(source);
        Self { reader }
    }

    pub fn steps(self) -> impl Iterator<Item = Result<ScenarioStep>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(BillingError::from))
    }
}
