/*
 * Copyright (C) 2024 The Policycore Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Group, version, and kind of a watched policy resource.
///
/// The textual form is `group/version/Kind`; resources in the core group are
/// written as `version/Kind`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchedKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl WatchedKind {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Returns `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindParseError {
    Empty,
    Malformed(String),
}

impl fmt::Display for KindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindParseError::Empty => write!(f, "resource kind must not be empty"),
            KindParseError::Malformed(value) => write!(
                f,
                "invalid resource kind '{value}', expected group/version/Kind or version/Kind"
            ),
        }
    }
}

impl std::error::Error for KindParseError {}

impl FromStr for WatchedKind {
    type Err = KindParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(KindParseError::Empty);
        }

        let parts: Vec<&str> = value.split('/').collect();
        if parts.iter().any(|part| part.trim().is_empty()) {
            return Err(KindParseError::Malformed(value.to_string()));
        }

        match parts.as_slice() {
            [version, kind] => Ok(WatchedKind::new("", *version, *kind)),
            [group, version, kind] => Ok(WatchedKind::new(*group, *version, *kind)),
            _ => Err(KindParseError::Malformed(value.to_string())),
        }
    }
}

/// Identity of one exported series: the policy kind, its namespace, and its
/// name. Cluster-scoped policies carry an empty namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: &WatchedKind, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Label values in the order the compliance gauge declares its labels:
    /// `policy_kind`, `policy_name`, `policy_namespace`.
    pub fn label_values(&self) -> [&str; 3] {
        [&self.kind, &self.name, &self.namespace]
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Literal values a policy reports in `status.compliant`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    UnknownCompliancy,
}

impl ComplianceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceState::Compliant => "Compliant",
            ComplianceState::NonCompliant => "NonCompliant",
            ComplianceState::UnknownCompliancy => "UnknownCompliancy",
        }
    }

    /// Matches the literal exactly; any other spelling is not a state.
    pub fn from_literal(value: &str) -> Option<Self> {
        match value {
            "Compliant" => Some(ComplianceState::Compliant),
            "NonCompliant" => Some(ComplianceState::NonCompliant),
            "UnknownCompliancy" => Some(ComplianceState::UnknownCompliancy),
            _ => None,
        }
    }
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compliance as exported on the gauge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComplianceCode {
    Compliant,
    NonCompliant,
    Unknown,
}

impl ComplianceCode {
    /// Gauge encoding consumed by dashboards and alerts; these values are fixed.
    pub fn metric_value(self) -> i64 {
        match self {
            ComplianceCode::Compliant => 0,
            ComplianceCode::NonCompliant => 1,
            ComplianceCode::Unknown => 2,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            ComplianceCode::Compliant => "Compliant",
            ComplianceCode::NonCompliant => "NonCompliant",
            ComplianceCode::Unknown => "UnknownCompliancy",
        }
    }
}

impl From<ComplianceState> for ComplianceCode {
    fn from(state: ComplianceState) -> Self {
        match state {
            ComplianceState::Compliant => ComplianceCode::Compliant,
            ComplianceState::NonCompliant => ComplianceCode::NonCompliant,
            ComplianceState::UnknownCompliancy => ComplianceCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grouped_and_core_kinds() {
        let grouped: WatchedKind = "policy.open-cluster-management.io/v1/ConfigurationPolicy"
            .parse()
            .expect("grouped kind");
        assert_eq!(grouped.group, "policy.open-cluster-management.io");
        assert_eq!(grouped.version, "v1");
        assert_eq!(grouped.kind, "ConfigurationPolicy");
        assert_eq!(
            grouped.to_string(),
            "policy.open-cluster-management.io/v1/ConfigurationPolicy"
        );

        let core: WatchedKind = "v1/ConfigMap".parse().expect("core kind");
        assert!(core.group.is_empty());
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.to_string(), "v1/ConfigMap");
    }

    #[test]
    fn rejects_malformed_kinds() {
        assert_eq!("".parse::<WatchedKind>(), Err(KindParseError::Empty));
        assert!(matches!(
            "PolicyKindA".parse::<WatchedKind>(),
            Err(KindParseError::Malformed(_))
        ));
        assert!(matches!(
            "a/b/c/d".parse::<WatchedKind>(),
            Err(KindParseError::Malformed(_))
        ));
        assert!(matches!(
            "group//Kind".parse::<WatchedKind>(),
            Err(KindParseError::Malformed(_))
        ));
    }

    #[test]
    fn label_values_follow_gauge_label_order() {
        let kind = WatchedKind::new("policy.example.io", "v1", "PolicyKindA");
        let key = ResourceKey::new(&kind, "ns1", "p1");
        assert_eq!(key.label_values(), ["PolicyKindA", "p1", "ns1"]);
        assert_eq!(key.to_string(), "PolicyKindA/ns1/p1");
    }

    #[test]
    fn metric_encoding_is_stable() {
        assert_eq!(ComplianceCode::Compliant.metric_value(), 0);
        assert_eq!(ComplianceCode::NonCompliant.metric_value(), 1);
        assert_eq!(ComplianceCode::Unknown.metric_value(), 2);
        assert_eq!(
            ComplianceCode::from(ComplianceState::UnknownCompliancy),
            ComplianceCode::Unknown
        );
    }
}
