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

//! Mapping from a policy's free-form status to the exported compliance code.
//!
//! The mapping is total: whatever shape the status has, a code comes out.
//! Anything that is not exactly `Compliant` or `NonCompliant` in
//! `status.compliant` is reported as unknown, including the explicit
//! `UnknownCompliancy` literal.

use serde_json::Value;

use crate::policycore::api::types::{ComplianceCode, ComplianceState};

const STATUS_FIELD: &str = "status";
const COMPLIANT_FIELD: &str = "compliant";

/// Returns the `status` sub-document of a resource when it is an object.
pub fn status_payload(object: &Value) -> Option<&Value> {
    object.get(STATUS_FIELD).filter(|status| status.is_object())
}

/// Returns the raw `status.compliant` string, if there is one.
pub fn compliance_literal(status: Option<&Value>) -> Option<&str> {
    status?.get(COMPLIANT_FIELD)?.as_str()
}

pub fn map_status(status: Option<&Value>) -> ComplianceCode {
    compliance_literal(status)
        .and_then(ComplianceState::from_literal)
        .map(ComplianceCode::from)
        .unwrap_or(ComplianceCode::Unknown)
}

/// Maps a whole resource object.
pub fn map_object(object: &Value) -> ComplianceCode {
    map_status(status_payload(object))
}
