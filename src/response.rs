// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The status envelope used by every externally-visible operation.
//!
//! Internally the agent works with typed results; the closed set of named
//! errors below is rendered into the wire envelope only at the RPC
//! boundary.

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

/// The well-known error names with their stable codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorName {
    NoVm,
    ImageErr,
    Unexpected,
    DestVolumeTooSmall,
    MergeErr,
    ReplicaErr,
    TransientErr,
    Recovery,
}

impl ErrorName {
    pub fn code(&self) -> i32 {
        match self {
            ErrorName::NoVm => 1,
            ErrorName::ImageErr => 13,
            ErrorName::Unexpected => 16,
            ErrorName::MergeErr => 52,
            ErrorName::ReplicaErr => 55,
            ErrorName::TransientErr => 59,
            ErrorName::DestVolumeTooSmall => 61,
            ErrorName::Recovery => 99,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorName::NoVm => "Virtual machine does not exist",
            ErrorName::ImageErr => "Drive image file could not be found",
            ErrorName::Unexpected => "Unexpected exception",
            ErrorName::MergeErr => "Merge failed",
            ErrorName::ReplicaErr => "Drive replication error",
            ErrorName::TransientErr => "Error in transient disk handling",
            ErrorName::DestVolumeTooSmall => "Destination volume is too small",
            ErrorName::Recovery => "Recovering from crash or initializing",
        }
    }

    pub fn status(&self) -> Status {
        Status {
            code: self.code(),
            message: self.message().to_string(),
        }
    }
}

pub fn success() -> Value {
    json!({"status": {"code": 0, "message": "Done"}})
}

/// Success envelope with extra top-level fields.
pub fn success_with(mut extra: serde_json::Map<String, Value>) -> Value {
    extra.insert(
        "status".to_string(),
        json!({"code": 0, "message": "Done"}),
    );
    Value::Object(extra)
}

pub fn error(name: ErrorName) -> Value {
    let status = name.status();
    json!({"status": {"code": status.code, "message": status.message}})
}

pub fn error_with_message(name: ErrorName, message: impl Into<String>) -> Value {
    json!({"status": {"code": name.code(), "message": message.into()}})
}

/// Whether an envelope carries an error status. A malformed envelope is an
/// error too.
pub fn is_error(response: &Value) -> bool {
    response
        .get("status")
        .and_then(|status| status.get("code"))
        .and_then(Value::as_i64)
        .map(|code| code != 0)
        .unwrap_or(true)
}
