// Copyright 2017 PingCAP, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! The closed status-code enumeration every terminal call outcome maps to,
//! and the transport-code-to-`StatusCode` translation described in spec §6.

use std::fmt;

/// Public, closed status code enumeration.
///
/// A call's terminal `code` is always one of these; transport-native codes
/// outside this set collapse to [`StatusCode::Unknown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// The raw wire value grpc uses for this code, mirroring the transport's
    /// own numbering so round-tripping through [`from_transport_code`] is
    /// lossless for recognised codes.
    pub fn code(self) -> u32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::Unknown => 2,
            StatusCode::InvalidArgument => 3,
            StatusCode::DeadlineExceeded => 4,
            StatusCode::NotFound => 5,
            StatusCode::AlreadyExists => 6,
            StatusCode::PermissionDenied => 7,
            StatusCode::ResourceExhausted => 8,
            StatusCode::FailedPrecondition => 9,
            StatusCode::Aborted => 10,
            StatusCode::OutOfRange => 11,
            StatusCode::Unimplemented => 12,
            StatusCode::Internal => 13,
            StatusCode::Unavailable => 14,
            StatusCode::DataLoss => 15,
            StatusCode::Unauthenticated => 16,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Translate a transport-native status code into the closed enumeration.
///
/// Unrecognised codes map to `Unknown` and the details string is rewritten
/// to surface the original numeric code, per spec §6.
pub fn map_transport_status(raw_code: u32, details: &str) -> (StatusCode, String) {
    let code = match raw_code {
        0 => StatusCode::Ok,
        1 => StatusCode::Cancelled,
        2 => StatusCode::Unknown,
        3 => StatusCode::InvalidArgument,
        4 => StatusCode::DeadlineExceeded,
        5 => StatusCode::NotFound,
        6 => StatusCode::AlreadyExists,
        7 => StatusCode::PermissionDenied,
        8 => StatusCode::ResourceExhausted,
        9 => StatusCode::FailedPrecondition,
        10 => StatusCode::Aborted,
        11 => StatusCode::OutOfRange,
        12 => StatusCode::Unimplemented,
        13 => StatusCode::Internal,
        14 => StatusCode::Unavailable,
        15 => StatusCode::DataLoss,
        16 => StatusCode::Unauthenticated,
        _ => {
            return (
                StatusCode::Unknown,
                format!(
                    "Server sent unknown code {} and details {}",
                    raw_code, details
                ),
            );
        }
    };
    (code, details.to_owned())
}

/// Terminal status of a call, as observed by the caller.
#[derive(Clone, Debug)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub details: String,
    pub debug_error_string: Option<String>,
}

impl RpcStatus {
    pub fn ok() -> RpcStatus {
        RpcStatus {
            code: StatusCode::Ok,
            details: String::new(),
            debug_error_string: None,
        }
    }

    pub fn new(code: StatusCode, details: impl Into<String>) -> RpcStatus {
        RpcStatus {
            code,
            details: details.into(),
            debug_error_string: None,
        }
    }

    pub fn with_debug_error_string(mut self, debug_error_string: impl Into<String>) -> RpcStatus {
        self.debug_error_string = Some(debug_error_string.into());
        self
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.details)
    }
}
