//! Desired-state derivation: workload labels/annotations -> dependents.

use crate::{
    DesiredIngress, DesiredService, WorkloadRef, WorkloadSnapshot, HOST_ANNOTATION, PATH_ANNOTATION, PORT_LABEL,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DerivationError {
    #[error("label {label} has invalid port {value:?}: {reason}")]
    InvalidPort { label: &'static str, value: String, reason: &'static str },
}

/// Result of one derivation pass. Both branches are evaluated independently;
/// `errors` lists what kept a branch from producing a spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Derived {
    pub service: Option<DesiredService>,
    pub ingress: Option<DesiredIngress>,
    pub errors: Vec<DerivationError>,
}

impl Derived {
    pub fn is_empty(&self) -> bool { self.service.is_none() && self.ingress.is_none() }
}

pub fn derive(workload: &WorkloadRef, snapshot: &WorkloadSnapshot) -> Derived {
    let mut out = Derived::default();

    let port = match snapshot.label(PORT_LABEL).map(parse_port) {
        None => None,
        Some(Ok(p)) => Some(p),
        Some(Err(e)) => {
            out.errors.push(e);
            None
        }
    };

    if let Some(port) = port {
        out.service = Some(DesiredService {
            name: workload.service_name(),
            namespace: workload.namespace.clone(),
            selector_labels: snapshot.labels.clone(),
            port,
        });
    }

    // Host, path and a usable port must all be present.
    if let (Some(host), Some(path), Some(port)) =
        (snapshot.annotation(HOST_ANNOTATION), snapshot.annotation(PATH_ANNOTATION), port)
    {
        out.ingress = Some(DesiredIngress {
            name: workload.ingress_name(),
            namespace: workload.namespace.clone(),
            host: host.to_string(),
            path_prefix: path.to_string(),
            backend_service_name: workload.service_name(),
            backend_port: port,
        });
    }

    out
}

/// Parse a port label value as a 32-bit integer literal.
///
/// Accepts an optional sign followed by decimal digits or a `0x`, `0o`,
/// `0b` (or bare leading `0` octal) prefixed literal. Single underscores may
/// separate digits, and may follow a base prefix.
pub fn parse_port(raw: &str) -> Result<i32, DerivationError> {
    let invalid = |reason| DerivationError::InvalidPort { label: PORT_LABEL, value: raw.to_string(), reason };

    let (negative, body) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };
    let (radix, prefixed, digits) = if let Some(d) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        (16, true, d)
    } else if let Some(d) = body.strip_prefix("0o").or_else(|| body.strip_prefix("0O")) {
        (8, true, d)
    } else if let Some(d) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        (2, true, d)
    } else if body.len() > 1 && body.starts_with('0') {
        (8, true, &body[1..])
    } else {
        (10, false, body)
    };

    if digits.is_empty() {
        return Err(invalid("no digits"));
    }
    if !digits.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(invalid("not an integer"));
    }
    if digits.ends_with('_') || digits.contains("__") || (!prefixed && digits.starts_with('_')) {
        return Err(invalid("misplaced digit separator"));
    }
    let digits: String = digits.chars().filter(|&c| c != '_').collect();
    let magnitude = i64::from_str_radix(&digits, radix).map_err(|_| invalid("not an integer"))?;
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).map_err(|_| invalid("out of 32-bit range"))
}
