//! Topic parsing and tenant authorization.
//!
//! Topics have the shape `<domain>.<tenant_id>.<entity_id>.<event_type>`. A
//! client may use `*` for any whole segment except the tenant segment, which
//! must equal the session's tenant exactly.

use std::fmt;

use thiserror::Error;

use crate::connection_manager::Session;

pub const WILDCARD: &str = "*";

const SEGMENTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("topic must have the form <domain>.<tenant_id>.<entity_id>.<event_type>")]
    Malformed,

    #[error("topic segment {0:?} is not a valid pattern segment")]
    InvalidSegment(String),

    #[error("topic tenant must be given explicitly")]
    WildcardTenant,

    #[error("not authorized for tenant {0}")]
    ForeignTenant(String),
}

/// A parsed 4-segment topic or topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    pub domain: String,
    pub tenant_id: String,
    pub entity_id: String,
    pub event_type: String,
}

impl TopicPattern {
    pub fn parse(topic: &str) -> Result<Self, AuthorizationError> {
        let parts: Vec<&str> = topic.split('.').collect();
        if parts.len() != SEGMENTS {
            return Err(AuthorizationError::Malformed);
        }

        for part in &parts {
            validate_segment(part)?;
        }

        if parts[1] == WILDCARD {
            return Err(AuthorizationError::WildcardTenant);
        }

        Ok(Self {
            domain: parts[0].to_string(),
            tenant_id: parts[1].to_string(),
            entity_id: parts[2].to_string(),
            event_type: parts[3].to_string(),
        })
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.domain, self.tenant_id, self.entity_id, self.event_type
        )
    }
}

/// A segment is either `*` or a literal free of broker glob characters.
fn validate_segment(segment: &str) -> Result<(), AuthorizationError> {
    if segment.is_empty() {
        return Err(AuthorizationError::InvalidSegment(segment.to_string()));
    }
    if segment == WILDCARD {
        return Ok(());
    }
    if segment
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '\\') || c.is_whitespace())
    {
        return Err(AuthorizationError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

/// Parse `topic` and check that it is scoped to `tenant_id`.
pub fn authorize(tenant_id: &str, topic: &str) -> Result<TopicPattern, AuthorizationError> {
    let pattern = TopicPattern::parse(topic)?;
    if pattern.tenant_id != tenant_id {
        return Err(AuthorizationError::ForeignTenant(pattern.tenant_id));
    }
    Ok(pattern)
}

pub fn authorize_subscribe(session: &Session, topic: &str) -> bool {
    authorize(&session.tenant_id, topic).is_ok()
}
