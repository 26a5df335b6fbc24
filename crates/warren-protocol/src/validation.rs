//! Validation for payloads received from peers. Every object coming off the
//! wire is validated before it reaches the store.

use crate::types::{Group, Location, Payload, Post, PublicIdentity, PullRequest};
use thiserror::Error;

/// Upper bound on free-text fields, matching the store's column limits.
const MAX_TEXT_LEN: usize = 64 * 1024;

const MAX_GROUP_MEMBERS: usize = 256;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("field too long: {0}")]
    TooLong(&'static str),

    #[error("group has {0} members (max {MAX_GROUP_MEMBERS})")]
    TooManyMembers(usize),

    #[error("coordinate out of range: {0}")]
    CoordinateOutOfRange(&'static str),

    #[error("negative sequence number")]
    NegativeSequenceNumber,
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if value.len() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong(field));
    }
    Ok(())
}

pub fn validate_identity(identity: &PublicIdentity) -> Result<(), ValidationError> {
    require("id", identity.id.as_str())?;
    require("nickname", &identity.nickname)?;
    require("x509_certificate", &identity.x509_certificate)?;
    require("hidden_service_hostname", &identity.hidden_service_hostname)?;
    Ok(())
}

pub fn validate_group(group: &Group) -> Result<(), ValidationError> {
    require("group.id", &group.id)?;
    require("group.name", &group.name)?;
    if group.members.len() > MAX_GROUP_MEMBERS {
        return Err(ValidationError::TooManyMembers(group.members.len()));
    }
    for member in &group.members {
        validate_identity(member)?;
    }
    if group.sequence_number < 0 {
        return Err(ValidationError::NegativeSequenceNumber);
    }
    Ok(())
}

pub fn validate_post(post: &Post) -> Result<(), ValidationError> {
    require("post.id", &post.id)?;
    require("post.group_id", &post.group_id)?;
    if post.content.len() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong("post.content"));
    }
    for attachment in &post.attachments {
        require("attachment.resource_id", &attachment.resource_id)?;
        require("attachment.mime_type", &attachment.mime_type)?;
    }
    if post.sequence_number < 0 {
        return Err(ValidationError::NegativeSequenceNumber);
    }
    Ok(())
}

pub fn validate_location(location: &Location) -> Result<(), ValidationError> {
    if !(-90.0..=90.0).contains(&location.latitude) {
        return Err(ValidationError::CoordinateOutOfRange("latitude"));
    }
    if !(-180.0..=180.0).contains(&location.longitude) {
        return Err(ValidationError::CoordinateOutOfRange("longitude"));
    }
    if location.street_address.len() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong("location.street_address"));
    }
    Ok(())
}

pub fn validate_pull_request(request: &PullRequest) -> Result<(), ValidationError> {
    if request.last_received_sequence_number < 0 {
        return Err(ValidationError::NegativeSequenceNumber);
    }
    Ok(())
}

/// Validate a payload according to its variant.
pub fn validate_payload(payload: &Payload) -> Result<(), ValidationError> {
    match payload {
        Payload::Group(group) => validate_group(group),
        Payload::Post(post) => validate_post(post),
        Payload::Location(location) => validate_location(location),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_location() -> Location {
        Location {
            timestamp: Utc::now(),
            latitude: 48.86,
            longitude: 2.35,
            street_address: "somewhere".into(),
        }
    }

    #[test]
    fn accepts_valid_location() {
        assert!(validate_location(&sample_location()).is_ok());
    }

    #[test]
    fn rejects_out_of_range_latitude() {
        let mut location = sample_location();
        location.latitude = 91.0;
        assert!(matches!(
            validate_location(&location),
            Err(ValidationError::CoordinateOutOfRange("latitude"))
        ));
    }

    #[test]
    fn rejects_empty_group_id() {
        let group = Group {
            id: String::new(),
            name: "n".into(),
            members: vec![],
            sequence_number: 0,
            modified_timestamp: Utc::now(),
        };
        assert!(matches!(
            validate_group(&group),
            Err(ValidationError::MissingField("group.id"))
        ));
    }

    #[test]
    fn rejects_negative_pull_cursor() {
        let request = PullRequest {
            last_received_sequence_number: -1,
            want_reciprocal: false,
        };
        assert!(validate_pull_request(&request).is_err());
    }
}
