//! Inbound identity enforcement.
//!
//! Validates that an inbound message's claimed entity identity matches an
//! independently derived identity, preventing identity spoofing. The rule
//! is scoped to a single message; a violation never touches the live
//! session.

use crate::connections::model::Enforcement;
use crate::protocol::error::GatewayError;
use crate::routing::placeholder::PlaceholderResolver;

/// A filter template may end in `*` to accept any suffix.
fn filter_matches(filter: &str, claim: &str) -> bool {
    match filter.strip_suffix('*') {
        Some(prefix) => claim.starts_with(prefix),
        None => filter == claim,
    }
}

/// Check a claimed identity against the rule's filters.
///
/// `claim_resolver` resolves the `input` template (wire headers);
/// `identity_resolver` resolves the filter templates (thing identity,
/// topic) for the signal the message mapped to.
pub fn enforce(
    enforcement: &Enforcement,
    claim_resolver: &PlaceholderResolver<'_>,
    identity_resolver: &PlaceholderResolver<'_>,
) -> Result<(), GatewayError> {
    let claim = claim_resolver.resolve(&enforcement.input)?;
    for filter in &enforcement.filters {
        let derived = identity_resolver.resolve(filter)?;
        if filter_matches(&derived, &claim) {
            return Ok(());
        }
    }
    Err(GatewayError::enforcement_rejected(&claim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::signal::EntityId;
    use crate::routing::placeholder::{HeaderSource, ThingSource};
    use std::collections::BTreeMap;

    fn rule() -> Enforcement {
        Enforcement {
            input: "{{ header:device-id }}".to_string(),
            filters: vec!["{{ thing:id }}".to_string()],
        }
    }

    #[test]
    fn test_matching_identity_passes() {
        let mut headers = BTreeMap::new();
        headers.insert("device-id".to_string(), "org.acme:device-7".to_string());
        let header_src = HeaderSource::new(&headers);
        let claim = PlaceholderResolver::new().with_source(&header_src);

        let id = EntityId::new("org.acme", "device-7");
        let thing_src = ThingSource::new(&id);
        let identity = PlaceholderResolver::new().with_source(&thing_src);

        assert!(enforce(&rule(), &claim, &identity).is_ok());
    }

    #[test]
    fn test_spoofed_identity_rejected() {
        let mut headers = BTreeMap::new();
        headers.insert("device-id".to_string(), "org.evil:device-7".to_string());
        let header_src = HeaderSource::new(&headers);
        let claim = PlaceholderResolver::new().with_source(&header_src);

        let id = EntityId::new("org.acme", "device-7");
        let thing_src = ThingSource::new(&id);
        let identity = PlaceholderResolver::new().with_source(&thing_src);

        let err = enforce(&rule(), &claim, &identity).unwrap_err();
        assert_eq!(err.code, "connectivity:connection.id.enforcement.failed");
    }

    #[test]
    fn test_wildcard_filter() {
        let mut headers = BTreeMap::new();
        headers.insert("device-id".to_string(), "org.acme:device-7".to_string());
        let header_src = HeaderSource::new(&headers);
        let claim = PlaceholderResolver::new().with_source(&header_src);

        let rule = Enforcement {
            input: "{{ header:device-id }}".to_string(),
            filters: vec!["org.acme:*".to_string()],
        };
        let identity = PlaceholderResolver::new();
        assert!(enforce(&rule, &claim, &identity).is_ok());
    }
}
