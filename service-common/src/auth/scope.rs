//! Scope matching.
//!
//! Scopes are `resource:action` strings. A granted `*` satisfies anything and
//! a granted `resource:*` satisfies every action on `resource`.

/// Universal scope.
pub const WILDCARD: &str = "*";

/// Whether `granted` satisfies `required`.
///
/// An empty `required` is always satisfied.
///
/// # Examples
///
/// ```
/// use service_common::auth::has_scope;
///
/// let granted = vec!["notifications:*".to_string()];
/// assert!(has_scope(&granted, "notifications:send"));
/// assert!(!has_scope(&granted, "users:read"));
/// ```
#[must_use]
pub fn has_scope<S: AsRef<str>>(granted: &[S], required: &str) -> bool {
    if required.is_empty() {
        return true;
    }
    let resource_wildcard = resource_wildcard(required);

    granted.iter().map(AsRef::as_ref).any(|scope| {
        scope == WILDCARD
            || scope == required
            || resource_wildcard.as_deref().is_some_and(|wildcard| scope == wildcard)
    })
}

/// `resource:*` for a well-formed `resource:action`, `None` otherwise.
fn resource_wildcard(required: &str) -> Option<String> {
    let mut parts = required.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(resource), Some(_), None) => Some(format!("{resource}:*")),
        _ => None,
    }
}
