//! Version conflict detection

/// Check whether the stored version has moved past the version the client
/// last saw.
///
/// Equal versions are no conflict. A client-ahead version is also treated
/// as no conflict; it should not occur with a well-behaved client.
pub fn has_conflict(current_version: i64, client_version: i64) -> bool {
    current_version > client_version
}
