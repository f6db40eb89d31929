//! Database readiness detection.
//!
//! A freshly started database container reports "not ready" only through
//! the client's stderr: until the server accepts connections, the client
//! fails with a connection-refused exception. There is no signal for
//! "ready", so queries are retried until the exception disappears.

const CONNECTION_REFUSED: &str = "NetException: Connection refused";

/// Whether the database instance accepted the query, judging by the
/// client's stderr.
pub fn query_accepted(stderr: &str) -> bool {
    !stderr.contains(CONNECTION_REFUSED)
}
