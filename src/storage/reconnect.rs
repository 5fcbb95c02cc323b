//! Liveness probe + one reconnect retry for connection-backed adapters

use tracing::warn;

use crate::{Error, Result};

/// A connection that can be probed and re-established.
pub trait Reconnect {
    /// Cheap round trip to the server.
    fn is_alive(&mut self) -> bool;

    /// Drop the current connection and open a new one.
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be reached.
    fn reconnect(&mut self) -> Result<()>;
}

/// Run `op` over `conn`, probing liveness first.
///
/// A dead connection is re-established before the operation. If the
/// operation itself reports [`Error::ConnectionLost`], the connection is
/// re-established and the operation retried exactly once. Failing to
/// reconnect, or losing the connection again, is [`Error::StorageFatal`].
///
/// # Errors
///
/// Returns the operation's own error, or [`Error::StorageFatal`].
pub fn with_reconnect<C, T, F>(conn: &mut C, what: &str, mut op: F) -> Result<T>
where
    C: Reconnect + ?Sized,
    F: FnMut(&mut C) -> Result<T>,
{
    if !conn.is_alive() {
        warn!(operation = what, "storage connection is dead, reconnecting");
        conn.reconnect().map_err(|err| fatal(what, &err))?;
    }

    match op(conn) {
        Err(err) if err.is_connection_lost() => {
            warn!(operation = what, error = %err, "connection lost mid-operation, retrying once");
            conn.reconnect().map_err(|err| fatal(what, &err))?;
            op(conn).map_err(|err| {
                if err.is_connection_lost() {
                    fatal(what, &err)
                } else {
                    err
                }
            })
        }
        other => other,
    }
}

fn fatal(what: &str, err: &Error) -> Error {
    Error::StorageFatal(format!("{what}: {err}"))
}
