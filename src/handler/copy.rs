//! Bidirectional byte pump between the local and upstream sockets. Replaces
//! the source's manually-polled transfer loop (and this crate's own
//! futures-0.1-era `BufferedTransfer`, dropped per the spec's redesign
//! notes) with `tokio::io::copy_bidirectional`: no timeouts, termination of
//! either direction ends the whole pump.

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// Runs until either side closes or errors. The caller is responsible for
/// deregistering the handler afterward regardless of the outcome.
pub async fn pump<A, B>(local: &mut A, remote: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    copy_bidirectional(local, remote).await.map_err(Error::from)
}
