//! Bidirectional byte splice between two streams.

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};

/// Bytes moved by a finished splice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    /// Bytes read from `a` and written to `b`.
    pub a_to_b: u64,
    /// Bytes read from `b` and written to `a`.
    pub b_to_a: u64,
}

/// Splice `a` and `b` until both directions reached EOF.
///
/// Each direction half-closes its destination at EOF. The first error
/// aborts both; the streams are closed when dropped here.
pub async fn splice<A, B>(mut a: A, mut b: B) -> std::io::Result<SpliceStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_to_b, b_to_a) = copy_bidirectional(&mut a, &mut b).await?;
    Ok(SpliceStats { a_to_b, b_to_a })
}
