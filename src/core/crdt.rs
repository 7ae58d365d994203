//! The algebraic contract every stored state satisfies.

use super::Stamp;

/// A state with a commutative, associative, idempotent merge.
///
/// `join` must satisfy, for all `a`, `b`, `c`:
/// - `join(a, b) == join(b, a)`
/// - `join(a, join(b, c)) == join(join(a, b), c)`
/// - `join(a, a) == a`
///
/// `extract` projects the state onto what is visible at or after `since`;
/// `None` means nothing of the state remains visible and the key should not
/// be observed. `extract(_, None)` returns the full live state.
pub trait Crdt: Clone + Send + 'static {
    fn join(a: Self, b: Self) -> Self;

    fn extract(&self, since: Option<Stamp>) -> Option<Self>;
}
