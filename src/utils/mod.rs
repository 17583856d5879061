pub(crate) mod bits;
pub(crate) use bits::BitSet;

pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;
