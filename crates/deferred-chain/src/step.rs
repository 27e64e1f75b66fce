use crate::chain::DeferredChain;

/// What a continuation hands to the next link of the chain.
///
/// A plain [`Step::Value`] resolves the next chain directly. A
/// [`Step::Chain`] makes the next chain adopt that chain's eventual value,
/// so chains never nest.
pub enum Step<U> {
    Value(U),
    Chain(DeferredChain<U>),
}

impl<U> From<DeferredChain<U>> for Step<U> {
    fn from(chain: DeferredChain<U>) -> Self {
        Step::Chain(chain)
    }
}

impl<U: std::fmt::Debug> std::fmt::Debug for Step<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Step::Chain(_) => f.write_str("Chain(..)"),
        }
    }
}
