//! Dependency handles of a node.
//!
//! A node declares its inputs as a value implementing [`Dependencies`]:
//! nothing (`()`), a single node, or a tuple of up to four handles. Tuple
//! members resolve concurrently; the tuple completes only when every member
//! has, and fails fast on the first error.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::{Error, Result};

use super::{Neuron, Resolver};

/// A set of dependency handles producing the input of an evaluator.
pub trait Dependencies: Send + Sync + 'static {
    /// The resolved input tuple
    type Output: Send + 'static;

    /// Resolve every handle, each under its own healing loop
    fn resolve(&self, resolver: &Resolver) -> BoxFuture<'static, Result<Self::Output>>;
}

impl Dependencies for () {
    type Output = ();

    fn resolve(&self, _resolver: &Resolver) -> BoxFuture<'static, Result<()>> {
        future::ok(()).boxed()
    }
}

impl<I, O> Dependencies for Arc<Neuron<I, O>>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    type Output = O;

    fn resolve(&self, resolver: &Resolver) -> BoxFuture<'static, Result<O>> {
        let node = Arc::clone(self);
        let resolver = resolver.clone();
        async move {
            node.get_with_healing(&resolver)
                .await
                .map_err(|e| Error::Dependency {
                    node: node.name().to_string(),
                    cause: Arc::new(e),
                })
        }
        .boxed()
    }
}

macro_rules! tuple_dependencies {
    ($($dep:ident => $fut:ident),+) => {
        impl<$($dep: Dependencies),+> Dependencies for ($($dep,)+) {
            type Output = ($($dep::Output,)+);

            fn resolve(&self, resolver: &Resolver) -> BoxFuture<'static, Result<Self::Output>> {
                let ($($fut,)+) = self;
                $(let $fut = $fut.resolve(resolver);)+
                async move { futures::try_join!($($fut),+) }.boxed()
            }
        }
    };
}

impl<A: Dependencies> Dependencies for (A,) {
    type Output = (A::Output,);

    fn resolve(&self, resolver: &Resolver) -> BoxFuture<'static, Result<Self::Output>> {
        self.0.resolve(resolver).map(|r| r.map(|a| (a,))).boxed()
    }
}

tuple_dependencies!(A => a, B => b);
tuple_dependencies!(A => a, B => b, C => c);
tuple_dependencies!(A => a, B => b, C => c, D => d);
