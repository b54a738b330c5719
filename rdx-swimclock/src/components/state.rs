//! Schedulable functions and the states a runner keeps for them.

use crate::args::{Args, Value};
use crate::common::StateId;
use crate::components::context::SwimCtx;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// The keyword that carries a function's period, in beats.
pub const PERIOD_PARAM: &str = "p";
/// Period used when a function is called without one.
pub const DEFAULT_PERIOD: f64 = 1.0;

/// The async body of a [`SwimFn`].
pub type SwimBody = Arc<dyn Fn(SwimCtx) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A declared keyword parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// `None` makes the parameter required.
    pub default: Option<Value>,
}

/// A named async function that a runner calls once per iteration.
///
/// The declared parameters play the role of a signature: binding fills in
/// defaults and drops keywords that are not declared, so a function whose
/// signature shrank between two edits can still be called with the arguments
/// of its previous version.
#[derive(Clone)]
pub struct SwimFn {
    name: String,
    params: Vec<Param>,
    catch_all: bool,
    body: SwimBody,
}

impl SwimFn {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(SwimCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            params: Vec::new(),
            catch_all: false,
            body: Arc::new(move |ctx| body(ctx).boxed()),
        }
    }

    /// Declares a keyword parameter with a default value.
    pub fn param(self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.declare(name.into(), Some(default.into()))
    }

    /// Declares a keyword parameter that every call must supply.
    pub fn required(self, name: impl Into<String>) -> Self {
        self.declare(name.into(), None)
    }

    /// Keeps undeclared keywords when binding instead of dropping them.
    pub fn catch_all(mut self) -> Self {
        self.catch_all = true;
        self
    }

    fn declare(mut self, name: String, default: Option<Value>) -> Self {
        self.params.retain(|param| param.name != name);
        self.params.push(Param { name, default });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Checks that the function can be scheduled: its name must be an identifier.
    pub fn validate(&self) -> Result<()> {
        let mut chars = self.name.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_alphabetic() || first == '_')
                    && chars.all(|c| c.is_alphanumeric() || c == '_')
            }
            None => false,
        };
        if valid {
            Ok(())
        } else {
            Err(Error::BadFunction(self.name.clone()))
        }
    }

    /// Binds call arguments to the declared parameters.
    pub fn bind(&self, args: &Args) -> Result<Args> {
        let mut bound = if self.catch_all {
            args.clone()
        } else {
            Args::new()
        };
        for param in &self.params {
            match (args.get(&param.name), &param.default) {
                (Some(value), _) | (None, Some(value)) => {
                    bound.insert(param.name.clone(), value.clone());
                }
                (None, None) => {
                    return Err(Error::BadArgument {
                        function: self.name.clone(),
                        reason: format!("missing required keyword argument `{}`", param.name),
                    });
                }
            }
        }
        Ok(bound)
    }

    pub(crate) fn call(&self, ctx: SwimCtx) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.body)(ctx)
    }
}

impl fmt::Debug for SwimFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwimFn")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("catch_all", &self.catch_all)
            .finish_non_exhaustive()
    }
}

/// Reads the period of one call, in beats.
///
/// The bound arguments are checked first, then the raw call arguments, so that a
/// function may take `p` without declaring it.
pub(crate) fn period_of(function: &str, bound: &Args, raw: &Args) -> Result<f64> {
    let Some(value) = bound.get(PERIOD_PARAM).or_else(|| raw.get(PERIOD_PARAM)) else {
        return Ok(DEFAULT_PERIOD);
    };
    let bad = |reason: String| Error::BadPeriod {
        function: function.to_string(),
        reason,
    };
    match value.as_f64() {
        Some(period) if period.is_finite() && period > 0.0 => Ok(period),
        Some(period) => Err(bad(format!(
            "period must be a positive number of beats, got {period}"
        ))),
        None => Err(bad(format!("period must be numeric, got {value}"))),
    }
}

/// A function together with the arguments it will be called with.
#[derive(Debug, Clone)]
pub struct FunctionState {
    pub id: StateId,
    pub func: SwimFn,
    pub args: Args,
}

impl FunctionState {
    pub fn new(func: SwimFn, args: Args) -> Self {
        Self {
            id: StateId::next(),
            func,
            args,
        }
    }
}

/// A state waiting in a runner's queue for its deadline.
///
/// Ordered so that a `BinaryHeap` pops the earliest deadline first, and among
/// equal deadlines the one pushed first.
#[derive(Debug, Clone)]
pub struct DeferredState {
    pub deadline: f64,
    pub index: u64,
    pub state: FunctionState,
}

impl PartialEq for DeferredState {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DeferredState {}

impl PartialOrd for DeferredState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeferredState {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .total_cmp(&self.deadline)
            .then_with(|| other.index.cmp(&self.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use std::collections::BinaryHeap;

    fn noop(name: &str) -> SwimFn {
        SwimFn::new(name, |_ctx| async { Ok(()) })
    }

    #[test]
    fn names_must_be_identifiers() {
        assert!(noop("kick").validate().is_ok());
        assert!(noop("_hat2").validate().is_ok());
        for bad in ["", "2kick", "kick drum", "<lambda>"] {
            assert!(matches!(noop(bad).validate(), Err(Error::BadFunction(_))));
        }
    }

    #[test]
    fn bind_fills_defaults_and_drops_undeclared_keywords() {
        let func = noop("bass").param("p", 0.5).param("note", 40).required("vel");
        let bound = func.bind(&args! { vel => 90, cutoff => 800 }).unwrap();
        assert_eq!(bound, args! { p => 0.5, note => 40, vel => 90 });

        let err = func.bind(&args! { note => 42 }).unwrap_err();
        assert!(matches!(err, Error::BadArgument { .. }));

        let open = noop("fx").param("p", 1).catch_all();
        assert_eq!(
            open.bind(&args! { cutoff => 800 }).unwrap(),
            args! { p => 1, cutoff => 800 }
        );
    }

    #[test]
    fn redeclaring_a_parameter_replaces_it() {
        let func = noop("lead").param("p", 1).param("p", 0.25);
        assert_eq!(func.params().len(), 1);
        assert_eq!(func.bind(&args! {}).unwrap(), args! { p => 0.25 });
    }

    #[test]
    fn period_defaults_and_validation() {
        assert_eq!(period_of("f", &args! {}, &args! {}).unwrap(), DEFAULT_PERIOD);
        assert_eq!(period_of("f", &args! {}, &args! { p => 2 }).unwrap(), 2.0);
        assert_eq!(period_of("f", &args! { p => 0.5 }, &args! { p => 2 }).unwrap(), 0.5);
        for bad in [args! { p => 0 }, args! { p => -1.0 }, args! { p => "fast" }] {
            assert!(matches!(
                period_of("f", &bad, &args! {}),
                Err(Error::BadPeriod { .. })
            ));
        }
        assert!(period_of("f", &args! { p => f64::NAN }, &args! {}).is_err());
    }

    #[test]
    fn deferred_heap_pops_earliest_then_first_pushed() {
        let mut heap = BinaryHeap::new();
        for (index, deadline) in [(0, 2.0), (1, 1.0), (2, 2.0), (3, 0.5)] {
            heap.push(DeferredState {
                deadline,
                index,
                state: FunctionState::new(noop("f"), args! {}),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|d| d.index)).collect();
        assert_eq!(order, vec![3, 1, 0, 2]);
    }
}
