//! Predicate queries over snapshots.
//!
//! A query compiles a predicate string such as
//! `tag('people') && !complete && nextCount > 2`, builds one flat
//! [`QueryRecord`] per subscription in a snapshot, keeps every stream with
//! at least one matching subscription and orders the kept streams by the
//! order-by clause (`"age asc"` unless given).
//!
//! ## Record fields
//!
//! Identities: `observableId`, `subscriberId`, `subscriptionId`, `kind`.
//! Lifecycle: `subscribeAge`, `nextAge`, `completeAge`, `errorAge`,
//! `unsubscribeAge` (seconds, undefined until the event happened),
//! `complete`, `error`, `unsubscribed`, `incomplete`, `nextCount`,
//! `frequency`. Graph: `depth`, `root`, `leaf`, `flattened`, `sink`,
//! `rootSink`, `sourceCount`, `flatteningCount`, `sourceNextAge`,
//! `innerNextAge`, `innerNextCount`, `innerIncompleteCount`. Derived: `age`
//! (most recent activity) and `blocking` (sources emitted more recently than
//! the subscription itself).
//!
//! Matchers are called like functions: `tag()`, `tag('x')`, `tag(/^x/)`,
//! `id(42)`, `file('people.rs')`, `func(/load/)`, `pipeline('source')`.
//! Fields written by plugins into the snapshot's query extension (e.g.
//! `cycles`) and custom derivations are looked up the same way.

mod compiler;
mod executor;
mod lexer;
mod record;
mod value;

pub use compiler::{compile, compile_order_by, Expression, Lookup, OrderBy, MAX_NESTING};
pub use executor::{
    run, Derivation, QueryMatch, QueryRequest, QueryResult, DEFAULT_LIMIT, DEFAULT_ORDER_BY,
};
pub use record::QueryRecord;
pub use value::{QValue, QueryFn};

pub(crate) use executor::execute;
