//! Flat per-subscription records that predicates are evaluated against.

use super::compiler::Lookup;
use super::value::QValue;
use crate::snapshot::{Snapshot, SubscriptionSnapshot};
use crate::types::{StackFrame, SubscriptionId, Timestamp};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Field name to value. Matcher fields such as `tag` hold functions.
#[derive(Clone, Default)]
pub struct QueryRecord {
    fields: BTreeMap<String, QValue>,
}

impl QueryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> QValue {
        self.fields.get(key).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<QValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &QValue)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }
}

impl Lookup for QueryRecord {
    fn lookup(&self, key: &str) -> QValue {
        self.get(key)
    }
}

impl fmt::Debug for QueryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.iter()).finish()
    }
}

/// Tests `text` against a matcher argument. Strings must equal `text` when
/// `exact`, otherwise they only need to occur in it.
fn text_matches(text: &str, matcher: &QValue, exact: bool) -> bool {
    match matcher {
        QValue::Str(s) if exact => text == s,
        QValue::Str(s) => text.contains(s.as_str()),
        QValue::Regex(regex) => regex.is_match(text),
        QValue::Number(_) => text == matcher.to_string(),
        QValue::Function(f) => f(&[QValue::Str(text.to_string())]).truthy(),
        _ => false,
    }
}

fn id_matches(ids: &[u64], matcher: &QValue) -> bool {
    match matcher {
        QValue::Number(n) => ids.iter().any(|&id| id as f64 == *n),
        QValue::Str(s) => s.trim().parse::<u64>().is_ok_and(|n| ids.contains(&n)),
        QValue::Regex(_) | QValue::Function(_) => {
            ids.iter().any(|id| text_matches(&id.to_string(), matcher, true))
        }
        _ => false,
    }
}

fn min_age(ages: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    ages.into_iter().flatten().reduce(f64::min)
}

/// Builds the record of `subscription`, computing ages against `now`.
pub(crate) fn build(snapshot: &Snapshot, subscription: &SubscriptionSnapshot, now: Timestamp) -> QueryRecord {
    let age = |timestamp: Option<Timestamp>| timestamp.map(|t| t.age_at(now));
    let mut record = QueryRecord::new();

    let observable = snapshot.observable(subscription.observable);
    let subscribe_age = subscription.subscribed_at.age_at(now);
    let next_age = age(subscription.next_at);
    let complete_age = age(subscription.completed_at);
    let error_age = age(subscription.errored_at);
    let unsubscribe_age = age(subscription.unsubscribed_at);

    let sources = linked(snapshot, &subscription.sources);
    let flattenings = linked(snapshot, &subscription.flattenings);
    let source_next_age = min_age(sources.iter().map(|s| age(s.next_at)));
    let inner_next_age = min_age(flattenings.iter().map(|s| age(s.next_at)));
    let inner_next_count: usize = flattenings.iter().map(|s| s.next_count).sum();
    let inner_incomplete = flattenings
        .iter()
        .filter(|s| !s.is_complete() && !s.is_errored())
        .count();

    let complete = subscription.is_complete();
    let error = subscription.is_errored();
    let incomplete = !complete && !error;

    record.set("observableId", subscription.observable.0);
    record.set("subscriberId", subscription.subscriber.0);
    record.set("subscriptionId", subscription.id.0);
    record.set("kind", observable.map(|o| o.kind));
    record.set("subscribeAge", subscribe_age);
    record.set("nextAge", next_age);
    record.set("completeAge", complete_age);
    record.set("errorAge", error_age);
    record.set("unsubscribeAge", unsubscribe_age);
    record.set("complete", complete);
    record.set("error", error);
    record.set("unsubscribed", subscription.is_unsubscribed());
    record.set("incomplete", incomplete);
    record.set("nextCount", subscription.next_count);
    record.set(
        "frequency",
        if subscribe_age > 0.0 {
            subscription.next_count as f64 / subscribe_age
        } else {
            0.0
        },
    );

    record.set("depth", subscription.depth);
    record.set("root", subscription.is_root());
    record.set(
        "leaf",
        subscription.sources.is_empty() && subscription.flattenings.is_empty(),
    );
    record.set("flattened", subscription.flattened);
    record.set("sink", subscription.sink.map(|id| id.0));
    record.set("rootSink", subscription.root_sink.map(|id| id.0));
    record.set("sourceCount", subscription.sources.len());
    record.set("flatteningCount", subscription.flattenings.len());
    record.set("sourceNextAge", source_next_age);
    record.set("innerNextAge", inner_next_age);
    record.set("innerNextCount", inner_next_count);
    record.set("innerIncompleteCount", inner_incomplete);

    record.set(
        "age",
        min_age([
            Some(subscribe_age),
            next_age,
            complete_age,
            error_age,
            unsubscribe_age,
            source_next_age,
            inner_next_age,
        ]),
    );
    let blocking = incomplete
        && source_next_age.is_some_and(|source| next_age.map_or(true, |next| next > source));
    record.set("blocking", blocking);

    let tag = observable.and_then(|o| o.tag.clone());
    record.set(
        "tag",
        QValue::function(move |args: &[QValue]| {
            let matched = match args.first() {
                None | Some(QValue::Undefined) => tag.is_some(),
                Some(matcher) => tag.as_deref().is_some_and(|t| text_matches(t, matcher, true)),
            };
            QValue::Bool(matched)
        }),
    );

    let ids = [subscription.observable.0, subscription.subscriber.0, subscription.id.0];
    record.set(
        "id",
        QValue::function(move |args: &[QValue]| {
            QValue::Bool(args.first().is_some_and(|m| id_matches(&ids, m)))
        }),
    );

    let frames: Vec<StackFrame> = match (&subscription.stack_trace, observable) {
        (Some(trace), _) => trace.frames(),
        (None, Some(observable)) => vec![observable.site.clone()],
        (None, None) => Vec::new(),
    };
    let files: Vec<String> = frames.iter().map(|frame| frame.file.clone()).collect();
    record.set(
        "file",
        QValue::function(move |args: &[QValue]| {
            QValue::Bool(
                args.first()
                    .is_some_and(|m| files.iter().any(|file| text_matches(file, m, false))),
            )
        }),
    );
    let functions: Vec<String> = frames.into_iter().filter_map(|frame| frame.function).collect();
    record.set(
        "func",
        QValue::function(move |args: &[QValue]| {
            QValue::Bool(
                args.first()
                    .is_some_and(|m| functions.iter().any(|name| text_matches(name, m, false))),
            )
        }),
    );

    let feeding = pipeline(snapshot, subscription);
    record.set(
        "pipeline",
        QValue::function(move |args: &[QValue]| {
            let Some(matcher) = args.first() else {
                return QValue::Bool(false);
            };
            QValue::Bool(feeding.iter().any(|(tag, id)| {
                tag.as_deref().is_some_and(|t| text_matches(t, matcher, true))
                    || id_matches(&[*id], matcher)
            }))
        }),
    );

    for (key, value) in &subscription.query {
        record.set(key.clone(), QValue::from_json(value));
    }

    record
}

fn linked<'a>(snapshot: &'a Snapshot, ids: &[SubscriptionId]) -> Vec<&'a SubscriptionSnapshot> {
    ids.iter().filter_map(|id| snapshot.subscription(*id)).collect()
}

/// Tags and ids of the observables feeding `subscription`, itself included.
fn pipeline(snapshot: &Snapshot, subscription: &SubscriptionSnapshot) -> Vec<(Option<String>, u64)> {
    let mut seen = HashSet::new();
    let mut stack = vec![subscription];
    let mut pipeline = Vec::new();

    while let Some(next) = stack.pop() {
        if !seen.insert(next.id) {
            continue;
        }
        let tag = snapshot.observable(next.observable).and_then(|o| o.tag.clone());
        pipeline.push((tag, next.observable.0));
        stack.extend(next.sources.iter().filter_map(|id| snapshot.subscription(*id)));
    }
    pipeline
}
