//! Selection, ordering and rendering of query results.

use super::compiler::{compile, compile_order_by, Expression, OrderBy};
use super::record::{self, QueryRecord};
use super::value::QValue;
use crate::error::Result;
use crate::logger::Logger;
use crate::plugins::StackResolver;
use crate::session::Session;
use crate::snapshot::{ObservableSnapshot, Snapshot, SubscriptionSnapshot};
use crate::types::{StackFrame, SubscriptionId, Timestamp};
use std::fmt;
use std::sync::Arc;

/// Default order-by clause.
pub const DEFAULT_ORDER_BY: &str = "age asc";

/// Default maximum number of reported streams.
pub const DEFAULT_LIMIT: usize = 20;

/// Computes a record field from the fields derived so far.
pub type Derivation = Arc<dyn Fn(&QueryRecord) -> QValue + Send + Sync>;

/// What to select, how to order it and how many to report.
#[derive(Clone, Default)]
pub struct QueryRequest {
    pub predicate: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    pub derivations: Vec<(String, Derivation)>,
    /// Query this snapshot instead of taking a fresh one.
    pub snapshot: Option<Snapshot>,
}

impl QueryRequest {
    /// Selects streams with a subscription matching `predicate`.
    pub fn new(predicate: impl Into<String>) -> Self {
        Self {
            predicate: Some(predicate.into()),
            ..Self::default()
        }
    }

    /// Selects every stream.
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Adds a field computed after the built-in ones. Derivations run in
    /// the order they were added.
    #[must_use]
    pub fn derive<F>(mut self, name: impl Into<String>, derivation: F) -> Self
    where
        F: Fn(&QueryRecord) -> QValue + Send + Sync + 'static,
    {
        self.derivations.push((name.into(), Arc::new(derivation)));
        self
    }

    #[must_use]
    pub fn snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

impl fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let derivations: Vec<&str> = self.derivations.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("QueryRequest")
            .field("predicate", &self.predicate)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("derivations", &derivations)
            .field("snapshot", &self.snapshot.as_ref().map(|s| s.tick))
            .finish()
    }
}

/// One selected stream.
#[derive(Clone, Debug)]
pub struct QueryMatch {
    pub observable: ObservableSnapshot,
    /// Best matching subscription under the order-by.
    pub subscription: SubscriptionSnapshot,
    pub record: QueryRecord,
    /// Every subscription of the stream that matched.
    pub matching: Vec<SubscriptionId>,
}

/// Ordered, truncated selection.
#[derive(Clone, Debug)]
pub struct QueryResult {
    pub matches: Vec<QueryMatch>,
    /// Streams that matched but fell past the limit.
    pub omitted: usize,
    pub order_by: OrderBy,
    pub tick: u64,
}

struct Section {
    title: String,
    lines: Vec<String>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Tags of the selected streams, in order. Untagged streams are skipped.
    pub fn tags(&self) -> Vec<&str> {
        self.matches
            .iter()
            .filter_map(|m| m.observable.tag.as_deref())
            .collect()
    }

    fn header(&self) -> String {
        let mut header = format!("{} observable(s) matched", self.matches.len());
        if self.omitted > 0 {
            header.push_str(&format!("; {} omitted", self.omitted));
        }
        header
    }

    fn sections(&self, traces: &[Vec<StackFrame>]) -> Vec<Section> {
        self.matches
            .iter()
            .enumerate()
            .map(|(index, m)| {
                let title = match &m.observable.tag {
                    Some(tag) => format!("Observable {} (tag = {})", m.observable.id, tag),
                    None => format!("Observable {}", m.observable.id),
                };

                let subscription = &m.subscription;
                let mut lines = vec![
                    format!("Kind = {}", m.observable.kind),
                    format!(
                        "Subscriptions = {} matching of {}",
                        m.matching.len(),
                        m.observable.subscriptions.len()
                    ),
                    format!("Subscription = {}", subscription.id),
                    format!(
                        "{} = {}",
                        self.order_by.key,
                        m.record.get(&self.order_by.key)
                    ),
                ];

                let frames = traces.get(index).map(Vec::as_slice).unwrap_or_default();
                if let Some(frame) = frames.first() {
                    lines.push(format!("Subscribed at {frame}"));
                }
                match frames.get(1) {
                    Some(frame) => lines.push(format!("Created at {frame}")),
                    None if frames.is_empty() => {
                        lines.push(format!("Created at {}", m.observable.site));
                    }
                    None => {}
                }

                if !subscription.values.is_empty() {
                    let values: Vec<String> = subscription
                        .values
                        .iter()
                        .map(|v| v.value.to_string())
                        .collect();
                    lines.push(format!("Values = [{}]", values.join(", ")));
                }
                if let Some(error) = &subscription.error {
                    lines.push(format!("Error = {error}"));
                }
                if subscription.is_complete() {
                    lines.push("Complete".to_string());
                }

                Section { title, lines }
            })
            .collect()
    }

    fn raw_traces(&self) -> Vec<Vec<StackFrame>> {
        self.matches
            .iter()
            .map(|m| {
                m.subscription
                    .stack_trace
                    .as_ref()
                    .map(|trace| trace.frames())
                    .unwrap_or_default()
            })
            .collect()
    }

    fn format(&self, traces: &[Vec<StackFrame>]) -> String {
        let mut out = self.header();
        for section in self.sections(traces) {
            out.push_str("\n  ");
            out.push_str(&section.title);
            for line in section.lines {
                out.push_str("\n    ");
                out.push_str(&line);
            }
        }
        out
    }

    /// Renders with the raw captured call sites.
    pub fn render(&self) -> String {
        self.format(&self.raw_traces())
    }

    /// Renders after resolving call sites through `resolver`.
    pub async fn render_with(&self, resolver: &dyn StackResolver) -> String {
        let mut traces = Vec::with_capacity(self.matches.len());
        for raw in self.raw_traces() {
            let resolved = if raw.is_empty() {
                raw
            } else {
                resolver.resolve(raw).await
            };
            traces.push(resolved);
        }
        self.format(&traces)
    }

    /// Writes the rendered result through `logger`, one group per stream.
    pub fn log(&self, logger: &dyn Logger) {
        logger.group(&self.header());
        for section in self.sections(&self.raw_traces()) {
            logger.group(&section.title);
            for line in &section.lines {
                logger.log(line);
            }
            logger.group_end();
        }
        logger.group_end();
    }
}

/// Runs `request` against its own snapshot, or a fresh one from `session`.
pub(crate) fn execute(session: &Session, request: &QueryRequest) -> Result<QueryResult> {
    match &request.snapshot {
        Some(snapshot) => run(snapshot, request),
        None => run(&session.snapshot().unwrap_or_default(), request),
    }
}

/// Runs `request` against `snapshot`.
pub fn run(snapshot: &Snapshot, request: &QueryRequest) -> Result<QueryResult> {
    let predicate: Option<Expression> = request.predicate.as_deref().map(compile).transpose()?;
    let order_by = compile_order_by(request.order_by.as_deref().unwrap_or(DEFAULT_ORDER_BY))?;
    let limit = request.limit.unwrap_or(DEFAULT_LIMIT);
    let now = Timestamp::now();

    let mut kept = Vec::new();
    for observable in snapshot.observables.values() {
        let mut best: Option<(QueryRecord, &SubscriptionSnapshot)> = None;
        let mut matching = Vec::new();

        for subscription in observable
            .subscriptions
            .iter()
            .filter_map(|id| snapshot.subscription(*id))
        {
            let mut record = record::build(snapshot, subscription, now);
            for (name, derivation) in &request.derivations {
                let value = derivation(&record);
                record.set(name.clone(), value);
            }

            if predicate.as_ref().is_some_and(|p| !p.test(&record)) {
                continue;
            }
            matching.push(subscription.id);

            let better = best
                .as_ref()
                .map_or(true, |(current, _)| order_by.compare(&record, current).is_lt());
            if better {
                best = Some((record, subscription));
            }
        }

        if let Some((record, subscription)) = best {
            kept.push(QueryMatch {
                observable: observable.clone(),
                subscription: subscription.clone(),
                record,
                matching,
            });
        }
    }

    kept.sort_by(|a, b| order_by.compare(&a.record, &b.record));
    let omitted = kept.len().saturating_sub(limit);
    kept.truncate(limit);

    tracing::debug!(
        predicate = request.predicate.as_deref().unwrap_or("<all>"),
        matched = kept.len(),
        omitted,
        "query"
    );

    Ok(QueryResult {
        matches: kept,
        omitted,
        order_by,
        tick: snapshot.tick,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Retention, SpyConfig};
    use crate::logger::MemoryLogger;
    use crate::plugins::StackTracePlugin;
    use crate::stream::{Observable, Subject};
    use crate::types::Notification;
    use futures::executor::block_on;
    use futures::future::{self, BoxFuture, FutureExt};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session() -> (Session, Arc<MemoryLogger>) {
        let logger = Arc::new(MemoryLogger::new());
        let session = Session::new(
            SpyConfig::default()
                .with_retention(Retention::Forever)
                .with_logger(logger.clone()),
        );
        (session, logger)
    }

    #[test]
    fn test_tag_selects_exactly_tagged_streams() {
        let (session, _) = session();
        let people = Observable::never().with_tag("people");
        let places = Observable::never().with_tag("places");
        let _a = session.subscribe(&people, |_: Notification| {});
        let _b = session.subscribe(&places, |_: Notification| {});
        let _c = session.subscribe(&Observable::never(), |_: Notification| {});

        let result = session.query(QueryRequest::new("tag('people')")).unwrap();
        assert_eq!(result.tags(), vec!["people"]);

        let result = session.query(QueryRequest::new("tag()")).unwrap();
        assert_eq!(result.len(), 2);

        let result = session.query(QueryRequest::all()).unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_malformed_predicate_is_an_error() {
        let (session, _) = session();
        let error = session.query(QueryRequest::new("tag(")).unwrap_err();
        assert!(error.is_expression());
        let error = session
            .query(QueryRequest::all().order_by("age upward"))
            .unwrap_err();
        assert!(error.is_expression());
    }

    #[test]
    fn test_order_limit_and_omitted() {
        let (session, _) = session();
        let subjects: Vec<Subject> = (0..3).map(|_| Subject::new()).collect();
        let mut subscriptions = Vec::new();
        for (n, subject) in subjects.iter().enumerate() {
            let observable = subject.observable().with_tag(format!("s{n}"));
            subscriptions.push(session.subscribe(&observable, |_: Notification| {}));
            for _ in 0..n {
                subject.next(json!(n));
            }
        }

        let result = session
            .query(QueryRequest::all().order_by("nextCount desc").limit(2))
            .unwrap();
        assert_eq!(result.tags(), vec!["s2", "s1"]);
        assert_eq!(result.omitted, 1);
    }

    #[test]
    fn test_any_matching_subscription_keeps_the_stream() {
        let (session, _) = session();
        let subject = Subject::new();
        let observable = subject.observable().with_tag("shared");
        let first = session.subscribe(&observable, |_: Notification| {});
        let _second = session.subscribe(&observable, |_: Notification| {});
        first.unsubscribe();

        let result = session.query(QueryRequest::new("unsubscribed")).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.matches[0].matching, vec![first.id().unwrap()]);
        assert_eq!(result.matches[0].observable.subscriptions.len(), 2);
    }

    #[test]
    fn test_derivations_see_earlier_fields() {
        let (session, _) = session();
        let subject = Subject::new();
        let _s = session.subscribe(&subject.observable().with_tag("busy"), |_: Notification| {});
        subject.next(json!(1));
        subject.next(json!(2));

        let request = QueryRequest::new("double == 4")
            .derive("double", |record| QValue::Number(record.get("nextCount").to_number() * 2.0));
        let result = session.query(request).unwrap();
        assert_eq!(result.tags(), vec!["busy"]);
    }

    #[test]
    fn test_graph_fields_and_pipeline() {
        let (session, _) = session();
        let source = Observable::never().with_tag("source");
        let mapped = source.map(|v| v).with_tag("mapped");
        let _s = session.subscribe(&mapped, |_: Notification| {});

        let result = session.query(QueryRequest::new("root && sourceCount == 1")).unwrap();
        assert_eq!(result.tags(), vec!["mapped"]);

        let result = session.query(QueryRequest::new("leaf && depth == 2")).unwrap();
        assert_eq!(result.tags(), vec!["source"]);

        let result = session.query(QueryRequest::new("pipeline('source')")).unwrap();
        assert_eq!(result.len(), 2);

        let result = session.query(QueryRequest::new("file('query')")).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_render_and_log() {
        let (session, logger) = session();
        let subject = Subject::new();
        let _s = session.subscribe(&subject.observable().with_tag("people"), |_: Notification| {});
        subject.next(json!("alice"));

        let result = session.query(QueryRequest::new("tag('people')")).unwrap();
        let rendered = result.render();
        assert!(rendered.starts_with("1 observable(s) matched"));
        assert!(rendered.contains("tag = people"));
        assert!(rendered.contains("Values = [\"alice\"]"));
        assert!(logger.contains("Observable"));
        assert!(logger.contains("Subscribed at"));
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl StackResolver for CountingResolver {
        fn resolve(&self, frames: Vec<StackFrame>) -> BoxFuture<'static, Vec<StackFrame>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let resolved: Vec<StackFrame> = frames
                .into_iter()
                .map(|frame| StackFrame {
                    function: Some("resolved::site".to_string()),
                    ..frame
                })
                .collect();
            future::ready(resolved).boxed()
        }
    }

    #[test]
    fn test_frames_are_resolved_only_for_display() {
        let counting = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let session = Session::new(
            SpyConfig::default()
                .with_retention(Retention::Forever)
                .with_logger(Arc::new(MemoryLogger::new()))
                .with_resolver(counting.clone()),
        );
        let _s = session.subscribe(&Observable::never().with_tag("people"), |_: Notification| {});

        let result = session.query(QueryRequest::new("tag('people')")).unwrap();
        let snapshot = session.snapshot().unwrap();
        run(&snapshot, &QueryRequest::all()).unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
        assert!(!result.render().contains("resolved::site"));

        let resolver = session
            .find::<StackTracePlugin>()
            .and_then(|plugin| plugin.resolver())
            .unwrap();
        let rendered = block_on(result.render_with(resolver.as_ref()));
        assert!(rendered.contains("Subscribed at resolved::site"));
        assert!(rendered.contains("Created at resolved::site"));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        block_on(result.render_with(resolver.as_ref()));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_query_against_given_snapshot() {
        let (session, _) = session();
        let _s = session.subscribe(&Observable::never().with_tag("early"), |_: Notification| {});
        let snapshot = session.snapshot().unwrap();
        let _t = session.subscribe(&Observable::never().with_tag("late"), |_: Notification| {});

        let result = run(&snapshot, &QueryRequest::new("tag()")).unwrap();
        assert_eq!(result.tags(), vec!["early"]);
    }
}
