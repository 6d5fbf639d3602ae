//! Audited lifecycle logging for matching subscriptions.

use super::Plugin;
use crate::auditor::Auditor;
use crate::identity::Match;
use crate::logger::Logger;
use crate::scheduler::Scheduler;
use crate::session::Session;
use crate::stream::SubscriptionRef;
use crate::types::{NotificationKind, Value};
use std::sync::Arc;
use std::time::Duration;

/// Logs the lifecycle of every subscription `matcher` selects.
///
/// Output is coalesced per subscription and event kind: within one audit
/// window only the latest line is written, followed by how many were
/// ignored.
pub struct LogPlugin {
    matcher: Match,
    auditor: Auditor,
    logger: Arc<dyn Logger>,
}

impl LogPlugin {
    pub fn new(
        matcher: Match,
        audit: Duration,
        logger: Arc<dyn Logger>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            matcher,
            auditor: Auditor::new(audit, scheduler),
            logger,
        }
    }

    fn log(&self, subscription: &SubscriptionRef, kind: NotificationKind, value: Option<&Value>) {
        if !self.matcher.matches(subscription) {
            return;
        }

        let observable = subscription.observable();
        let mut line = match observable.tag() {
            Some(tag) => format!("Tag = {tag}"),
            None => format!("ID = {}", observable.id()),
        };
        line.push_str(&format!("; subscription = {}; notification = {kind}", subscription.id()));
        if let Some(value) = value {
            let label = if kind == NotificationKind::Error { "error" } else { "value" };
            line.push_str(&format!("; {label} = {value}"));
        }

        let logger = Arc::clone(&self.logger);
        let key = format!("{}:{}", subscription.id(), kind);
        self.auditor.audit(key, move |ignored| {
            if ignored > 0 {
                logger.log(&format!("{line}; ignored {ignored}"));
            } else {
                logger.log(&line);
            }
        });
    }
}

impl Plugin for LogPlugin {
    fn name(&self) -> &'static str {
        "log"
    }

    fn before_subscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        self.log(subscription, NotificationKind::Subscribe, None);
    }

    fn before_next(&self, _: &Session, subscription: &SubscriptionRef, value: &Value) {
        self.log(subscription, NotificationKind::Next, Some(value));
    }

    fn before_error(&self, _: &Session, subscription: &SubscriptionRef, error: &Value) {
        self.log(subscription, NotificationKind::Error, Some(error));
    }

    fn before_complete(&self, _: &Session, subscription: &SubscriptionRef) {
        self.log(subscription, NotificationKind::Complete, None);
    }

    fn before_unsubscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        self.log(subscription, NotificationKind::Unsubscribe, None);
    }

    fn teardown(&self) {
        self.auditor.teardown();
    }
}
