//! Stable identities and the [`Match`] predicate used wherever streams are
//! filtered.

use crate::stream::{Observable, SubscriptionRef};
use crate::types::{ObservableId, SubscriberId, SubscriptionId};
use regex::Regex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One counter for every identity kind, so ids never collide across kinds.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::SeqCst)
}

pub(crate) fn next_observable_id() -> ObservableId {
    ObservableId(next_id())
}

pub(crate) fn next_subscriber_id() -> SubscriberId {
    SubscriberId(next_id())
}

pub(crate) fn next_subscription_id() -> SubscriptionId {
    SubscriptionId(next_id())
}

/// Predicate over `(tag, observable)`.
pub type MatchFn = Arc<dyn Fn(Option<&str>, &Observable) -> bool + Send + Sync>;

/// Selects streams by reference, identity, tag, tag pattern or predicate.
#[derive(Clone)]
pub enum Match {
    /// The very same observable.
    Observable(Observable),
    /// An observable, subscriber or subscription id.
    Id(u64),
    /// A tag, or the decimal form of an id.
    Tag(String),
    /// A pattern tested against the tag.
    Regex(Regex),
    Predicate(MatchFn),
}

impl Match {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(Option<&str>, &Observable) -> bool + Send + Sync + 'static,
    {
        Match::Predicate(Arc::new(f))
    }

    /// Tests an observable on its own, without subscription context.
    pub fn matches_observable(&self, observable: &Observable) -> bool {
        self.matches_parts(observable, &[])
    }

    /// Tests a live subscription: ids match the observable, the subscriber
    /// or the subscription itself.
    pub fn matches(&self, subscription: &SubscriptionRef) -> bool {
        self.matches_parts(
            subscription.observable(),
            &[subscription.id().0, subscription.subscriber().0],
        )
    }

    pub(crate) fn matches_parts(&self, observable: &Observable, ids: &[u64]) -> bool {
        match self {
            Match::Observable(other) => observable.ptr_eq(other),
            Match::Predicate(f) => f(observable.tag(), observable),
            _ => self.matches_identity(observable.id(), observable.tag(), ids),
        }
    }

    /// Tests ids and tag only. Reference and predicate matches need a live
    /// observable and never match here.
    pub(crate) fn matches_identity(&self, observable: ObservableId, tag: Option<&str>, ids: &[u64]) -> bool {
        let id_matches = |id: u64| id == observable.0 || ids.contains(&id);

        match self {
            Match::Id(id) => id_matches(*id),
            Match::Tag(wanted) => {
                tag == Some(wanted.as_str()) || wanted.parse::<u64>().is_ok_and(id_matches)
            }
            Match::Regex(regex) => tag.is_some_and(|tag| regex.is_match(tag)),
            Match::Observable(_) | Match::Predicate(_) => false,
        }
    }
}

impl fmt::Debug for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::Observable(observable) => write!(f, "Match::Observable({})", observable.id()),
            Match::Id(id) => write!(f, "Match::Id({id})"),
            Match::Tag(tag) => write!(f, "Match::Tag({tag:?})"),
            Match::Regex(regex) => write!(f, "Match::Regex(/{}/)", regex.as_str()),
            Match::Predicate(_) => f.write_str("Match::Predicate(..)"),
        }
    }
}

impl From<&str> for Match {
    fn from(tag: &str) -> Self {
        Match::Tag(tag.to_string())
    }
}

impl From<String> for Match {
    fn from(tag: String) -> Self {
        Match::Tag(tag)
    }
}

impl From<u64> for Match {
    fn from(id: u64) -> Self {
        Match::Id(id)
    }
}

impl From<ObservableId> for Match {
    fn from(id: ObservableId) -> Self {
        Match::Id(id.0)
    }
}

impl From<SubscriptionId> for Match {
    fn from(id: SubscriptionId) -> Self {
        Match::Id(id.0)
    }
}

impl From<Regex> for Match {
    fn from(regex: Regex) -> Self {
        Match::Regex(regex)
    }
}

impl From<&Observable> for Match {
    fn from(observable: &Observable) -> Self {
        Match::Observable(observable.clone())
    }
}

impl From<Observable> for Match {
    fn from(observable: Observable) -> Self {
        Match::Observable(observable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_memoized() {
        let a = Observable::empty();
        let b = Observable::empty();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_match_by_tag_id_and_regex() {
        let tagged = Observable::empty().with_tag("people");

        assert!(Match::from("people").matches_observable(&tagged));
        assert!(!Match::from("places").matches_observable(&tagged));
        assert!(Match::from(tagged.id()).matches_observable(&tagged));
        assert!(Match::from(tagged.id().0.to_string()).matches_observable(&tagged));
        assert!(Match::from(Regex::new("^peo").unwrap()).matches_observable(&tagged));
        assert!(!Match::from(Regex::new("^peo").unwrap()).matches_observable(&Observable::empty()));
    }

    #[test]
    fn test_match_by_reference_and_predicate() {
        let source = Observable::empty();
        let other = Observable::empty();

        assert!(Match::from(&source).matches_observable(&source));
        assert!(!Match::from(&source).matches_observable(&other));

        let untagged = Match::predicate(|tag, _| tag.is_none());
        assert!(untagged.matches_observable(&source));
        assert!(!untagged.matches_observable(&source.with_tag("x")));
    }
}
