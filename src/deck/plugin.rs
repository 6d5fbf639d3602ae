use super::controller::Deck;
use crate::identity::Match;
use crate::plugins::Plugin;
use crate::session::relay::Transform;
use crate::stream::SubscriptionRef;
use std::sync::Arc;

/// Splices one [`Deck`] into every subscription `matcher` selects.
pub struct PausePlugin {
    matcher: Match,
    deck: Arc<Deck>,
}

impl PausePlugin {
    pub fn new(matcher: Match) -> Self {
        Self {
            matcher,
            deck: Arc::new(Deck::new()),
        }
    }

    pub fn deck(&self) -> Arc<Deck> {
        Arc::clone(&self.deck)
    }

    pub fn matcher(&self) -> &Match {
        &self.matcher
    }
}

impl Plugin for PausePlugin {
    fn name(&self) -> &'static str {
        "pause"
    }

    fn select(&self, subscription: &SubscriptionRef) -> Option<Arc<dyn Transform>> {
        if self.matcher.matches(subscription) {
            Some(Arc::clone(&self.deck) as Arc<dyn Transform>)
        } else {
            None
        }
    }

    fn teardown(&self) {
        self.deck.teardown();
    }
}
