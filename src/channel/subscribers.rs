use tokio::sync::mpsc;
use tracing::trace;

/// Subscribers with an optional filter each, notified in registration order. A subscriber
///  unsubscribes by dropping its receiver; it is removed on the next delivery.
pub struct Subscribers<T, F> {
    entries: Vec<(Option<F>, mpsc::UnboundedSender<T>)>,
}

impl <T, F> Default for Subscribers<T, F> {
    fn default() -> Self {
        Subscribers { entries: Vec::new() }
    }
}

impl <T: Clone, F> Subscribers<T, F> {
    pub fn add(&mut self, filter: Option<F>, sender: mpsc::UnboundedSender<T>) {
        self.entries.push((filter, sender));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Delivers `item` to every subscriber without a filter, and to those whose filter
    ///  `matches`
    pub fn deliver(&mut self, item: &T, matches: impl Fn(&F) -> bool) {
        self.entries.retain(|(filter, sender)| {
            if let Some(filter) = filter {
                if !matches(filter) {
                    return !sender.is_closed();
                }
            }
            let delivered = sender.send(item.clone()).is_ok();
            if !delivered {
                trace!("dropping closed subscriber");
            }
            delivered
        });
    }
}
