//! Notification router: per-method observer registration.
//!
//! The connection's reader task hands every server notification to
//! [`NotificationRouter::dispatch`]. Interested parties hold a
//! [`Subscription`]; dropping it (or calling [`Subscription::unsubscribe`])
//! removes its routes, so attach and detach are symmetric.
//!
//! A subscription covering several methods receives them on one channel in
//! dispatch order. Once the router itself is dropped, subscribers drain
//! what is queued and then see `None`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

/// A notification as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedNotification {
    pub method: String,
    pub params: serde_json::Value,
}

type RouteSender = mpsc::UnboundedSender<RoutedNotification>;

#[derive(Default)]
struct Routes {
    next_id: u64,
    by_method: HashMap<String, Vec<(u64, RouteSender)>>,
}

/// Shared routing table. Cloning yields another handle to the same table.
#[derive(Clone, Default)]
pub struct NotificationRouter {
    routes: Arc<Mutex<Routes>>,
}

impl NotificationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
        // Routing state stays consistent even if a holder panicked.
        routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register for notifications with the given method name.
    pub fn subscribe(&self, method: &str) -> Subscription {
        self.subscribe_many(&[method])
    }

    /// Register one ordered channel for several methods.
    pub fn subscribe_many(&self, methods: &[&str]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = Self::lock(&self.routes);
        let id = routes.next_id;
        routes.next_id += 1;
        for method in methods {
            routes
                .by_method
                .entry((*method).to_string())
                .or_default()
                .push((id, tx.clone()));
        }
        Subscription {
            id,
            methods: methods.iter().map(|m| (*m).to_string()).collect(),
            routes: Arc::downgrade(&self.routes),
            rx,
        }
    }

    /// Deliver `params` to every subscriber of `method`.
    ///
    /// Returns whether at least one subscriber received it.
    pub fn dispatch(&self, method: &str, params: &serde_json::Value) -> bool {
        let mut routes = Self::lock(&self.routes);
        let Some(subscribers) = routes.by_method.get_mut(method) else {
            return false;
        };
        subscribers.retain(|(_, tx)| {
            tx.send(RoutedNotification {
                method: method.to_string(),
                params: params.clone(),
            })
            .is_ok()
        });
        !subscribers.is_empty()
    }

    /// Number of live subscriptions for `method`.
    #[must_use]
    pub fn subscriber_count(&self, method: &str) -> usize {
        Self::lock(&self.routes)
            .by_method
            .get(method)
            .map_or(0, Vec::len)
    }
}

/// Handle to one registration. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    methods: Vec<String>,
    routes: Weak<Mutex<Routes>>,
    rx: mpsc::UnboundedReceiver<RoutedNotification>,
}

impl Subscription {
    /// Wait for the next notification. `None` once the router is gone and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<RoutedNotification> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(routes) = self.routes.upgrade() else {
            return;
        };
        let mut routes = NotificationRouter::lock(&routes);
        for method in &self.methods {
            if let Some(subscribers) = routes.by_method.get_mut(method) {
                subscribers.retain(|(id, _)| *id != self.id);
                if subscribers.is_empty() {
                    routes.by_method.remove(method);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_reaches_only_matching_method() {
        let router = NotificationRouter::new();
        let mut progress = router.subscribe("$/progress");
        let mut messages = router.subscribe("window/showMessage");

        assert!(router.dispatch("$/progress", &serde_json::json!({"token": "a"})));
        let routed = progress.recv().await.unwrap();
        assert_eq!(routed.method, "$/progress");
        assert_eq!(routed.params["token"], "a");
        assert!(messages.rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_without_subscribers_reports_undelivered() {
        let router = NotificationRouter::new();
        assert!(!router.dispatch("$/progress", &serde_json::Value::Null));
    }

    #[test]
    fn dropping_subscription_detaches_route() {
        let router = NotificationRouter::new();
        let first = router.subscribe("$/progress");
        let second = router.subscribe("$/progress");
        assert_eq!(router.subscriber_count("$/progress"), 2);

        first.unsubscribe();
        assert_eq!(router.subscriber_count("$/progress"), 1);

        drop(second);
        assert_eq!(router.subscriber_count("$/progress"), 0);
        assert!(!router.dispatch("$/progress", &serde_json::Value::Null));
    }

    #[tokio::test]
    async fn multi_method_subscription_keeps_dispatch_order() {
        let router = NotificationRouter::new();
        let mut sub = router.subscribe_many(&["$/progress", "window/showMessage"]);

        router.dispatch("window/showMessage", &serde_json::json!(1));
        router.dispatch("$/progress", &serde_json::json!(2));
        router.dispatch("window/showMessage", &serde_json::json!(3));

        let order: Vec<_> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|r| (r.method, r.params))
        .collect();
        assert_eq!(
            order,
            vec![
                ("window/showMessage".to_string(), serde_json::json!(1)),
                ("$/progress".to_string(), serde_json::json!(2)),
                ("window/showMessage".to_string(), serde_json::json!(3)),
            ]
        );

        drop(sub);
        assert_eq!(router.subscriber_count("$/progress"), 0);
        assert_eq!(router.subscriber_count("window/showMessage"), 0);
    }

    #[tokio::test]
    async fn dropping_router_ends_stream_after_drain() {
        let router = NotificationRouter::new();
        let mut sub = router.subscribe("$/progress");
        router.dispatch("$/progress", &serde_json::json!("last"));
        drop(router);

        assert_eq!(sub.recv().await.unwrap().params, "last");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn every_subscriber_of_a_method_receives_in_order() {
        let router = NotificationRouter::new();
        let mut a = router.subscribe("window/showMessage");
        let mut b = router.subscribe("window/showMessage");

        for n in 0..3 {
            router.dispatch("window/showMessage", &serde_json::json!(n));
        }
        for n in 0..3 {
            assert_eq!(a.recv().await.unwrap().params, n);
            assert_eq!(b.recv().await.unwrap().params, n);
        }
    }
}
