//! Topic routing between the supervisor's bus and its worker.
//!
//! Both sides of the process boundary run a [`Bus`](forkbus_client::Bus)
//! that reports `ON`/`OFF`/`OUT`. The router keeps the resulting route
//! table and decides, for every published value, which side receives it
//! as `IN`.
//!
//! ```text
//!   parent Bus ──ON/OFF/OUT──►┌──────────────┐◄──ON/OFF/OUT── worker Bus
//!              ◄────IN────────│ TopicRouter  │──────IN──────►
//!                             └──────────────┘
//! ```
//!
//! A publish reaches every endpoint with a plain route and exactly one
//! member of each queue group, picked round-robin.

use forkbus_client::{TopicEvent, TopicSignal};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, warn};

/// One side of the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// The supervisor's own bus.
    Parent,
    /// The forked worker.
    Worker,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parent => write!(f, "parent"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// A routed delivery: send `event` (always `IN`) to `endpoint`.
pub type Delivery = (Endpoint, TopicEvent);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    endpoint: Endpoint,
    queue: Option<String>,
}

/// Route table fed by subscription signals from both endpoints.
#[derive(Debug, Default)]
pub struct TopicRouter {
    routes: HashMap<String, Vec<Route>>,
    cursors: HashMap<(String, String), usize>,
}

impl TopicRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a signal emitted by `from` and return the deliveries it causes.
    pub fn on_signal(&mut self, from: Endpoint, event: &TopicEvent) -> Vec<Delivery> {
        match event.signal() {
            TopicSignal::On => {
                self.activate(from, event.sub(), event.queue());
                Vec::new()
            }
            TopicSignal::Off => {
                self.deactivate(from, event.sub());
                Vec::new()
            }
            TopicSignal::Out => self.route(event),
            TopicSignal::In => {
                warn!(%from, topic = %event.sub(), "ignoring IN signal sent to the router");
                Vec::new()
            }
        }
    }

    /// Forget every route of `endpoint`.
    pub fn remove_endpoint(&mut self, endpoint: Endpoint) {
        self.routes.retain(|_, routes| {
            routes.retain(|route| route.endpoint != endpoint);
            !routes.is_empty()
        });
    }

    /// Current routes of `topic` as `(endpoint, queue)` pairs.
    #[must_use]
    pub fn routes(&self, topic: &str) -> Vec<(Endpoint, Option<&str>)> {
        self.routes.get(topic).map_or_else(Vec::new, |routes| {
            routes
                .iter()
                .map(|route| (route.endpoint, route.queue.as_deref()))
                .collect()
        })
    }

    fn activate(&mut self, endpoint: Endpoint, topic: &str, queue: Option<&str>) {
        let routes = self.routes.entry(topic.to_string()).or_default();
        let route = Route {
            endpoint,
            queue: queue.map(ToString::to_string),
        };
        match routes.iter_mut().find(|r| r.endpoint == endpoint) {
            Some(existing) => *existing = route,
            None => routes.push(route),
        }
        debug!(%endpoint, %topic, ?queue, "route added");
    }

    fn deactivate(&mut self, endpoint: Endpoint, topic: &str) {
        if let Some(routes) = self.routes.get_mut(topic) {
            routes.retain(|route| route.endpoint != endpoint);
            if routes.is_empty() {
                self.routes.remove(topic);
            }
            debug!(%endpoint, %topic, "route removed");
        }
    }

    fn route(&mut self, event: &TopicEvent) -> Vec<Delivery> {
        let Some(inbound) = event.to_inbound() else {
            return Vec::new();
        };
        let Some(routes) = self.routes.get(event.sub()) else {
            debug!(topic = %event.sub(), "no route, value dropped");
            return Vec::new();
        };

        let mut targets = Vec::new();
        let mut groups: BTreeMap<&str, Vec<Endpoint>> = BTreeMap::new();
        for route in routes {
            match route.queue.as_deref() {
                Some(queue) => groups.entry(queue).or_default().push(route.endpoint),
                None => targets.push(route.endpoint),
            }
        }

        for (queue, members) in groups {
            let cursor = self
                .cursors
                .entry((event.sub().to_string(), queue.to_string()))
                .or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor = cursor.wrapping_add(1);
        }

        targets
            .into_iter()
            .map(|endpoint| (endpoint, inbound.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoints(deliveries: &[Delivery]) -> Vec<Endpoint> {
        deliveries.iter().map(|(endpoint, _)| *endpoint).collect()
    }

    #[test]
    fn out_becomes_in_for_every_plain_route() {
        let mut router = TopicRouter::new();
        router.on_signal(Endpoint::Parent, &TopicEvent::on("t", None));
        router.on_signal(Endpoint::Worker, &TopicEvent::on("t", None));

        let deliveries = router.on_signal(Endpoint::Worker, &TopicEvent::outbound("t", json!(1)));
        assert_eq!(endpoints(&deliveries), vec![Endpoint::Parent, Endpoint::Worker]);
        for (_, event) in &deliveries {
            assert_eq!(event, &TopicEvent::inbound("t", json!(1)));
        }
    }

    #[test]
    fn unrouted_topic_drops_the_value() {
        let mut router = TopicRouter::new();
        router.on_signal(Endpoint::Parent, &TopicEvent::on("other", None));
        assert!(router
            .on_signal(Endpoint::Worker, &TopicEvent::outbound("t", json!(1)))
            .is_empty());
    }

    #[test]
    fn off_removes_only_the_sender_route() {
        let mut router = TopicRouter::new();
        router.on_signal(Endpoint::Parent, &TopicEvent::on("t", None));
        router.on_signal(Endpoint::Worker, &TopicEvent::on("t", None));
        router.on_signal(Endpoint::Worker, &TopicEvent::off("t"));

        assert_eq!(router.routes("t"), vec![(Endpoint::Parent, None)]);
        router.on_signal(Endpoint::Parent, &TopicEvent::off("t"));
        assert!(router.routes("t").is_empty());
    }

    #[test]
    fn queue_group_round_robins() {
        let mut router = TopicRouter::new();
        let group = Some("workers".to_string());
        router.on_signal(Endpoint::Parent, &TopicEvent::on("jobs", group.clone()));
        router.on_signal(Endpoint::Worker, &TopicEvent::on("jobs", group));

        let picked: Vec<Endpoint> = (0..4)
            .flat_map(|n| {
                endpoints(&router.on_signal(Endpoint::Parent, &TopicEvent::outbound("jobs", json!(n))))
            })
            .collect();
        assert_eq!(
            picked,
            vec![Endpoint::Parent, Endpoint::Worker, Endpoint::Parent, Endpoint::Worker]
        );
    }

    #[test]
    fn plain_and_queued_routes_combine() {
        let mut router = TopicRouter::new();
        router.on_signal(Endpoint::Parent, &TopicEvent::on("t", None));
        router.on_signal(Endpoint::Worker, &TopicEvent::on("t", Some("g".to_string())));

        let deliveries = router.on_signal(Endpoint::Parent, &TopicEvent::outbound("t", json!("v")));
        assert_eq!(endpoints(&deliveries), vec![Endpoint::Parent, Endpoint::Worker]);
    }

    #[test]
    fn stray_in_is_ignored() {
        let mut router = TopicRouter::new();
        router.on_signal(Endpoint::Parent, &TopicEvent::on("t", None));
        assert!(router
            .on_signal(Endpoint::Worker, &TopicEvent::inbound("t", json!(1)))
            .is_empty());
    }

    #[test]
    fn removing_an_endpoint_clears_its_routes() {
        let mut router = TopicRouter::new();
        router.on_signal(Endpoint::Worker, &TopicEvent::on("a", None));
        router.on_signal(Endpoint::Worker, &TopicEvent::on("b", None));
        router.on_signal(Endpoint::Parent, &TopicEvent::on("b", None));

        router.remove_endpoint(Endpoint::Worker);
        assert!(router.routes("a").is_empty());
        assert_eq!(router.routes("b"), vec![(Endpoint::Parent, None)]);
    }
}
