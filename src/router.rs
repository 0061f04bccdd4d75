use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    events::{BrokerEvent, EventBus},
    registry::ClientRegistry,
    session::{Capability, Session},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    /// The session declared the function by name.
    Explicit,
    /// Matched as `Class.Name` against a declared function.
    Qualified,
    /// Nobody declared it; handed to a session that resolves names at call time.
    Ambient,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub session: Arc<Session>,
    /// The declared entry that matched; `None` for ambient dispatch.
    pub capability: Option<Capability>,
    pub via: ResolvedBy,
}

impl Resolution {
    /// The method name to put on the wire.
    pub fn method<'a>(&'a self, requested: &'a str) -> &'a str {
        match &self.capability {
            Some(c) => &c.name,
            None => requested,
        }
    }

    pub fn class(&self) -> Option<String> {
        self.capability.as_ref().and_then(|c| c.class.clone())
    }
}

/// Picks the session that should serve a function.
///
/// Order: explicit declaration (first registered wins), then `Class.Name`
/// against declared classes, then the first session that supports ambient
/// dispatch. Blank names never match.
pub struct FunctionRouter {
    registry: Arc<ClientRegistry>,
    events: EventBus,
}

impl FunctionRouter {
    pub fn new(registry: Arc<ClientRegistry>, events: EventBus) -> Self {
        Self { registry, events }
    }

    pub fn resolve(&self, function: &str) -> Option<Resolution> {
        let function = function.trim();
        if function.is_empty() {
            return None;
        }
        let sessions = self.registry.all();

        if let Some(found) = self.explicit(&sessions, function) {
            return Some(found);
        }
        if let Some(found) = self.qualified(&sessions, function) {
            return Some(found);
        }

        let ambient = sessions.iter().find(|s| s.supports_ambient_dispatch())?;
        debug!(%function, instance = %ambient.instance_id(), "no declaration, using ambient dispatch");
        Some(Resolution {
            session: ambient.clone(),
            capability: None,
            via: ResolvedBy::Ambient,
        })
    }

    /// Same rules, restricted to one instance.
    pub fn resolve_on(&self, instance_id: &str, function: &str) -> Option<Resolution> {
        let function = function.trim();
        if function.is_empty() {
            return None;
        }
        let session = self.registry.get(instance_id)?;
        let sessions = std::slice::from_ref(&session);

        if let Some(found) = self
            .explicit(sessions, function)
            .or_else(|| self.qualified(sessions, function))
        {
            return Some(found);
        }
        session.supports_ambient_dispatch().then(|| Resolution {
            session: session.clone(),
            capability: None,
            via: ResolvedBy::Ambient,
        })
    }

    fn explicit(&self, sessions: &[Arc<Session>], function: &str) -> Option<Resolution> {
        let mut owners = sessions
            .iter()
            .filter_map(|s| s.find(function).map(|c| (s, c)));
        let (session, capability) = owners.next()?;

        let shadowed: Vec<String> = owners.map(|(s, _)| s.instance_id().to_string()).collect();
        if !shadowed.is_empty() {
            warn!(
                %function,
                chosen = %session.instance_id(),
                ?shadowed,
                "function declared by several sessions; first registered wins, use Class.Name to pick one"
            );
            self.events.emit(BrokerEvent::AmbiguousFunction {
                function: function.to_string(),
                chosen: session.instance_id().to_string(),
                shadowed,
            });
        }

        Some(Resolution {
            session: session.clone(),
            capability: Some(capability.clone()),
            via: ResolvedBy::Explicit,
        })
    }

    fn qualified(&self, sessions: &[Arc<Session>], function: &str) -> Option<Resolution> {
        // the class is everything before the last dot, as native clients split it
        let (class, name) = function.rsplit_once('.')?;
        if class.is_empty() || name.is_empty() {
            return None;
        }
        sessions.iter().find_map(|s| {
            s.find_qualified(class, name).map(|c| Resolution {
                session: s.clone(),
                capability: Some(c.clone()),
                via: ResolvedBy::Qualified,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::session;

    async fn router(sessions: Vec<Arc<Session>>) -> (FunctionRouter, EventBus) {
        let registry = Arc::new(ClientRegistry::new());
        for s in sessions {
            registry.register(s).await;
        }
        let events = EventBus::default();
        (FunctionRouter::new(registry, events.clone()), events)
    }

    #[tokio::test]
    async fn explicit_declaration_beats_ambient_session() {
        let (b, _pb) = session("B", &[], true);
        let (a, _pa) = session("A", &[("Foo", None)], false);
        // B registered first on purpose
        let (router, _) = router(vec![b, a]).await;

        let r = router.resolve("foo").unwrap();
        assert_eq!(r.session.instance_id(), "A");
        assert_eq!(r.via, ResolvedBy::Explicit);
        assert_eq!(r.method("foo"), "Foo");
    }

    #[tokio::test]
    async fn ambient_session_catches_undeclared_names() {
        let (a, _pa) = session("A", &[("Foo", None)], false);
        let (c, _pc) = session("C", &[], true);
        let (router, _) = router(vec![a, c]).await;

        let r = router.resolve("Bar").unwrap();
        assert_eq!(r.session.instance_id(), "C");
        assert_eq!(r.via, ResolvedBy::Ambient);
        assert!(r.capability.is_none());
        assert_eq!(r.method("Bar"), "Bar");
    }

    #[tokio::test]
    async fn miss_without_ambient_sessions() {
        let (a, _pa) = session("A", &[("Foo", None)], false);
        let (router, _) = router(vec![a]).await;
        assert!(router.resolve("Baz").is_none());
    }

    #[tokio::test]
    async fn blank_names_never_resolve() {
        let (c, _pc) = session("C", &[], true);
        let (router, _) = router(vec![c]).await;
        assert!(router.resolve("").is_none());
        assert!(router.resolve("   ").is_none());
        assert!(router.resolve_on("C", " ").is_none());
    }

    #[tokio::test]
    async fn duplicate_declarations_pick_first_and_report() {
        let (a, _pa) = session("A", &[("Add", Some("Calc"))], false);
        let (b, _pb) = session("B", &[("Add", Some("Math"))], false);
        let (router, events) = router(vec![a, b]).await;
        let mut rx = events.subscribe();

        let r = router.resolve("Add").unwrap();
        assert_eq!(r.session.instance_id(), "A");
        assert_eq!(r.class().as_deref(), Some("Calc"));
        assert_eq!(
            rx.try_recv().unwrap(),
            BrokerEvent::AmbiguousFunction {
                function: "Add".into(),
                chosen: "A".into(),
                shadowed: vec!["B".into()],
            }
        );

        let r = router.resolve("Math.Add").unwrap();
        assert_eq!(r.session.instance_id(), "B");
        assert_eq!(r.via, ResolvedBy::Qualified);
        assert_eq!(r.method("Math.Add"), "Add");
    }

    #[tokio::test]
    async fn dotted_declarations_match_by_full_name_first() {
        let (a, _pa) = session("A", &[("Math.Add", None)], false);
        let (router, _) = router(vec![a]).await;
        let r = router.resolve("math.add").unwrap();
        assert_eq!(r.via, ResolvedBy::Explicit);
        assert_eq!(r.method("math.add"), "Math.Add");
    }

    #[tokio::test]
    async fn targeted_resolution_stays_on_the_instance() {
        let (a, _pa) = session("A", &[("Foo", None)], false);
        let (c, _pc) = session("C", &[], true);
        let (router, _) = router(vec![a, c]).await;

        assert_eq!(router.resolve_on("C", "Foo").unwrap().via, ResolvedBy::Ambient);
        assert!(router.resolve_on("A", "Bar").is_none());
        assert!(router.resolve_on("missing", "Foo").is_none());
    }
}
