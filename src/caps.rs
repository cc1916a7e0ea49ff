//! Capability router: unguessable URL-safe tokens mapped to handler
//! descriptors.
//!
//! The HTTP server is external: it strips `/CAPS/<token>/...`, asks the
//! router what the token means, and feeds the parsed request to the region.
//! Handlers are a closed enum rather than callbacks so dispatch needs no
//! borrow gymnastics and teardown can sweep a session's caps by value.

use std::collections::HashMap;

use log::debug;
use uuid::Uuid;

use crate::session::SessionHandle;

/// The well-known per-session capability names handed out via the seed cap.
pub const NAMED_CAPS: [&str; 5] = [
    "EventQueueGet",
    "ServerReleaseNotes",
    "UpdateScriptTask",
    "UpdateScriptAgent",
    "NewFileAgentInventory",
];

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// What a capability token grants. Upload-target variants are one-shot:
/// they deregister themselves when the upload arrives.
#[derive(Debug, Clone)]
pub enum CapHandler {
    /// The one capability the client learns at login; returns the rest.
    Seed(SessionHandle),
    EventQueueGet(SessionHandle),
    ServerReleaseNotes,
    /// Stage one of the prim-script update handshake.
    UpdateScriptTask(SessionHandle),
    /// Stage two: raw script bytes for a prim inventory item.
    ScriptTaskUploader {
        session: SessionHandle,
        task_id: Uuid,
        item_id: Uuid,
        script_running: bool,
    },
    /// Stage one for user-inventory scripts.
    UpdateScriptAgent(SessionHandle),
    AgentScriptUploader {
        session: SessionHandle,
        item_id: Uuid,
    },
    /// Stage one of a generic asset upload with inventory-item creation.
    NewFileAgentInventory(SessionHandle),
    FileUploader {
        session: SessionHandle,
        folder_id: Uuid,
        asset_type: i8,
        inv_type: i8,
        name: String,
        description: String,
    },
}

impl CapHandler {
    /// Session this capability belongs to, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        match self {
            CapHandler::Seed(s)
            | CapHandler::EventQueueGet(s)
            | CapHandler::UpdateScriptTask(s)
            | CapHandler::UpdateScriptAgent(s)
            | CapHandler::NewFileAgentInventory(s)
            | CapHandler::ScriptTaskUploader { session: s, .. }
            | CapHandler::AgentScriptUploader { session: s, .. }
            | CapHandler::FileUploader { session: s, .. } => Some(*s),
            CapHandler::ServerReleaseNotes => None,
        }
    }

    /// Uploader targets are consumed by their first use.
    pub fn one_shot(&self) -> bool {
        matches!(
            self,
            CapHandler::ScriptTaskUploader { .. }
                | CapHandler::AgentScriptUploader { .. }
                | CapHandler::FileUploader { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CapRouter {
    caps: HashMap<String, CapHandler>,
}

/// Strip the `/CAPS/<token>[/...]` prefix, yielding the token.
pub fn token_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/CAPS/")?;
    let token = rest.split('/').next()?;
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

impl CapRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token for `handler`. Tokens are random UUIDs in hex form,
    /// URL-safe by construction.
    pub fn register(&mut self, handler: CapHandler) -> String {
        let token = Uuid::new_v4().simple().to_string();
        debug!("capability {} -> {:?}", token, handler);
        self.caps.insert(token.clone(), handler);
        token
    }

    pub fn lookup(&self, token: &str) -> Option<&CapHandler> {
        self.caps.get(token)
    }

    /// Look up and, for one-shot capabilities, consume in the same step.
    pub fn take_for_dispatch(&mut self, token: &str) -> Option<CapHandler> {
        let one_shot = self.caps.get(token)?.one_shot();
        if one_shot {
            self.caps.remove(token)
        } else {
            self.caps.get(token).cloned()
        }
    }

    pub fn deregister(&mut self, token: &str) -> Option<CapHandler> {
        self.caps.remove(token)
    }

    /// Sweep every capability owned by a departing session.
    pub fn deregister_session(&mut self, session: SessionHandle) {
        self.caps
            .retain(|_, handler| handler.session() != Some(session));
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SessionHandle {
        SessionHandle {
            agent_id: Uuid::new_v4(),
            generation: 1,
        }
    }

    #[test]
    fn path_parsing() {
        assert_eq!(token_from_path("/CAPS/abcdef/"), Some("abcdef"));
        assert_eq!(token_from_path("/CAPS/abcdef"), Some("abcdef"));
        assert_eq!(token_from_path("/other/abcdef"), None);
        assert_eq!(token_from_path("/CAPS/"), None);
    }

    #[test]
    fn one_shot_caps_consume_on_dispatch() {
        let mut router = CapRouter::new();
        let session = handle();
        let token = router.register(CapHandler::ScriptTaskUploader {
            session,
            task_id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            script_running: true,
        });
        assert!(router.take_for_dispatch(&token).is_some());
        assert!(router.take_for_dispatch(&token).is_none());
    }

    #[test]
    fn session_teardown_sweeps_caps() {
        let mut router = CapRouter::new();
        let session = handle();
        let t1 = router.register(CapHandler::EventQueueGet(session));
        let t2 = router.register(CapHandler::ServerReleaseNotes);
        router.deregister_session(session);
        assert!(router.lookup(&t1).is_none());
        assert!(router.lookup(&t2).is_some());
    }
}
