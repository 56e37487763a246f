//! Identity types for tabmesh
//!
//! Every execution context (tab, hub, server) carries an origin fingerprint.
//! Identifiers are opaque strings on the wire so that contexts written in
//! other languages can interoperate.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[inline]
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            /// Generate a fresh random identifier
            pub fn generate() -> Self {
                $name(random_id($prefix))
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id!(
    /// Device identity - stable across tabs and restarts of one browser profile
    DeviceId,
    "dev"
);
string_id!(
    /// Tab identity - one per execution context
    TabId,
    "tab"
);
string_id!(
    /// Session identity - one per login session
    SessionId,
    "ses"
);

/// Random identifier of the form `prefix_<16 hex digits>`
pub fn random_id(prefix: &str) -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("{}_{:016x}", prefix, value)
}

/// Origin fingerprint stamped on every message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub device_id: DeviceId,
    pub tab_id: TabId,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
}

impl Identity {
    pub fn new(device_id: DeviceId, tab_id: TabId, session_id: SessionId) -> Self {
        Identity {
            device_id,
            tab_id,
            session_id,
            user_id: None,
            canvas_id: None,
        }
    }

    /// Create an identity with freshly generated device, tab and session ids
    pub fn generate() -> Self {
        Self::new(DeviceId::generate(), TabId::generate(), SessionId::generate())
    }

    /// Same device and session, new tab (e.g. a second tab opened by the same user)
    pub fn sibling_tab(&self) -> Self {
        Identity {
            tab_id: TabId::generate(),
            ..self.clone()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_canvas(mut self, canvas_id: impl Into<String>) -> Self {
        self.canvas_id = Some(canvas_id.into());
        self
    }

    /// Context id used for loop-guard bookkeeping
    #[inline]
    pub fn context_id(&self) -> &str {
        self.tab_id.as_str()
    }
}

/// Source of the per-process identity, supplied by the host application
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Identity;
}

/// Identity provider returning a fixed identity
#[derive(Clone, Debug)]
pub struct StaticIdentity(pub Identity);

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> Identity {
        self.0.clone()
    }
}

impl IdentityProvider for Identity {
    fn identity(&self) -> Identity {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_distinct() {
        let a = TabId::generate();
        let b = TabId::generate();
        assert!(a.as_str().starts_with("tab_"));
        assert_eq!(a.as_str().len(), "tab_".len() + 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sibling_tab_keeps_device() {
        let identity = Identity::generate().with_user("u1");
        let sibling = identity.sibling_tab();

        assert_eq!(identity.device_id, sibling.device_id);
        assert_eq!(identity.session_id, sibling.session_id);
        assert_eq!(sibling.user_id.as_deref(), Some("u1"));
        assert_ne!(identity.tab_id, sibling.tab_id);
    }

    #[test]
    fn test_identity_wire_shape() {
        let identity = Identity::new("d1".into(), "t1".into(), "s1".into()).with_canvas("c1");
        let json = serde_json::to_value(&identity).unwrap();

        assert_eq!(json["deviceId"], "d1");
        assert_eq!(json["tabId"], "t1");
        assert_eq!(json["canvasId"], "c1");
        assert!(json.get("userId").is_none());
    }

    #[test]
    fn test_static_provider() {
        let identity = Identity::generate();
        let provider = StaticIdentity(identity.clone());
        assert_eq!(provider.identity(), identity);
        assert_eq!(identity.context_id(), identity.tab_id.as_str());
    }
}
