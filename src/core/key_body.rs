//! Per-handle key bodies and the handle object that owns them
//!
//! A [`KeyBody`] is created for every open handle and references one cached
//! node. [`KeyHandle`] plays the object manager: dropping it (or calling
//! [`KeyHandle::close`]) hands the body to [`Registry::close`], the single
//! entry point into node and hive teardown.

use crate::core::hive::HiveId;
use crate::core::kcb::KcbRef;
use crate::core::registry::Registry;
use std::fmt;
use std::sync::Arc;

/// Identity of an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Listed on its node; closing it may trigger a late unload
    Ordinary,
    /// Not listed; closing it only drops the node reference
    Predefined,
}

/// Change-notification registration on a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyState {
    pub filter: u32,
    pub watch_tree: bool,
}

#[derive(Debug)]
pub struct KeyBody {
    pub(crate) id: BodyId,
    pub(crate) kcb: Option<KcbRef>,
    pub(crate) kind: BodyKind,
    pub(crate) hive_id: HiveId,
    pub(crate) notify: Option<NotifyState>,
}

impl KeyBody {
    pub(crate) fn new(id: BodyId, kcb: KcbRef, kind: BodyKind, hive_id: HiveId) -> Self {
        KeyBody {
            id,
            kcb: Some(kcb),
            kind,
            hive_id,
            notify: None,
        }
    }

    pub fn id(&self) -> BodyId {
        self.id
    }

    pub fn kcb(&self) -> Option<KcbRef> {
        self.kcb
    }

    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    pub fn hive_id(&self) -> HiveId {
        self.hive_id
    }

    pub fn notify(&self) -> Option<NotifyState> {
        self.notify
    }
}

/// Hooks run around a handle close, with no registry or bucket lock held.
/// Their outcome never affects the close.
pub trait CloseNotifier: Send + Sync {
    fn pre_close(&self, body: &KeyBody);
    fn post_close(&self, body: &KeyBody);
}

/// Notifier that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl CloseNotifier for NoopNotifier {
    fn pre_close(&self, _body: &KeyBody) {}
    fn post_close(&self, _body: &KeyBody) {}
}

/// An open key handle
pub struct KeyHandle {
    registry: Arc<Registry>,
    body: Option<KeyBody>,
    path: String,
}

impl KeyHandle {
    pub(crate) fn new(registry: Arc<Registry>, body: KeyBody, path: String) -> Self {
        KeyHandle {
            registry,
            body: Some(body),
            path,
        }
    }

    fn body(&self) -> &KeyBody {
        match &self.body {
            Some(body) => body,
            None => unreachable!("key handle used after close"),
        }
    }

    /// Canonical path this handle was opened on
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> BodyId {
        self.body().id
    }

    pub fn kcb(&self) -> KcbRef {
        match self.body().kcb {
            Some(kcb) => kcb,
            None => unreachable!("open handle without a control block"),
        }
    }

    pub fn kind(&self) -> BodyKind {
        self.body().kind
    }

    pub fn hive_id(&self) -> HiveId {
        self.body().hive_id
    }

    /// Register for change notification on this handle
    pub fn watch(&mut self, filter: u32, watch_tree: bool) {
        if let Some(body) = self.body.as_mut() {
            body.notify = Some(NotifyState { filter, watch_tree });
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Close explicitly; same as dropping the handle
    pub fn close(mut self) {
        if let Some(body) = self.body.take() {
            self.registry.close(body);
        }
    }
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        if let Some(body) = self.body.take() {
            self.registry.close(body);
        }
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("path", &self.path)
            .field("body", &self.body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kcb::{name::ConvKey, KcbId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, BodyId)>>,
    }

    impl CloseNotifier for Recorder {
        fn pre_close(&self, body: &KeyBody) {
            self.events.lock().push(("pre", body.id()));
        }
        fn post_close(&self, body: &KeyBody) {
            self.events.lock().push(("post", body.id()));
        }
    }

    #[test]
    fn test_body_accessors() {
        let kcb = KcbRef {
            id: KcbId(3),
            conv_key: ConvKey(99),
        };
        let body = KeyBody::new(BodyId(5), kcb, BodyKind::Predefined, HiveId(2));
        assert_eq!(body.id(), BodyId(5));
        assert_eq!(body.kcb(), Some(kcb));
        assert_eq!(body.kind(), BodyKind::Predefined);
        assert_eq!(body.hive_id(), HiveId(2));
        assert!(body.notify().is_none());
    }

    #[test]
    fn test_notifier_trait_object() {
        let recorder = Recorder::default();
        let notifier: &dyn CloseNotifier = &recorder;
        let body = KeyBody::new(
            BodyId(1),
            KcbRef {
                id: KcbId(1),
                conv_key: ConvKey(1),
            },
            BodyKind::Ordinary,
            HiveId(1),
        );
        notifier.pre_close(&body);
        notifier.post_close(&body);
        assert_eq!(
            *recorder.events.lock(),
            vec![("pre", BodyId(1)), ("post", BodyId(1))]
        );
    }
}
