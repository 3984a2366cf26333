//! Orphan Reconciler
//!
//! After a recovery the registry may list rooms whose widgets never came
//! back (deleted while offline, different slide, closed tab). Once the UI
//! has had time to remount, every registry entry without a rendered widget is
//! closed on the relay and dropped locally. Runs at most once per connection
//! epoch.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::lock;
use crate::protocol::ClientEvent;
use crate::registry::RoomRegistry;
use crate::session::SessionCode;
use crate::transport::Transport;

/// The widget ids the host application currently renders.
pub trait RenderedWidgets: Send + Sync + 'static {
    fn rendered_widget_ids(&self) -> HashSet<String>;
}

impl<F> RenderedWidgets for F
where
    F: Fn() -> HashSet<String> + Send + Sync + 'static,
{
    fn rendered_widget_ids(&self) -> HashSet<String> {
        self()
    }
}

/// Mount counts of widgets driven through [`crate::WidgetSync`]. A widget id
/// can be mounted by more than one adapter for a moment while it re-renders.
#[derive(Debug, Default)]
pub struct MountTable {
    counts: Mutex<HashMap<String, usize>>,
}

impl MountTable {
    pub fn mount(&self, widget_id: &str) {
        *lock(&self.counts).entry(widget_id.to_string()).or_default() += 1;
    }

    /// Returns true if the widget is still mounted elsewhere.
    pub fn unmount(&self, widget_id: &str) -> bool {
        let mut counts = lock(&self.counts);
        match counts.get_mut(widget_id) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                counts.remove(widget_id);
                false
            }
            None => false,
        }
    }

    pub fn is_mounted(&self, widget_id: &str) -> bool {
        lock(&self.counts).contains_key(widget_id)
    }
}

impl RenderedWidgets for MountTable {
    fn rendered_widget_ids(&self) -> HashSet<String> {
        lock(&self.counts).keys().cloned().collect()
    }
}

#[derive(Debug, Default)]
pub(crate) struct OrphanReconciler {
    last_epoch: Mutex<Option<u64>>,
}

impl OrphanReconciler {
    /// Claim the run for `epoch`. Only the first claim per epoch succeeds.
    fn claim(&self, epoch: u64) -> bool {
        let mut last = lock(&self.last_epoch);
        if *last == Some(epoch) {
            return false;
        }
        *last = Some(epoch);
        true
    }

    /// Close every registry room with no rendered widget. Returns the widget
    /// ids that were closed; empty if this epoch already ran.
    pub(crate) fn reconcile(
        &self,
        epoch: u64,
        code: &SessionCode,
        registry: &RoomRegistry,
        rendered: &dyn RenderedWidgets,
        transport: &Transport,
    ) -> Vec<String> {
        if !self.claim(epoch) {
            debug!(epoch, "orphan cleanup already ran for this connection");
            return Vec::new();
        }

        let rendered = rendered.rendered_widget_ids();
        let mut orphans = Vec::new();
        for widget_id in registry.widget_ids() {
            if rendered.contains(&widget_id) {
                continue;
            }
            let Some(room) = registry.remove(&widget_id) else {
                continue;
            };
            transport.emit(&ClientEvent::CloseRoom {
                code: code.to_string(),
                room_type: room.room_type,
                widget_id: widget_id.clone(),
            });
            orphans.push(widget_id);
        }

        if orphans.is_empty() {
            debug!(epoch, "no orphaned rooms");
        } else {
            info!(epoch, count = orphans.len(), orphans = ?orphans, "closed orphaned rooms");
        }
        orphans
    }
}
