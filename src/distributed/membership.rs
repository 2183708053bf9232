use log::info;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

use crate::distributed::View;
use crate::errors::{MnemosyneError, Result};

/// Receives view-change notifications.
pub trait ViewListener: Send + Sync {
    /// Called after `new_view` was installed. `previous` is the view it replaces.
    fn view_changed(&self, previous: &View, new_view: &View);
}

/// Source of cluster views.
///
/// Membership is consumed, not implemented, by the grid: the consistent hash
/// and the transport both follow whatever views this collaborator installs.
pub trait Membership: Send + Sync {
    fn current_view(&self) -> View;

    /// Registers a listener. Listeners are held weakly and dropped once their
    /// owner is gone.
    fn add_listener(&self, listener: Weak<dyn ViewListener>);
}

/// Membership driven explicitly by the host (or by tests).
///
/// Listeners are notified synchronously, in registration order, on the thread
/// that installs the view.
pub struct InMemoryMembership {
    view: RwLock<View>,
    listeners: Mutex<Vec<Weak<dyn ViewListener>>>,
    /// Serializes installs so listeners see views in id order.
    install: Mutex<()>,
}

impl InMemoryMembership {
    pub fn new(initial: View) -> Arc<Self> {
        Arc::new(Self {
            view: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
            install: Mutex::new(()),
        })
    }

    /// Installs `view` and notifies every live listener.
    ///
    /// # Errors
    ///
    /// Fails with `MnemosyneError::Config` if the view id does not increase.
    pub fn install_view(&self, view: View) -> Result<()> {
        let _install = self.install.lock();
        let previous = {
            let mut current = self.view.write();
            if view.id <= current.id {
                return Err(MnemosyneError::Config(format!(
                    "view {} does not supersede installed view {}",
                    view.id, current.id
                )));
            }
            std::mem::replace(&mut *current, view.clone())
        };
        info!(
            "Installing view {} {:?} (previous {} {:?})",
            view.id, view.members, previous.id, previous.members
        );

        let listeners: Vec<Arc<dyn ViewListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.view_changed(&previous, &view);
        }
        Ok(())
    }

    /// Installs the next view with `node` removed.
    pub fn remove_member(&self, node: crate::NodeId) -> Result<View> {
        let current = self.current_view();
        let members = current.members.into_iter().filter(|m| *m != node).collect();
        let next = View::new(current.id + 1, members);
        self.install_view(next.clone())?;
        Ok(next)
    }

    /// Installs the next view with `node` appended.
    pub fn add_member(&self, node: crate::NodeId) -> Result<View> {
        let current = self.current_view();
        let mut members = current.members;
        if !members.contains(&node) {
            members.push(node);
        }
        let next = View::new(current.id + 1, members);
        self.install_view(next.clone())?;
        Ok(next)
    }
}

impl Membership for InMemoryMembership {
    fn current_view(&self) -> View {
        self.view.read().clone()
    }

    fn add_listener(&self, listener: Weak<dyn ViewListener>) {
        self.listeners.lock().push(listener);
    }
}
