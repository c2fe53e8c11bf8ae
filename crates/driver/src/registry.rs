//! Minor number registry
//!
//! Maps minor identifiers to live sessions. Minors are handed out lowest
//! free first, starting at a configurable base, so a detached unit's minor
//! is reused by the next arrival.

use crate::error::{DriverError, Result};
use crate::session::DeviceSession;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Conventional first minor for USB character devices
pub const DEFAULT_MINOR_BASE: u32 = 192;

pub struct SessionRegistry {
    base: u32,
    capacity: u32,
    sessions: RwLock<BTreeMap<u32, Arc<DeviceSession>>>,
}

impl SessionRegistry {
    pub fn new(base: u32, capacity: u32) -> Self {
        Self {
            base,
            capacity,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register `session` under the lowest free minor
    pub(crate) fn register(&self, session: Arc<DeviceSession>) -> Result<u32> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let minor = (0..self.capacity)
            .filter_map(|offset| self.base.checked_add(offset))
            .find(|minor| !sessions.contains_key(minor))
            .ok_or(DriverError::RegistrationFailed {
                capacity: self.capacity,
            })?;

        sessions.insert(minor, session);
        debug!("Registered minor {} ({} in use)", minor, sessions.len());
        Ok(minor)
    }

    pub(crate) fn lookup(&self, minor: u32) -> Option<Arc<DeviceSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&minor)
            .cloned()
    }

    pub(crate) fn deregister(&self, minor: u32) -> Option<Arc<DeviceSession>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&minor);
        if removed.is_some() {
            debug!("Deregistered minor {}", minor);
        }
        removed
    }

    /// Registered minors in ascending order
    pub fn minors(&self) -> Vec<u32> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MINOR_BASE, 16)
    }
}
